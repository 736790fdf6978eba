//! Telemetry Animator Deterministic Simulation Harness
//!
//! This crate runs every animator kind against a seeded rover recording
//! and checks each visible state against a full in-memory replay.
//!
//! # Core Principle: One Seed, One Run
//!
//! All sources of non-determinism are derived from a single 64-bit seed:
//! - **Time**: a virtual clock that only moves when the playback loop sleeps
//! - **Data**: rover physics and emission jitter
//! - **I/O**: chunk and preload latency, counted in scheduler yields
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────┐        ┌──────────────────────────────┐   │
//! │  │  RoverModel  │──────▶│ recording (Vec<Frame>)        │   │
//! │  └──────────────┘        └──────┬──────────────┬────────┘   │
//! │                                 │              │            │
//! │                    ┌────────────▼───┐   ┌──────▼────────┐   │
//! │                    │ SimFrameSource │   │   replay      │   │
//! │                    │ (seeded delay) │   │ (reference)   │   │
//! │                    └────────┬───────┘   └──────┬────────┘   │
//! │                    ┌────────▼───────┐          │            │
//! │                    │ animator under │──state──▶ compare     │
//! │                    │ test           │                       │
//! │                    └────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use telemetry_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42).with_duration(10.0);
//! let result = runner.run(ScenarioId::Scrub).await;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod preload;
mod rover;
mod runner;
mod source;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{SimEvent, SimExport, SimFrame};
pub use preload::{camera_image, SimImagePreloader};
pub use rover::{image_name, RoverModel, ARM_JOINTS, MODES};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
pub use source::{SimFrameSource, SourceStats};
