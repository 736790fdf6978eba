//! Telemetry Environment Abstraction Layer
//!
//! This crate holds everything the animator core touches outside its own
//! memory, so that the same animators run against real time and disk in
//! production and against a virtual clock in the simulation harness.
//!
//! - Time (`now()`, `sleep()`, `spawn()`) via [`AnimatorContext`]
//! - Persistence (keyframes, frame chunks) via [`ObjectCache`]
//! - Abandonment of in-flight requests via [`CancelToken`]
//!
//! # Example
//!
//! ```ignore
//! use telemetry_env::{MemoryCache, ObjectCache};
//!
//! let cache: MemoryCache<String> = MemoryCache::new();
//! cache.set(0, "chunk-0".into()).await?;
//! assert!(cache.has(0).await?);
//! ```

mod cache;
mod context;
mod error;
mod tokio_impl;
mod types;

pub use cache::{MemoryCache, ObjectCache, SledCache};
pub use context::AnimatorContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use types::{AnimatorId, CancelToken};
