//! Core environment clock trait for telemetry playback.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts the wall clock so that playback loops can run against real
/// time (tokio) or a virtual clock in the simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - manually advanced virtual clock
#[async_trait]
pub trait AnimatorContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Playback uses deltas of this value to advance the playhead.
    fn now(&self) -> Duration;
    
    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);
    
    /// Spawns a background task (live feeds, producers).
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
    
    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
