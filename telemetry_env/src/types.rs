//! Common types for the telemetry environment abstraction.

use crate::error::EnvError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Unique identifier for an animator instance.
///
/// Used as a structured field in logs so interleaved chunk loads from
/// several animators can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnimatorId(pub Uuid);

impl AnimatorId {
    /// Creates a new random AnimatorId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
    
    /// Creates a deterministic AnimatorId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
    
    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AnimatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AnimatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag handed to every abandonable request.
///
/// Cloning shares the flag. Cancelling is one-way; once cancelled a token
/// stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }
    
    /// Cancels the token and wakes every task waiting in `cancelled()`.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }
    
    /// Returns true once `cancel()` has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
    
    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
    
    /// Returns `Err(EnvError::Cancelled)` if the token was cancelled.
    ///
    /// Frame sources call this between suspension points.
    pub fn check(&self) -> Result<(), EnvError> {
        if self.is_cancelled() {
            Err(EnvError::Cancelled)
        } else {
            Ok(())
        }
    }
}
