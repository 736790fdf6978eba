//! Animator error types.

use telemetry_env::EnvError;
use thiserror::Error;

/// Errors returned by animator operations.
///
/// Contract violations come back synchronously from the offending call.
/// I/O failures inside background work are delivered as
/// `AnimatorEvent::Error` instead, which is why this type is `Clone`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnimatorError {
    #[error("Animator is not seekable: cannot rewind from {from} to {to}")]
    NotSeekable { from: f64, to: f64 },
    
    #[error("Keyframe generation already in progress")]
    AlreadyGenerating,
    
    #[error("Duplicate animator name: {0}")]
    DuplicateAnimator(String),
    
    #[error("Animator {name} has seekable={seekable}, which disagrees with its siblings")]
    SeekableMismatch { name: String, seekable: bool },
    
    #[error("Unknown animator: {0}")]
    UnknownAnimator(String),
    
    #[error("Keyframes are not enabled for this animator")]
    MissingKeyframes,
    
    #[error(transparent)]
    Env(#[from] EnvError),
}

impl AnimatorError {
    /// True when the underlying cause is an intentional cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnimatorError::Env(e) if e.is_cancelled())
    }
}
