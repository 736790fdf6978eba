//! Telemetry Core - Time-Indexed State Animators
//!
//! This library turns streams of timestamped partial state deltas into a
//! full state at any requested time:
//! 1. **Roll-up**: forward playback folds frames in O(frames advanced)
//! 2. **Chunked loading**: history is fetched on demand, out of order, and merged in order
//! 3. **Keyframes**: periodic snapshots make rewinds cheap
//! 4. **Live fusion**: a streaming head and a cached history behind one animator

pub mod animator;
pub mod buffered;
pub mod error;
pub mod events;
pub mod frame;
pub mod joined;
pub mod keyframe;
pub mod live;
pub mod lookahead;
pub mod playback;
pub mod policy;
pub mod value;

// Re-export key types for convenience
pub use animator::{Animator, AnimatorConfig, ForEachOptions, TelemetryAnimator};
pub use buffered::{BufferConfig, BufferedAnimator, FrameSource};
pub use error::AnimatorError;
pub use events::{AnimatorEvent, EventBus, StateDiff};
pub use frame::Frame;
pub use joined::JoinedAnimator;
pub use keyframe::{Keyframe, KeyframeIndex};
pub use live::{CachedFrameSource, FramesCache, LiveAnimator, LiveConfig, LiveSide};
pub use lookahead::{LookAheadAnimator, LookAheadConfig, Preloader};
pub use playback::{Driver, Playback, PlaybackConfig};
pub use policy::{CustomPolicy, NestedPolicy, ShallowPolicy, StatePolicy};
pub use value::{State, Value};
