//! Frames: timestamped partial state deltas.

use crate::value::State;
use serde::{Deserialize, Serialize};

/// A self-contained delta describing what changed at `time`.
///
/// Frames are expected, but not required, to arrive sorted by time.
/// Duplicate times are legal; later frames win field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub time: f64,
    pub state: State,
}

impl Frame {
    pub fn new(time: f64, state: State) -> Self {
        Self { time, state }
    }
}

/// Stable sort by time. Frames sharing a time keep their relative order.
pub fn sort_frames(frames: &mut [Frame]) {
    frames.sort_by(|a, b| a.time.total_cmp(&b.time));
}

/// True if `frames` is non-decreasing in time.
pub fn is_sorted(frames: &[Frame]) -> bool {
    frames.windows(2).all(|pair| pair[0].time <= pair[1].time)
}
