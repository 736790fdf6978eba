//! The base time-stepping animator.
//!
//! [`TelemetryAnimator`] holds a time-sorted frame sequence and a playhead.
//! Moving the playhead forward folds every frame up to the new time into
//! the rolled-up state (O(frames advanced)); moving it backward resets and
//! replays, starting from a keyframe when an index is attached.
//!
//! ```text
//!   frames:  [f0][f1][f2][f3][f4][f5]
//!                         ^
//!                     next_frame      rolled = merge(f0..f2)
//!   time ----|----|----|--*-|----|---->
//! ```
//!
//! The buffered, look-ahead, live and joined animators all build on the
//! [`Animator`] trait defined here.

use crate::error::AnimatorError;
use crate::events::{AnimatorEvent, EventBus, StateDiff};
use crate::frame::{sort_frames, Frame};
use crate::keyframe::KeyframeIndex;
use crate::policy::{ShallowPolicy, StatePolicy};
use crate::value::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use telemetry_env::AnimatorId;
use tokio::sync::broadcast;
use tracing::debug;

/// Common interface of every animator kind.
///
/// A driver calls `set_time` and reads `state()` when a `Change` event
/// arrives. The returned state must be treated as read-only.
#[async_trait]
pub trait Animator: Send {
    fn id(&self) -> AnimatorId;
    
    /// Current playhead.
    fn time(&self) -> f64;
    
    /// Current rolled-up (possibly interpolated) state.
    fn state(&self) -> &State;
    
    /// Frames currently materialized in memory.
    fn frames(&self) -> &[Frame];
    
    /// Frames with `lo <= time <= hi` that are available without further I/O.
    ///
    /// Defaults to the materialized frames. Layers holding data they have
    /// not rolled up yet answer from everything resident.
    fn frames_in(&self, lo: f64, hi: f64) -> Vec<Frame> {
        let frames = self.frames();
        let first = frames.partition_point(|f| f.time < lo);
        let last = frames.partition_point(|f| f.time <= hi).max(first);
        frames[first..last].to_vec()
    }
    
    fn start_time(&self) -> f64;
    
    fn end_time(&self) -> f64;
    
    fn seekable(&self) -> bool;
    
    fn live_data(&self) -> bool;
    
    /// True while pending async work may still change the state for the current time.
    fn stale(&self) -> bool;
    
    fn ready(&self) -> bool;
    
    fn is_disposed(&self) -> bool;
    
    fn subscribe(&self) -> broadcast::Receiver<AnimatorEvent>;
    
    /// Moves the playhead to `time`.
    async fn set_time(&mut self, time: f64) -> Result<(), AnimatorError>;
    
    /// Clears the state and re-settles at `start_time`.
    async fn reset(&mut self) -> Result<(), AnimatorError>;
    
    async fn add_frames(&mut self, frames: Vec<Frame>) -> Result<(), AnimatorError>;
    
    /// Picks up background work that finished since the last operation.
    ///
    /// Drivers call this while the playhead is idle.
    async fn poll(&mut self) -> Result<(), AnimatorError> {
        Ok(())
    }
    
    /// Releases resources. Every later operation is a no-op.
    fn dispose(&mut self);
}

/// Configuration for [`TelemetryAnimator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimatorConfig {
    /// Allow moving the playhead backward (default: true)
    pub seekable: bool,
    
    /// Define state between frames instead of holding the last one (default: false)
    pub continuous: bool,
    
    /// Blend between bracketing frames when continuous (default: false)
    pub interpolate: bool,
    
    /// How much history a non-seekable animator keeps behind the playhead (default: 1.0)
    pub non_seekable_buffer: f64,
    
    /// Fed by a live source (default: false)
    pub live_data: bool,
}

impl Default for AnimatorConfig {
    fn default() -> Self {
        Self {
            seekable: true,
            continuous: false,
            interpolate: false,
            non_seekable_buffer: 1.0,
            live_data: false,
        }
    }
}

impl AnimatorConfig {
    pub fn with_seekable(mut self, seekable: bool) -> Self {
        self.seekable = seekable;
        self
    }
    
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }
    
    /// Enables interpolation (implies continuous).
    pub fn with_interpolate(mut self, interpolate: bool) -> Self {
        self.interpolate = interpolate;
        if interpolate {
            self.continuous = true;
        }
        self
    }
    
    pub fn with_non_seekable_buffer(mut self, buffer: f64) -> Self {
        self.non_seekable_buffer = buffer;
        self
    }
    
    pub fn with_live_data(mut self, live_data: bool) -> Self {
        self.live_data = live_data;
        self
    }
}

/// Options for [`TelemetryAnimator::for_each_frame`].
///
/// Both bounds are exclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForEachOptions {
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// Pass each frame's own partial state instead of the accumulated state
    pub raw: bool,
}

impl ForEachOptions {
    pub fn between(start_time: f64, end_time: f64) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            raw: false,
        }
    }
    
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
    
    /// Visits frames with `start < time < end`; stops at the first frame at or past `end`.
    pub(crate) fn visit<F>(&self, frames: &[Frame], policy: &dyn StatePolicy, acc: &mut State, mut callback: F) -> bool
    where
        F: FnMut(&State, f64),
    {
        for frame in frames {
            if self.end_time.is_some_and(|end| frame.time >= end) {
                return false;
            }
            if !self.raw {
                policy.merge(&frame.state, acc);
            }
            if self.start_time.is_some_and(|start| frame.time <= start) {
                continue;
            }
            if self.raw {
                callback(&frame.state, frame.time);
            } else {
                callback(acc, frame.time);
            }
        }
        true
    }
}

/// In-memory time-stepping animator.
pub struct TelemetryAnimator {
    id: AnimatorId,
    config: AnimatorConfig,
    policy: Arc<dyn StatePolicy>,
    
    /// Sorted by time
    frames: Vec<Frame>,
    
    /// Merge of `frames[..next_frame]` (plus any seed)
    rolled: State,
    
    /// Blended or held state when continuous; `rolled` otherwise
    interpolated: Option<State>,
    
    /// Number of frames folded into `rolled`
    next_frame: usize,
    
    /// Time of the last frame folded into `rolled`
    last_rolled: Option<f64>,
    
    time: f64,
    
    /// Observed bounds, possibly wider than the materialized frames
    range: Option<(f64, f64)>,
    
    keyframes: Option<KeyframeIndex>,
    connected: bool,
    disposed: bool,
    bus: EventBus,
}

impl TelemetryAnimator {
    /// Creates an animator with default configuration, settled at time 0.
    pub fn new(frames: Vec<Frame>) -> Self {
        Self::with_config(frames, AnimatorConfig::default())
    }
    
    pub fn with_config(mut frames: Vec<Frame>, config: AnimatorConfig) -> Self {
        sort_frames(&mut frames);
        let range = match (frames.first(), frames.last()) {
            (Some(first), Some(last)) => Some((first.time, last.time)),
            _ => None,
        };
        let mut animator = Self {
            id: AnimatorId::new(),
            config,
            policy: Arc::new(ShallowPolicy),
            frames,
            rolled: State::new(),
            interpolated: None,
            next_frame: 0,
            last_rolled: None,
            time: 0.0,
            range,
            keyframes: None,
            connected: false,
            disposed: false,
            bus: EventBus::new(),
        };
        animator.resettle();
        animator
    }
    
    /// Replaces the merge/interpolate policy and re-settles.
    pub fn with_policy(mut self, policy: Arc<dyn StatePolicy>) -> Self {
        if let Some(keyframes) = self.keyframes.as_mut() {
            keyframes.set_policy(policy.clone());
        }
        self.policy = policy;
        self.resettle();
        self
    }
    
    /// Attaches a keyframe index used to seed rewinds.
    pub fn with_keyframes(mut self, mut keyframes: KeyframeIndex) -> Self {
        keyframes.set_policy(self.policy.clone());
        self.keyframes = Some(keyframes);
        self
    }
    
    pub fn with_id(mut self, id: AnimatorId) -> Self {
        self.id = id;
        self
    }
    
    pub fn config(&self) -> &AnimatorConfig {
        &self.config
    }
    
    pub fn policy(&self) -> Arc<dyn StatePolicy> {
        self.policy.clone()
    }
    
    pub fn keyframes(&self) -> Option<&KeyframeIndex> {
        self.keyframes.as_ref()
    }
    
    pub fn connected(&self) -> bool {
        self.connected
    }
    
    /// Records the live connection state, emitting one event per transition.
    pub fn set_connected(&mut self, connected: bool) {
        if self.disposed || self.connected == connected {
            return;
        }
        self.connected = connected;
        self.bus.emit(if connected {
            AnimatorEvent::Connected
        } else {
            AnimatorEvent::Disconnected
        });
    }
    
    /// Widens the observed `[start_time, end_time]` bounds.
    pub fn widen_range(&mut self, start: f64, end: f64) {
        self.range = Some(match self.range {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }
    
    // ========================================================================
    // ROLL-UP
    // ========================================================================
    
    pub(crate) fn reset_state(&mut self) {
        self.rolled.clear();
        self.interpolated = None;
        self.next_frame = 0;
        self.last_rolled = None;
    }
    
    /// Replays from scratch up to the current time.
    fn resettle(&mut self) {
        let mut diff = StateDiff::new();
        self.reset_state();
        self.roll_up(self.time, &mut diff);
        self.apply_interpolation(self.time, &mut diff);
    }
    
    /// Folds every unrolled frame with `frame.time <= time`.
    pub(crate) fn roll_up(&mut self, time: f64, diff: &mut StateDiff) {
        while let Some(frame) = self.frames.get(self.next_frame) {
            if frame.time > time {
                break;
            }
            self.policy.merge(&frame.state, &mut self.rolled);
            diff.mark_state(&frame.state);
            self.last_rolled = Some(frame.time);
            self.next_frame += 1;
        }
    }
    
    /// Recomputes the held or blended state for `time`.
    fn apply_interpolation(&mut self, time: f64, diff: &mut StateDiff) {
        if let Some(previous) = self.interpolated.take() {
            diff.mark_state(&previous);
        }
        if !self.config.continuous {
            return;
        }
        let Some(next_time) = self.frames.get(self.next_frame).map(|f| f.time) else {
            return;
        };
        let group_end = self.next_frame
            + self.frames[self.next_frame..].partition_point(|f| f.time <= next_time);
        let group = &self.frames[self.next_frame..group_end];
        
        match self.last_rolled {
            // Before the first frame: hold it
            None if self.rolled.is_empty() => {
                let mut held = State::new();
                for frame in group {
                    self.policy.merge(&frame.state, &mut held);
                }
                diff.mark_state(&held);
                self.interpolated = Some(held);
            }
            Some(curr_time) if self.config.interpolate && next_time > curr_time => {
                let ratio = ((time - curr_time) / (next_time - curr_time)).clamp(0.0, 1.0);
                let mut next_state = self.rolled.clone();
                for frame in group {
                    self.policy.merge(&frame.state, &mut next_state);
                    diff.mark_state(&frame.state);
                }
                let mut target = self.rolled.clone();
                self.policy.interpolate(&self.rolled, &next_state, ratio, &mut target);
                self.interpolated = Some(target);
            }
            _ => {}
        }
    }
    
    /// Rolls forward, blends and moves the playhead. No rewind check.
    pub(crate) fn advance(&mut self, time: f64, diff: &mut StateDiff) {
        self.roll_up(time, diff);
        self.settle(time, diff);
        if !self.config.seekable {
            self.trim();
        }
    }
    
    /// Blends for `time` and moves the playhead without rolling.
    pub(crate) fn settle(&mut self, time: f64, diff: &mut StateDiff) {
        self.apply_interpolation(time, diff);
        self.time = time;
    }
    
    /// Drops rolled frames older than `time - non_seekable_buffer`.
    fn trim(&mut self) {
        let cutoff = self.time - self.config.non_seekable_buffer;
        let count = self.frames[..self.next_frame].partition_point(|f| f.time < cutoff);
        if count > 0 {
            self.drop_front(count);
        }
    }
    
    /// Removes the first `count` frames, keeping the rolled state.
    pub(crate) fn drop_front(&mut self, count: usize) {
        let count = count.min(self.frames.len());
        self.frames.drain(..count);
        self.next_frame = self.next_frame.saturating_sub(count);
    }
    
    pub(crate) fn clear_frames(&mut self) {
        self.frames.clear();
        self.next_frame = 0;
    }
    
    /// Starts from a known full state at `time` with no frames rolled.
    ///
    /// `last_frame_time` is the time of the newest frame folded into
    /// `state`; interpolation blends from it.
    pub(crate) fn seed(&mut self, time: f64, state: State, last_frame_time: Option<f64>) {
        self.reset_state();
        self.rolled = state;
        self.last_rolled = last_frame_time;
        self.time = time;
    }
    
    /// Appends frames known to sort after everything present.
    pub(crate) fn append_sorted(&mut self, frames: &[Frame]) {
        self.frames.extend_from_slice(frames);
    }
    
    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }
    
    pub(crate) fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }
    
    /// Queues `diff` and flushes one `Change` at the current time.
    pub(crate) fn publish(&mut self, diff: &StateDiff) {
        self.bus.mark_changed(diff);
        self.bus.flush(self.time);
    }
    
    /// Inserts sorted `frames` and repairs the rolled state.
    fn insert_frames(&mut self, frames: &[Frame], diff: &mut StateDiff) {
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return;
        };
        let earliest = first.time;
        self.widen_range(earliest, last.time);
        
        let in_order = self.frames.last().map_or(true, |tail| earliest >= tail.time);
        self.frames.extend_from_slice(frames);
        
        if in_order || earliest > self.time {
            // Everything before next_frame keeps its index
            if !in_order {
                sort_frames(&mut self.frames);
            }
            self.roll_up(self.time, diff);
            self.apply_interpolation(self.time, diff);
            return;
        }
        
        sort_frames(&mut self.frames);
        if self.config.seekable {
            self.reset_state();
            diff.mark_all();
            self.roll_up(self.time, diff);
        } else {
            // History may be trimmed, so fold the late frames in directly
            let time = self.time;
            for frame in frames.iter().filter(|f| f.time <= time) {
                self.policy.merge(&frame.state, &mut self.rolled);
                diff.mark_state(&frame.state);
            }
            self.next_frame = self.frames.partition_point(|f| f.time <= time);
        }
        self.apply_interpolation(self.time, diff);
    }
    
    // ========================================================================
    // FRAME UTILITIES
    // ========================================================================
    
    /// Merges consecutive frames that share a time.
    ///
    /// The observable state at every time is unchanged.
    pub fn optimize(&mut self) {
        if self.disposed {
            return;
        }
        let before = self.frames.len();
        let mut merged: Vec<Frame> = Vec::with_capacity(before);
        for frame in std::mem::take(&mut self.frames) {
            match merged.last_mut() {
                Some(last) if last.time == frame.time => {
                    self.policy.merge(&frame.state, &mut last.state)
                }
                _ => merged.push(frame),
            }
        }
        self.frames = merged;
        
        if self.config.seekable {
            self.resettle();
        } else {
            let time = self.time;
            self.next_frame = self.frames.partition_point(|f| f.time <= time);
        }
        debug!(id = %self.id, before, after = self.frames.len(), "optimized frames");
    }
    
    /// Visits frames strictly between the optional bounds.
    ///
    /// Without `raw`, the callback receives the state accumulated over
    /// every frame up to and including the visited one.
    pub fn for_each_frame<F>(&self, options: ForEachOptions, callback: F)
    where
        F: FnMut(&State, f64),
    {
        let mut acc = State::new();
        options.visit(&self.frames, self.policy.as_ref(), &mut acc, callback);
    }
    
    /// Walks frame history backward, newest first.
    ///
    /// Starts at the last rolled frame, or at the last frame at or before
    /// `from_time`. Stops when the callback returns true; returns whether it did.
    pub fn seek_back<F>(&self, from_time: Option<f64>, mut callback: F) -> bool
    where
        F: FnMut(&State, f64) -> bool,
    {
        let start = match from_time {
            Some(time) => self.frames.partition_point(|f| f.time <= time),
            None => self.next_frame,
        };
        self.frames[..start]
            .iter()
            .rev()
            .any(|frame| callback(&frame.state, frame.time))
    }
    
    /// Rebuilds every keyframe from the in-memory frames.
    pub async fn generate_keyframes(&mut self) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        let keyframes = self.keyframes.as_mut().ok_or(AnimatorError::MissingKeyframes)?;
        let bus = &self.bus;
        keyframes
            .generate(&self.frames, |progress| {
                bus.emit(AnimatorEvent::KeyframeProgress { progress })
            })
            .await
    }
}

#[async_trait]
impl Animator for TelemetryAnimator {
    fn id(&self) -> AnimatorId {
        self.id
    }
    
    fn time(&self) -> f64 {
        self.time
    }
    
    fn state(&self) -> &State {
        self.interpolated.as_ref().unwrap_or(&self.rolled)
    }
    
    fn frames(&self) -> &[Frame] {
        &self.frames
    }
    
    fn start_time(&self) -> f64 {
        self.range.map(|(start, _)| start).unwrap_or(0.0)
    }
    
    fn end_time(&self) -> f64 {
        self.range.map(|(_, end)| end).unwrap_or(0.0)
    }
    
    fn seekable(&self) -> bool {
        self.config.seekable
    }
    
    fn live_data(&self) -> bool {
        self.config.live_data
    }
    
    fn stale(&self) -> bool {
        false
    }
    
    fn ready(&self) -> bool {
        self.range.is_some()
    }
    
    fn is_disposed(&self) -> bool {
        self.disposed
    }
    
    fn subscribe(&self) -> broadcast::Receiver<AnimatorEvent> {
        self.bus.subscribe()
    }
    
    async fn set_time(&mut self, time: f64) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        let mut diff = StateDiff::new();
        if time < self.time {
            if !self.config.seekable {
                return Err(AnimatorError::NotSeekable { from: self.time, to: time });
            }
            self.reset_state();
            diff.mark_all();
            if let Some(keyframes) = &self.keyframes {
                if let Some((keyframe_time, keyframe)) = keyframes.get_keyframe(time).await? {
                    self.rolled = keyframe.state;
                    self.last_rolled = keyframe.last_frame_time;
                    self.next_frame = self.frames.partition_point(|f| f.time < keyframe_time);
                    debug!(id = %self.id, keyframe_time, "seeded rewind from keyframe");
                }
            }
        }
        self.advance(time, &mut diff);
        self.publish(&diff);
        Ok(())
    }
    
    async fn reset(&mut self) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        self.reset_state();
        self.bus.emit(AnimatorEvent::Reset);
        let start = self.start_time();
        let mut diff = StateDiff::all();
        self.advance(start, &mut diff);
        self.publish(&diff);
        Ok(())
    }
    
    async fn add_frames(&mut self, mut frames: Vec<Frame>) -> Result<(), AnimatorError> {
        if self.disposed || frames.is_empty() {
            return Ok(());
        }
        if self.keyframes.as_ref().is_some_and(KeyframeIndex::is_generating) {
            return Err(AnimatorError::AlreadyGenerating);
        }
        sort_frames(&mut frames);
        
        let mut diff = StateDiff::new();
        self.insert_frames(&frames, &mut diff);
        if let Some(keyframes) = self.keyframes.as_mut() {
            keyframes.extend(&frames).await?;
        }
        
        self.bus.emit(AnimatorEvent::AddedFrames { frames: Arc::new(frames) });
        self.publish(&diff);
        Ok(())
    }
    
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.frames.clear();
        self.bus.emit(AnimatorEvent::Dispose);
    }
}
