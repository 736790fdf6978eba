//! Animator events, change diffs and the per-animator event bus.
//!
//! State changes are coalesced: operations mark fields as changed while
//! they run and flush a single `Change` event when they finish, so
//! observers never see a half-updated state.

use crate::error::AnimatorError;
use crate::frame::Frame;
use crate::value::State;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::warn;

/// Default broadcast capacity per animator.
pub const EVENT_CAPACITY: usize = 256;

/// Set of top-level fields touched since the last `Change` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDiff {
    all: bool,
    fields: BTreeSet<String>,
}

impl StateDiff {
    pub fn new() -> Self {
        Self::default()
    }
    
    /// A diff reporting every field as changed (after resets and reseeds).
    pub fn all() -> Self {
        Self {
            all: true,
            fields: BTreeSet::new(),
        }
    }
    
    pub fn is_all(&self) -> bool {
        self.all
    }
    
    /// Lets drivers skip subsystems whose fields did not change.
    pub fn did_change(&self, field: &str) -> bool {
        self.all || self.fields.contains(field)
    }
    
    pub fn mark(&mut self, field: &str) {
        if !self.all {
            self.fields.insert(field.to_string());
        }
    }
    
    /// Marks every top-level key of `state`.
    pub fn mark_state(&mut self, state: &State) {
        if self.all {
            return;
        }
        for key in state.keys() {
            self.fields.insert(key.clone());
        }
    }
    
    pub fn mark_all(&mut self) {
        self.all = true;
        self.fields.clear();
    }
    
    pub fn merge(&mut self, other: &StateDiff) {
        if other.all {
            self.mark_all();
        } else if !self.all {
            self.fields.extend(other.fields.iter().cloned());
        }
    }
    
    pub fn is_empty(&self) -> bool {
        !self.all && self.fields.is_empty()
    }
    
    /// Explicitly marked fields. Empty for an `all` diff.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }
}

/// Events raised by every animator kind.
#[derive(Debug, Clone)]
pub enum AnimatorEvent {
    /// State changed. Read the new state from the animator.
    Change { time: f64, diff: StateDiff },
    Reset,
    Dispose,
    AddedFrames { frames: Arc<Vec<Frame>> },
    /// A recoverable failure in background work (chunk fetch, preload, cache write)
    Error { error: AnimatorError },
    /// Keyframe generation progress in `0.0..=1.0`
    KeyframeProgress { progress: f64 },
    Connected,
    Disconnected,
    AddAnimator { name: String },
    RemoveAnimator { name: String },
}

/// Broadcast sender with a change debouncer.
pub struct EventBus {
    sender: broadcast::Sender<AnimatorEvent>,
    pending: Option<StateDiff>,
    suppressed: u32,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }
    
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            pending: None,
            suppressed: 0,
        }
    }
    
    pub fn subscribe(&self) -> broadcast::Receiver<AnimatorEvent> {
        self.sender.subscribe()
    }
    
    /// Sends immediately. Having no subscribers is not an error.
    pub fn emit(&self, event: AnimatorEvent) {
        let _ = self.sender.send(event);
    }
    
    /// Coalesces `diff` into the pending change.
    pub fn mark_changed(&mut self, diff: &StateDiff) {
        if diff.is_empty() {
            return;
        }
        self.pending.get_or_insert_with(StateDiff::new).merge(diff);
    }
    
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
    
    /// Holds back `flush` until the matching `resume`.
    pub fn suppress(&mut self) {
        self.suppressed += 1;
    }
    
    pub fn resume(&mut self) {
        self.suppressed = self.suppressed.saturating_sub(1);
    }
    
    /// Emits at most one `Change` for everything marked since the last flush.
    ///
    /// Returns true if an event was sent.
    pub fn flush(&mut self, time: f64) -> bool {
        if self.suppressed > 0 {
            return false;
        }
        match self.pending.take() {
            Some(diff) => {
                self.emit(AnimatorEvent::Change { time, diff });
                true
            }
            None => false,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects every event currently queued on `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<AnimatorEvent>) -> Vec<AnimatorEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "event receiver lagged");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    
    #[test]
    fn test_diff_marks_and_merges() {
        let mut diff = StateDiff::new();
        assert!(diff.is_empty());
        
        diff.mark_state(&state! { "odometry" => 1.0, "arm" => 2.0 });
        assert!(diff.did_change("odometry"));
        assert!(!diff.did_change("camera"));
        
        let mut other = StateDiff::new();
        other.mark("camera");
        diff.merge(&other);
        assert_eq!(diff.fields().collect::<Vec<_>>(), vec!["arm", "camera", "odometry"]);
        
        diff.merge(&StateDiff::all());
        assert!(diff.is_all());
        assert!(diff.did_change("anything"));
    }
    
    #[test]
    fn test_bus_coalesces_changes() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();
        
        let mut a = StateDiff::new();
        a.mark("a");
        let mut b = StateDiff::new();
        b.mark("b");
        bus.mark_changed(&a);
        bus.mark_changed(&b);
        bus.mark_changed(&StateDiff::new());
        
        assert!(bus.flush(1.5));
        assert!(!bus.flush(1.5));
        
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AnimatorEvent::Change { time, diff } => {
                assert_eq!(*time, 1.5);
                assert!(diff.did_change("a") && diff.did_change("b"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    
    #[test]
    fn test_bus_suppress_defers_flush() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();
        
        bus.suppress();
        bus.mark_changed(&StateDiff::all());
        assert!(!bus.flush(0.0));
        bus.resume();
        assert!(bus.flush(0.0));
        
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
