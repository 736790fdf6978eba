//! Joined animator: named child animators behind one composite state.
//!
//! The composite state maps each child's name to that child's state as a
//! `Value::Map`. It is rebuilt after every operation, so reading it never
//! observes a half-updated fan-out.

use crate::animator::Animator;
use crate::error::AnimatorError;
use crate::events::{drain, AnimatorEvent, EventBus, StateDiff};
use crate::frame::Frame;
use crate::value::{State, Value};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeMap;
use telemetry_env::AnimatorId;
use tokio::sync::broadcast;
use tracing::{debug, warn};

struct JoinedChild {
    name: String,
    animator: Box<dyn Animator>,
    events: broadcast::Receiver<AnimatorEvent>,
}

impl JoinedChild {
    fn new(name: String, animator: Box<dyn Animator>) -> Self {
        let events = animator.subscribe();
        Self { name, animator, events }
    }
}

/// Fans every operation out to named children.
///
/// All children must agree on `seekable`. Aggregates:
/// - `start_time`: min over children; `end_time`: max
/// - `ready`, `live_data`, `stale`: any child
/// - `seekable`: every child
pub struct JoinedAnimator {
    id: AnimatorId,
    children: Vec<JoinedChild>,
    state: State,
    time: f64,
    disposed: bool,
    bus: EventBus,
}

impl JoinedAnimator {
    pub fn new(children: Vec<(String, Box<dyn Animator>)>) -> Result<Self, AnimatorError> {
        let mut joined = Self {
            id: AnimatorId::new(),
            children: Vec::with_capacity(children.len()),
            state: State::new(),
            time: 0.0,
            disposed: false,
            bus: EventBus::new(),
        };
        for (name, animator) in children {
            joined.check_child(&name, animator.as_ref())?;
            joined.children.push(JoinedChild::new(name, animator));
        }
        joined.rebuild_state();
        Ok(joined)
    }
    
    fn check_child(&self, name: &str, animator: &dyn Animator) -> Result<(), AnimatorError> {
        if self.children.iter().any(|c| c.name == name) {
            return Err(AnimatorError::DuplicateAnimator(name.to_string()));
        }
        if let Some(first) = self.children.first() {
            let seekable = animator.seekable();
            if first.animator.seekable() != seekable {
                return Err(AnimatorError::SeekableMismatch {
                    name: name.to_string(),
                    seekable,
                });
            }
        }
        Ok(())
    }
    
    /// Adds a child, bringing it to the composite's current time.
    pub async fn add_animator(&mut self, name: &str, mut animator: Box<dyn Animator>) -> Result<(), AnimatorError> {
        self.check_child(name, animator.as_ref())?;
        if !self.children.is_empty() {
            animator.set_time(self.time).await?;
        }
        let mut child = JoinedChild::new(name.to_string(), animator);
        // The child's own settle events predate the join
        drain(&mut child.events);
        self.children.push(child);
        
        debug!(id = %self.id, name, "added child animator");
        self.rebuild_state();
        self.bus.emit(AnimatorEvent::AddAnimator { name: name.to_string() });
        let mut diff = StateDiff::new();
        diff.mark(name);
        self.bus.mark_changed(&diff);
        self.bus.flush(self.time);
        Ok(())
    }
    
    /// Detaches and returns a child.
    pub fn remove_animator(&mut self, name: &str) -> Result<Box<dyn Animator>, AnimatorError> {
        let index = self
            .children
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| AnimatorError::UnknownAnimator(name.to_string()))?;
        let child = self.children.remove(index);
        
        debug!(id = %self.id, name, "removed child animator");
        self.rebuild_state();
        self.bus.emit(AnimatorEvent::RemoveAnimator { name: name.to_string() });
        let mut diff = StateDiff::new();
        diff.mark(name);
        self.bus.mark_changed(&diff);
        self.bus.flush(self.time);
        Ok(child.animator)
    }
    
    pub fn names(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.name.as_str()).collect()
    }
    
    pub fn child_state(&self, name: &str) -> Option<&State> {
        self.animator(name).map(|animator| animator.state())
    }
    
    pub fn animator(&self, name: &str) -> Option<&dyn Animator> {
        self.children
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.animator.as_ref())
    }
    
    pub fn animator_mut(&mut self, name: &str) -> Option<&mut Box<dyn Animator>> {
        self.children
            .iter_mut()
            .find(|c| c.name == name)
            .map(|c| &mut c.animator)
    }
    
    fn rebuild_state(&mut self) {
        self.state = self
            .children
            .iter()
            .map(|c| (c.name.clone(), Value::Map(c.animator.state().clone())))
            .collect();
    }
    
    /// Forwards child events. A child `Change` marks that child's field.
    fn forward_events(&mut self) {
        for child in &mut self.children {
            for event in drain(&mut child.events) {
                match event {
                    AnimatorEvent::Change { .. } => {
                        let mut diff = StateDiff::new();
                        diff.mark(&child.name);
                        self.bus.mark_changed(&diff);
                    }
                    AnimatorEvent::Reset | AnimatorEvent::Dispose => {}
                    event => self.bus.emit(event),
                }
            }
        }
    }
    
    fn settle(&mut self) {
        self.forward_events();
        self.rebuild_state();
        self.bus.flush(self.time);
    }
}

fn first_error(results: Vec<Result<(), AnimatorError>>) -> Result<(), AnimatorError> {
    results.into_iter().collect()
}

#[async_trait]
impl Animator for JoinedAnimator {
    fn id(&self) -> AnimatorId {
        self.id
    }
    
    fn time(&self) -> f64 {
        self.time
    }
    
    fn state(&self) -> &State {
        &self.state
    }
    
    /// A joined animator holds no frames of its own.
    fn frames(&self) -> &[Frame] {
        &[]
    }
    
    fn start_time(&self) -> f64 {
        self.children
            .iter()
            .map(|c| c.animator.start_time())
            .reduce(f64::min)
            .unwrap_or(0.0)
    }
    
    fn end_time(&self) -> f64 {
        self.children
            .iter()
            .map(|c| c.animator.end_time())
            .reduce(f64::max)
            .unwrap_or(0.0)
    }
    
    fn seekable(&self) -> bool {
        self.children.iter().all(|c| c.animator.seekable())
    }
    
    fn live_data(&self) -> bool {
        self.children.iter().any(|c| c.animator.live_data())
    }
    
    fn stale(&self) -> bool {
        self.children.iter().any(|c| c.animator.stale())
    }
    
    fn ready(&self) -> bool {
        self.children.iter().any(|c| c.animator.ready())
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
        let results = join_all(self.children.iter_mut().map(|c| c.animator.set_time(time))).await;
        self.time = time;
        self.settle();
        first_error(results)
    }
    
    async fn reset(&mut self) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        let results = join_all(self.children.iter_mut().map(|c| c.animator.reset())).await;
        self.time = self.start_time();
        self.bus.emit(AnimatorEvent::Reset);
        self.bus.mark_changed(&StateDiff::all());
        self.settle();
        first_error(results)
    }
    
    /// Splits frames by top-level key; each key names a child and carries its partial state.
    async fn add_frames(&mut self, frames: Vec<Frame>) -> Result<(), AnimatorError> {
        if self.disposed || frames.is_empty() {
            return Ok(());
        }
        let mut routed: BTreeMap<usize, Vec<Frame>> = BTreeMap::new();
        for frame in frames {
            for (name, value) in frame.state {
                let index = self
                    .children
                    .iter()
                    .position(|c| c.name == name)
                    .ok_or_else(|| AnimatorError::UnknownAnimator(name.clone()))?;
                match value {
                    Value::Map(state) => routed.entry(index).or_default().push(Frame::new(frame.time, state)),
                    _ => warn!(id = %self.id, name = %name, "ignoring non-map value for child"),
                }
            }
        }
        
        let mut result = Ok(());
        for (index, frames) in routed {
            if let Err(err) = self.children[index].animator.add_frames(frames).await {
                result = result.and(Err(err));
            }
        }
        self.settle();
        result
    }
    
    async fn poll(&mut self) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        let results = join_all(self.children.iter_mut().map(|c| c.animator.poll())).await;
        self.settle();
        first_error(results)
    }
    
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for child in &mut self.children {
            child.animator.dispose();
        }
        self.bus.emit(AnimatorEvent::Dispose);
    }
}
