//! Look-ahead layer: preloads out-of-band resources around the playhead.
//!
//! Frames whose time falls in `[time - look_back, time + look_ahead]` get
//! their resources preloaded (image blobs, meshes, anything a frame state
//! only references). Frames leaving the window are cancelled and unloaded.
//! Preloads never touch the rolled state; a [`Preloader`] may still patch
//! the visible state through [`Preloader::process_state`].

use crate::animator::Animator;
use crate::error::AnimatorError;
use crate::events::{AnimatorEvent, EventBus, StateDiff};
use crate::frame::Frame;
use crate::value::State;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use telemetry_env::{AnimatorId, CancelToken, EnvError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

/// Loads and releases the resources referenced by a frame state.
pub trait Preloader: Send + Sync + 'static {
    /// Starts loading everything `state` references.
    fn preload(&self, state: &State, cancel: CancelToken) -> Vec<BoxFuture<'static, Result<(), EnvError>>>;
    
    /// Releases what `preload` loaded for `state`.
    fn unload(&self, state: &State);
    
    /// Patches the visible state once preloads settle. Returns true if it changed anything.
    fn process_state(&self, _state: &mut State) -> bool {
        false
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookAheadConfig {
    /// Preload frames up to this far ahead of the playhead (default: 1.0)
    pub look_ahead: f64,
    
    /// Keep frames this far behind the playhead loaded (default: 1.0)
    pub look_back: f64,
}

impl Default for LookAheadConfig {
    fn default() -> Self {
        Self {
            look_ahead: 1.0,
            look_back: 1.0,
        }
    }
}

impl LookAheadConfig {
    pub fn with_look_ahead(mut self, look_ahead: f64) -> Self {
        self.look_ahead = look_ahead;
        self
    }
    
    pub fn with_look_back(mut self, look_back: f64) -> Self {
        self.look_back = look_back;
        self
    }
}

/// Frame identity: time bits plus position among frames sharing that time.
type FrameKey = (u64, usize);

type PreloadResults = Vec<Result<(), EnvError>>;

/// Sent by a preload task once every future it runs has settled.
type Settled = (FrameKey, u64, PreloadResults);

struct Preload {
    time: f64,
    state: State,
    cancel: CancelToken,
    request: u64,
    task: JoinHandle<()>,
    done: bool,
}

/// Wraps an animator and preloads resources for frames near the playhead.
pub struct LookAheadAnimator<A: Animator> {
    inner: A,
    preloader: Arc<dyn Preloader>,
    config: LookAheadConfig,
    preloads: HashMap<FrameKey, Preload>,
    settled_tx: mpsc::UnboundedSender<Settled>,
    settled_rx: mpsc::UnboundedReceiver<Settled>,
    next_request: u64,
    
    /// Inner state after `process_state`, when it changed anything
    processed: Option<State>,
    
    bus: EventBus,
    inner_events: broadcast::Receiver<AnimatorEvent>,
}

impl<A: Animator> LookAheadAnimator<A> {
    pub fn new(inner: A, preloader: Arc<dyn Preloader>, config: LookAheadConfig) -> Self {
        let inner_events = inner.subscribe();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        Self {
            inner,
            preloader,
            config,
            preloads: HashMap::new(),
            settled_tx,
            settled_rx,
            next_request: 0,
            processed: None,
            bus: EventBus::new(),
            inner_events,
        }
    }
    
    pub fn inner(&self) -> &A {
        &self.inner
    }
    
    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }
    
    pub fn config(&self) -> &LookAheadConfig {
        &self.config
    }
    
    /// Times of every frame currently tracked, ascending.
    pub fn preloaded_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self.preloads.values().map(|p| p.time).collect();
        times.sort_by(f64::total_cmp);
        times
    }
    
    /// Waits for every tracked preload to settle.
    pub async fn wait_for_preloads(&mut self) {
        let mut failed = Vec::new();
        for (key, preload) in self.preloads.iter_mut().filter(|(_, p)| !p.done) {
            if let Err(err) = (&mut preload.task).await {
                preload.done = true;
                failed.push((*key, err));
            }
        }
        for (key, err) in failed {
            self.report(key, Err(err));
        }
        self.poll_preloads();
        self.refresh_processed();
        self.bus.flush(self.inner.time());
    }
    
    // ========================================================================
    // WINDOW
    // ========================================================================
    
    /// Preloads newly entered frames and unloads frames that left the window.
    fn update_window(&mut self) {
        let time = self.inner.time();
        let (lo, hi) = (time - self.config.look_back, time + self.config.look_ahead);
        let frames = self.inner.frames_in(lo, hi);
        
        let mut wanted: HashSet<FrameKey> = HashSet::new();
        let mut entered: Vec<(FrameKey, &Frame)> = Vec::new();
        let mut ordinal = 0;
        for (i, frame) in frames.iter().enumerate() {
            ordinal = match i.checked_sub(1).map(|p| frames[p].time) {
                Some(previous) if previous == frame.time => ordinal + 1,
                _ => 0,
            };
            let key = (frame.time.to_bits(), ordinal);
            wanted.insert(key);
            if !self.preloads.contains_key(&key) {
                entered.push((key, frame));
            }
        }
        
        let mut started = Vec::with_capacity(entered.len());
        for (key, frame) in entered {
            let cancel = CancelToken::new();
            let futures = self.preloader.preload(&frame.state, cancel.clone());
            let request = self.next_request;
            self.next_request += 1;
            let settled = self.settled_tx.clone();
            let task = tokio::spawn(async move {
                let results = join_all(futures).await;
                let _ = settled.send((key, request, results));
            });
            started.push((
                key,
                Preload {
                    time: frame.time,
                    state: frame.state.clone(),
                    cancel,
                    request,
                    task,
                    done: false,
                },
            ));
        }
        for (key, preload) in started {
            debug!(id = %self.inner.id(), time = preload.time, "preloading frame");
            self.preloads.insert(key, preload);
        }
        
        let left: Vec<FrameKey> = self
            .preloads
            .keys()
            .filter(|key| !wanted.contains(key))
            .copied()
            .collect();
        for key in left {
            if let Some(preload) = self.preloads.remove(&key) {
                self.release(preload);
            }
        }
    }
    
    fn release(&self, preload: Preload) {
        preload.cancel.cancel();
        preload.task.abort();
        self.preloader.unload(&preload.state);
        debug!(id = %self.inner.id(), time = preload.time, "unloaded frame");
    }
    
    /// Collects preloads that settled since the last call.
    fn poll_preloads(&mut self) {
        let finished: Vec<FrameKey> = self
            .preloads
            .iter()
            .filter(|(_, p)| !p.done && p.task.is_finished())
            .map(|(key, _)| *key)
            .collect();
        
        let mut settled = Vec::new();
        while let Ok((key, request, results)) = self.settled_rx.try_recv() {
            // Replies for frames unloaded and re-entered since are dropped
            if let Some(preload) = self.preloads.get_mut(&key) {
                if preload.request == request && !preload.done {
                    preload.done = true;
                    settled.push((key, Ok(results)));
                }
            }
        }
        
        // Finished without reporting back: the task panicked
        for key in finished {
            let Some(preload) = self.preloads.get_mut(&key).filter(|p| !p.done) else {
                continue;
            };
            if let Some(Err(err)) = (&mut preload.task).now_or_never() {
                preload.done = true;
                settled.push((key, Err(err)));
            }
        }
        
        for (key, result) in settled {
            self.report(key, result);
        }
    }
    
    /// Surfaces preload failures other than cancellation as error events.
    fn report(&self, key: FrameKey, result: Result<PreloadResults, JoinError>) {
        let time = f64::from_bits(key.0);
        let results = match result {
            Ok(results) => results,
            Err(err) if err.is_cancelled() => return,
            Err(err) => vec![Err(EnvError::source(err.to_string()))],
        };
        for err in results.into_iter().filter_map(Result::err) {
            if err.is_cancelled() {
                continue;
            }
            warn!(id = %self.inner.id(), time, error = %err, "preload failed");
            self.bus.emit(AnimatorEvent::Error { error: err.into() });
        }
    }
    
    /// Reruns `process_state` over the inner state.
    ///
    /// Fields that differ from the previously visible state are queued as a change.
    fn refresh_processed(&mut self) {
        let mut state = self.inner.state().clone();
        let processed = self.preloader.process_state(&mut state).then_some(state);
        let before = self.state();
        let after = processed.as_ref().unwrap_or(self.inner.state());
        let mut diff = StateDiff::new();
        for key in before.keys().chain(after.keys()) {
            if before.get(key) != after.get(key) {
                diff.mark(key);
            }
        }
        self.bus.mark_changed(&diff);
        self.processed = processed;
    }
    
    /// Re-emits inner events on this animator's bus, coalescing changes.
    fn forward_events(&mut self) {
        loop {
            match self.inner_events.try_recv() {
                Ok(AnimatorEvent::Change { diff, .. }) => self.bus.mark_changed(&diff),
                Ok(event) => self.bus.emit(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "look-ahead lagged behind inner events");
                }
                Err(_) => break,
            }
        }
    }
    
    /// Window maintenance and event flush after any inner operation.
    fn after_inner(&mut self) {
        self.forward_events();
        self.update_window();
        self.poll_preloads();
        self.refresh_processed();
        self.bus.flush(self.inner.time());
    }
}

#[async_trait]
impl<A: Animator> Animator for LookAheadAnimator<A> {
    fn id(&self) -> AnimatorId {
        self.inner.id()
    }
    
    fn time(&self) -> f64 {
        self.inner.time()
    }
    
    fn state(&self) -> &State {
        self.processed.as_ref().unwrap_or(self.inner.state())
    }
    
    fn frames(&self) -> &[Frame] {
        self.inner.frames()
    }
    
    fn frames_in(&self, lo: f64, hi: f64) -> Vec<Frame> {
        self.inner.frames_in(lo, hi)
    }
    
    fn start_time(&self) -> f64 {
        self.inner.start_time()
    }
    
    fn end_time(&self) -> f64 {
        self.inner.end_time()
    }
    
    fn seekable(&self) -> bool {
        self.inner.seekable()
    }
    
    fn live_data(&self) -> bool {
        self.inner.live_data()
    }
    
    /// Stale while the inner animator is, or while a preload for a frame at
    /// or before the playhead is still running. Frames ahead do not count.
    fn stale(&self) -> bool {
        let now = self.inner.time();
        self.inner.stale()
            || self
                .preloads
                .values()
                .any(|p| p.time <= now && !p.done && !p.task.is_finished())
    }
    
    fn ready(&self) -> bool {
        self.inner.ready()
    }
    
    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
    
    fn subscribe(&self) -> broadcast::Receiver<AnimatorEvent> {
        self.bus.subscribe()
    }
    
    async fn set_time(&mut self, time: f64) -> Result<(), AnimatorError> {
        if self.inner.is_disposed() {
            return Ok(());
        }
        let result = self.inner.set_time(time).await;
        self.after_inner();
        result
    }
    
    async fn reset(&mut self) -> Result<(), AnimatorError> {
        if self.inner.is_disposed() {
            return Ok(());
        }
        let result = self.inner.reset().await;
        self.after_inner();
        result
    }
    
    async fn add_frames(&mut self, frames: Vec<Frame>) -> Result<(), AnimatorError> {
        if self.inner.is_disposed() {
            return Ok(());
        }
        let result = self.inner.add_frames(frames).await;
        self.after_inner();
        result
    }
    
    /// Runs `process_state` for preloads that settled while the playhead was idle.
    async fn poll(&mut self) -> Result<(), AnimatorError> {
        if self.inner.is_disposed() {
            return Ok(());
        }
        let result = self.inner.poll().await;
        self.after_inner();
        result
    }
    
    fn dispose(&mut self) {
        if self.inner.is_disposed() {
            return;
        }
        for (_, preload) in std::mem::take(&mut self.preloads) {
            self.release(preload);
        }
        self.processed = None;
        self.inner.dispose();
        self.forward_events();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animator::TelemetryAnimator;
    use crate::buffered::{BufferConfig, BufferedAnimator};
    use crate::events::drain;
    use crate::live::{CachedFrameSource, FramesCache};
    use crate::state;
    use crate::value::Value;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;
    
    /// Records loads and unloads by the frame's `img` field.
    #[derive(Default)]
    struct RecordingPreloader {
        loads: Mutex<Vec<String>>,
        unloads: Mutex<Vec<String>>,
        loaded: Arc<Mutex<HashSet<String>>>,
        gate: Option<Arc<Semaphore>>,
        failing: Option<String>,
    }
    
    fn image(state: &State) -> String {
        state.get("img").and_then(Value::as_str).unwrap_or_default().to_string()
    }
    
    impl Preloader for RecordingPreloader {
        fn preload(&self, state: &State, _cancel: CancelToken) -> Vec<BoxFuture<'static, Result<(), EnvError>>> {
            let img = image(state);
            self.loads.lock().unwrap().push(img.clone());
            let gate = self.gate.clone();
            let failing = self.failing.as_deref() == Some(img.as_str());
            let loaded = self.loaded.clone();
            vec![async move {
                if let Some(gate) = gate {
                    let _permit = gate.acquire().await;
                }
                if failing {
                    return Err(EnvError::source(format!("missing blob {}", img)));
                }
                loaded.lock().unwrap().insert(img);
                Ok(())
            }
            .boxed()]
        }
        
        fn unload(&self, state: &State) {
            let img = image(state);
            self.loaded.lock().unwrap().remove(&img);
            self.unloads.lock().unwrap().push(img);
        }
        
        fn process_state(&self, state: &mut State) -> bool {
            let img = image(state);
            if img.is_empty() || !self.loaded.lock().unwrap().contains(&img) {
                return false;
            }
            state.insert("image_ready".to_string(), Value::Bool(true));
            true
        }
    }
    
    fn image_frames() -> Vec<Frame> {
        (1..=4)
            .map(|i| Frame::new(i as f64, state! { "img" => format!("f{}", i) }))
            .collect()
    }
    
    #[tokio::test]
    async fn test_window_loads_one_in_one_out() {
        let preloader = Arc::new(RecordingPreloader::default());
        let inner = TelemetryAnimator::new(image_frames());
        let mut anim = LookAheadAnimator::new(inner, preloader.clone(), LookAheadConfig::default());
        
        anim.set_time(1.0).await.unwrap();
        assert_eq!(*preloader.loads.lock().unwrap(), vec!["f1", "f2"]);
        assert!(preloader.unloads.lock().unwrap().is_empty());
        
        anim.set_time(2.0).await.unwrap();
        assert_eq!(preloader.loads.lock().unwrap().len(), 3);
        assert!(preloader.unloads.lock().unwrap().is_empty());
        
        anim.set_time(3.0).await.unwrap();
        assert_eq!(preloader.loads.lock().unwrap().last().map(String::as_str), Some("f4"));
        assert_eq!(*preloader.unloads.lock().unwrap(), vec!["f1"]);
        assert_eq!(anim.preloaded_times(), vec![2.0, 3.0, 4.0]);
    }
    
    #[tokio::test]
    async fn test_stale_only_for_frames_at_or_before_playhead() {
        let gate = Arc::new(Semaphore::new(0));
        let preloader = Arc::new(RecordingPreloader {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let inner = TelemetryAnimator::new(image_frames());
        let mut anim = LookAheadAnimator::new(inner, preloader, LookAheadConfig::default().with_look_back(0.0));
        
        // Frame 1 is ahead of the playhead; its pending preload does not block
        anim.set_time(0.5).await.unwrap();
        assert!(!anim.stale());
        
        anim.set_time(1.0).await.unwrap();
        assert!(anim.stale());
        
        gate.add_permits(8);
        anim.wait_for_preloads().await;
        assert!(!anim.stale());
    }
    
    #[tokio::test]
    async fn test_preload_error_is_emitted() {
        let preloader = Arc::new(RecordingPreloader {
            failing: Some("f2".to_string()),
            ..Default::default()
        });
        let inner = TelemetryAnimator::new(image_frames());
        let mut anim = LookAheadAnimator::new(inner, preloader, LookAheadConfig::default());
        let mut rx = anim.subscribe();
        
        anim.set_time(1.0).await.unwrap();
        anim.wait_for_preloads().await;
        
        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AnimatorEvent::Error { error } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![AnimatorError::Env(EnvError::source("missing blob f2"))]);
        assert!(!anim.stale());
    }
    
    #[tokio::test]
    async fn test_process_state_after_preload() {
        let preloader = Arc::new(RecordingPreloader::default());
        let inner = TelemetryAnimator::new(image_frames());
        let mut anim = LookAheadAnimator::new(inner, preloader, LookAheadConfig::default());
        let mut rx = anim.subscribe();
        
        anim.set_time(2.0).await.unwrap();
        anim.wait_for_preloads().await;
        
        assert_eq!(anim.state()["image_ready"], Value::Bool(true));
        assert!(anim.inner().state().get("image_ready").is_none());
        let marked = drain(&mut rx).into_iter().any(|e| match e {
            AnimatorEvent::Change { diff, .. } => diff.did_change("image_ready"),
            _ => false,
        });
        assert!(marked);
    }
    
    #[tokio::test]
    async fn test_idle_poll_applies_settled_preloads() {
        let gate = Arc::new(Semaphore::new(0));
        let preloader = Arc::new(RecordingPreloader {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let inner = TelemetryAnimator::new(image_frames());
        let mut anim = LookAheadAnimator::new(inner, preloader, LookAheadConfig::default());
        let mut rx = anim.subscribe();
        
        anim.set_time(2.0).await.unwrap();
        assert!(anim.state().get("image_ready").is_none());
        drain(&mut rx);
        
        gate.add_permits(8);
        for _ in 0..4 {
            tokio::task::yield_now().await;
            anim.poll().await.unwrap();
        }
        
        assert_eq!(anim.state()["image_ready"], Value::Bool(true));
        assert!(!anim.stale());
        let marked = drain(&mut rx).into_iter().any(|e| match e {
            AnimatorEvent::Change { diff, .. } => diff.did_change("image_ready"),
            _ => false,
        });
        assert!(marked);
    }
    
    #[tokio::test]
    async fn test_window_reaches_into_buffered_chunks() {
        let cache = FramesCache::in_memory(1.0);
        cache.set(0.0, vec![Frame::new(0.2, state! { "img" => "a" })]).await.unwrap();
        cache
            .set(
                1.0,
                vec![
                    Frame::new(1.2, state! { "img" => "b" }),
                    Frame::new(1.4, state! { "img" => "c" }),
                ],
            )
            .await
            .unwrap();
        let inner = BufferedAnimator::new(
            Arc::new(CachedFrameSource::new(cache)),
            BufferConfig::default().with_buffer(1.0),
        );
        let preloader = Arc::new(RecordingPreloader::default());
        let config = LookAheadConfig::default().with_look_ahead(1.0);
        let mut anim = LookAheadAnimator::new(inner, preloader, config);
        
        anim.set_time(0.5).await.unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
            anim.poll().await.unwrap();
        }
        
        // Frames ahead of the rolled chunk are preloaded before the playhead gets there
        assert_eq!(anim.inner().frames().len(), 1);
        assert_eq!(anim.preloaded_times(), vec![0.2, 1.2, 1.4]);
    }
    
    #[tokio::test]
    async fn test_dispose_unloads_everything() {
        let preloader = Arc::new(RecordingPreloader::default());
        let inner = TelemetryAnimator::new(image_frames());
        let mut anim = LookAheadAnimator::new(inner, preloader.clone(), LookAheadConfig::default());
        let mut rx = anim.subscribe();
        
        anim.set_time(2.0).await.unwrap();
        anim.dispose();
        
        let mut unloads = preloader.unloads.lock().unwrap().clone();
        unloads.sort();
        assert_eq!(unloads, vec!["f1", "f2", "f3"]);
        assert!(drain(&mut rx).iter().any(|e| matches!(e, AnimatorEvent::Dispose)));
        assert!(anim.set_time(3.0).await.is_ok());
    }
}
