//! Live animator: streaming head fused with a buffered, keyframed history.
//!
//! New frames always go to a non-seekable streaming animator that holds
//! only recent data. As they arrive they are folded into the keyframe
//! index and queued for the chunked [`FramesCache`]. Seeking behind the
//! streaming head is served by a [`BufferedAnimator`] reading that cache.
//!
//! ```text
//!   cache side (history)                     streaming side (head)
//!   |--- chunk ---|--- chunk ---|--- chunk ---|======== in memory ====|
//!   start_time                          streaming.time()        end_time
//! ```

use crate::animator::{Animator, AnimatorConfig, TelemetryAnimator};
use crate::buffered::{BufferConfig, BufferedAnimator, FrameSource};
use crate::error::AnimatorError;
use crate::events::{drain, AnimatorEvent, EventBus, StateDiff};
use crate::frame::{sort_frames, Frame};
use crate::keyframe::{Keyframe, KeyframeIndex};
use crate::policy::StatePolicy;
use crate::value::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use telemetry_env::{AnimatorId, CancelToken, EnvError, MemoryCache, ObjectCache};
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// History chunk size (default: 1000.0)
    pub chunk_size: f64,
    
    /// Resident history around the playhead (default: 2000.0)
    pub buffer: f64,
    
    /// Keyframe spacing (default: 1000.0)
    pub keyframe_stride: f64,
    
    /// How much of the stream stays in memory behind the head (default: 1000.0)
    pub non_seekable_buffer: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000.0,
            buffer: 2000.0,
            keyframe_stride: 1000.0,
            non_seekable_buffer: 1000.0,
        }
    }
}

impl LiveConfig {
    pub fn with_chunk_size(mut self, chunk_size: f64) -> Self {
        self.chunk_size = chunk_size;
        self
    }
    
    pub fn with_buffer(mut self, buffer: f64) -> Self {
        self.buffer = buffer;
        self
    }
    
    pub fn with_keyframe_stride(mut self, stride: f64) -> Self {
        self.keyframe_stride = stride;
        self
    }
    
    pub fn with_non_seekable_buffer(mut self, buffer: f64) -> Self {
        self.non_seekable_buffer = buffer;
        self
    }
}

// ============================================================================
// FRAMES CACHE
// ============================================================================

/// Chunk-aligned frame storage keyed by chunk start time.
#[derive(Clone)]
pub struct FramesCache {
    cache: Arc<dyn ObjectCache<Vec<Frame>>>,
    chunk_size: f64,
}

impl FramesCache {
    pub fn new(cache: Arc<dyn ObjectCache<Vec<Frame>>>, chunk_size: f64) -> Self {
        Self { cache, chunk_size }
    }
    
    pub fn in_memory(chunk_size: f64) -> Self {
        Self::new(Arc::new(MemoryCache::<Vec<Frame>>::new()), chunk_size)
    }
    
    pub fn chunk_size(&self) -> f64 {
        self.chunk_size
    }
    
    fn key(&self, time: f64) -> i64 {
        (time / self.chunk_size).floor() as i64
    }
    
    /// Frames stored for the chunk containing `time`.
    pub async fn get(&self, time: f64) -> Result<Option<Vec<Frame>>, EnvError> {
        self.cache.get(self.key(time)).await
    }
    
    pub async fn set(&self, time: f64, frames: Vec<Frame>) -> Result<(), EnvError> {
        self.cache.set(self.key(time), frames).await
    }
    
    pub async fn has(&self, time: f64) -> Result<bool, EnvError> {
        self.cache.has(self.key(time)).await
    }
}

/// Serves chunks out of a [`FramesCache`]. A missing chunk is a gap.
pub struct CachedFrameSource {
    cache: FramesCache,
}

impl CachedFrameSource {
    pub fn new(cache: FramesCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl FrameSource for CachedFrameSource {
    async fn get_frames(&self, time: f64, _length: f64, cancel: CancelToken) -> Result<Option<Vec<Frame>>, EnvError> {
        cancel.check()?;
        let frames = self.cache.get(time).await?;
        cancel.check()?;
        Ok(Some(frames.unwrap_or_default()))
    }
}

// ============================================================================
// LIVE ANIMATOR
// ============================================================================

/// Which child currently answers `state()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSide {
    Streaming,
    Cache,
}

pub struct LiveAnimator {
    id: AnimatorId,
    config: LiveConfig,
    streaming: TelemetryAnimator,
    cache_animator: BufferedAnimator,
    frames_cache: FramesCache,
    
    /// Frames not yet written to the frames cache, by chunk index
    pending: BTreeMap<i64, Vec<Frame>>,
    
    current: LiveSide,
    time: f64,
    disposed: bool,
    bus: EventBus,
    streaming_events: broadcast::Receiver<AnimatorEvent>,
    cache_events: broadcast::Receiver<AnimatorEvent>,
}

impl LiveAnimator {
    /// Live animator over in-memory frame and keyframe caches.
    pub fn new(config: LiveConfig) -> Self {
        Self::with_caches(config, Arc::new(MemoryCache::<Vec<Frame>>::new()), Arc::new(MemoryCache::<Keyframe>::new()))
    }
    
    pub fn with_caches(
        config: LiveConfig,
        frames: Arc<dyn ObjectCache<Vec<Frame>>>,
        keyframes: Arc<dyn ObjectCache<Keyframe>>,
    ) -> Self {
        let streaming = TelemetryAnimator::with_config(
            Vec::new(),
            AnimatorConfig::default()
                .with_seekable(false)
                .with_live_data(true)
                .with_non_seekable_buffer(config.non_seekable_buffer),
        );
        let frames_cache = FramesCache::new(frames, config.chunk_size);
        let buffer = BufferConfig::default()
            .with_chunk_size(config.chunk_size)
            .with_buffer(config.buffer);
        let cache_animator = BufferedAnimator::new(Arc::new(CachedFrameSource::new(frames_cache.clone())), buffer)
            .with_keyframes(KeyframeIndex::new(config.keyframe_stride, keyframes));
        
        let streaming_events = streaming.subscribe();
        let cache_events = cache_animator.subscribe();
        Self {
            id: AnimatorId::new(),
            config,
            streaming,
            cache_animator,
            frames_cache,
            pending: BTreeMap::new(),
            current: LiveSide::Streaming,
            time: 0.0,
            disposed: false,
            bus: EventBus::new(),
            streaming_events,
            cache_events,
        }
    }
    
    /// Uses `policy` for both the stream and the history.
    pub fn with_policy(mut self, policy: Arc<dyn StatePolicy>) -> Self {
        self.streaming = self.streaming.with_policy(policy.clone());
        let history = TelemetryAnimator::new(Vec::new()).with_policy(policy);
        self.cache_animator = self.cache_animator.with_base(history);
        self.cache_events = self.cache_animator.subscribe();
        self
    }
    
    pub fn config(&self) -> &LiveConfig {
        &self.config
    }
    
    pub fn streaming(&self) -> &TelemetryAnimator {
        &self.streaming
    }
    
    pub fn cache_animator(&self) -> &BufferedAnimator {
        &self.cache_animator
    }
    
    pub fn frames_cache(&self) -> &FramesCache {
        &self.frames_cache
    }
    
    pub fn keyframes(&self) -> Option<&KeyframeIndex> {
        self.cache_animator.keyframes()
    }
    
    pub fn current(&self) -> LiveSide {
        self.current
    }
    
    /// Forwards the feed's connection state to the streaming side.
    pub fn set_connected(&mut self, connected: bool) {
        self.streaming.set_connected(connected);
        self.forward_events();
    }
    
    /// Writes every queued frame to the frames cache.
    pub async fn flush(&mut self) {
        let chunks: Vec<i64> = self.pending.keys().copied().collect();
        self.flush_chunks(chunks).await;
    }
    
    /// Writes every chunk the streaming head has moved past.
    async fn flush_completed(&mut self) {
        let head = (self.streaming.time() / self.config.chunk_size).floor() as i64;
        let completed: Vec<i64> = self.pending.range(..head).map(|(&index, _)| index).collect();
        self.flush_chunks(completed).await;
    }
    
    /// Appends to the stream and moves its head, publishing a single `Change`.
    async fn stream_frames(&mut self, frames: Vec<Frame>) -> Result<(), AnimatorError> {
        self.streaming.bus_mut().suppress();
        let result = self.advance_stream(frames).await;
        self.streaming.bus_mut().resume();
        let time = self.streaming.time();
        self.streaming.bus_mut().flush(time);
        result
    }
    
    async fn advance_stream(&mut self, frames: Vec<Frame>) -> Result<(), AnimatorError> {
        self.streaming.add_frames(frames).await?;
        let head = self.streaming.end_time();
        if head > self.streaming.time() {
            self.streaming.set_time(head).await?;
        }
        Ok(())
    }
    
    async fn flush_chunks(&mut self, chunks: Vec<i64>) {
        for index in chunks {
            let Some(frames) = self.pending.remove(&index) else {
                continue;
            };
            let time = index as f64 * self.config.chunk_size;
            match self.write_chunk(time, &frames).await {
                Ok(()) => {
                    self.cache_animator.reset_chunk_at_time(time);
                    debug!(id = %self.id, time, count = frames.len(), "moved frames to history");
                }
                Err(err) => {
                    warn!(id = %self.id, time, error = %err, "history write failed");
                    self.pending.insert(index, frames);
                    self.bus.emit(AnimatorEvent::Error { error: err.into() });
                }
            }
        }
    }
    
    async fn write_chunk(&self, time: f64, frames: &[Frame]) -> Result<(), EnvError> {
        let mut merged = self.frames_cache.get(time).await?.unwrap_or_default();
        merged.extend_from_slice(frames);
        sort_frames(&mut merged);
        self.frames_cache.set(time, merged).await
    }
    
    fn side(&self) -> &dyn Animator {
        match self.current {
            LiveSide::Streaming => &self.streaming,
            LiveSide::Cache => &self.cache_animator,
        }
    }
    
    /// Re-emits child events; state events only from the current side.
    fn forward_events(&mut self) {
        let sides = [
            (LiveSide::Streaming, drain(&mut self.streaming_events)),
            (LiveSide::Cache, drain(&mut self.cache_events)),
        ];
        for (side, events) in sides {
            let active = side == self.current;
            for event in events {
                match event {
                    AnimatorEvent::Change { diff, .. } if active => self.bus.mark_changed(&diff),
                    event @ (AnimatorEvent::AddedFrames { .. } | AnimatorEvent::Error { .. }) => {
                        self.bus.emit(event)
                    }
                    event @ (AnimatorEvent::Reset
                    | AnimatorEvent::KeyframeProgress { .. }
                    | AnimatorEvent::Connected
                    | AnimatorEvent::Disconnected)
                        if active =>
                    {
                        self.bus.emit(event)
                    }
                    _ => {}
                }
            }
        }
    }
}

#[async_trait]
impl Animator for LiveAnimator {
    fn id(&self) -> AnimatorId {
        self.id
    }
    
    fn time(&self) -> f64 {
        self.time
    }
    
    fn state(&self) -> &State {
        self.side().state()
    }
    
    fn frames(&self) -> &[Frame] {
        self.side().frames()
    }
    
    fn frames_in(&self, lo: f64, hi: f64) -> Vec<Frame> {
        self.side().frames_in(lo, hi)
    }
    
    fn start_time(&self) -> f64 {
        self.cache_animator.start_time()
    }
    
    fn end_time(&self) -> f64 {
        self.streaming.end_time()
    }
    
    fn seekable(&self) -> bool {
        true
    }
    
    fn live_data(&self) -> bool {
        true
    }
    
    fn stale(&self) -> bool {
        self.side().stale()
    }
    
    fn ready(&self) -> bool {
        self.streaming.ready() || self.cache_animator.ready()
    }
    
    fn is_disposed(&self) -> bool {
        self.disposed
    }
    
    fn subscribe(&self) -> broadcast::Receiver<AnimatorEvent> {
        self.bus.subscribe()
    }
    
    /// Routes to the stream at or past its head, to the history otherwise.
    async fn set_time(&mut self, time: f64) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        self.flush().await;
        
        let side = if time >= self.streaming.time() {
            LiveSide::Streaming
        } else {
            LiveSide::Cache
        };
        let switched = side != self.current;
        self.current = side;
        self.time = time;
        
        let result = match side {
            LiveSide::Streaming => Ok(()),
            LiveSide::Cache => self.cache_animator.set_time(time).await,
        };
        self.forward_events();
        if switched {
            debug!(id = %self.id, ?side, time, "switched live side");
            self.bus.mark_changed(&StateDiff::all());
        }
        self.bus.flush(self.time);
        result
    }
    
    async fn reset(&mut self) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        self.bus.emit(AnimatorEvent::Reset);
        let start = self.start_time();
        self.set_time(start).await
    }
    
    /// Appends to the stream and advances its head; the history catches up as frames age out.
    async fn add_frames(&mut self, mut frames: Vec<Frame>) -> Result<(), AnimatorError> {
        if self.disposed || frames.is_empty() {
            return Ok(());
        }
        sort_frames(&mut frames);
        if let Some(keyframes) = self.cache_animator.keyframes() {
            if keyframes.is_generating() {
                return Err(AnimatorError::AlreadyGenerating);
            }
        }
        
        self.stream_frames(frames.clone()).await?;
        
        if let Some(keyframes) = self.cache_animator.keyframes_mut() {
            keyframes.extend(&frames).await?;
        }
        if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
            self.cache_animator.widen_range(first.time, last.time);
        }
        let chunk_size = self.config.chunk_size;
        for frame in frames {
            let index = (frame.time / chunk_size).floor() as i64;
            self.pending.entry(index).or_default().push(frame);
        }
        self.flush_completed().await;
        
        if self.current == LiveSide::Streaming {
            self.time = self.streaming.time();
        }
        self.forward_events();
        self.bus.flush(self.time);
        Ok(())
    }
    
    /// Lets the history pick up chunk loads that finished while idle.
    async fn poll(&mut self) -> Result<(), AnimatorError> {
        if self.disposed {
            return Ok(());
        }
        let result = match self.current {
            LiveSide::Streaming => Ok(()),
            LiveSide::Cache => self.cache_animator.poll().await,
        };
        self.forward_events();
        self.bus.flush(self.time);
        result
    }
    
    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.streaming.dispose();
        self.cache_animator.dispose();
        self.pending.clear();
        self.bus.emit(AnimatorEvent::Dispose);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    use crate::value::Value;
    
    fn live() -> LiveAnimator {
        LiveAnimator::new(LiveConfig::default())
    }
    
    #[tokio::test]
    async fn test_frames_cache_keys_by_chunk() {
        let cache = FramesCache::in_memory(10.0);
        cache.set(12.0, vec![Frame::new(12.0, state! { "a" => 1.0 })]).await.unwrap();
        
        assert!(cache.has(19.9).await.unwrap());
        assert!(!cache.has(20.0).await.unwrap());
        assert_eq!(cache.get(10.0).await.unwrap().unwrap().len(), 1);
        
        let source = CachedFrameSource::new(cache);
        let gap = source.get_frames(30.0, 10.0, CancelToken::new()).await.unwrap();
        assert_eq!(gap, Some(Vec::new()));
    }
    
    #[tokio::test]
    async fn test_stream_feeds_keyframes_and_history() {
        let mut anim = live();
        anim.add_frames(vec![
            Frame::new(1.0, state! { "a" => 1.0 }),
            Frame::new(2.0, state! { "a" => 2.0 }),
        ])
        .await
        .unwrap();
        anim.add_frames(vec![Frame::new(1001.0, state! { "b" => 1.0 })]).await.unwrap();
        
        assert_eq!(anim.time(), 1001.0);
        assert_eq!(anim.state(), &state! { "a" => 2.0, "b" => 1.0 });
        assert_eq!(anim.start_time(), 1.0);
        assert_eq!(anim.end_time(), 1001.0);
        
        let keyframe = anim.keyframes().unwrap().get(1000.0).await.unwrap();
        assert_eq!(keyframe.map(|k| k.state), Some(state! { "a" => 2.0 }));
        
        // The head moved past chunk 0, so it is already in the history
        tokio::task::yield_now().await;
        let history = anim.frames_cache().get(0.0).await.unwrap().unwrap();
        let times: Vec<f64> = history.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![1.0, 2.0]);
    }
    
    #[tokio::test]
    async fn test_seek_routes_between_sides() {
        let mut anim = live();
        let mut rx = anim.subscribe();
        anim.add_frames(vec![
            Frame::new(1.0, state! { "a" => 1.0 }),
            Frame::new(2.0, state! { "a" => 2.0 }),
            Frame::new(1001.0, state! { "b" => 1.0 }),
        ])
        .await
        .unwrap();
        drain(&mut rx);
        
        anim.set_time(500.0).await.unwrap();
        assert_eq!(anim.current(), LiveSide::Cache);
        assert_eq!(anim.state(), &state! { "a" => 2.0 });
        assert!(!anim.stale());
        
        let changes: Vec<StateDiff> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AnimatorEvent::Change { diff, .. } => Some(diff),
                _ => None,
            })
            .collect();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_all());
        
        anim.set_time(1.5).await.unwrap();
        assert_eq!(anim.state()["a"], Value::Number(1.0));
        
        anim.set_time(2000.0).await.unwrap();
        assert_eq!(anim.current(), LiveSide::Streaming);
        assert_eq!(anim.state()["b"], Value::Number(1.0));
    }
    
    #[tokio::test]
    async fn test_late_frame_reaches_history() {
        let mut anim = live();
        anim.add_frames(vec![
            Frame::new(10.0, state! { "a" => 1.0 }),
            Frame::new(3000.0, state! { "a" => 3.0 }),
        ])
        .await
        .unwrap();
        anim.set_time(500.0).await.unwrap();
        assert_eq!(anim.state()["a"], Value::Number(1.0));
        
        anim.add_frames(vec![Frame::new(400.0, state! { "late" => true })]).await.unwrap();
        anim.set_time(600.0).await.unwrap();
        assert_eq!(anim.state()["late"], Value::Bool(true));
        assert_eq!(anim.current(), LiveSide::Cache);
    }
    
    #[tokio::test]
    async fn test_unfinished_chunk_stays_pending() {
        let mut anim = live();
        anim.add_frames(vec![
            Frame::new(1.0, state! { "a" => 1.0 }),
            Frame::new(2.0, state! { "a" => 2.0 }),
        ])
        .await
        .unwrap();
        assert!(!anim.frames_cache().has(0.0).await.unwrap());
        
        anim.add_frames(vec![Frame::new(1500.0, state! { "a" => 3.0 })]).await.unwrap();
        assert!(anim.frames_cache().has(0.0).await.unwrap());
        assert!(!anim.frames_cache().has(1000.0).await.unwrap());
    }
    
    #[tokio::test]
    async fn test_one_change_per_batch() {
        let mut anim = live();
        let mut rx = anim.streaming().subscribe();
        anim.add_frames(vec![
            Frame::new(1.0, state! { "a" => 1.0 }),
            Frame::new(2.0, state! { "b" => 2.0 }),
        ])
        .await
        .unwrap();
        // The late frame repairs the rolled state before the head moves
        anim.add_frames(vec![
            Frame::new(1.5, state! { "c" => 1.0 }),
            Frame::new(3.0, state! { "a" => 3.0 }),
        ])
        .await
        .unwrap();
        assert_eq!(anim.streaming().state()["c"], Value::Number(1.0));
        
        let changes: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AnimatorEvent::Change { time, .. } => Some(time),
                _ => None,
            })
            .collect();
        assert_eq!(changes, vec![2.0, 3.0]);
    }
    
    #[tokio::test]
    async fn test_added_frames_always_forwarded() {
        let mut anim = live();
        let mut rx = anim.subscribe();
        anim.add_frames(vec![Frame::new(5.0, state! { "a" => 1.0 })]).await.unwrap();
        anim.set_connected(true);
        
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, AnimatorEvent::AddedFrames { .. })));
        assert!(events.iter().any(|e| matches!(e, AnimatorEvent::Connected)));
        assert!(events.iter().any(|e| matches!(e, AnimatorEvent::Change { .. })));
    }
    
    #[tokio::test]
    async fn test_dispose_is_terminal() {
        let mut anim = live();
        let mut rx = anim.subscribe();
        anim.add_frames(vec![Frame::new(5.0, state! { "a" => 1.0 })]).await.unwrap();
        anim.dispose();
        anim.dispose();
        
        assert!(anim.add_frames(vec![Frame::new(6.0, state! { "a" => 2.0 })]).await.is_ok());
        let disposals = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, AnimatorEvent::Dispose))
            .count();
        assert_eq!(disposals, 1);
    }
}
