//! Buffered animator: on-demand chunked frame loading.
//!
//! Frames live in an external [`FrameSource`] and are fetched in fixed
//! `chunk_size` windows. Chunks inside `[actual - buffer, target + buffer]`
//! are kept resident; chunks that fall outside are cancelled and dropped.
//!
//! Fetches run as background tasks and report back over a channel in any
//! order. They are consumed strictly in chunk-index order: chunk `i` is
//! merged only after chunk `i - 1`, regardless of which finished first.

use crate::animator::{Animator, ForEachOptions, TelemetryAnimator};
use crate::error::AnimatorError;
use crate::events::{AnimatorEvent, StateDiff};
use crate::frame::{sort_frames, Frame};
use crate::keyframe::{Keyframe, KeyframeIndex};
use crate::value::State;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use telemetry_env::{AnimatorId, CancelToken, EnvError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source of historical frames.
///
/// Returns the frames in `[time, time + length)`, or `None` when there is
/// no data at or beyond `time`. An empty vector is a gap, not the end.
#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    async fn get_frames(
        &self,
        time: f64,
        length: f64,
        cancel: CancelToken,
    ) -> Result<Option<Vec<Frame>>, EnvError>;
}

/// Configuration for [`BufferedAnimator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Fetch granularity (default: 1.0)
    pub chunk_size: f64,
    
    /// How far around the playhead chunks stay resident (default: 2.0)
    pub buffer: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1.0,
            buffer: 2.0,
        }
    }
}

impl BufferConfig {
    pub fn with_chunk_size(mut self, chunk_size: f64) -> Self {
        self.chunk_size = chunk_size;
        self
    }
    
    pub fn with_buffer(mut self, buffer: f64) -> Self {
        self.buffer = buffer;
        self
    }
}

fn chunk_index(time: f64, chunk_size: f64) -> i64 {
    (time / chunk_size).floor() as i64
}

#[derive(Debug)]
enum ChunkStatus {
    Pending,
    Ready(Arc<Vec<Frame>>),
    /// Source reported no more data
    End,
    Failed,
}

/// One resident `[time, time + chunk_size)` window.
#[derive(Debug)]
struct BufferChunk {
    time: f64,
    /// Request generation; results from older requests are dropped
    request: u64,
    status: ChunkStatus,
    cancel: CancelToken,
    task: Option<JoinHandle<()>>,
    /// Number of frames handed to the base animator, once consumed
    consumed: Option<usize>,
    needs_update: bool,
}

impl BufferChunk {
    fn abandon(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct ChunkResult {
    index: i64,
    request: u64,
    result: Result<Option<Vec<Frame>>, EnvError>,
}

/// Animator whose frames are fetched chunk by chunk from a [`FrameSource`].
pub struct BufferedAnimator {
    base: TelemetryAnimator,
    source: Arc<dyn FrameSource>,
    config: BufferConfig,
    chunks: BTreeMap<i64, BufferChunk>,
    results_tx: mpsc::UnboundedSender<ChunkResult>,
    results_rx: mpsc::UnboundedReceiver<ChunkResult>,
    next_request: u64,
    
    /// Next chunk to consume; `None` until the first restart
    cursor: Option<i64>,
    
    /// Frames before this time are already part of the seed keyframe
    skip_before: Option<f64>,
    
    /// First chunk index known to have no data
    known_end: Option<i64>,
    
    range: Option<(f64, f64)>,
    target_time: f64,
    needs_reset: bool,
    
    /// Target of a `set_time` that began rolling but never settled
    rolling_to: Option<f64>,
    
    stale: bool,
    ready: bool,
    keyframes: Option<KeyframeIndex>,
}

impl BufferedAnimator {
    pub fn new(source: Arc<dyn FrameSource>, config: BufferConfig) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            base: TelemetryAnimator::new(Vec::new()),
            source,
            config,
            chunks: BTreeMap::new(),
            results_tx,
            results_rx,
            next_request: 0,
            cursor: None,
            skip_before: None,
            known_end: None,
            range: None,
            target_time: 0.0,
            needs_reset: false,
            rolling_to: None,
            stale: false,
            ready: false,
            keyframes: None,
        }
    }
    
    /// Replaces the inner animator (config, policy). It should hold no frames.
    pub fn with_base(mut self, base: TelemetryAnimator) -> Self {
        if let Some(keyframes) = self.keyframes.as_mut() {
            keyframes.set_policy(base.policy());
        }
        self.base = base;
        self
    }
    
    pub fn with_keyframes(mut self, mut keyframes: KeyframeIndex) -> Self {
        keyframes.set_policy(self.base.policy());
        self.keyframes = Some(keyframes);
        self
    }
    
    pub fn with_range(mut self, start: f64, end: f64) -> Self {
        self.widen_range(start, end);
        self
    }
    
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
    
    pub fn base(&self) -> &TelemetryAnimator {
        &self.base
    }
    
    pub fn keyframes(&self) -> Option<&KeyframeIndex> {
        self.keyframes.as_ref()
    }
    
    pub fn keyframes_mut(&mut self) -> Option<&mut KeyframeIndex> {
        self.keyframes.as_mut()
    }
    
    /// Last time requested through `set_time`.
    pub fn target_time(&self) -> f64 {
        self.target_time
    }
    
    /// Start times of every resident chunk, ascending.
    pub fn chunk_times(&self) -> Vec<f64> {
        self.chunks.values().map(|chunk| chunk.time).collect()
    }
    
    pub fn widen_range(&mut self, start: f64, end: f64) {
        self.range = Some(match self.range {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }
    
    /// Start of the chunk containing `time`.
    pub fn resolve_to_chunk_time(&self, time: f64) -> f64 {
        self.chunk_index(time) as f64 * self.config.chunk_size
    }
    
    fn chunk_index(&self, time: f64) -> i64 {
        chunk_index(time, self.config.chunk_size)
    }
    
    fn first_index(&self) -> i64 {
        self.chunk_index(self.start_time())
    }
    
    /// Forces the chunk covering `time` to be fetched again.
    ///
    /// A chunk already merged into the state triggers a full restart on
    /// the next `set_time`.
    pub fn reset_chunk_at_time(&mut self, time: f64) {
        let index = self.chunk_index(time);
        if self.known_end.is_some_and(|end| index >= end) {
            self.known_end = None;
            self.chunks.retain(|_, chunk| {
                let ended = matches!(chunk.status, ChunkStatus::End);
                if ended {
                    chunk.abandon();
                }
                !ended
            });
        }
        
        let consumed = match self.chunks.get_mut(&index) {
            Some(chunk) if chunk.consumed.is_some() => {
                chunk.needs_update = true;
                true
            }
            Some(_) => false,
            None => return,
        };
        if consumed {
            self.needs_reset = true;
        } else if let Some(mut chunk) = self.chunks.remove(&index) {
            chunk.abandon();
        }
        debug!(id = %self.base.id(), index, consumed, "reset chunk");
    }
    
    // ========================================================================
    // CHUNK REQUESTS
    // ========================================================================
    
    fn request_chunk(&mut self, index: i64) {
        let time = index as f64 * self.config.chunk_size;
        let length = self.config.chunk_size;
        self.next_request += 1;
        let request = self.next_request;
        
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let source = self.source.clone();
        let results = self.results_tx.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                result = source.get_frames(time, length, token.clone()) => result,
                _ = token.cancelled() => Err(EnvError::Cancelled),
            };
            let _ = results.send(ChunkResult { index, request, result });
        });
        
        debug!(id = %self.base.id(), index, time, "requested chunk");
        self.chunks.insert(
            index,
            BufferChunk {
                time,
                request,
                status: ChunkStatus::Pending,
                cancel,
                task: Some(task),
                consumed: None,
                needs_update: false,
            },
        );
    }
    
    fn evict_chunk(&mut self, index: i64) {
        let lowest_consumed = self
            .chunks
            .iter()
            .find(|(_, chunk)| chunk.consumed.is_some())
            .map(|(&i, _)| i);
        let Some(mut chunk) = self.chunks.remove(&index) else {
            return;
        };
        chunk.abandon();
        if let Some(count) = chunk.consumed {
            if lowest_consumed == Some(index) {
                self.base.drop_front(count);
            } else {
                self.needs_reset = true;
            }
        }
        debug!(id = %self.base.id(), index, "evicted chunk");
    }
    
    /// Evicts chunks outside `[min(actual, target) - buffer, target + buffer]`
    /// and requests the missing ones inside it.
    fn update_window(&mut self, target: f64) {
        let actual = self.base.time();
        let lo = self
            .chunk_index(actual.min(target) - self.config.buffer)
            .max(self.first_index());
        let mut hi = self.chunk_index(target + self.config.buffer);
        if let Some(end) = self.known_end {
            hi = hi.min(end);
        }
        
        let outside: Vec<i64> = self
            .chunks
            .keys()
            .copied()
            .filter(|&index| index < lo || index > hi)
            .collect();
        for index in outside {
            self.evict_chunk(index);
        }
        
        for index in lo..=hi {
            let refetch = match self.chunks.get_mut(&index) {
                None => true,
                Some(chunk) if chunk.needs_update && chunk.consumed.is_none() => {
                    chunk.abandon();
                    true
                }
                Some(_) => false,
            };
            if refetch {
                self.request_chunk(index);
            }
        }
    }
    
    /// Stores a finished fetch. Results for evicted or superseded requests are dropped.
    fn absorb(&mut self, message: ChunkResult) {
        let chunk_size = self.config.chunk_size;
        let Some(chunk) = self.chunks.get_mut(&message.index) else {
            debug!(index = message.index, "dropping result for evicted chunk");
            return;
        };
        if chunk.request != message.request {
            debug!(index = message.index, "dropping superseded chunk result");
            return;
        }
        chunk.task = None;
        
        match message.result {
            Ok(Some(mut frames)) => {
                let (lo, hi) = (chunk.time, chunk.time + chunk_size);
                frames.retain(|frame| frame.time >= lo && frame.time < hi);
                sort_frames(&mut frames);
                chunk.status = ChunkStatus::Ready(Arc::new(frames));
            }
            Ok(None) => {
                chunk.status = ChunkStatus::End;
                let end = self.known_end.map_or(message.index, |end| end.min(message.index));
                self.known_end = Some(end);
            }
            Err(err) if err.is_cancelled() => {
                self.chunks.remove(&message.index);
            }
            Err(err) => {
                warn!(id = %self.base.id(), index = message.index, error = %err, "chunk fetch failed");
                chunk.status = ChunkStatus::Failed;
                self.base.bus().emit(AnimatorEvent::Error { error: err.into() });
            }
        }
    }
    
    fn drain_results(&mut self) {
        while let Ok(message) = self.results_rx.try_recv() {
            self.absorb(message);
        }
    }
    
    /// Waits until the chunk at `index` is no longer pending.
    async fn wait_for_chunk(&mut self, index: i64) {
        while matches!(self.chunks.get(&index).map(|c| &c.status), Some(ChunkStatus::Pending)) {
            self.stale = true;
            match self.results_rx.recv().await {
                Some(message) => self.absorb(message),
                None => return,
            }
        }
    }
    
    // ========================================================================
    // SEEDING
    // ========================================================================
    
    fn first_consumed_time(&self) -> Option<f64> {
        self.chunks
            .values()
            .find(|chunk| chunk.consumed.is_some())
            .map(|chunk| chunk.time)
    }
    
    /// Clears rolled state and restarts consumption from a keyframe or the start.
    fn apply_seed(&mut self, seed: Option<(f64, Keyframe)>, diff: &mut StateDiff) {
        let (seed_time, keyframe, skip_before) = match seed {
            Some((time, keyframe)) => (time, keyframe, Some(time)),
            None => (self.start_time(), Keyframe::default(), None),
        };
        self.base.clear_frames();
        self.base.seed(seed_time, keyframe.state, keyframe.last_frame_time);
        
        let stale: Vec<i64> = self
            .chunks
            .iter_mut()
            .filter_map(|(&index, chunk)| {
                chunk.consumed = None;
                chunk.needs_update.then_some(index)
            })
            .collect();
        for index in stale {
            if let Some(mut chunk) = self.chunks.remove(&index) {
                chunk.abandon();
            }
        }
        
        self.cursor = Some(self.chunk_index(seed_time));
        self.skip_before = skip_before;
        self.needs_reset = false;
        self.rolling_to = None;
        diff.mark_all();
        debug!(id = %self.base.id(), seed_time, keyframe = skip_before.is_some(), "restarted buffered roll-up");
    }
    
    /// A keyframe past the actual time, worth jumping to instead of loading
    /// every chunk in between.
    async fn keyframe_ahead(&self, time: f64) -> Result<Option<(f64, Keyframe)>, AnimatorError> {
        let Some(keyframes) = &self.keyframes else {
            return Ok(None);
        };
        let actual = self.base.time();
        if keyframes.bucket(time) <= keyframes.bucket(actual) {
            return Ok(None);
        }
        Ok(keyframes
            .get_keyframe(time)
            .await?
            .filter(|(keyframe_time, _)| *keyframe_time > actual))
    }
    
    async fn seed_for(&self, time: f64) -> Result<Option<(f64, Keyframe)>, AnimatorError> {
        match &self.keyframes {
            Some(keyframes) => keyframes.get_keyframe(time).await,
            None => Ok(None),
        }
    }
    
    // ========================================================================
    // ITERATION & KEYFRAMES
    // ========================================================================
    
    /// Fetches `[time, time + chunk_size)` directly from the source.
    async fn fetch_chunk(&self, index: i64) -> Result<Option<Vec<Frame>>, AnimatorError> {
        let time = index as f64 * self.config.chunk_size;
        let frames = self
            .source
            .get_frames(time, self.config.chunk_size, CancelToken::new())
            .await?;
        Ok(frames.map(|mut frames| {
            frames.retain(|f| f.time >= time && f.time < time + self.config.chunk_size);
            sort_frames(&mut frames);
            frames
        }))
    }
    
    fn last_index(&self, end_time: Option<f64>) -> Option<i64> {
        let by_time = end_time
            .or(self.range.map(|(_, end)| end))
            .map(|end| self.chunk_index(end));
        match (by_time, self.known_end) {
            (Some(index), Some(end)) => Some(index.min(end - 1)),
            (Some(index), None) => Some(index),
            (None, Some(end)) => Some(end - 1),
            (None, None) => None,
        }
    }
    
    /// Visits frames strictly between the optional bounds, fetching chunk by chunk.
    ///
    /// Chunks are fetched independently of the resident window.
    pub async fn for_each_frame<F>(&self, options: ForEachOptions, mut callback: F) -> Result<(), AnimatorError>
    where
        F: FnMut(&State, f64) + Send,
    {
        let policy = self.base.policy();
        let mut acc = State::new();
        let mut index = match (options.raw, options.start_time) {
            (true, Some(start)) => self.chunk_index(start).max(self.first_index()),
            _ => self.first_index(),
        };
        let last = self.last_index(options.end_time);
        
        while last.map_or(true, |last| index <= last) {
            let Some(frames) = self.fetch_chunk(index).await? else {
                break;
            };
            if !options.visit(&frames, policy.as_ref(), &mut acc, &mut callback) {
                break;
            }
            index += 1;
        }
        Ok(())
    }
    
    /// Rebuilds every keyframe by streaming all chunks through the index.
    pub async fn generate_keyframes(&mut self) -> Result<(), AnimatorError> {
        if self.base.is_disposed() {
            return Ok(());
        }
        let first = self.first_index();
        let last = self.last_index(None);
        let keyframes = self.keyframes.as_mut().ok_or(AnimatorError::MissingKeyframes)?;
        let _guard = keyframes.begin_generation()?;
        keyframes.restart();
        
        let chunk_size = self.config.chunk_size;
        let mut index = first;
        while last.map_or(true, |last| index <= last) {
            let time = index as f64 * chunk_size;
            let fetched = self
                .source
                .get_frames(time, chunk_size, CancelToken::new())
                .await?;
            let Some(mut frames) = fetched else {
                break;
            };
            frames.retain(|f| f.time >= time && f.time < time + chunk_size);
            sort_frames(&mut frames);
            for frame in &frames {
                keyframes.fold(frame).await?;
            }
            if let Some(last) = last {
                let progress = (index - first + 1) as f64 / (last - first + 1).max(1) as f64;
                self.base.bus().emit(AnimatorEvent::KeyframeProgress { progress });
            }
            index += 1;
        }
        self.base.bus().emit(AnimatorEvent::KeyframeProgress { progress: 1.0 });
        Ok(())
    }
}

#[async_trait]
impl Animator for BufferedAnimator {
    fn id(&self) -> AnimatorId {
        self.base.id()
    }
    
    fn time(&self) -> f64 {
        self.base.time()
    }
    
    fn state(&self) -> &State {
        self.base.state()
    }
    
    fn frames(&self) -> &[Frame] {
        self.base.frames()
    }
    
    /// Includes loaded chunks ahead of the playhead that are not rolled yet.
    fn frames_in(&self, lo: f64, hi: f64) -> Vec<Frame> {
        let (first, last) = (self.chunk_index(lo), self.chunk_index(hi));
        if first > last {
            return Vec::new();
        }
        self.chunks
            .range(first..=last)
            .filter_map(|(_, chunk)| match &chunk.status {
                ChunkStatus::Ready(frames) => Some(frames.iter()),
                _ => None,
            })
            .flatten()
            .filter(|f| f.time >= lo && f.time <= hi)
            .cloned()
            .collect()
    }
    
    fn start_time(&self) -> f64 {
        self.range.map(|(start, _)| start).unwrap_or(0.0)
    }
    
    fn end_time(&self) -> f64 {
        match (self.range, self.known_end) {
            (Some((_, end)), _) => end,
            (None, Some(end)) => end as f64 * self.config.chunk_size,
            (None, None) => self.base.end_time(),
        }
    }
    
    fn seekable(&self) -> bool {
        self.base.seekable()
    }
    
    fn live_data(&self) -> bool {
        self.base.live_data()
    }
    
    fn stale(&self) -> bool {
        self.stale
    }
    
    fn ready(&self) -> bool {
        self.ready
    }
    
    fn is_disposed(&self) -> bool {
        self.base.is_disposed()
    }
    
    fn subscribe(&self) -> broadcast::Receiver<AnimatorEvent> {
        self.base.subscribe()
    }
    
    async fn set_time(&mut self, time: f64) -> Result<(), AnimatorError> {
        if self.base.is_disposed() {
            return Ok(());
        }
        self.target_time = time;
        self.drain_results();
        let mut diff = StateDiff::new();
        
        let actual = self.base.time();
        let rewinding = self.cursor.is_some() && time < actual;
        if rewinding && !self.base.seekable() {
            return Err(AnimatorError::NotSeekable { from: actual, to: time });
        }
        let mismatch = self.first_consumed_time().is_some_and(|first| first > actual);
        // A dropped call may have rolled frames past `time` without settling
        let overrun = self.rolling_to.is_some_and(|rolled| rolled > time);
        
        if self.cursor.is_none() || rewinding || self.needs_reset || mismatch || overrun {
            let seed = self.seed_for(time).await?;
            self.apply_seed(seed, &mut diff);
        } else if let Some(seed) = self.keyframe_ahead(time).await? {
            self.apply_seed(Some(seed), &mut diff);
        }
        
        self.update_window(time);
        
        let interpolating = self.base.config().continuous;
        let last_needed = self.chunk_index(time) + i64::from(interpolating);
        let mut halted = false;
        self.rolling_to = Some(self.rolling_to.map_or(time, |rolled| rolled.max(time)));
        while let Some(index) = self.cursor {
            if index > last_needed || self.known_end.is_some_and(|end| index >= end) {
                break;
            }
            if !self.chunks.contains_key(&index) {
                self.request_chunk(index);
            }
            self.wait_for_chunk(index).await;
            
            let Some(chunk) = self.chunks.get_mut(&index) else {
                halted = true;
                break;
            };
            match &chunk.status {
                ChunkStatus::Ready(frames) => {
                    let frames = frames.clone();
                    let from = self
                        .skip_before
                        .map_or(0, |skip| frames.partition_point(|f| f.time < skip));
                    chunk.consumed = Some(frames.len() - from);
                    self.base.append_sorted(&frames[from..]);
                    self.base.roll_up(time, &mut diff);
                    self.cursor = Some(index + 1);
                }
                ChunkStatus::End => break,
                ChunkStatus::Failed | ChunkStatus::Pending => {
                    halted = true;
                    break;
                }
            }
        }
        
        self.base.settle(time, &mut diff);
        self.rolling_to = None;
        self.update_window(time);
        self.stale = halted;
        self.ready |= !halted;
        self.base.publish(&diff);
        Ok(())
    }
    
    /// Absorbs finished fetches and resumes a stalled roll-up once the chunk it waited on has arrived.
    async fn poll(&mut self) -> Result<(), AnimatorError> {
        if self.base.is_disposed() {
            return Ok(());
        }
        self.drain_results();
        let resumable = self.stale
            && self
                .cursor
                .and_then(|index| self.chunks.get(&index))
                .is_some_and(|chunk| matches!(chunk.status, ChunkStatus::Ready(_) | ChunkStatus::End));
        if resumable {
            self.set_time(self.target_time).await
        } else {
            Ok(())
        }
    }
    
    async fn reset(&mut self) -> Result<(), AnimatorError> {
        if self.base.is_disposed() {
            return Ok(());
        }
        self.base.bus().emit(AnimatorEvent::Reset);
        self.cursor = None;
        let start = self.start_time();
        self.set_time(start).await
    }
    
    /// Records that new frames exist in the source for these times.
    ///
    /// The frames themselves are served by the source; this extends the
    /// keyframes, widens the range and invalidates the covering chunks.
    async fn add_frames(&mut self, mut frames: Vec<Frame>) -> Result<(), AnimatorError> {
        if self.base.is_disposed() || frames.is_empty() {
            return Ok(());
        }
        if self.keyframes.as_ref().is_some_and(KeyframeIndex::is_generating) {
            return Err(AnimatorError::AlreadyGenerating);
        }
        sort_frames(&mut frames);
        if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
            self.widen_range(first.time, last.time);
        }
        
        let mut touched: Vec<f64> = frames.iter().map(|f| self.resolve_to_chunk_time(f.time)).collect();
        touched.dedup();
        for time in touched {
            self.reset_chunk_at_time(time);
        }
        if let Some(keyframes) = self.keyframes.as_mut() {
            keyframes.extend(&frames).await?;
        }
        self.base.bus().emit(AnimatorEvent::AddedFrames { frames: Arc::new(frames) });
        Ok(())
    }
    
    fn dispose(&mut self) {
        if self.base.is_disposed() {
            return;
        }
        for chunk in self.chunks.values_mut() {
            chunk.abandon();
        }
        self.chunks.clear();
        self.base.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::state;
    use crate::value::Value;
    use approx::assert_relative_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use telemetry_env::MemoryCache;
    use tokio::sync::Notify;
    
    /// Serves frames from memory; `None` past the last frame.
    struct VecSource {
        frames: Mutex<Vec<Frame>>,
        fetches: AtomicUsize,
    }
    
    impl VecSource {
        fn new(frames: Vec<Frame>) -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(frames),
                fetches: AtomicUsize::new(0),
            })
        }
    }
    
    #[async_trait]
    impl FrameSource for VecSource {
        async fn get_frames(&self, time: f64, length: f64, _cancel: CancelToken) -> Result<Option<Vec<Frame>>, EnvError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let frames = self.frames.lock().unwrap();
            if frames.last().map_or(true, |last| time > last.time) {
                return Ok(None);
            }
            Ok(Some(
                frames
                    .iter()
                    .filter(|f| f.time >= time && f.time < time + length)
                    .cloned()
                    .collect(),
            ))
        }
    }
    
    /// Holds each chunk until its gate is opened. Chunks past `end` return `None` at once.
    struct GatedSource {
        frames: Vec<Frame>,
        end: i64,
        gates: HashMap<i64, Arc<Notify>>,
        tokens: Mutex<Vec<(i64, CancelToken)>>,
    }
    
    impl GatedSource {
        fn new(frames: Vec<Frame>, end: i64) -> Arc<Self> {
            let gates = (0..end).map(|i| (i, Arc::new(Notify::new()))).collect();
            Arc::new(Self {
                frames,
                end,
                gates,
                tokens: Mutex::new(Vec::new()),
            })
        }
        
        fn open(&self, index: i64) {
            self.gates[&index].notify_one();
        }
        
        fn token(&self, index: i64) -> Option<CancelToken> {
            self.tokens
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(i, _)| *i == index)
                .map(|(_, token)| token.clone())
        }
    }
    
    #[async_trait]
    impl FrameSource for GatedSource {
        async fn get_frames(&self, time: f64, length: f64, cancel: CancelToken) -> Result<Option<Vec<Frame>>, EnvError> {
            let index = time.floor() as i64;
            if index >= self.end {
                return Ok(None);
            }
            self.tokens.lock().unwrap().push((index, cancel.clone()));
            self.gates[&index].notified().await;
            cancel.check()?;
            Ok(Some(
                self.frames
                    .iter()
                    .filter(|f| f.time >= time && f.time < time + length)
                    .cloned()
                    .collect(),
            ))
        }
    }
    
    /// Fails for one chunk.
    struct FailingSource {
        inner: Arc<VecSource>,
        failing: i64,
    }
    
    #[async_trait]
    impl FrameSource for FailingSource {
        async fn get_frames(&self, time: f64, length: f64, cancel: CancelToken) -> Result<Option<Vec<Frame>>, EnvError> {
            if time.floor() as i64 == self.failing {
                return Err(EnvError::source("disk read failed"));
            }
            self.inner.get_frames(time, length, cancel).await
        }
    }
    
    fn series(count: usize, step: f64) -> Vec<Frame> {
        (0..count)
            .map(|i| Frame::new(i as f64 * step, state! { "a" => i as f64, format!("k{}", i % 3) => 1.0 }))
            .collect()
    }
    
    async fn reference_state(frames: &[Frame], time: f64) -> State {
        let mut reference = TelemetryAnimator::new(frames.to_vec());
        reference.set_time(time).await.unwrap();
        reference.state().clone()
    }
    
    #[test]
    fn test_resolve_to_chunk_time() {
        let anim = BufferedAnimator::new(VecSource::new(Vec::new()), BufferConfig::default().with_chunk_size(2.5));
        assert_eq!(anim.resolve_to_chunk_time(6.0), 5.0);
        assert_eq!(anim.resolve_to_chunk_time(5.0), 5.0);
        assert_eq!(anim.resolve_to_chunk_time(-0.1), -2.5);
    }
    
    #[tokio::test]
    async fn test_matches_in_memory_roll_up() {
        let frames = series(21, 0.5);
        let mut anim = BufferedAnimator::new(VecSource::new(frames.clone()), BufferConfig::default());
        
        for time in [0.0, 1.2, 5.2, 5.3, 9.9, 3.1, 10.0] {
            anim.set_time(time).await.unwrap();
            assert_eq!(anim.state(), &reference_state(&frames, time).await, "at {}", time);
            assert!(!anim.stale());
        }
        assert!(anim.ready());
    }
    
    #[tokio::test]
    async fn test_chunk_window_evicts_outside_buffer() {
        let frames = series(21, 0.5);
        let mut anim = BufferedAnimator::new(VecSource::new(frames), BufferConfig::default());
        
        anim.set_time(5.2).await.unwrap();
        assert_eq!(anim.chunk_times(), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
        
        anim.set_time(8.0).await.unwrap();
        assert_eq!(anim.chunk_times(), vec![6.0, 7.0, 8.0, 9.0, 10.0]);
        // Consumed chunks behind the window no longer hold frames in memory
        assert!(anim.frames().iter().all(|f| f.time >= 6.0));
    }
    
    #[tokio::test]
    async fn test_out_of_order_resolution_merges_in_time_order() {
        let frames = vec![
            Frame::new(0.0, state! { "a" => 0.0, "x" => 1.0 }),
            Frame::new(0.5, state! { "a" => 1.0 }),
            Frame::new(1.0, state! { "a" => 2.0 }),
            Frame::new(1.5, state! { "a" => 3.0, "x" => 2.0 }),
            Frame::new(2.0, state! { "a" => 4.0 }),
            Frame::new(2.5, state! { "b" => 9.0 }),
        ];
        let source = GatedSource::new(frames.clone(), 3);
        let config = BufferConfig::default().with_buffer(1.0);
        let mut anim = BufferedAnimator::new(source.clone(), config);
        let mut rx = anim.subscribe();
        
        let release = async {
            for index in [2, 0, 1] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                source.open(index);
            }
        };
        let (result, _) = tokio::join!(anim.set_time(2.99), release);
        result.unwrap();
        
        assert_eq!(anim.state(), &reference_state(&frames, 2.99).await);
        assert!(!anim.stale());
        let changes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, AnimatorEvent::Change { .. }))
            .count();
        assert_eq!(changes, 1);
    }
    
    #[tokio::test]
    async fn test_stale_while_waiting_on_chunk() {
        let frames = vec![Frame::new(0.25, state! { "a" => 1.0 })];
        let source = GatedSource::new(frames, 3);
        let mut anim = BufferedAnimator::new(source.clone(), BufferConfig::default());
        
        let pending = tokio::time::timeout(Duration::from_millis(20), anim.set_time(0.5)).await;
        assert!(pending.is_err());
        assert!(anim.stale());
        assert!(anim.state().is_empty());
        
        source.open(0);
        anim.set_time(0.5).await.unwrap();
        assert!(!anim.stale());
        assert_eq!(anim.state()["a"], Value::Number(1.0));
    }
    
    #[tokio::test]
    async fn test_evicted_chunk_fetch_is_cancelled() {
        let frames = series(40, 0.5);
        let source = GatedSource::new(frames.clone(), 20);
        let config = BufferConfig::default().with_buffer(1.0);
        let mut anim = BufferedAnimator::new(source.clone(), config);
        
        for index in 0..=6 {
            source.open(index);
        }
        anim.set_time(5.5).await.unwrap();
        
        // Chunks 7..=9 stay gated
        let pending = tokio::time::timeout(Duration::from_millis(20), anim.set_time(8.5)).await;
        assert!(pending.is_err());
        assert!(anim.stale());
        let far_chunk = source.token(8).expect("chunk 8 requested");
        assert!(!far_chunk.is_cancelled());
        
        for index in 0..=2 {
            source.open(index);
        }
        anim.set_time(1.0).await.unwrap();
        
        assert!(far_chunk.is_cancelled());
        assert!(!anim.stale());
        assert_eq!(anim.state(), &reference_state(&frames, 1.0).await);
        assert!(anim.chunk_times().iter().all(|&t| t <= 2.0));
    }
    
    #[tokio::test]
    async fn test_dropped_set_time_does_not_leak_future_frames() {
        let frames = series(40, 0.5);
        let source = GatedSource::new(frames.clone(), 20);
        let config = BufferConfig::default().with_buffer(1.0);
        let mut anim = BufferedAnimator::new(source.clone(), config);
        
        for index in 0..=6 {
            source.open(index);
        }
        anim.set_time(5.5).await.unwrap();
        
        // Chunk 6 is rolled toward 8.5, then the call stalls on chunk 7 and is dropped
        let pending = tokio::time::timeout(Duration::from_millis(20), anim.set_time(8.5)).await;
        assert!(pending.is_err());
        
        for index in 0..=6 {
            source.open(index);
        }
        anim.set_time(6.2).await.unwrap();
        assert_eq!(anim.state(), &reference_state(&frames, 6.2).await);
        assert!(!anim.stale());
    }
    
    #[tokio::test]
    async fn test_poll_resumes_after_chunk_arrives() {
        let frames = vec![Frame::new(0.25, state! { "a" => 1.0 })];
        let source = GatedSource::new(frames, 3);
        let mut anim = BufferedAnimator::new(source.clone(), BufferConfig::default());
        let mut rx = anim.subscribe();
        
        let pending = tokio::time::timeout(Duration::from_millis(20), anim.set_time(0.5)).await;
        assert!(pending.is_err());
        assert!(anim.stale());
        
        source.open(0);
        for _ in 0..4 {
            tokio::task::yield_now().await;
            anim.poll().await.unwrap();
        }
        assert!(!anim.stale());
        assert_eq!(anim.state()["a"], Value::Number(1.0));
        assert!(drain(&mut rx).iter().any(|e| matches!(e, AnimatorEvent::Change { .. })));
    }
    
    #[tokio::test]
    async fn test_frames_in_covers_resident_chunks() {
        let frames = vec![
            Frame::new(0.2, state! { "a" => 0.0 }),
            Frame::new(1.2, state! { "a" => 1.0 }),
            Frame::new(1.4, state! { "a" => 2.0 }),
        ];
        let mut anim = BufferedAnimator::new(VecSource::new(frames), BufferConfig::default());
        anim.set_time(0.5).await.unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
            anim.poll().await.unwrap();
        }
        
        // Only chunk 0 is rolled; chunk 1 is loaded ahead
        assert_eq!(anim.frames().len(), 1);
        let times: Vec<f64> = anim.frames_in(-0.5, 1.5).iter().map(|f| f.time).collect();
        assert_eq!(times, vec![0.2, 1.2, 1.4]);
        assert!(anim.frames_in(1.3, 1.1).is_empty());
    }
    
    #[tokio::test]
    async fn test_fetch_error_is_surfaced_as_event() {
        let frames = series(8, 0.5);
        let source = Arc::new(FailingSource {
            inner: VecSource::new(frames.clone()),
            failing: 1,
        });
        let mut anim = BufferedAnimator::new(source, BufferConfig::default());
        let mut rx = anim.subscribe();
        
        anim.set_time(2.5).await.unwrap();
        
        assert!(anim.stale());
        assert_eq!(anim.state(), &reference_state(&frames, 0.5).await);
        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AnimatorEvent::Error { error } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![AnimatorError::Env(EnvError::source("disk read failed"))]);
    }
    
    #[tokio::test]
    async fn test_reset_chunk_at_time_refetches() {
        let frames = series(8, 0.5);
        let source = VecSource::new(frames);
        let mut anim = BufferedAnimator::new(source.clone(), BufferConfig::default());
        anim.set_time(1.5).await.unwrap();
        
        source.frames.lock().unwrap().insert(2, Frame::new(0.7, state! { "z" => 1.0 }));
        anim.reset_chunk_at_time(0.7);
        anim.set_time(1.6).await.unwrap();
        
        assert_eq!(anim.state()["z"], Value::Number(1.0));
    }
    
    #[tokio::test]
    async fn test_known_end_stops_requests() {
        let frames = series(4, 0.5);
        let source = VecSource::new(frames.clone());
        let mut anim = BufferedAnimator::new(source.clone(), BufferConfig::default());
        
        anim.set_time(6.0).await.unwrap();
        assert_eq!(anim.state(), &reference_state(&frames, 6.0).await);
        assert_eq!(anim.end_time(), 2.0);
        
        let fetches = source.fetches.load(Ordering::SeqCst);
        anim.set_time(7.0).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), fetches);
    }
    
    #[tokio::test]
    async fn test_keyframes_seed_rewind() {
        let frames = series(25, 0.5);
        let source = VecSource::new(frames.clone());
        let keyframes = KeyframeIndex::new(2.0, Arc::new(MemoryCache::<Keyframe>::new()));
        let config = BufferConfig::default().with_buffer(1.0);
        let mut anim = BufferedAnimator::new(source, config)
            .with_range(0.0, 12.0)
            .with_keyframes(keyframes);
        let mut rx = anim.subscribe();
        
        anim.generate_keyframes().await.unwrap();
        assert_eq!(anim.keyframes().unwrap().committed(), vec![1, 2, 3, 4, 5, 6]);
        let progress = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, AnimatorEvent::KeyframeProgress { .. }))
            .count();
        assert!(progress > 1);
        
        anim.set_time(9.5).await.unwrap();
        anim.set_time(7.5).await.unwrap();
        assert_eq!(anim.state(), &reference_state(&frames, 7.5).await);
        // Restart began at the keyframe for t=6, not at the origin
        assert!(anim.chunk_times().iter().all(|&t| t >= 5.0));
    }
    
    #[tokio::test]
    async fn test_keyframed_rewind_keeps_interpolating() {
        let frames = vec![
            Frame::new(0.0, state! { "a" => 0.0 }),
            Frame::new(8.0, state! { "a" => 8.0 }),
            Frame::new(12.0, state! { "a" => 12.0 }),
            Frame::new(20.0, state! { "a" => 20.0 }),
        ];
        let base = TelemetryAnimator::with_config(
            Vec::new(),
            crate::animator::AnimatorConfig::default().with_interpolate(true),
        );
        let keyframes = KeyframeIndex::new(10.0, Arc::new(MemoryCache::<Keyframe>::new()));
        let mut anim = BufferedAnimator::new(VecSource::new(frames), BufferConfig::default())
            .with_base(base)
            .with_range(0.0, 20.0)
            .with_keyframes(keyframes);
        anim.generate_keyframes().await.unwrap();
        
        anim.set_time(20.0).await.unwrap();
        anim.set_time(11.0).await.unwrap();
        
        // Seeded from the keyframe at 10, blending from the frame at 8
        assert_relative_eq!(anim.state()["a"].as_f64().unwrap(), 11.0);
    }
    
    #[tokio::test]
    async fn test_for_each_frame_across_chunks() {
        let frames = series(9, 0.5);
        let anim = BufferedAnimator::new(VecSource::new(frames), BufferConfig::default()).with_range(0.0, 4.0);
        
        let mut times = Vec::new();
        anim.for_each_frame(ForEachOptions::between(0.5, 3.0).raw(), |_, t| times.push(t))
            .await
            .unwrap();
        assert_eq!(times, vec![1.0, 1.5, 2.0, 2.5]);
        
        let mut last = State::new();
        anim.for_each_frame(ForEachOptions::default(), |state, _| last = state.clone())
            .await
            .unwrap();
        assert_eq!(last["a"], Value::Number(8.0));
    }
    
    #[tokio::test]
    async fn test_interpolation_uses_next_chunk() {
        let frames = vec![
            Frame::new(0.0, state! { "a" => 0.0 }),
            Frame::new(1.5, state! { "a" => 3.0 }),
        ];
        let base = TelemetryAnimator::with_config(
            Vec::new(),
            crate::animator::AnimatorConfig::default().with_interpolate(true),
        );
        let mut anim = BufferedAnimator::new(VecSource::new(frames), BufferConfig::default()).with_base(base);
        
        anim.set_time(0.5).await.unwrap();
        assert_relative_eq!(anim.state()["a"].as_f64().unwrap(), 1.0);
    }
    
    #[tokio::test]
    async fn test_dispose_cancels_pending_chunks() {
        let source = GatedSource::new(series(4, 0.5), 2);
        let mut anim = BufferedAnimator::new(source.clone(), BufferConfig::default());
        let _ = tokio::time::timeout(Duration::from_millis(20), anim.set_time(0.5)).await;
        
        anim.dispose();
        assert!(source.token(0).unwrap().is_cancelled());
        assert!(anim.set_time(1.0).await.is_ok());
        assert!(anim.is_disposed());
    }
}
