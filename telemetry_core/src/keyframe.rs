//! Keyframe index: periodic full-state snapshots.
//!
//! Keyframes are spaced `stride` apart and stored in an [`ObjectCache`]
//! keyed by bucket index (`floor(time / stride)`). The keyframe for
//! bucket `B` holds the state accumulated over every frame with
//! `time < B * stride`; the frame exactly at `B * stride` is not part of
//! it. Seeking to `t` loads the keyframe at or below `t`, then rolls
//! forward from there instead of replaying from the origin.
//!
//! Each keyframe also records the time of the last frame folded into it,
//! so interpolating animators can blend from it without that frame.

use crate::error::AnimatorError;
use crate::frame::Frame;
use crate::policy::{ShallowPolicy, StatePolicy};
use crate::value::State;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use telemetry_env::{EnvError, ObjectCache};
use tracing::{debug, warn};

type KeyframeLoad = Shared<BoxFuture<'static, Result<Option<Keyframe>, EnvError>>>;

/// Snapshot of the state accumulated before a bucket boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub state: State,
    
    /// Time of the last frame folded into `state`
    pub last_frame_time: Option<f64>,
}

impl Keyframe {
    pub fn new(state: State, last_frame_time: Option<f64>) -> Self {
        Self { state, last_frame_time }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held while a full keyframe generation pass runs.
///
/// Dropping the guard releases the generation lock.
pub struct GenerationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Keyframe store and incremental accumulator.
///
/// Clones share the cache, the set of committed buckets, in-flight loads
/// and the generation lock; each clone keeps its own accumulator.
#[derive(Clone)]
pub struct KeyframeIndex {
    stride: f64,
    cache: Arc<dyn ObjectCache<Keyframe>>,
    policy: Arc<dyn StatePolicy>,
    
    /// In-flight loads by bucket, so identical requests share one read
    pending: Arc<Mutex<HashMap<i64, KeyframeLoad>>>,
    
    /// Buckets written by this index (or its clones)
    committed: Arc<Mutex<BTreeSet<i64>>>,
    
    generating: Arc<AtomicBool>,
    
    /// Running merge of every frame folded so far
    accumulator: State,
    
    /// Time of the most recently folded frame
    acc_last: Option<f64>,
    
    /// Bucket of the most recently folded frame
    acc_bucket: Option<i64>,
}

impl KeyframeIndex {
    /// Creates an index with the given stride over `cache`.
    pub fn new(stride: f64, cache: Arc<dyn ObjectCache<Keyframe>>) -> Self {
        Self {
            stride,
            cache,
            policy: Arc::new(ShallowPolicy),
            pending: Arc::new(Mutex::new(HashMap::new())),
            committed: Arc::new(Mutex::new(BTreeSet::new())),
            generating: Arc::new(AtomicBool::new(false)),
            accumulator: State::new(),
            acc_last: None,
            acc_bucket: None,
        }
    }
    
    /// Sets the merge policy used by the accumulator.
    pub fn with_policy(mut self, policy: Arc<dyn StatePolicy>) -> Self {
        self.policy = policy;
        self
    }
    
    pub(crate) fn set_policy(&mut self, policy: Arc<dyn StatePolicy>) {
        self.policy = policy;
    }
    
    pub fn stride(&self) -> f64 {
        self.stride
    }
    
    /// Bucket index containing `time`.
    pub fn bucket(&self, time: f64) -> i64 {
        (time / self.stride).floor() as i64
    }
    
    /// Start of the bucket containing `time`.
    pub fn resolve_to_keyframe_time(&self, time: f64) -> f64 {
        self.bucket(time) as f64 * self.stride
    }
    
    /// Start of the bucket after the one containing `time`.
    pub fn resolve_to_next_keyframe_time(&self, time: f64) -> f64 {
        (self.bucket(time) + 1) as f64 * self.stride
    }
    
    /// Buckets committed so far, ascending.
    pub fn committed(&self) -> Vec<i64> {
        lock(&self.committed).iter().copied().collect()
    }
    
    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }
    
    /// Reads the keyframe stored for the bucket containing `time`.
    ///
    /// Concurrent requests for the same bucket share a single cache read.
    pub async fn get(&self, time: f64) -> Result<Option<Keyframe>, EnvError> {
        let key = self.bucket(time);
        let load = {
            let mut pending = lock(&self.pending);
            pending
                .entry(key)
                .or_insert_with(|| {
                    let cache = self.cache.clone();
                    async move { cache.get(key).await }.boxed().shared()
                })
                .clone()
        };
        
        let result = load.await;
        
        let mut pending = lock(&self.pending);
        if pending.get(&key).is_some_and(|load| load.peek().is_some()) {
            pending.remove(&key);
        }
        result
    }
    
    /// Finds the best seed for seeking to `time`.
    ///
    /// Returns the keyframe for `time`'s own bucket, or else the latest
    /// committed keyframe below it, together with the keyframe's time.
    pub async fn get_keyframe(&self, time: f64) -> Result<Option<(f64, Keyframe)>, AnimatorError> {
        if let Some(keyframe) = self.get(time).await? {
            return Ok(Some((self.resolve_to_keyframe_time(time), keyframe)));
        }
        
        let bucket = self.bucket(time);
        let below = lock(&self.committed).range(..bucket).next_back().copied();
        if let Some(below) = below {
            let below_time = below as f64 * self.stride;
            if let Some(keyframe) = self.get(below_time).await? {
                return Ok(Some((below_time, keyframe)));
            }
        }
        Ok(None)
    }
    
    /// Takes the generation lock.
    pub fn begin_generation(&self) -> Result<GenerationGuard, AnimatorError> {
        self.generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AnimatorError::AlreadyGenerating)?;
        Ok(GenerationGuard {
            flag: self.generating.clone(),
        })
    }
    
    /// Forgets the accumulator so the next fold starts from an empty state.
    pub(crate) fn restart(&mut self) {
        self.accumulator.clear();
        self.acc_last = None;
        self.acc_bucket = None;
    }
    
    /// Folds one frame into the accumulator.
    ///
    /// Crossing into a new bucket first commits the state accumulated so
    /// far as that bucket's keyframe.
    pub(crate) async fn fold(&mut self, frame: &Frame) -> Result<(), AnimatorError> {
        let bucket = self.bucket(frame.time);
        match self.acc_bucket {
            None => self.acc_bucket = Some(bucket),
            Some(current) if bucket > current => {
                let keyframe = Keyframe::new(self.accumulator.clone(), self.acc_last);
                self.commit(bucket, keyframe).await?;
                self.acc_bucket = Some(bucket);
            }
            Some(current) if bucket < current => {
                warn!(time = frame.time, bucket, current, "frame lands in an already keyframed interval");
            }
            Some(_) => {}
        }
        self.policy.merge(&frame.state, &mut self.accumulator);
        self.acc_last = Some(frame.time);
        Ok(())
    }
    
    /// Writes a keyframe unless one already exists for `bucket`.
    async fn commit(&self, bucket: i64, keyframe: Keyframe) -> Result<(), AnimatorError> {
        let known = lock(&self.committed).contains(&bucket);
        if known || self.cache.has(bucket).await? {
            warn!(bucket, "keyframe already exists, skipping");
            return Ok(());
        }
        self.cache.set(bucket, keyframe).await?;
        lock(&self.committed).insert(bucket);
        debug!(bucket, time = bucket as f64 * self.stride, "committed keyframe");
        Ok(())
    }
    
    /// Extends keyframes with newly arrived frames.
    ///
    /// Fails if a generation pass is running on this index or a clone.
    pub async fn extend(&mut self, frames: &[Frame]) -> Result<(), AnimatorError> {
        if self.is_generating() {
            return Err(AnimatorError::AlreadyGenerating);
        }
        for frame in frames {
            self.fold(frame).await?;
        }
        Ok(())
    }
    
    /// Regenerates keyframes from a complete, sorted frame sequence.
    ///
    /// `progress` is called with the fraction of frames processed.
    pub async fn generate<P>(&mut self, frames: &[Frame], mut progress: P) -> Result<(), AnimatorError>
    where
        P: FnMut(f64) + Send,
    {
        let _guard = self.begin_generation()?;
        self.restart();
        let total = frames.len().max(1) as f64;
        for (i, frame) in frames.iter().enumerate() {
            self.fold(frame).await?;
            if (i + 1) % 64 == 0 {
                progress((i + 1) as f64 / total);
            }
        }
        progress(1.0);
        Ok(())
    }
}
