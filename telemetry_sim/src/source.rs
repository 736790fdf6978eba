//! Simulated chunk store with seeded latency.
//!
//! Latency is counted in scheduler yields rather than wall time, so
//! chunk results complete out of order without slowing the run down.

use async_trait::async_trait;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use telemetry_core::{Frame, FrameSource};
use telemetry_env::{CancelToken, EnvError};
use tracing::trace;

/// Counters shared between a source and the runner that reports on it.
#[derive(Debug, Default)]
pub struct SourceStats {
    pub fetches: AtomicU64,
    pub cancellations: AtomicU64,
    pub failures: AtomicU64,
}

impl SourceStats {
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
    
    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::SeqCst)
    }
    
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Serves a fixed recording chunk by chunk.
pub struct SimFrameSource {
    frames: Arc<Vec<Frame>>,
    latency_rng: Mutex<ChaCha8Rng>,
    
    /// Upper bound on yields before a fetch completes
    max_latency_polls: u32,
    
    /// Probability that a fetch fails (default: 0)
    failure_rate: f64,
    
    stats: Arc<SourceStats>,
}

impl SimFrameSource {
    /// `frames` must be sorted by time.
    pub fn new(frames: Arc<Vec<Frame>>, latency_rng: ChaCha8Rng) -> Self {
        Self {
            frames,
            latency_rng: Mutex::new(latency_rng),
            max_latency_polls: 8,
            failure_rate: 0.0,
            stats: Arc::new(SourceStats::default()),
        }
    }
    
    pub fn with_max_latency(mut self, polls: u32) -> Self {
        self.max_latency_polls = polls;
        self
    }
    
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }
    
    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }
    
    fn roll(&self) -> (u32, bool) {
        let mut rng = self.latency_rng.lock().unwrap_or_else(PoisonError::into_inner);
        let polls = rng.gen_range(0..=self.max_latency_polls);
        let fail = self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate);
        (polls, fail)
    }
    
    fn slice(&self, time: f64, length: f64) -> Option<Vec<Frame>> {
        let last = self.frames.last()?;
        if time > last.time {
            return None;
        }
        let from = self.frames.partition_point(|f| f.time < time);
        let to = self.frames.partition_point(|f| f.time < time + length);
        Some(self.frames[from..to].to_vec())
    }
}

#[async_trait]
impl FrameSource for SimFrameSource {
    async fn get_frames(&self, time: f64, length: f64, cancel: CancelToken) -> Result<Option<Vec<Frame>>, EnvError> {
        self.stats.fetches.fetch_add(1, Ordering::SeqCst);
        let (polls, fail) = self.roll();
        for _ in 0..polls {
            if cancel.is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
        }
        if cancel.is_cancelled() {
            self.stats.cancellations.fetch_add(1, Ordering::SeqCst);
            return Err(EnvError::Cancelled);
        }
        if fail {
            self.stats.failures.fetch_add(1, Ordering::SeqCst);
            return Err(EnvError::source(format!("simulated fetch failure at {time}")));
        }
        trace!(time, polls, "served chunk");
        Ok(self.slice(time, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use telemetry_core::state;
    
    fn source() -> SimFrameSource {
        let frames = (0..10).map(|i| Frame::new(i as f64 * 0.5, state! { "i" => i })).collect();
        SimFrameSource::new(Arc::new(frames), ChaCha8Rng::seed_from_u64(1)).with_max_latency(3)
    }
    
    #[tokio::test]
    async fn test_serves_half_open_chunks() {
        let source = source();
        let chunk = source.get_frames(1.0, 1.0, CancelToken::new()).await.unwrap().unwrap();
        let times: Vec<f64> = chunk.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![1.0, 1.5]);
        
        // Past the last frame is the end; a gap before it is empty
        assert_eq!(source.get_frames(5.0, 1.0, CancelToken::new()).await.unwrap(), None);
        assert_eq!(source.stats().fetches(), 2);
    }
    
    #[tokio::test]
    async fn test_cancelled_fetch_is_counted() {
        let source = source();
        let cancel = CancelToken::new();
        cancel.cancel();
        
        let err = source.get_frames(0.0, 1.0, cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(source.stats().cancellations(), 1);
    }
    
    #[tokio::test]
    async fn test_failure_injection() {
        let source = source().with_failure_rate(1.0);
        let err = source.get_frames(0.0, 1.0, CancelToken::new()).await.unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(source.stats().failures(), 1);
    }
}
