//! Scenario runner - drives animators against a full replay of the same recording.
//!
//! Every scenario follows the same pattern: generate a seeded rover
//! recording, hand it to the animator under test through a slow source,
//! and after every step compare the visible state with a plain
//! [`TelemetryAnimator`] that holds the whole recording in memory.

use crate::context::SimContext;
use crate::exporter::{SimEvent, SimExport, SimFrame};
use crate::preload::{camera_image, SimImagePreloader};
use crate::rover::RoverModel;
use crate::scenarios::ScenarioId;
use crate::source::SimFrameSource;

use rand::Rng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::events::drain;
use telemetry_core::value::state_to_json;
use telemetry_core::{
    Animator, AnimatorError, AnimatorEvent, BufferConfig, BufferedAnimator, Driver, Frame, JoinedAnimator,
    Keyframe, KeyframeIndex, LiveAnimator, LiveConfig, LiveSide, LookAheadAnimator, LookAheadConfig, Playback,
    PlaybackConfig, State, StateDiff, TelemetryAnimator, Value,
};
use telemetry_env::{AnimatorContext, MemoryCache};
use thiserror::Error;
use tracing::{debug, info, warn};

/// RNG stream for chunk latency.
const SOURCE_STREAM: u64 = 1;

/// RNG stream for seek targets.
const SEEK_STREAM: u64 = 2;

/// RNG stream for preload latency.
const PRELOAD_STREAM: u64 = 3;

/// Slack for float comparisons on window bounds.
const EPSILON: f64 = 1e-9;

/// Why a scenario run failed.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Animator(#[from] AnimatorError),
    
    #[error("state mismatch at t={time:.3}s in field '{field}'")]
    Mismatch { time: f64, field: String },
    
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,
    
    /// Seed used
    pub seed: u64,
    
    /// Whether scenario passed all assertions
    pub passed: bool,
    
    /// Playback ticks executed
    pub total_ticks: u64,
    
    /// States compared against the replay
    pub checks: u64,
    
    /// Last playhead time in seconds
    pub final_time_secs: f64,
    
    /// Failure message if any
    pub failure_reason: Option<String>,
    
    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Explicit `set_time` calls outside playback ticks
    pub seeks: u64,
    
    /// Chunk fetches started against the source
    pub chunk_fetches: u64,
    
    /// Fetches that observed their cancellation
    pub chunk_cancellations: u64,
    
    /// Keyframes committed
    pub keyframes: u64,
    
    /// Preloads started
    pub preloads: u64,
    
    /// Preloads released
    pub unloads: u64,
    
    /// Driver updates delivered by playback
    pub driver_updates: u64,
    
    /// `Error` events observed
    pub error_events: u64,
    
    /// `Connected` and `Disconnected` events observed
    pub connection_events: u64,
}

/// Counts updates so the runner can report on them.
#[derive(Default)]
struct CountingDriver {
    updates: Arc<AtomicU64>,
}

impl Driver for CountingDriver {
    fn update(&mut self, _state: &State, diff: &StateDiff) {
        if !diff.is_empty() {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-run bookkeeping: comparisons, metrics and the optional export.
struct Recorder {
    ticks: u64,
    checks: u64,
    final_time: f64,
    metrics: ScenarioMetrics,
    export: Option<SimExport>,
    
    /// Export every n-th check
    sample_interval: u64,
    
    pending_events: Vec<SimEvent>,
}

impl Recorder {
    fn new(export: Option<SimExport>) -> Self {
        Self {
            ticks: 0,
            checks: 0,
            final_time: 0.0,
            metrics: ScenarioMetrics::default(),
            export,
            sample_interval: 10,
            pending_events: Vec::new(),
        }
    }
    
    /// Compares the visible state with the replay, sampling it into the export.
    fn check(&mut self, time: f64, actual: &State, expected: &State, stale: bool) -> Result<(), SimError> {
        if let Some(export) = self.export.as_mut() {
            if self.checks % self.sample_interval == 0 {
                export.add_frame(SimFrame {
                    time_sec: time,
                    state: state_to_json(actual),
                    stale,
                    events: std::mem::take(&mut self.pending_events),
                });
            }
        }
        self.checks += 1;
        self.final_time = time;
        
        match first_difference(actual, expected) {
            Some(field) => Err(SimError::Mismatch { time, field }),
            None => Ok(()),
        }
    }
    
    fn observe(&mut self, events: Vec<AnimatorEvent>) {
        for event in events {
            match event {
                AnimatorEvent::Error { error } => {
                    self.metrics.error_events += 1;
                    self.pending_events.push(SimEvent::error(error.to_string()));
                }
                AnimatorEvent::Connected | AnimatorEvent::Disconnected => {
                    self.metrics.connection_events += 1;
                    self.pending_events.push(SimEvent::info(format!("{event:?}")));
                }
                AnimatorEvent::KeyframeProgress { progress } if progress >= 1.0 => {
                    self.pending_events.push(SimEvent::info("keyframes generated"));
                }
                _ => {}
            }
        }
    }
}

/// Name of the first top-level field whose value differs.
fn first_difference(actual: &State, expected: &State) -> Option<String> {
    actual
        .keys()
        .chain(expected.keys())
        .find(|key| actual.get(*key) != expected.get(*key))
        .cloned()
}

/// Moves every `arm` field into a separate recording.
fn split_arm(frames: &[Frame]) -> (Vec<Frame>, Vec<Frame>) {
    let mut rover = Vec::with_capacity(frames.len());
    let mut arm = Vec::new();
    for frame in frames {
        let mut state = frame.state.clone();
        if let Some(joints) = state.remove("arm") {
            arm.push(Frame::new(frame.time, State::from([("arm".to_string(), joints)])));
        }
        if !state.is_empty() {
            rover.push(Frame::new(frame.time, state));
        }
    }
    (rover, arm)
}

/// Runs simulation scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,
    
    /// Tick rate in Hz
    tick_rate_hz: u32,
    
    /// Recording length in seconds
    duration_secs: f64,
    
    chunk_size: f64,
    buffer: f64,
    keyframe_stride: f64,
    
    /// Upper bound on source and preload latency, in scheduler yields
    max_latency_polls: u32,
    
    /// Random seeks per seek-driven scenario
    seeks: usize,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 30,
            duration_secs: 10.0,
            chunk_size: 1.0,
            buffer: 2.0,
            keyframe_stride: 2.0,
            max_latency_polls: 8,
            seeks: 100,
        }
    }
    
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }
    
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs.max(1.0);
        self
    }
    
    pub fn with_chunk_size(mut self, chunk_size: f64) -> Self {
        self.chunk_size = chunk_size;
        self
    }
    
    pub fn with_max_latency(mut self, polls: u32) -> Self {
        self.max_latency_polls = polls;
        self
    }
    
    pub fn with_seeks(mut self, seeks: usize) -> Self {
        self.seeks = seeks;
        self
    }
    
    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None).await.0
    }
    
    /// Runs a scenario, sampling visible states into an export.
    pub async fn run_with_export(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let export = SimExport::new(scenario.name(), self.seed);
        let (result, export) = self.execute(scenario, Some(export)).await;
        let export = export.unwrap_or_else(|| SimExport::new(scenario.name(), self.seed));
        (result, export)
    }
    
    async fn execute(&self, scenario: ScenarioId, export: Option<SimExport>) -> (ScenarioResult, Option<SimExport>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        if scenario.is_stress() {
            warn!("Stress scenario, expect a longer run");
        }
        
        let context = SimContext::shared(self.seed);
        let mut rec = Recorder::new(export);
        let outcome = match scenario {
            ScenarioId::Playback => self.run_playback(&context, &mut rec).await,
            ScenarioId::Scrub => {
                self.run_scrub(&context, &mut rec, self.chunk_size, self.max_latency_polls, self.seeks)
                    .await
            }
            ScenarioId::ReverseChunks => self.run_reverse(&context, &mut rec).await,
            ScenarioId::LiveStream => self.run_live(&context, &mut rec).await,
            ScenarioId::LookAhead => self.run_look_ahead(&context, &mut rec).await,
            ScenarioId::Joined => self.run_joined(&context, &mut rec).await,
            ScenarioId::ScrubStorm => self.run_scrub(&context, &mut rec, 0.25, 64, 500).await,
        };
        
        let failure_reason = outcome.err().map(|err| err.to_string());
        if let Some(reason) = &failure_reason {
            warn!(scenario = %scenario, seed = self.seed, reason = %reason, "scenario failed");
        }
        let passed = failure_reason.is_none();
        if let Some(export) = rec.export.as_mut() {
            export.finalize(passed, failure_reason.clone());
        }
        
        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: rec.ticks,
            checks: rec.checks,
            final_time_secs: rec.final_time,
            failure_reason,
            metrics: rec.metrics,
        };
        (result, rec.export)
    }
    
    // ========================================================================
    // SETUP
    // ========================================================================
    
    /// The rover recording for this seed.
    fn recording(&self) -> Vec<Frame> {
        // Physics gets its own seed so changing source latency never changes the data
        let physics_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        RoverModel::new(physics_seed).generate(self.duration_secs)
    }
    
    fn source(&self, context: &SimContext, frames: Vec<Frame>, max_latency_polls: u32) -> SimFrameSource {
        SimFrameSource::new(Arc::new(frames), context.derive_rng(SOURCE_STREAM)).with_max_latency(max_latency_polls)
    }
    
    fn buffered(&self, source: SimFrameSource, chunk_size: f64) -> BufferedAnimator {
        let config = BufferConfig::default()
            .with_chunk_size(chunk_size)
            .with_buffer(self.buffer);
        BufferedAnimator::new(Arc::new(source), config).with_range(0.0, self.duration_secs)
    }
    
    fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig::default().with_tick_rate(self.tick_rate_hz)
    }
    
    fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz))
    }
    
    /// Playback that has not reached the end after this many ticks is stuck.
    fn max_ticks(&self) -> u64 {
        (self.duration_secs * f64::from(self.tick_rate_hz)) as u64 * 2 + u64::from(self.tick_rate_hz) * 2
    }
    
    // ========================================================================
    // SIM-001: PLAYBACK
    // ========================================================================
    
    async fn run_playback(&self, context: &Arc<SimContext>, rec: &mut Recorder) -> Result<(), SimError> {
        let frames = self.recording();
        let source = self.source(context, frames.clone(), self.max_latency_polls);
        let stats = source.stats();
        let animator = self.buffered(source, self.chunk_size);
        let mut events = animator.subscribe();
        
        let driver = CountingDriver::default();
        let updates = driver.updates.clone();
        let mut playback = Playback::new(animator, context.clone(), self.playback_config());
        playback.add_driver(Box::new(driver));
        let mut reference = TelemetryAnimator::new(frames);
        
        playback.seek(0.0).await?;
        playback.play();
        let period = self.tick_period();
        while playback.is_playing() && rec.ticks < self.max_ticks() {
            context.sleep(period).await;
            let time = playback.tick().await?;
            rec.ticks += 1;
            reference.set_time(time).await?;
            
            let animator = playback.animator();
            rec.observe(drain(&mut events));
            rec.check(time, animator.state(), reference.state(), animator.stale())?;
            self.check_window(animator)?;
            
            if rec.ticks % 30 == 0 {
                debug!("  t={:.1}s | chunks={:?} | fetches={}", time, animator.chunk_times(), stats.fetches());
            }
        }
        if playback.is_playing() {
            return Err(SimError::Invariant(format!(
                "playback stuck at t={:.3}s after {} ticks",
                playback.animator().time(),
                rec.ticks
            )));
        }
        
        rec.metrics.driver_updates = updates.load(Ordering::Relaxed);
        rec.metrics.chunk_fetches = stats.fetches();
        rec.metrics.chunk_cancellations = stats.cancellations();
        Ok(())
    }
    
    /// Resident chunks stay within the buffer around the playhead.
    fn check_window(&self, animator: &BufferedAnimator) -> Result<(), SimError> {
        let time = animator.time();
        let chunk_size = animator.config().chunk_size;
        let (lo, hi) = (time - self.buffer - chunk_size - EPSILON, time + self.buffer + EPSILON);
        match animator.chunk_times().into_iter().find(|&t| t < lo || t > hi) {
            Some(chunk) => Err(SimError::Invariant(format!(
                "chunk at {chunk:.3}s resident outside the window around t={time:.3}s"
            ))),
            None => Ok(()),
        }
    }
    
    // ========================================================================
    // SIM-002 / SIM-007: SCRUB
    // ========================================================================
    
    async fn run_scrub(
        &self,
        context: &Arc<SimContext>,
        rec: &mut Recorder,
        chunk_size: f64,
        max_latency_polls: u32,
        seeks: usize,
    ) -> Result<(), SimError> {
        let frames = self.recording();
        let source = self.source(context, frames.clone(), max_latency_polls);
        let stats = source.stats();
        let keyframes = KeyframeIndex::new(self.keyframe_stride, Arc::new(MemoryCache::<Keyframe>::new()));
        let mut animator = self.buffered(source, chunk_size).with_keyframes(keyframes);
        let mut events = animator.subscribe();
        
        animator.generate_keyframes().await?;
        rec.metrics.keyframes = animator.keyframes().map_or(0, |k| k.committed().len()) as u64;
        rec.observe(drain(&mut events));
        info!(keyframes = rec.metrics.keyframes, "keyframes generated");
        
        let mut reference = TelemetryAnimator::new(frames);
        let mut rng = context.derive_rng(SEEK_STREAM);
        for _ in 0..seeks {
            let time = rng.gen_range(0.0..=self.duration_secs);
            animator.set_time(time).await?;
            reference.set_time(time).await?;
            rec.metrics.seeks += 1;
            
            rec.observe(drain(&mut events));
            rec.check(time, animator.state(), reference.state(), animator.stale())?;
        }
        
        rec.metrics.chunk_fetches = stats.fetches();
        rec.metrics.chunk_cancellations = stats.cancellations();
        Ok(())
    }
    
    // ========================================================================
    // SIM-003: REVERSE CHUNKS
    // ========================================================================
    
    async fn run_reverse(&self, context: &Arc<SimContext>, rec: &mut Recorder) -> Result<(), SimError> {
        let frames = self.recording();
        let source = self.source(context, frames.clone(), self.max_latency_polls);
        let stats = source.stats();
        let mut animator = self.buffered(source, self.chunk_size);
        let mut reference = TelemetryAnimator::new(frames);
        
        // Not a multiple of the chunk size, so steps land all over each chunk
        let step = self.chunk_size * 0.37;
        let mut time = self.duration_secs;
        loop {
            animator.set_time(time).await?;
            reference.set_time(time).await?;
            rec.metrics.seeks += 1;
            rec.check(time, animator.state(), reference.state(), animator.stale())?;
            if time <= 0.0 {
                break;
            }
            time = (time - step).max(0.0);
        }
        
        rec.metrics.chunk_fetches = stats.fetches();
        rec.metrics.chunk_cancellations = stats.cancellations();
        Ok(())
    }
    
    // ========================================================================
    // SIM-004: LIVE STREAM
    // ========================================================================
    
    async fn run_live(&self, context: &Arc<SimContext>, rec: &mut Recorder) -> Result<(), SimError> {
        const BATCH_SECS: f64 = 0.5;
        
        let frames = self.recording();
        let config = LiveConfig::default()
            .with_chunk_size(self.chunk_size)
            .with_buffer(self.buffer)
            .with_keyframe_stride(self.keyframe_stride)
            .with_non_seekable_buffer(self.chunk_size);
        let mut live = LiveAnimator::new(config);
        let mut events = live.subscribe();
        live.set_connected(true);
        
        let mut batches: Vec<Vec<Frame>> = Vec::new();
        for frame in frames {
            let index = (frame.time / BATCH_SECS).floor() as usize;
            if batches.len() <= index {
                batches.resize_with(index + 1, Vec::new);
            }
            batches[index].push(frame);
        }
        
        let mut reference = TelemetryAnimator::new(Vec::new());
        let mut rng = context.derive_rng(SEEK_STREAM);
        let reconnect_at = batches.len() / 2;
        for (index, batch) in batches.into_iter().enumerate() {
            context.sleep(Duration::from_secs_f64(BATCH_SECS)).await;
            if batch.is_empty() {
                continue;
            }
            live.add_frames(batch.clone()).await?;
            reference.add_frames(batch).await?;
            
            let head = live.time();
            reference.set_time(head).await?;
            rec.check(head, live.state(), reference.state(), live.stale())?;
            
            if index % 4 == 3 && head > 0.0 {
                let time = rng.gen_range(0.0..head);
                live.set_time(time).await?;
                rec.metrics.seeks += 1;
                if live.current() != LiveSide::Cache {
                    return Err(SimError::Invariant(format!("seek to {time:.3}s behind the head stayed on the stream")));
                }
                reference.set_time(time).await?;
                rec.check(time, live.state(), reference.state(), live.stale())?;
                
                let end = live.end_time();
                live.set_time(end).await?;
                rec.metrics.seeks += 1;
                if live.current() != LiveSide::Streaming {
                    return Err(SimError::Invariant(format!("seek to head {end:.3}s stayed in history")));
                }
                reference.set_time(end).await?;
                rec.check(end, live.state(), reference.state(), live.stale())?;
            }
            
            if index == reconnect_at {
                live.set_connected(false);
                live.set_connected(true);
            }
            rec.observe(drain(&mut events));
        }
        
        live.flush().await;
        rec.metrics.keyframes = live.keyframes().map_or(0, |k| k.committed().len()) as u64;
        Ok(())
    }
    
    // ========================================================================
    // SIM-005: LOOK-AHEAD
    // ========================================================================
    
    async fn run_look_ahead(&self, context: &Arc<SimContext>, rec: &mut Recorder) -> Result<(), SimError> {
        let frames = self.recording();
        let preloader = Arc::new(
            SimImagePreloader::new(context.derive_rng(PRELOAD_STREAM)).with_max_latency(self.max_latency_polls),
        );
        let config = LookAheadConfig::default().with_look_ahead(1.5).with_look_back(0.5);
        let animator = LookAheadAnimator::new(TelemetryAnimator::new(frames.clone()), preloader.clone(), config.clone());
        let mut events = animator.subscribe();
        let mut playback = Playback::new(animator, context.clone(), self.playback_config());
        let mut reference = TelemetryAnimator::new(frames);
        
        playback.seek(0.0).await?;
        playback.play();
        let period = self.tick_period();
        while playback.is_playing() && rec.ticks < self.max_ticks() {
            context.sleep(period).await;
            let time = playback.tick().await?;
            rec.ticks += 1;
            reference.set_time(time).await?;
            
            let animator = playback.animator();
            rec.check(time, animator.inner().state(), reference.state(), animator.stale())?;
            if rec.ticks % 10 == 0 {
                playback.animator_mut().wait_for_preloads().await;
                check_resident(playback.animator(), &preloader, &config)?;
            }
            rec.observe(drain(&mut events));
        }
        
        rec.metrics.preloads = preloader.loads();
        rec.metrics.unloads = preloader.unloads();
        Ok(())
    }
    
    // ========================================================================
    // SIM-006: JOINED
    // ========================================================================
    
    async fn run_joined(&self, context: &Arc<SimContext>, rec: &mut Recorder) -> Result<(), SimError> {
        let (rover, arm) = split_arm(&self.recording());
        let source = self.source(context, rover.clone(), self.max_latency_polls);
        let stats = source.stats();
        let rover_animator: Box<dyn Animator> = Box::new(self.buffered(source, self.chunk_size));
        let arm_animator: Box<dyn Animator> = Box::new(TelemetryAnimator::new(arm.clone()));
        let mut joined = JoinedAnimator::new(vec![
            ("rover".to_string(), rover_animator),
            ("arm".to_string(), arm_animator),
        ])?;
        let mut events = joined.subscribe();
        let mut rover_ref = TelemetryAnimator::new(rover);
        let mut arm_ref = TelemetryAnimator::new(arm);
        
        // The arm keeps reporting after the rover recording ends
        let mut rng = context.derive_rng(SEEK_STREAM);
        let extension: Vec<Frame> = (1..=6)
            .map(|i| {
                let joints: Vec<f64> = (0..crate::rover::ARM_JOINTS).map(|_| rng.gen_range(-1.0..1.0)).collect();
                Frame::new(self.duration_secs + i as f64 * 0.3, State::from([("arm".to_string(), Value::from(joints))]))
            })
            .collect();
        let extension_end = self.duration_secs + 1.8;
        
        for i in 0..self.seeks {
            if i == self.seeks / 2 {
                let routed = extension
                    .iter()
                    .map(|f| Frame::new(f.time, State::from([("arm".to_string(), Value::Map(f.state.clone()))])))
                    .collect();
                joined.add_frames(routed).await?;
                arm_ref.add_frames(extension.clone()).await?;
                if joined.end_time() < extension_end - EPSILON {
                    return Err(SimError::Invariant(format!(
                        "joined end {:.3}s ignores the extended arm feed",
                        joined.end_time()
                    )));
                }
            }
            
            let time = rng.gen_range(0.0..=joined.end_time());
            joined.set_time(time).await?;
            rover_ref.set_time(time).await?;
            arm_ref.set_time(time).await?;
            rec.metrics.seeks += 1;
            rec.observe(drain(&mut events));
            
            for (name, reference) in [("rover", &rover_ref), ("arm", &arm_ref)] {
                let child = joined
                    .child_state(name)
                    .ok_or_else(|| SimError::Invariant(format!("child '{name}' missing")))?;
                rec.check(time, child, reference.state(), joined.stale())?;
                if joined.state().get(name) != Some(&Value::Map(child.clone())) {
                    return Err(SimError::Invariant(format!("composite state out of date for '{name}'")));
                }
            }
        }
        
        rec.metrics.chunk_fetches = stats.fetches();
        rec.metrics.chunk_cancellations = stats.cancellations();
        Ok(())
    }
}

/// Resident images must be exactly the ones referenced inside the look-ahead window.
fn check_resident(
    animator: &LookAheadAnimator<TelemetryAnimator>,
    preloader: &SimImagePreloader,
    config: &LookAheadConfig,
) -> Result<(), SimError> {
    let time = animator.time();
    let (lo, hi) = (time - config.look_back, time + config.look_ahead);
    let expected: BTreeSet<String> = animator
        .inner()
        .frames_in(lo, hi)
        .iter()
        .filter_map(|f| camera_image(&f.state).map(str::to_owned))
        .collect();
    let loaded: BTreeSet<String> = preloader.loaded().into_iter().collect();
    if loaded != expected {
        return Err(SimError::Invariant(format!(
            "resident images {loaded:?} differ from window {expected:?} at t={time:.3}s"
        )));
    }
    
    if let Some(image) = camera_image(animator.state()) {
        let ready = animator
            .state()
            .get("camera")
            .and_then(Value::as_map)
            .and_then(|camera| camera.get("ready"))
            == Some(&Value::Bool(true));
        if preloader.is_loaded(image) && !ready {
            return Err(SimError::Invariant(format!("camera {image} loaded but not marked ready")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_core::state;
    
    fn runner(seed: u64) -> ScenarioRunner {
        ScenarioRunner::new(seed).with_duration(4.0).with_seeks(40)
    }
    
    async fn assert_passes(scenario: ScenarioId) -> ScenarioResult {
        let result = runner(42).run(scenario).await;
        assert!(result.passed, "{} failed: {:?}", scenario, result.failure_reason);
        assert!(result.checks > 0);
        result
    }
    
    #[tokio::test]
    async fn test_playback_matches_replay() {
        let result = assert_passes(ScenarioId::Playback).await;
        assert!(result.total_ticks >= 4 * 30);
        assert!((result.final_time_secs - 4.0).abs() < 1e-9);
        assert!(result.metrics.chunk_fetches >= 5);
        assert!(result.metrics.driver_updates > 0);
    }
    
    #[tokio::test]
    async fn test_scrub_matches_replay() {
        let result = assert_passes(ScenarioId::Scrub).await;
        assert_eq!(result.metrics.seeks, 40);
        assert!(result.metrics.keyframes > 0);
    }
    
    #[tokio::test]
    async fn test_reverse_chunks_matches_replay() {
        let result = assert_passes(ScenarioId::ReverseChunks).await;
        assert_eq!(result.final_time_secs, 0.0);
    }
    
    #[tokio::test]
    async fn test_live_stream_matches_replay() {
        let result = assert_passes(ScenarioId::LiveStream).await;
        assert!(result.metrics.seeks >= 2);
        assert_eq!(result.metrics.connection_events, 3);
    }
    
    #[tokio::test]
    async fn test_look_ahead_tracks_window() {
        let result = assert_passes(ScenarioId::LookAhead).await;
        assert!(result.metrics.preloads >= 4);
        assert!(result.metrics.unloads > 0);
    }
    
    #[tokio::test]
    async fn test_joined_matches_replay() {
        assert_passes(ScenarioId::Joined).await;
    }
    
    #[tokio::test]
    async fn test_scrub_storm_survives_slow_tiny_chunks() {
        assert_passes(ScenarioId::ScrubStorm).await;
    }
    
    #[tokio::test]
    async fn test_export_samples_states() {
        let (result, export) = runner(7).run_with_export(ScenarioId::Scrub).await;
        assert!(result.passed);
        assert!(export.passed);
        assert_eq!(export.seed, 7);
        assert_eq!(export.frames.len() as u64, result.checks.div_ceil(10));
        assert!(export.frames.iter().all(|f| f.state.is_object()));
    }
    
    #[tokio::test]
    async fn test_same_seed_same_run() {
        let (_, a) = runner(9).run_with_export(ScenarioId::Scrub).await;
        let (_, b) = runner(9).run_with_export(ScenarioId::Scrub).await;
        let states = |export: &SimExport| -> Vec<(f64, serde_json::Value)> {
            export.frames.iter().map(|f| (f.time_sec, f.state.clone())).collect()
        };
        assert_eq!(states(&a), states(&b));
    }
    
    #[test]
    fn test_mismatch_names_field() {
        let mut rec = Recorder::new(None);
        let expected = state! { "mode" => "drive", "speed" => 1.0 };
        assert!(rec.check(1.0, &expected.clone(), &expected, false).is_ok());
        
        let actual = state! { "mode" => "idle", "speed" => 1.0 };
        match rec.check(2.0, &actual, &expected, false) {
            Err(SimError::Mismatch { time, field }) => {
                assert_eq!(time, 2.0);
                assert_eq!(field, "mode");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert_eq!(rec.checks, 2);
    }
    
    #[test]
    fn test_split_arm_keeps_times() {
        let frames = vec![
            Frame::new(0.0, state! { "speed" => 1.0, "arm" => vec![0.1, 0.2] }),
            Frame::new(0.5, state! { "arm" => vec![0.3, 0.4] }),
        ];
        let (rover, arm) = split_arm(&frames);
        assert_eq!(rover, vec![Frame::new(0.0, state! { "speed" => 1.0 })]);
        assert_eq!(arm.iter().map(|f| f.time).collect::<Vec<_>>(), vec![0.0, 0.5]);
        assert!(arm.iter().all(|f| f.state.contains_key("arm")));
    }
}
