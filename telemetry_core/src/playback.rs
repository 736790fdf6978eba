//! Playback loop: drives an animator from a clock and feeds drivers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Playback                         │
//! │  Context: AnimatorContext                            │
//! │   • now()   → elapsed wall (or virtual) time         │
//! │   • sleep() → tick rate control                      │
//! │                        │                             │
//! │            set_time(time + elapsed * speed)          │
//! │                        ▼                             │
//! │  ┌──────────┐   Change   ┌────────┐ ┌────────┐       │
//! │  │ Animator │ ─────────▶ │ Driver │ │ Driver │ ...   │
//! │  └──────────┘  (diff)    └────────┘ └────────┘       │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! The same loop runs against `TokioContext` in production and a virtual
//! clock in the simulator.

use crate::animator::Animator;
use crate::error::AnimatorError;
use crate::events::{drain, AnimatorEvent, StateDiff};
use crate::value::State;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use telemetry_env::AnimatorContext;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Consumer of animator output (a 3D scene, a plot, a HUD).
pub trait Driver: Send {
    /// Called once per tick that produced changes. `diff` says which top-level fields moved.
    fn update(&mut self, state: &State, diff: &StateDiff);
}

/// Configuration for [`Playback`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Playhead seconds per clock second (default: 1.0)
    pub speed: f64,
    
    /// Wrap to `start_time` at the end instead of stopping (default: false)
    pub looping: bool,
    
    /// Tick rate in Hz for `run_for` (default: 30)
    pub tick_rate_hz: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            looping: false,
            tick_rate_hz: 30,
        }
    }
}

impl PlaybackConfig {
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }
    
    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
    
    pub fn with_tick_rate(mut self, tick_rate_hz: u32) -> Self {
        self.tick_rate_hz = tick_rate_hz;
        self
    }
}

/// Drives an animator from a clock.
///
/// Generic over the animator and the context, so the same loop runs in
/// production (tokio) or simulation (virtual clock).
pub struct Playback<A, C>
where
    A: Animator,
    C: AnimatorContext,
{
    animator: A,
    context: Arc<C>,
    config: PlaybackConfig,
    drivers: Vec<Box<dyn Driver>>,
    events: broadcast::Receiver<AnimatorEvent>,
    playing: bool,
    last_tick: Option<Duration>,
    tick_count: u64,
}

impl<A, C> Playback<A, C>
where
    A: Animator,
    C: AnimatorContext,
{
    pub fn new(animator: A, context: Arc<C>, config: PlaybackConfig) -> Self {
        let events = animator.subscribe();
        Self {
            animator,
            context,
            config,
            drivers: Vec::new(),
            events,
            playing: false,
            last_tick: None,
            tick_count: 0,
        }
    }
    
    pub fn add_driver(&mut self, driver: Box<dyn Driver>) {
        self.drivers.push(driver);
    }
    
    pub fn animator(&self) -> &A {
        &self.animator
    }
    
    pub fn animator_mut(&mut self) -> &mut A {
        &mut self.animator
    }
    
    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }
    
    pub fn set_speed(&mut self, speed: f64) {
        self.config.speed = speed;
    }
    
    pub fn is_playing(&self) -> bool {
        self.playing
    }
    
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
    
    pub fn play(&mut self) {
        if !self.playing {
            self.playing = true;
            self.last_tick = Some(self.context.now());
            debug!(time = self.animator.time(), speed = self.config.speed, "playback started");
        }
    }
    
    pub fn pause(&mut self) {
        self.playing = false;
        self.last_tick = None;
    }
    
    /// Jumps the playhead and notifies drivers.
    pub async fn seek(&mut self, time: f64) -> Result<(), AnimatorError> {
        self.animator.set_time(time).await?;
        self.dispatch();
        Ok(())
    }
    
    /// Next playhead for `elapsed` clock time; clamps or wraps at the end.
    fn next_time(&mut self, elapsed: Duration) -> f64 {
        let (start, end) = (self.animator.start_time(), self.animator.end_time());
        let time = self.animator.time() + elapsed.as_secs_f64() * self.config.speed;
        if time <= end {
            return time;
        }
        if self.config.looping && end > start {
            start + (time - start) % (end - start)
        } else {
            self.playing = false;
            self.last_tick = None;
            info!(end, "playback reached the end");
            end
        }
    }
    
    /// Advances by the clock time elapsed since the previous tick.
    ///
    /// While paused it lets the animator pick up finished background work.
    /// Returns the playhead after the tick.
    pub async fn tick(&mut self) -> Result<f64, AnimatorError> {
        self.tick_count += 1;
        let now = self.context.now();
        match self.last_tick.filter(|_| self.playing) {
            Some(last) => {
                let time = self.next_time(now.saturating_sub(last));
                if self.playing {
                    self.last_tick = Some(now);
                }
                self.animator.set_time(time).await?;
            }
            None => self.animator.poll().await?,
        }
        self.dispatch();
        Ok(self.animator.time())
    }
    
    /// Ticks at `tick_rate_hz` until `duration` of clock time has passed.
    ///
    /// Returns the number of ticks run.
    pub async fn run_for(&mut self, duration: Duration) -> Result<u64, AnimatorError> {
        let period = Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64);
        let started = self.context.now();
        let mut ticks = 0;
        while self.context.now().saturating_sub(started) < duration {
            self.context.sleep(period).await;
            self.tick().await?;
            ticks += 1;
        }
        Ok(ticks)
    }
    
    /// Coalesces pending animator events into one driver update.
    fn dispatch(&mut self) {
        let mut diff = StateDiff::new();
        for event in drain(&mut self.events) {
            match event {
                AnimatorEvent::Change { diff: changed, .. } => diff.merge(&changed),
                AnimatorEvent::Reset => diff.mark_all(),
                _ => {}
            }
        }
        if diff.is_empty() {
            return;
        }
        let state = self.animator.state();
        for driver in &mut self.drivers {
            driver.update(state, &diff);
        }
    }
}
