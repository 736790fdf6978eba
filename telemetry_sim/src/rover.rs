//! Ground truth rover for simulation.
//!
//! The rover is the telemetry producer of every scenario. It drives a
//! noisy 2D kinematic model and emits frames the way a real feed does:
//! - Odometry on every tick
//! - Arm joints and battery at lower rates, sometimes sharing a timestamp
//! - A camera image reference every second (what look-ahead preloads)
//! - Sparse mode changes, so some fields stay constant for long stretches

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use telemetry_core::{state, Frame, State, Value};

/// Operating modes the rover cycles through.
pub const MODES: [&str; 4] = ["idle", "drive", "sample", "charge"];

/// Number of arm joints reported in the `arm` array.
pub const ARM_JOINTS: usize = 4;

/// Deterministic telemetry generator.
pub struct RoverModel {
    /// RNG for physics and emission jitter
    physics_rng: ChaCha8Rng,
    
    /// Ticks emitted so far
    tick: u64,
    
    /// Emission rate (frames per second of telemetry time)
    rate_hz: f64,
    
    x: f64,
    y: f64,
    heading: f64,
    speed: f64,
    turn_rate: f64,
    joints: [f64; ARM_JOINTS],
    battery: f64,
    mode: usize,
    
    /// Odometry noise standard deviation (meters)
    position_noise_std: f64,
}

impl RoverModel {
    pub fn new(physics_seed: u64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            tick: 0,
            rate_hz: 10.0,
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            speed: 0.5,
            turn_rate: 0.0,
            joints: [0.0; ARM_JOINTS],
            battery: 100.0,
            mode: 0,
            position_noise_std: 0.05,
        }
    }
    
    pub fn with_rate(mut self, rate_hz: f64) -> Self {
        self.rate_hz = rate_hz.max(1.0);
        self
    }
    
    pub fn with_position_noise(mut self, std_dev: f64) -> Self {
        self.position_noise_std = std_dev;
        self
    }
    
    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }
    
    /// Telemetry time of the next tick.
    pub fn time(&self) -> f64 {
        self.tick as f64 / self.rate_hz
    }
    
    /// Advances one tick and returns the frames emitted at that time.
    pub fn step(&mut self) -> Vec<Frame> {
        let time = self.time();
        let dt = 1.0 / self.rate_hz;
        self.integrate(dt);
        
        let mut frames = Vec::with_capacity(2);
        let mut main = state! {
            "odom" => self.odometry(),
            "speed" => self.speed,
        };
        if self.tick == 0 || self.physics_rng.gen_bool(0.02) {
            if self.tick > 0 {
                self.mode = (self.mode + self.physics_rng.gen_range(1..MODES.len())) % MODES.len();
            }
            main.insert("mode".into(), Value::from(MODES[self.mode]));
        }
        if self.tick % 3 == 0 {
            main.insert("arm".into(), self.arm());
        }
        if self.tick % self.rate_hz.round() as u64 == 0 {
            main.insert(
                "camera".into(),
                Value::from(state! {
                    "image" => image_name(self.tick),
                    "ready" => false,
                }),
            );
        }
        frames.push(Frame::new(time, main));
        
        // Battery reports arrive as separate messages stamped with the same time
        if self.tick % 5 == 0 {
            self.battery = (self.battery - self.physics_rng.gen_range(0.0..0.2)).max(0.0);
            frames.push(Frame::new(time, state! { "battery" => self.battery }));
        }
        
        self.tick += 1;
        frames
    }
    
    /// Frames for `[0, duration]` of telemetry time, sorted.
    pub fn generate(&mut self, duration: f64) -> Vec<Frame> {
        let mut frames = Vec::new();
        while self.time() <= duration {
            frames.extend(self.step());
        }
        frames
    }
    
    fn integrate(&mut self, dt: f64) {
        self.turn_rate = (self.turn_rate + self.physics_rng.gen_range(-0.1..0.1)).clamp(-0.5, 0.5);
        self.speed = (self.speed + self.physics_rng.gen_range(-0.05..0.05)).clamp(0.0, 1.5);
        self.heading += self.turn_rate * dt;
        self.x += self.speed * self.heading.cos() * dt;
        self.y += self.speed * self.heading.sin() * dt;
        for joint in &mut self.joints {
            *joint = (*joint + self.physics_rng.gen_range(-0.05..0.05)).clamp(-1.0, 1.0);
        }
    }
    
    fn noise(&mut self) -> f64 {
        match Normal::new(0.0, self.position_noise_std) {
            Ok(normal) => normal.sample(&mut self.physics_rng),
            Err(_) => 0.0,
        }
    }
    
    fn odometry(&mut self) -> State {
        let (x, y) = (self.x + self.noise(), self.y + self.noise());
        state! {
            "x" => x,
            "y" => y,
            "heading" => self.heading,
        }
    }
    
    fn arm(&self) -> Value {
        Value::Array(self.joints.iter().map(|&j| Value::Number(j)).collect())
    }
}

/// Image reference emitted by the camera on `tick`.
pub fn image_name(tick: u64) -> String {
    format!("img_{tick:06}")
}
