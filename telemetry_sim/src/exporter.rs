//! JSON exporter for simulation runs.
//!
//! Exports sampled animator states so a run can be inspected or diffed
//! against another seed offline.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// One sampled playhead position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Playhead time in seconds
    pub time_sec: f64,
    
    /// Visible state at that time
    pub state: serde_json::Value,
    
    /// Whether the animator reported stale data
    pub stale: bool,
    
    /// Events observed since the previous sample
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
    
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("error".into()),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,
    
    /// Seed used
    pub seed: u64,
    
    /// Last sampled playhead time in seconds
    pub duration_sec: f64,
    
    /// All frames
    pub frames: Vec<SimFrame>,
    
    /// Final results
    pub passed: bool,
    
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }
    
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = self.duration_sec.max(frame.time_sec);
        self.frames.push(frame);
    }
    
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }
    
    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
