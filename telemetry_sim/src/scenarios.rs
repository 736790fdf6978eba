//! Simulation scenarios for the animators.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: Forward playback over a chunked recording
    Playback,
    
    /// SIM-002: Random seeks with keyframes enabled
    Scrub,
    
    /// SIM-003: Backward sweep, every step a rewind without keyframes
    ReverseChunks,
    
    /// SIM-004: Streaming head plus history behind one animator
    LiveStream,
    
    /// SIM-005: Camera images preloaded around the playhead
    LookAhead,
    
    /// SIM-006: Rover and arm feeds composed under one playhead
    Joined,
    
    // ═══════════════════════════════════════════════════
    // STRESS SCENARIOS
    // ═══════════════════════════════════════════════════
    
    /// SIM-007: Tiny chunks, slow source, hundreds of seeks
    ScrubStorm,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Playback,
            ScenarioId::Scrub,
            ScenarioId::ReverseChunks,
            ScenarioId::LiveStream,
            ScenarioId::LookAhead,
            ScenarioId::Joined,
            ScenarioId::ScrubStorm,
        ]
    }
    
    /// Returns standard scenarios (not stress).
    pub fn standard() -> Vec<ScenarioId> {
        Self::all().into_iter().filter(|s| !s.is_stress()).collect()
    }
    
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Playback => "playback",
            ScenarioId::Scrub => "scrub",
            ScenarioId::ReverseChunks => "reverse_chunks",
            ScenarioId::LiveStream => "live_stream",
            ScenarioId::LookAhead => "look_ahead",
            ScenarioId::Joined => "joined",
            ScenarioId::ScrubStorm => "scrub_storm",
        }
    }
    
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Playback => "Tick a buffered animator at 30Hz; every tick must match a full replay",
            ScenarioId::Scrub => "Seeded random seeks over a keyframed recording with out-of-order chunk arrival",
            ScenarioId::ReverseChunks => "Sweep backwards one step at a time, reseeding from the start each time",
            ScenarioId::LiveStream => "Feed the stream in batches, seek into history and back to the head",
            ScenarioId::LookAhead => "Play with image preloading; resident images must track the window",
            ScenarioId::Joined => "Two feeds under one playhead; each child must match its own replay",
            ScenarioId::ScrubStorm => "Stress: 0.25s chunks, 64-poll latency, 500 seeks",
        }
    }
    
    pub fn is_stress(&self) -> bool {
        matches!(self, ScenarioId::ScrubStorm)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;
    
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "playback" | "sim-001" => Ok(ScenarioId::Playback),
            "scrub" | "sim-002" => Ok(ScenarioId::Scrub),
            "reverse_chunks" | "reverse" | "sim-003" => Ok(ScenarioId::ReverseChunks),
            "live_stream" | "live" | "sim-004" => Ok(ScenarioId::LiveStream),
            "look_ahead" | "lookahead" | "sim-005" => Ok(ScenarioId::LookAhead),
            "joined" | "sim-006" => Ok(ScenarioId::Joined),
            "scrub_storm" | "scrubstorm" | "sim-007" => Ok(ScenarioId::ScrubStorm),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("SIM-004".parse::<ScenarioId>(), Ok(ScenarioId::LiveStream));
        assert!("warp_drive".parse::<ScenarioId>().is_err());
    }
    
    #[test]
    fn test_standard_excludes_stress() {
        assert!(!ScenarioId::standard().contains(&ScenarioId::ScrubStorm));
        assert_eq!(ScenarioId::standard().len(), ScenarioId::all().len() - 1);
    }
}
