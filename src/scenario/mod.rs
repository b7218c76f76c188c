//! Scenario documents
//!
//! A scenario is a timeline of phases, each mapping subsystems to an
//! operating mode for a window of seconds:
//!
//! ```json
//! {
//!   "duration_seconds": 4,
//!   "phases": [
//!     {"start": 0, "end": 2, "network": "normal", "auth": "normal"},
//!     {"start": 2, "end": 4, "network": "ddos", "auth": "bruteforce"}
//!   ]
//! }
//! ```
//!
//! Lookup is first-match in declaration order; phases are not required to be
//! sorted, contiguous or non-overlapping. [`Scenario::validate`] reports the
//! shapes that are probably authoring mistakes without rejecting them.

pub mod engine;

pub use engine::{Clock, ManualClock, ScenarioEngine, SystemClock};

use crate::error::{Result, TestbedError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Mode reported for subsystems no active phase mentions
pub const NORMAL_MODE: &str = "normal";

/// One time window of a scenario
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScenarioPhase {
    /// Inclusive second offset
    pub start: u64,
    /// Exclusive second offset
    pub end: u64,
    /// Subsystem name -> mode
    #[serde(flatten)]
    pub modes: BTreeMap<String, String>,
}

impl ScenarioPhase {
    pub fn contains(&self, t: u64) -> bool {
        self.start <= t && t < self.end
    }

    fn overlaps(&self, other: &ScenarioPhase) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A complete scenario timeline
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Scenario {
    pub duration_seconds: u64,
    #[serde(default)]
    pub phases: Vec<ScenarioPhase>,
}

/// Per-subsystem modes resolved for one instant
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct StateMap {
    modes: BTreeMap<String, String>,
}

impl StateMap {
    /// Mode for `subsystem`, `"normal"` when unmapped
    pub fn mode_for(&self, subsystem: &str) -> &str {
        self.modes
            .get(subsystem)
            .map(String::as_str)
            .unwrap_or(NORMAL_MODE)
    }

    pub fn get(&self, subsystem: &str) -> Option<&str> {
        self.modes.get(subsystem).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

impl From<BTreeMap<String, String>> for StateMap {
    fn from(modes: BTreeMap<String, String>) -> Self {
        Self { modes }
    }
}

/// Suspicious scenario shapes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioIssue {
    /// `start >= end`, the phase can never match
    EmptyPhase { index: usize },
    /// Two phases share seconds; the earlier one wins
    Overlap { first: usize, second: usize },
    /// Phase begins at or after the run ends
    AfterDuration { index: usize },
}

impl fmt::Display for ScenarioIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioIssue::EmptyPhase { index } => {
                write!(f, "phase {} is empty (start >= end)", index)
            }
            ScenarioIssue::Overlap { first, second } => write!(
                f,
                "phases {} and {} overlap; phase {} takes precedence",
                first, second, first
            ),
            ScenarioIssue::AfterDuration { index } => {
                write!(f, "phase {} starts after the scenario ends", index)
            }
        }
    }
}

impl Scenario {
    /// Load a scenario document from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TestbedError::ScenarioNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|source| TestbedError::InvalidScenario {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every subsystem named by any phase
    pub fn known_subsystems(&self) -> BTreeSet<&str> {
        self.phases
            .iter()
            .flat_map(|p| p.modes.keys().map(String::as_str))
            .collect()
    }

    /// Modes at `t` seconds into the run
    pub fn state_at(&self, t: u64) -> StateMap {
        match self.phases.iter().find(|p| p.contains(t)) {
            Some(phase) => StateMap::from(phase.modes.clone()),
            None => StateMap::from(
                self.known_subsystems()
                    .into_iter()
                    .map(|s| (s.to_string(), NORMAL_MODE.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
        }
    }

    pub fn is_done(&self, t: u64) -> bool {
        t >= self.duration_seconds
    }

    pub fn validate(&self) -> Vec<ScenarioIssue> {
        let mut issues = Vec::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.start >= phase.end {
                issues.push(ScenarioIssue::EmptyPhase { index: i });
                continue;
            }
            if phase.start >= self.duration_seconds {
                issues.push(ScenarioIssue::AfterDuration { index: i });
            }
            for (j, later) in self.phases.iter().enumerate().skip(i + 1) {
                if later.start < later.end && phase.overlaps(later) {
                    issues.push(ScenarioIssue::Overlap {
                        first: i,
                        second: j,
                    });
                }
            }
        }
        issues
    }
}

impl std::str::FromStr for Scenario {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{"duration_seconds": 4, "phases": [
        {"start":0,"end":2,"network":"normal"},
        {"start":2,"end":4,"network":"ddos"}
    ]}"#;

    #[test]
    fn test_example_timeline() {
        let scenario: Scenario = EXAMPLE.parse().unwrap();
        assert_eq!(scenario.state_at(1).mode_for("network"), "normal");
        assert_eq!(scenario.state_at(3).mode_for("network"), "ddos");
        assert!(!scenario.is_done(3));
        assert!(scenario.is_done(4));
        assert!(scenario.is_done(100));
    }

    #[test]
    fn test_boundaries_are_half_open() {
        let scenario: Scenario = EXAMPLE.parse().unwrap();
        assert_eq!(scenario.state_at(0).get("network"), Some("normal"));
        assert_eq!(scenario.state_at(2).get("network"), Some("ddos"));
    }

    #[test]
    fn test_gap_falls_back_to_normal_for_known_subsystems() {
        let scenario: Scenario = r#"{"duration_seconds": 30, "phases": [
            {"start":5,"end":10,"network":"portscan","auth":"bruteforce"},
            {"start":20,"end":25,"device":"fork_bomb"}
        ]}"#
        .parse()
        .unwrap();

        let state = scenario.state_at(12);
        assert_eq!(state.len(), 3);
        assert!(state.iter().all(|(_, mode)| mode == NORMAL_MODE));

        // Subsystems absent from the active phase resolve to normal
        let state = scenario.state_at(21);
        assert_eq!(state.mode_for("device"), "fork_bomb");
        assert_eq!(state.mode_for("network"), NORMAL_MODE);
        assert_eq!(state.get("network"), None);
    }

    #[test]
    fn test_first_declared_phase_wins() {
        let scenario: Scenario = r#"{"duration_seconds": 10, "phases": [
            {"start":0,"end":10,"network":"botnet"},
            {"start":3,"end":6,"network":"ddos"}
        ]}"#
        .parse()
        .unwrap();

        assert_eq!(scenario.state_at(4).mode_for("network"), "botnet");
        assert_eq!(
            scenario.validate(),
            vec![ScenarioIssue::Overlap { first: 0, second: 1 }]
        );
    }

    #[test]
    fn test_validate_flags_empty_and_unreachable_phases() {
        let scenario = Scenario {
            duration_seconds: 10,
            phases: vec![
                ScenarioPhase { start: 4, end: 4, modes: BTreeMap::new() },
                ScenarioPhase { start: 12, end: 15, modes: BTreeMap::new() },
            ],
        };
        assert_eq!(
            scenario.validate(),
            vec![
                ScenarioIssue::EmptyPhase { index: 0 },
                ScenarioIssue::AfterDuration { index: 1 },
            ]
        );
    }

    #[test]
    fn test_no_phases_means_normal_until_done() {
        let scenario: Scenario = r#"{"duration_seconds": 2}"#.parse().unwrap();
        assert!(scenario.state_at(0).is_empty());
        assert_eq!(scenario.state_at(0).mode_for("auth"), NORMAL_MODE);
        assert!(scenario.is_done(2));
    }

    #[test]
    fn test_load_reports_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            Scenario::load(&missing),
            Err(TestbedError::ScenarioNotFound(_))
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, r#"{"phases": []}"#).unwrap();
        assert!(matches!(
            Scenario::load(&broken),
            Err(TestbedError::InvalidScenario { .. })
        ));

        let good = dir.path().join("good.json");
        std::fs::write(&good, EXAMPLE).unwrap();
        let scenario = Scenario::load(&good).unwrap();
        assert_eq!(scenario.duration_seconds, 4);
        assert_eq!(scenario.phases.len(), 2);
    }

    #[test]
    fn test_shipped_default_scenario_is_clean() {
        let scenario: Scenario = include_str!("../../scenarios/default_scenario.json")
            .parse()
            .unwrap();
        assert!(scenario.validate().is_empty());
        assert_eq!(scenario.state_at(25).mode_for("network"), "ddos");
        assert_eq!(scenario.state_at(25).mode_for("auth"), "normal");
    }
}
