//! Drive records: configuration specs and runtime scheduling state.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::clock::MonoMs;
use crate::policy::DenyReason;

use super::outcome::RecordedOutcome;

/// How many outcomes the per-drive ring buffer retains.
const OUTCOME_HISTORY: usize = 3;

/// Detected or configured volume type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveKind {
    Ssd,
    Hdd,
    Removable,
    Unknown,
}

impl DriveKind {
    pub fn is_hdd(self) -> bool {
        matches!(self, Self::Hdd)
    }
}

impl Default for DriveKind {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Lifecycle state of a managed volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveState {
    Active,
    Paused,
    Quarantined,
    Disabled,
    Offline,
}

/// Per-drive configuration as provided by collaborators (config table,
/// settings UI, enumeration layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveSpec {
    #[serde(rename = "interval-sec")]
    pub interval_sec: u32,

    #[serde(rename = "type", default)]
    pub kind: DriveKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Probe directory override. `None` means `<letter>:\.drive_revenant\`.
    #[serde(rename = "ping-dir", default)]
    pub ping_dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

/// Normalize a drive identifier to a single uppercase letter.
///
/// Accepts forms like `"e"`, `"E:"`, `"e:\"`; anything else is rejected.
pub fn normalize_letter(raw: &str) -> Option<String> {
    let trimmed = raw
        .trim()
        .trim_end_matches(['\\', '/'])
        .trim_end_matches(':');
    let mut chars = trimmed.chars();
    let c = chars.next()?;
    if chars.next().is_some() || !c.is_ascii_alphabetic() {
        return None;
    }
    Some(c.to_ascii_uppercase().to_string())
}

/// Default probe directory for a normalized letter.
pub fn default_ping_dir(letter: &str) -> PathBuf {
    PathBuf::from(format!("{letter}:\\.drive_revenant"))
}

/// Runtime record for one managed volume. Owned and mutated only by the
/// scheduler task.
#[derive(Debug, Clone)]
pub struct Drive {
    pub letter: String,
    pub kind: DriveKind,
    /// User-configured cadence in seconds (before clamping).
    pub interval_sec: u32,
    pub enabled: bool,
    pub user_paused: bool,
    pub ping_dir: PathBuf,
    pub state: DriveState,

    /// Per-enable stable phase, in 500 ms grid cells.
    pub phase_offset_grid: u64,
    /// Cadence origin: the grid floor of the enable instant.
    pub epoch_ms: MonoMs,
    /// Index of the next unfired firing in the canonical sequence.
    pub firing_index: u64,
    pub next_due: MonoMs,

    pub consecutive_failures: u32,
    pub quarantine_until: Option<MonoMs>,
    /// Newest-first ring of the last few outcomes.
    pub last_outcomes: VecDeque<RecordedOutcome>,
    /// Set when a read found the probe file missing; forces the next firing
    /// to be a write.
    pub needs_write: bool,
    pub last_fire_ms: Option<MonoMs>,
    pub policy_reason: DenyReason,
}

impl Drive {
    pub fn new(letter: String, spec: &DriveSpec) -> Self {
        let ping_dir = spec
            .ping_dir
            .clone()
            .unwrap_or_else(|| default_ping_dir(&letter));
        Self {
            letter,
            kind: spec.kind,
            interval_sec: spec.interval_sec,
            enabled: spec.enabled,
            user_paused: false,
            ping_dir,
            state: if spec.enabled {
                DriveState::Active
            } else {
                DriveState::Disabled
            },
            phase_offset_grid: 0,
            epoch_ms: 0,
            firing_index: 0,
            next_due: 0,
            consecutive_failures: 0,
            quarantine_until: None,
            last_outcomes: VecDeque::with_capacity(OUTCOME_HISTORY),
            needs_write: false,
            last_fire_ms: None,
            policy_reason: DenyReason::None,
        }
    }

    pub fn record_outcome(&mut self, rec: RecordedOutcome) {
        self.last_outcomes.push_front(rec);
        self.last_outcomes.truncate(OUTCOME_HISTORY);
    }

    /// Whether the planner schedules firings for this drive at all.
    pub fn is_plannable(&self) -> bool {
        self.enabled && matches!(self.state, DriveState::Active | DriveState::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::outcome::{OpKind, OutcomeCode};

    #[test]
    fn test_normalize_letter() {
        assert_eq!(normalize_letter("e"), Some("E".to_string()));
        assert_eq!(normalize_letter("E:"), Some("E".to_string()));
        assert_eq!(normalize_letter("f:\\"), Some("F".to_string()));
        assert_eq!(normalize_letter(" g: "), Some("G".to_string()));
        assert_eq!(normalize_letter("EF"), None);
        assert_eq!(normalize_letter("1:"), None);
        assert_eq!(normalize_letter(""), None);
    }

    #[test]
    fn test_default_ping_dir() {
        assert_eq!(
            default_ping_dir("E"),
            PathBuf::from("E:\\.drive_revenant")
        );
    }

    #[test]
    fn test_outcome_ring_keeps_last_three() {
        let spec = DriveSpec {
            interval_sec: 20,
            kind: DriveKind::Ssd,
            enabled: true,
            ping_dir: None,
        };
        let mut drive = Drive::new("E".to_string(), &spec);

        for i in 0..5 {
            drive.record_outcome(RecordedOutcome {
                op: OpKind::Write,
                code: OutcomeCode::Ok,
                latency_ms: i,
                at_ms: i * 1000,
            });
        }

        assert_eq!(drive.last_outcomes.len(), 3);
        // Newest first
        assert_eq!(drive.last_outcomes[0].latency_ms, 4);
        assert_eq!(drive.last_outcomes[2].latency_ms, 2);
    }

    #[test]
    fn test_disabled_spec_starts_disabled() {
        let spec = DriveSpec {
            interval_sec: 20,
            kind: DriveKind::Hdd,
            enabled: false,
            ping_dir: None,
        };
        let drive = Drive::new("H".to_string(), &spec);
        assert_eq!(drive.state, DriveState::Disabled);
        assert!(!drive.is_plannable());
    }
}
