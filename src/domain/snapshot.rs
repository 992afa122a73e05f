//! Immutable status snapshots published to observers.
//!
//! Observers consume snapshots by value and diff them; they never read
//! mutable scheduler state directly.

use serde::Serialize;

use crate::clock::MonoMs;
use crate::policy::DenyReason;

use super::drive::{DriveKind, DriveState};
use super::outcome::RecordedOutcome;

/// Global scheduler state at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalView {
    pub paused: bool,
    pub pause_reason: Option<DenyReason>,
    pub now_ms: MonoMs,
}

/// Per-drive view inside a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DriveView {
    pub letter: String,
    pub kind: DriveKind,
    pub state: DriveState,
    pub interval_sec: u32,
    /// Interval actually in use after min/HDD clamping, in seconds.
    pub effective_interval_sec: f64,
    pub next_due_ms: Option<MonoMs>,
    pub seconds_until_next: Option<f64>,
    pub last_outcomes: Vec<RecordedOutcome>,
    pub quarantine_remaining_ms: Option<u64>,
    pub policy_reason: DenyReason,
}

/// Immutable per-tick view of the whole scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at_ms: MonoMs,
    pub global: GlobalView,
    pub drives: Vec<DriveView>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            taken_at_ms: 0,
            global: GlobalView {
                paused: false,
                pause_reason: None,
                now_ms: 0,
            },
            drives: Vec::new(),
        }
    }

    pub fn drive(&self, letter: &str) -> Option<&DriveView> {
        self.drives.iter().find(|d| d.letter == letter)
    }

    /// Whether two snapshots differ in anything an observer cares about:
    /// drive state, next_due, newest outcome, policy reason, or the global
    /// pause. Countdown fields and timestamps are ignored.
    pub fn observably_equal(&self, other: &Snapshot) -> bool {
        if self.global.paused != other.global.paused
            || self.global.pause_reason != other.global.pause_reason
            || self.drives.len() != other.drives.len()
        {
            return false;
        }
        self.drives.iter().zip(other.drives.iter()).all(|(a, b)| {
            a.letter == b.letter
                && a.state == b.state
                && a.next_due_ms == b.next_due_ms
                && a.policy_reason == b.policy_reason
                && a.interval_sec == b.interval_sec
                && a.last_outcomes.first() == b.last_outcomes.first()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(letter: &str, next_due: MonoMs) -> DriveView {
        DriveView {
            letter: letter.to_string(),
            kind: DriveKind::Ssd,
            state: DriveState::Active,
            interval_sec: 20,
            effective_interval_sec: 20.0,
            next_due_ms: Some(next_due),
            seconds_until_next: Some(5.0),
            last_outcomes: Vec::new(),
            quarantine_remaining_ms: None,
            policy_reason: DenyReason::None,
        }
    }

    fn snapshot(drives: Vec<DriveView>, taken_at: MonoMs) -> Snapshot {
        Snapshot {
            taken_at_ms: taken_at,
            global: GlobalView {
                paused: false,
                pause_reason: None,
                now_ms: taken_at,
            },
            drives,
        }
    }

    #[test]
    fn test_timestamp_changes_are_not_observable() {
        let a = snapshot(vec![view("E", 10_000)], 1_000);
        let b = snapshot(vec![view("E", 10_000)], 2_000);
        assert!(a.observably_equal(&b));
    }

    #[test]
    fn test_next_due_change_is_observable() {
        let a = snapshot(vec![view("E", 10_000)], 1_000);
        let b = snapshot(vec![view("E", 30_000)], 1_000);
        assert!(!a.observably_equal(&b));
    }

    #[test]
    fn test_state_change_is_observable() {
        let a = snapshot(vec![view("E", 10_000)], 1_000);
        let mut changed = view("E", 10_000);
        changed.state = DriveState::Paused;
        let b = snapshot(vec![changed], 1_000);
        assert!(!a.observably_equal(&b));
    }

    #[test]
    fn test_drive_lookup() {
        let snap = snapshot(vec![view("E", 10_000), view("F", 12_000)], 0);
        assert!(snap.drive("F").is_some());
        assert!(snap.drive("Z").is_none());
    }
}
