//! Policy arbitration: decides whether a scheduled firing may run.
//!
//! User pause is evaluated first unconditionally; quarantine and offline
//! are inherent states that block regardless of policy; everything else
//! follows the configured precedence order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::MonoMs;
use crate::config::{PolicyConfig, PolicyRule};
use crate::domain::{Drive, DriveState};

/// External conditions polled at the top of each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyInputs {
    pub global_paused: bool,
    pub on_battery: bool,
    pub idle_seconds: u64,
}

/// Source of policy inputs (power state, idle detection, global pause).
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn read(&self) -> PolicyInputs;
}

/// Policy source backed by plain flags. The binary wires this up; tests
/// and embedders flip the setters.
#[derive(Default)]
pub struct StaticPolicy {
    global_paused: AtomicBool,
    on_battery: AtomicBool,
    idle_seconds: AtomicU64,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global_paused(&self, paused: bool) {
        self.global_paused.store(paused, Ordering::Relaxed);
    }

    pub fn set_on_battery(&self, on_battery: bool) {
        self.on_battery.store(on_battery, Ordering::Relaxed);
    }

    pub fn set_idle_seconds(&self, idle: u64) {
        self.idle_seconds.store(idle, Ordering::Relaxed);
    }
}

#[async_trait]
impl PolicySource for StaticPolicy {
    async fn read(&self) -> PolicyInputs {
        PolicyInputs {
            global_paused: self.global_paused.load(Ordering::Relaxed),
            on_battery: self.on_battery.load(Ordering::Relaxed),
            idle_seconds: self.idle_seconds.load(Ordering::Relaxed),
        }
    }
}

/// Why a firing was denied (or `None` when allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    None,
    User,
    Global,
    Battery,
    Idle,
    PerDriveDisable,
    Quarantine,
    Offline,
}

/// Arbitration result for one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: DenyReason,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: DenyReason::None,
        }
    }

    fn deny(reason: DenyReason) -> Self {
        Self {
            allow: false,
            reason,
        }
    }
}

/// Precedence-ordered policy evaluation plus quarantine bookkeeping.
pub struct PolicyArbiter {
    precedence: Vec<PolicyRule>,
    pause_on_battery: bool,
    idle_pause_min: u32,
    quarantine_after: u32,
    quarantine_ms: u64,
}

impl PolicyArbiter {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            precedence: config.precedence.clone(),
            pause_on_battery: config.pause_on_battery,
            idle_pause_min: config.idle_pause_min,
            quarantine_after: config.error_quarantine_after,
            quarantine_ms: config.quarantine_ms(),
        }
    }

    /// Decide whether a firing for `drive` may run under `inputs`.
    pub fn evaluate(&self, drive: &Drive, inputs: &PolicyInputs) -> Decision {
        // User intent always wins: a user-paused drive stays paused through
        // a global resume.
        if drive.user_paused {
            return Decision::deny(DenyReason::User);
        }

        match drive.state {
            DriveState::Quarantined => return Decision::deny(DenyReason::Quarantine),
            DriveState::Offline => return Decision::deny(DenyReason::Offline),
            _ => {}
        }

        for rule in &self.precedence {
            match rule {
                PolicyRule::GlobalPause if inputs.global_paused => {
                    return Decision::deny(DenyReason::Global);
                }
                PolicyRule::Battery if self.pause_on_battery && inputs.on_battery => {
                    return Decision::deny(DenyReason::Battery);
                }
                PolicyRule::Idle if self.idle_matches(inputs.idle_seconds) => {
                    return Decision::deny(DenyReason::Idle);
                }
                PolicyRule::PerDriveDisable if !drive.enabled => {
                    return Decision::deny(DenyReason::PerDriveDisable);
                }
                _ => {}
            }
        }

        Decision::allow()
    }

    fn idle_matches(&self, idle_seconds: u64) -> bool {
        self.idle_pause_min > 0 && idle_seconds >= u64::from(self.idle_pause_min) * 60
    }

    /// Record a failed probe. Returns the quarantine release instant when
    /// the failure threshold is crossed.
    pub fn note_failure(&self, drive: &mut Drive, now: MonoMs) -> Option<MonoMs> {
        drive.consecutive_failures += 1;
        if drive.consecutive_failures >= self.quarantine_after {
            let until = now + self.quarantine_ms;
            drive.state = DriveState::Quarantined;
            drive.quarantine_until = Some(until);
            drive.next_due = until;
            return Some(until);
        }
        None
    }

    /// Record a successful probe; resets the failure counter.
    pub fn note_success(&self, drive: &mut Drive) {
        drive.consecutive_failures = 0;
    }
}
