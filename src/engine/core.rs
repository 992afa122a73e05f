//! The scheduler loop: plan → arbitrate → execute → record → snapshot.
//!
//! A single task owns all drive state. External mutations arrive as
//! commands drained at the top of each tick; observers consume published
//! snapshots by value. Probe failures are classified and absorbed here —
//! no error escapes a tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::clock::{grid_ceil, grid_floor, next_grid, Clock, MonoMs, GRID_MS};
use crate::config::Config;
use crate::domain::{
    default_ping_dir, normalize_letter, Drive, DriveKind, DriveSpec, DriveState, DriveView,
    GlobalView, OpKind, Outcome, OutcomeCode, RecordedOutcome, Snapshot, NOTE_CREATED,
};
use crate::events::{Event, EventSink};
use crate::planner::{CellFiring, JitterPlanner, PlannedOp, MIN_ANY_SPACING_MS, MIN_WRITE_SPACING_MS};
use crate::policy::{DenyReason, PolicyArbiter, PolicyInputs, PolicySource};
use crate::probe::{Prober, ProbeTarget};

use super::handle::EngineHandle;
use super::messages::EngineCommand;

const COMMAND_BUFFER: usize = 64;
const SNAPSHOT_BUFFER: usize = 16;

/// The scheduler engine. Construct with [`Engine::new`], then drive it with
/// [`Engine::run`] on a task; interact through the returned handle.
pub struct Engine {
    config: Config,
    clock: Arc<dyn Clock>,
    prober: Arc<dyn Prober>,
    policy_source: Arc<dyn PolicySource>,
    events: Arc<dyn EventSink>,
    arbiter: PolicyArbiter,
    planner: JitterPlanner,

    drives: BTreeMap<String, Drive>,
    rx: mpsc::Receiver<EngineCommand>,
    snapshot_tx: broadcast::Sender<Arc<Snapshot>>,
    published: Arc<Snapshot>,

    last_inputs: PolicyInputs,
    last_wake: Option<MonoMs>,
    last_launch: Option<MonoMs>,
    last_write_launch: Option<MonoMs>,
    manual_requests: Vec<String>,
    /// Commands observed mid-tick while checking for shutdown; applied at
    /// the next drain.
    pending: Vec<EngineCommand>,
    shutting_down: bool,
}

impl Engine {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        prober: Arc<dyn Prober>,
        policy_source: Arc<dyn PolicySource>,
        events: Arc<dyn EventSink>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_BUFFER);
        let handle = EngineHandle::new(tx, snapshot_tx.clone());

        let arbiter = PolicyArbiter::new(&config.policy);
        let planner = JitterPlanner::new(&config.install_id, &config.scheduling);

        let engine = Self {
            config,
            clock,
            prober,
            policy_source,
            events,
            arbiter,
            planner,
            drives: BTreeMap::new(),
            rx,
            snapshot_tx,
            published: Arc::new(Snapshot::empty()),
            last_inputs: PolicyInputs::default(),
            last_wake: None,
            last_launch: None,
            last_write_launch: None,
            manual_requests: Vec::new(),
            pending: Vec::new(),
            shutting_down: false,
        };

        (engine, handle)
    }

    /// Run the scheduler until shutdown. Consumes the engine.
    pub async fn run(mut self) {
        info!("Scheduler loop started");
        while !self.shutting_down {
            self.tick().await;
            if self.shutting_down {
                break;
            }
            let next = next_grid(self.clock.now_ms());
            self.clock.sleep_until(next).await;
        }
        info!("Scheduler loop stopped");
    }

    /// One full tick cycle.
    async fn tick(&mut self) {
        self.drain_commands();
        if self.shutting_down {
            return;
        }

        let now = self.clock.now_ms();
        self.smooth_resume_if_jumped(now);
        self.last_wake = Some(now);

        self.release_quarantines(now);

        self.last_inputs = self.policy_source.read().await;
        let inputs = self.last_inputs;

        let cell_start = grid_floor(now);
        let due = self.collect_due(cell_start);

        let mut allowed = Vec::new();
        for firing in due {
            if firing.manual {
                allowed.push(firing);
                continue;
            }
            let Some(drive) = self.drives.get(&firing.letter) else {
                continue;
            };
            let decision = self.arbiter.evaluate(drive, &inputs);
            if decision.allow {
                self.note_policy_reason(&firing.letter, DenyReason::None, now);
                allowed.push(firing);
            } else {
                debug!(drive = %firing.letter, reason = ?decision.reason, "firing denied");
                self.note_policy_reason(&firing.letter, decision.reason, now);
                // Advance as if fired so nothing backlogs across a resume.
                self.advance_cadence(&firing.letter, firing.firing_index, now);
            }
        }

        let planned =
            self.planner
                .pack_cell(cell_start, allowed, self.last_launch, self.last_write_launch);
        self.execute_batch(planned).await;

        let now = self.clock.now_ms();
        self.publish_if_changed(now);
    }

    // === command handling ===

    fn drain_commands(&mut self) {
        let pending: Vec<EngineCommand> = self.pending.drain(..).collect();
        for command in pending {
            self.apply_command(command);
        }
        while let Ok(command) = self.rx.try_recv() {
            self.apply_command(command);
        }
    }

    /// Mid-batch cancellation check: shutdown takes effect immediately,
    /// everything else waits for the next drain.
    fn observe_shutdown(&mut self) -> bool {
        while let Ok(command) = self.rx.try_recv() {
            if matches!(command, EngineCommand::Shutdown) {
                self.shutting_down = true;
            } else {
                self.pending.push(command);
            }
        }
        self.shutting_down
    }

    fn apply_command(&mut self, command: EngineCommand) {
        let now = self.clock.now_ms();
        match command {
            EngineCommand::SetDriveConfig { letter, spec } => {
                self.set_drive_config(&letter, spec, now);
            }
            EngineCommand::RemoveDrive { letter } => {
                if let Some(letter) = normalize_letter(&letter) {
                    if self.drives.remove(&letter).is_some() {
                        info!(drive = %letter, "drive removed");
                    }
                }
            }
            EngineCommand::PauseDrive { letter } => self.pause_drive(&letter),
            EngineCommand::ResumeDrive { letter } => self.resume_drive(&letter, now),
            EngineCommand::ReleaseQuarantine { letter } => self.release_quarantine(&letter, now),
            EngineCommand::PingNow { letter } => {
                if let Some(letter) = normalize_letter(&letter) {
                    debug!(drive = %letter, "manual probe requested");
                    self.manual_requests.push(letter);
                }
            }
            EngineCommand::GetSnapshot { reply } => {
                let snapshot = Arc::new(self.build_snapshot(now));
                let _ = reply.send(snapshot);
            }
            EngineCommand::Shutdown => {
                info!("Shutdown requested");
                self.shutting_down = true;
            }
        }
    }

    fn set_drive_config(&mut self, raw: &str, spec: DriveSpec, now: MonoMs) {
        let Some(letter) = normalize_letter(raw) else {
            warn!(raw, "Ignoring config for invalid drive letter");
            return;
        };
        let date = self.clock.local_date();

        match self.drives.get_mut(&letter) {
            None => {
                let mut drive = Drive::new(letter.clone(), &spec);
                if drive.enabled {
                    Self::enable_drive(&self.planner, &mut drive, now, date);
                }
                info!(drive = %letter, interval = spec.interval_sec, kind = ?spec.kind, "drive added");
                self.drives.insert(letter, drive);
            }
            Some(drive) => {
                let was_enabled = drive.enabled;
                let cadence_changed =
                    drive.interval_sec != spec.interval_sec || drive.kind != spec.kind;

                drive.kind = spec.kind;
                drive.interval_sec = spec.interval_sec;
                drive.enabled = spec.enabled;
                drive.ping_dir = spec
                    .ping_dir
                    .clone()
                    .unwrap_or_else(|| default_ping_dir(&letter));

                if !spec.enabled {
                    drive.state = DriveState::Disabled;
                    drive.quarantine_until = None;
                    drive.consecutive_failures = 0;
                    info!(drive = %letter, "drive disabled");
                } else if !was_enabled || cadence_changed {
                    // A fresh enable period: new phase offset and cadence origin.
                    Self::enable_drive(&self.planner, drive, now, date);
                    if drive.user_paused {
                        drive.state = DriveState::Paused;
                    }
                    info!(drive = %letter, interval = spec.interval_sec, "drive cadence reset");
                }
            }
        }
    }

    /// Start an enable period: derive the phase offset, anchor the cadence
    /// origin at the current grid cell, and plan the first firing.
    fn enable_drive(planner: &JitterPlanner, drive: &mut Drive, now: MonoMs, date: NaiveDate) {
        drive.phase_offset_grid =
            planner.phase_offset_grid(&drive.letter, drive.kind, drive.interval_sec, date);
        drive.epoch_ms = grid_floor(now);
        drive.firing_index = 0;
        drive.consecutive_failures = 0;
        drive.quarantine_until = None;
        drive.needs_write = false;
        drive.last_fire_ms = None;
        drive.state = DriveState::Active;
        let (k, t) = planner.next_due(drive, now, date);
        drive.firing_index = k;
        drive.next_due = t;
    }

    fn pause_drive(&mut self, raw: &str) {
        let Some(letter) = normalize_letter(raw) else {
            return;
        };
        let Some(drive) = self.drives.get_mut(&letter) else {
            warn!(drive = %letter, "cannot pause unknown drive");
            return;
        };
        if drive.state == DriveState::Quarantined {
            warn!(drive = %letter, "cannot pause quarantined drive");
            return;
        }
        drive.user_paused = true;
        if drive.state == DriveState::Active {
            drive.state = DriveState::Paused;
        }
        drive.policy_reason = DenyReason::User;
        info!(drive = %letter, "drive paused by user");
    }

    fn resume_drive(&mut self, raw: &str, now: MonoMs) {
        let date = self.clock.local_date();
        let Some(letter) = normalize_letter(raw) else {
            return;
        };
        let Some(drive) = self.drives.get_mut(&letter) else {
            warn!(drive = %letter, "cannot resume unknown drive");
            return;
        };
        drive.user_paused = false;
        if drive.state == DriveState::Paused {
            drive.state = DriveState::Active;
            drive.policy_reason = DenyReason::None;
            // The cadence kept advancing while paused; only refresh if the
            // stored firing slipped into the past.
            if drive.next_due < grid_ceil(now + MIN_ANY_SPACING_MS) {
                let (k, t) = self.planner.next_due(drive, now, date);
                drive.firing_index = k;
                drive.next_due = t;
            }
            info!(drive = %letter, "drive resumed");
        }
    }

    fn release_quarantine(&mut self, raw: &str, now: MonoMs) {
        let date = self.clock.local_date();
        let Some(letter) = normalize_letter(raw) else {
            return;
        };
        let Some(drive) = self.drives.get_mut(&letter) else {
            return;
        };
        if drive.state != DriveState::Quarantined {
            return;
        }
        drive.state = if drive.user_paused {
            DriveState::Paused
        } else {
            DriveState::Active
        };
        drive.quarantine_until = None;
        drive.consecutive_failures = 0;
        let (k, t) = self.planner.next_due(drive, now, date);
        drive.firing_index = k;
        drive.next_due = t;
        info!(drive = %letter, "quarantine released");
        self.events.emit(&Event::QuarantineExit {
            mono_ms: now,
            drive: letter,
        });
    }

    // === tick phases ===

    /// Detect a large monotonic jump (host sleep, loop starvation) and
    /// reschedule every drive to a short future offset instead of firing
    /// backlog. The only case where the cadence origin is recomputed.
    fn smooth_resume_if_jumped(&mut self, now: MonoMs) {
        let Some(last) = self.last_wake else {
            return;
        };
        let threshold = (2 * self.config.scheduling.interval_min_ms()).max(5000);
        let jump = now.saturating_sub(last);
        if jump <= threshold {
            return;
        }

        warn!(jump_ms = jump, "monotonic clock jumped, smoothing resume");
        for drive in self.drives.values_mut() {
            if !drive.is_plannable() {
                continue;
            }
            let interval = self
                .planner
                .effective_interval_ms(drive.kind, drive.interval_sec);
            let target = grid_ceil(now + 2000.min(interval / 2));
            drive.epoch_ms = target.saturating_sub(drive.phase_offset_grid * GRID_MS);
            drive.firing_index = 0;
            drive.next_due = target;
            drive.last_fire_ms = None;
        }
        self.last_launch = None;
        self.last_write_launch = None;
        self.events.emit(&Event::ResumeSmooth {
            mono_ms: now,
            jump_ms: jump,
        });
    }

    fn release_quarantines(&mut self, now: MonoMs) {
        let date = self.clock.local_date();
        let mut released = Vec::new();
        for drive in self.drives.values_mut() {
            if drive.state != DriveState::Quarantined {
                continue;
            }
            let Some(until) = drive.quarantine_until else {
                // Planner inconsistency: never terminate the loop over it.
                error!(drive = %drive.letter, "quarantined drive has no release instant, disabling");
                drive.state = DriveState::Disabled;
                drive.enabled = false;
                continue;
            };
            if now >= until {
                drive.state = if drive.user_paused {
                    DriveState::Paused
                } else {
                    DriveState::Active
                };
                drive.quarantine_until = None;
                drive.consecutive_failures = 0;
                let (k, t) = self.planner.next_due(drive, now, date);
                drive.firing_index = k;
                drive.next_due = t;
                released.push(drive.letter.clone());
            }
        }
        for letter in released {
            info!(drive = %letter, "quarantine expired");
            self.events.emit(&Event::QuarantineExit {
                mono_ms: now,
                drive: letter,
            });
        }
    }

    /// Firings due in the grid cell starting at `cell_start`, plus any
    /// pending manual probes.
    fn collect_due(&mut self, cell_start: MonoMs) -> Vec<CellFiring> {
        let cell_end = cell_start + GRID_MS;
        let mut due = Vec::new();

        for drive in self.drives.values() {
            if !drive.is_plannable() {
                continue;
            }
            if drive.next_due < cell_end {
                due.push(CellFiring {
                    letter: drive.letter.clone(),
                    op: self.op_for(drive),
                    firing_index: drive.firing_index,
                    manual: false,
                });
            }
        }

        for letter in std::mem::take(&mut self.manual_requests) {
            let Some(drive) = self.drives.get(&letter) else {
                warn!(drive = %letter, "manual probe for unknown drive");
                continue;
            };
            if !drive.enabled
                || matches!(
                    drive.state,
                    DriveState::Quarantined | DriveState::Offline | DriveState::Disabled
                )
            {
                warn!(drive = %letter, state = ?drive.state, "manual probe for unavailable drive");
                continue;
            }
            let op = if drive.needs_write {
                OpKind::Write
            } else {
                OpKind::Read
            };
            due.push(CellFiring {
                letter,
                op,
                firing_index: drive.firing_index,
                manual: true,
            });
        }

        due
    }

    /// Op selection: HDDs always write; SSD-like drives write on firing 0
    /// and every Nth firing (N = ceil(interval / 30 s)), read otherwise. A
    /// missing probe file forces the next firing to be a write.
    fn op_for(&self, drive: &Drive) -> OpKind {
        if drive.needs_write {
            return OpKind::Write;
        }
        let ssd_like = match drive.kind {
            DriveKind::Ssd | DriveKind::Removable => true,
            DriveKind::Unknown => self.config.scheduling.treat_unknown_as_ssd,
            DriveKind::Hdd => false,
        };
        if !ssd_like {
            return OpKind::Write;
        }
        let writes_every = u64::from(drive.interval_sec.div_ceil(30).max(1));
        if drive.firing_index % writes_every == 0 {
            OpKind::Write
        } else {
            OpKind::Read
        }
    }

    /// Execute packed firings sequentially in pack order, enforcing launch
    /// spacing against the previous batch as well.
    async fn execute_batch(&mut self, planned: Vec<PlannedOp>) {
        for op in planned {
            if self.observe_shutdown() {
                warn!("Shutdown observed mid-batch, abandoning remaining firings");
                return;
            }

            let mut launch = op.at;
            if let Some(prev) = self.last_launch {
                launch = launch.max(prev + MIN_ANY_SPACING_MS);
            }
            if op.op == OpKind::Write {
                if let Some(prev) = self.last_write_launch {
                    launch = launch.max(prev + MIN_WRITE_SPACING_MS);
                }
            }
            self.clock.sleep_until(launch).await;

            let Some(target) = self.drives.get(&op.letter).map(|d| ProbeTarget {
                letter: d.letter.clone(),
                ping_dir: d.ping_dir.clone(),
            }) else {
                continue;
            };

            let outcome = match op.op {
                OpKind::Write => self.prober.probe_write(&target).await,
                OpKind::Read => self.prober.probe_read(&target).await,
            };

            self.last_launch = Some(launch);
            if op.op == OpKind::Write {
                self.last_write_launch = Some(launch);
            }

            self.apply_outcome(&op, launch, outcome);
        }
    }

    fn apply_outcome(&mut self, op: &PlannedOp, fired_at: MonoMs, outcome: Outcome) {
        let now = self.clock.now_ms();
        self.events.emit(&Event::Probe {
            mono_ms: fired_at,
            drive: op.letter.clone(),
            op: op.op,
            code: outcome.code,
            latency_ms: outcome.latency_ms,
            tie_epoch: op.tie_epoch,
            tie_rank: op.tie_rank,
            pack_size: op.pack_size,
            notes: outcome.notes.clone(),
        });

        let Some(drive) = self.drives.get_mut(&op.letter) else {
            return;
        };
        drive.record_outcome(RecordedOutcome {
            op: op.op,
            code: outcome.code,
            latency_ms: outcome.latency_ms,
            at_ms: fired_at,
        });
        drive.last_fire_ms = Some(fired_at);

        match outcome.code {
            OutcomeCode::Ok | OutcomeCode::PartialFlush => {
                drive.consecutive_failures = 0;
                match op.op {
                    OpKind::Write => drive.needs_write = false,
                    OpKind::Read => {
                        if outcome.notes == NOTE_CREATED {
                            drive.needs_write = true;
                        }
                    }
                }
            }
            OutcomeCode::SkipLocked => {
                // Transient contention: no failure count, no schedule shift.
                debug!(drive = %op.letter, "probe skipped on lock contention");
            }
            OutcomeCode::Error => {
                if outcome.is_device_gone() {
                    warn!(drive = %op.letter, "device gone, marking offline");
                    drive.state = DriveState::Offline;
                } else if let Some(until) = self.arbiter.note_failure(drive, now) {
                    let failures = drive.consecutive_failures;
                    warn!(drive = %op.letter, failures, until_ms = until, "drive quarantined");
                    self.events.emit(&Event::QuarantineEnter {
                        mono_ms: now,
                        drive: op.letter.clone(),
                        until_ms: until,
                        failures,
                    });
                }
            }
        }

        let Some(drive) = self.drives.get_mut(&op.letter) else {
            return;
        };
        if !op.manual && drive.is_plannable() {
            drive.firing_index = op.firing_index + 1;
            let date = self.clock.local_date();
            let (k, t) = self.planner.next_due(drive, now, date);
            drive.firing_index = k;
            drive.next_due = t;
        }
    }

    /// Advance a drive's cadence as if the firing had executed.
    fn advance_cadence(&mut self, letter: &str, fired_index: u64, now: MonoMs) {
        let date = self.clock.local_date();
        let Some(drive) = self.drives.get_mut(letter) else {
            return;
        };
        drive.firing_index = fired_index + 1;
        let (k, t) = self.planner.next_due(drive, now, date);
        drive.firing_index = k;
        drive.next_due = t;
    }

    fn note_policy_reason(&mut self, letter: &str, reason: DenyReason, now: MonoMs) {
        let Some(drive) = self.drives.get_mut(letter) else {
            return;
        };
        if drive.policy_reason == reason {
            return;
        }
        drive.policy_reason = reason;
        if reason != DenyReason::None {
            self.events.emit(&Event::PolicyChange {
                mono_ms: now,
                drive: letter.to_string(),
                reason,
            });
        }
    }

    // === snapshots ===

    fn build_snapshot(&self, now: MonoMs) -> Snapshot {
        let pause_reason = if self.last_inputs.global_paused {
            Some(DenyReason::Global)
        } else {
            None
        };
        let drives = self
            .drives
            .values()
            .map(|drive| {
                let effective = self
                    .planner
                    .effective_interval_ms(drive.kind, drive.interval_sec);
                let next_due_ms = match drive.state {
                    DriveState::Disabled | DriveState::Offline => None,
                    DriveState::Quarantined => drive.quarantine_until,
                    DriveState::Active | DriveState::Paused => Some(drive.next_due),
                };
                DriveView {
                    letter: drive.letter.clone(),
                    kind: drive.kind,
                    state: drive.state,
                    interval_sec: drive.interval_sec,
                    effective_interval_sec: effective as f64 / 1000.0,
                    next_due_ms,
                    seconds_until_next: next_due_ms.map(|t| t.saturating_sub(now) as f64 / 1000.0),
                    last_outcomes: drive.last_outcomes.iter().cloned().collect(),
                    quarantine_remaining_ms: drive
                        .quarantine_until
                        .map(|until| until.saturating_sub(now)),
                    policy_reason: drive.policy_reason,
                }
            })
            .collect();

        Snapshot {
            taken_at_ms: now,
            global: GlobalView {
                paused: self.last_inputs.global_paused,
                pause_reason,
                now_ms: now,
            },
            drives,
        }
    }

    fn publish_if_changed(&mut self, now: MonoMs) {
        let snapshot = self.build_snapshot(now);
        if snapshot.observably_equal(&self.published) {
            return;
        }
        let snapshot = Arc::new(snapshot);
        self.published = snapshot.clone();
        // No receivers is fine; observers come and go.
        let _ = self.snapshot_tx.send(snapshot);
    }
}
