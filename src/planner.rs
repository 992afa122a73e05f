//! Deterministic firing planner.
//!
//! Maps (drive, firing index) to scheduled instants on the 500 ms grid:
//! canonical cadence anchored at the enable instant (no drift), keyed-hash
//! phase offsets and jitter, the HDD max-gap guard, and collision packing
//! with deterministic tie-breaking.
//!
//! Everything here is pure computation over values; the engine owns state.

use chrono::NaiveDate;
use uuid::Uuid;

use crate::clock::{grid_ceil, grid_floor, MonoMs, GRID_MS};
use crate::config::SchedulingConfig;
use crate::domain::{Drive, DriveKind, OpKind};

/// Minimum spacing between any two probe launches.
pub const MIN_ANY_SPACING_MS: u64 = 500;

/// Minimum spacing between two write launches.
pub const MIN_WRITE_SPACING_MS: u64 = 1000;

/// Domain-separation context for the planner's keyed hash.
const HASH_CONTEXT: &str = "drive-revenant 2025-11 planner seed v1";

/// A firing due inside one grid cell, before packing.
#[derive(Debug, Clone)]
pub struct CellFiring {
    pub letter: String,
    pub op: OpKind,
    pub firing_index: u64,
    /// Extra probe requested via `ping_now`; does not advance the cadence.
    pub manual: bool,
}

/// A packed firing with its launch instant and tie-break telemetry.
/// Carried by value through execution so nothing refers back into the
/// planning loop.
#[derive(Debug, Clone)]
pub struct PlannedOp {
    pub letter: String,
    pub op: OpKind,
    pub at: MonoMs,
    pub firing_index: u64,
    pub manual: bool,
    /// Grid cell number the firing was packed in.
    pub tie_epoch: u64,
    pub tie_rank: u64,
    pub pack_size: u32,
}

pub struct JitterPlanner {
    key: [u8; 32],
    jitter_ms: u64,
    deadline_margin_ms: u64,
    hdd_max_gap_ms: u64,
    interval_min_ms: u64,
}

impl JitterPlanner {
    pub fn new(install_id: &Uuid, config: &SchedulingConfig) -> Self {
        Self {
            key: blake3::derive_key(HASH_CONTEXT, install_id.as_bytes()),
            jitter_ms: config.jitter_ms(),
            deadline_margin_ms: config.deadline_margin_ms(),
            hdd_max_gap_ms: config.hdd_max_gap_ms(),
            interval_min_ms: config.interval_min_ms(),
        }
    }

    fn hash64(&self, msg: &str) -> u64 {
        let digest = blake3::keyed_hash(&self.key, msg.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Interval actually used for scheduling, in ms: floored at the global
    /// minimum, capped at the HDD max gap for HDDs, snapped to the grid.
    pub fn effective_interval_ms(&self, kind: DriveKind, interval_sec: u32) -> u64 {
        let base = u64::from(interval_sec) * 1000;
        let mut effective = base.max(self.interval_min_ms);
        if kind.is_hdd() {
            effective = effective.min(self.hdd_max_gap_ms).max(self.interval_min_ms);
        }
        (effective - effective % GRID_MS).max(GRID_MS)
    }

    /// Per-enable phase offset in grid cells: spreads drives sharing an
    /// interval across the grid, stable per install and local day.
    pub fn phase_offset_grid(
        &self,
        letter: &str,
        kind: DriveKind,
        interval_sec: u32,
        date: NaiveDate,
    ) -> u64 {
        let interval = self.effective_interval_ms(kind, interval_sec);
        let cells = (interval / GRID_MS).max(1);
        self.hash64(&format!("phase|{letter}|{date}")) % cells
    }

    /// Deterministic jitter for firing `k`, in ms, snapped to the grid.
    ///
    /// Non-HDD drives draw from `[-jitter, +jitter]`. HDD drives are
    /// earlier-only, with late slack only when the deadline margin covers a
    /// whole grid cell.
    pub fn jitter_offset_ms(&self, letter: &str, k: u64, date: NaiveDate, kind: DriveKind) -> i64 {
        let jitter_cells = (self.jitter_ms / GRID_MS) as i64;
        if jitter_cells == 0 {
            return 0;
        }
        let h = self.hash64(&format!("jitter|{letter}|{k}|{date}"));

        let cells = if kind.is_hdd() {
            let slack_cells = (self.deadline_margin_ms / GRID_MS) as i64;
            let span = jitter_cells + slack_cells + 1;
            let pick = (h % span as u64) as i64;
            if pick <= jitter_cells {
                -pick
            } else {
                pick - jitter_cells
            }
        } else {
            let span = 2 * jitter_cells + 1;
            (h % span as u64) as i64 - jitter_cells
        };

        cells * GRID_MS as i64
    }

    /// Deterministic within-cell ordering key for a drive.
    pub fn tie_rank(&self, letter: &str, cell: u64) -> u64 {
        self.hash64(&format!("tie|{letter}|{cell}"))
    }

    /// Compute the drive's next firing: the smallest firing index at or
    /// after `drive.firing_index` whose adjusted instant is at least
    /// `now + 0.5 s`, together with that instant.
    ///
    /// The instant derives from the canonical cadence
    /// `origin + k * interval` (origin = enable grid cell + phase offset),
    /// shifted by deterministic jitter, then corrected by the HDD guard.
    pub fn next_due(&self, drive: &Drive, now: MonoMs, date: NaiveDate) -> (u64, MonoMs) {
        let interval = self.effective_interval_ms(drive.kind, drive.interval_sec);
        let origin = drive.epoch_ms + drive.phase_offset_grid * GRID_MS;
        let earliest = grid_ceil(now + MIN_ANY_SPACING_MS);

        let mut k = drive.firing_index;
        // After a long stall, jump near the present instead of stepping one
        // interval at a time.
        if earliest > origin + self.jitter_ms {
            let catch_up = (earliest - origin - self.jitter_ms) / interval;
            if catch_up > k {
                k = catch_up;
            }
        }

        loop {
            let t_nom = origin + k * interval;
            let offset = self.jitter_offset_ms(&drive.letter, k, date, drive.kind);
            let mut t = if offset < 0 {
                t_nom.saturating_sub(offset.unsigned_abs())
            } else {
                t_nom + offset as u64
            };

            if drive.kind.is_hdd() {
                if let Some(last) = drive.last_fire_ms {
                    // An HDD firing may run at most deadline_margin past one
                    // interval since the last probe, and never past the max
                    // gap. Pull earlier by whole grid cells to comply.
                    let limit = last + self.hdd_max_gap_ms.min(interval + self.deadline_margin_ms);
                    if t > limit {
                        t = grid_floor(limit);
                    }
                }
            }

            if t < earliest {
                if t_nom >= earliest {
                    // The nominal instant is still ahead; only jitter or the
                    // HDD guard pulled the candidate below the floor.
                    return (k, earliest);
                }
                k += 1;
                continue;
            }
            return (k, t);
        }
    }

    /// Pack the firings due in one grid cell into launch instants.
    ///
    /// Writes go first, then reads; within each class the order is the
    /// deterministic per-cell hash rank. Launch instants honor the 0.5 s
    /// any-any and 1.0 s write-write spacing against each other and against
    /// the previous batch (`last_any` / `last_write`); later ops extend
    /// into following cells and execute in pack order.
    pub fn pack_cell(
        &self,
        cell_start: MonoMs,
        firings: Vec<CellFiring>,
        last_any: Option<MonoMs>,
        last_write: Option<MonoMs>,
    ) -> Vec<PlannedOp> {
        let cell = cell_start / GRID_MS;
        let pack_size = firings.len() as u32;

        let (mut writes, mut reads): (Vec<_>, Vec<_>) =
            firings.into_iter().partition(|f| f.op == OpKind::Write);
        writes.sort_by_key(|f| self.tie_rank(&f.letter, cell));
        reads.sort_by_key(|f| self.tie_rank(&f.letter, cell));

        let mut placed = Vec::with_capacity(pack_size as usize);
        let mut last_any = last_any;
        let mut last_write = last_write;

        for firing in writes.into_iter().chain(reads) {
            let mut at = cell_start;
            if let Some(prev) = last_any {
                at = at.max(prev + MIN_ANY_SPACING_MS);
            }
            if firing.op == OpKind::Write {
                if let Some(prev) = last_write {
                    at = at.max(prev + MIN_WRITE_SPACING_MS);
                }
            }
            let at = grid_ceil(at);

            if firing.op == OpKind::Write {
                last_write = Some(at);
            }
            last_any = Some(at);

            let tie_rank = self.tie_rank(&firing.letter, cell);
            placed.push(PlannedOp {
                letter: firing.letter,
                op: firing.op,
                at,
                firing_index: firing.firing_index,
                manual: firing.manual,
                tie_epoch: cell,
                tie_rank,
                pack_size,
            });
        }

        placed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DriveSpec;

    fn install_id() -> Uuid {
        Uuid::parse_str("6f2a8f9e-1d4b-4c7a-9a61-0c3de1f5a927").unwrap()
    }

    fn planner() -> JitterPlanner {
        JitterPlanner::new(&install_id(), &SchedulingConfig::default())
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    fn drive(letter: &str, kind: DriveKind, interval_sec: u32, epoch_ms: MonoMs) -> Drive {
        let mut d = Drive::new(
            letter.to_string(),
            &DriveSpec {
                interval_sec,
                kind,
                enabled: true,
                ping_dir: None,
            },
        );
        d.epoch_ms = epoch_ms;
        d
    }

    #[test]
    fn test_effective_interval_clamps() {
        let p = planner();
        // Below minimum
        assert_eq!(p.effective_interval_ms(DriveKind::Ssd, 1), 3000);
        // HDD above the gap cap is pulled down
        assert_eq!(p.effective_interval_ms(DriveKind::Hdd, 300), 45_000);
        // Short HDD intervals pass through: the cap is a maximum, not a minimum
        assert_eq!(p.effective_interval_ms(DriveKind::Hdd, 6), 6000);
        // SSD intervals above the cap are untouched
        assert_eq!(p.effective_interval_ms(DriveKind::Ssd, 300), 300_000);
    }

    #[test]
    fn test_phase_offset_within_interval() {
        let p = planner();
        for letter in ["E", "F", "G", "H"] {
            let offset = p.phase_offset_grid(letter, DriveKind::Ssd, 20, date());
            assert!(offset < 40, "offset {offset} exceeds 20s/0.5s cells");
        }
    }

    #[test]
    fn test_phase_offset_deterministic_across_planners() {
        let a = planner();
        let b = JitterPlanner::new(&install_id(), &SchedulingConfig::default());
        assert_eq!(
            a.phase_offset_grid("E", DriveKind::Ssd, 20, date()),
            b.phase_offset_grid("E", DriveKind::Ssd, 20, date()),
        );
        assert_eq!(a.tie_rank("E", 17), b.tie_rank("E", 17));
        assert_eq!(
            a.jitter_offset_ms("E", 3, date(), DriveKind::Ssd),
            b.jitter_offset_ms("E", 3, date(), DriveKind::Ssd),
        );
    }

    #[test]
    fn test_different_install_ids_diverge() {
        let a = planner();
        let b = JitterPlanner::new(&Uuid::new_v4(), &SchedulingConfig::default());
        let same = (0..64).all(|cell| a.tie_rank("E", cell) == b.tie_rank("E", cell));
        assert!(!same);
    }

    #[test]
    fn test_jitter_bounds_and_grid_alignment() {
        let p = planner();
        for k in 0..200 {
            let offset = p.jitter_offset_ms("E", k, date(), DriveKind::Ssd);
            assert!(offset.unsigned_abs() <= 2000, "offset {offset} outside window");
            assert_eq!(offset % GRID_MS as i64, 0);
        }
    }

    #[test]
    fn test_hdd_jitter_is_earlier_only_at_default_margin() {
        // Default margin (0.3 s) is below one grid cell, so no late slack
        let p = planner();
        for k in 0..200 {
            let offset = p.jitter_offset_ms("H", k, date(), DriveKind::Hdd);
            assert!(offset <= 0, "HDD offset {offset} is late");
            assert!(offset >= -2000);
        }
    }

    #[test]
    fn test_zero_jitter_config() {
        let config = SchedulingConfig {
            jitter_sec: 0,
            ..Default::default()
        };
        let p = JitterPlanner::new(&install_id(), &config);
        assert_eq!(p.jitter_offset_ms("E", 7, date(), DriveKind::Ssd), 0);
    }

    #[test]
    fn test_next_due_never_immediate() {
        let p = planner();
        let d = drive("E", DriveKind::Ssd, 20, 0);
        for now in [0, 250, 499, 500, 777, 19_800] {
            let (_, t) = p.next_due(&d, now, date());
            assert!(t >= now + 500, "next_due {t} fires too soon after {now}");
            assert_eq!(t % GRID_MS, 0);
        }
    }

    #[test]
    fn test_cadence_is_drift_free() {
        // With jitter disabled, firing instants are exact multiples of the
        // interval from the fixed origin.
        let config = SchedulingConfig {
            jitter_sec: 0,
            ..Default::default()
        };
        let p = JitterPlanner::new(&install_id(), &config);
        let mut d = drive("E", DriveKind::Ssd, 20, 10_000);
        d.phase_offset_grid = 3;
        let origin = 10_000 + 3 * GRID_MS;

        let mut now = 10_000;
        for expected_k in 0..1000u64 {
            let (k, t) = p.next_due(&d, now, date());
            assert_eq!(k, expected_k);
            assert_eq!(t, origin + k * 20_000);
            d.firing_index = k + 1;
            // Simulate the engine running slightly late
            now = t + 120;
        }
    }

    #[test]
    fn test_next_due_skips_missed_firings_without_doubling() {
        let p = planner();
        let mut d = drive("E", DriveKind::Ssd, 20, 0);
        d.firing_index = 1;
        // An hour passed; the planner lands on one near-future firing
        let now = 3_600_000;
        let (k, t) = p.next_due(&d, now, date());
        assert!(k > 1);
        assert!(t >= now + 500);
        assert!(t <= now + 25_000, "firing {t} too far after wake at {now}");
    }

    #[test]
    fn test_hdd_guard_pulls_firing_earlier() {
        let config = SchedulingConfig {
            jitter_sec: 0,
            ..Default::default()
        };
        let p = JitterPlanner::new(&install_id(), &config);
        let mut d = drive("H", DriveKind::Hdd, 40, 0);
        d.last_fire_ms = Some(10_000);
        d.firing_index = 2;
        // Nominal firing 2 at 80_000 would leave a 70 s gap; the guard
        // pulls it back to one interval (plus sub-cell margin) after the
        // last probe.
        let (_, t) = p.next_due(&d, 12_000, date());
        assert_eq!(t, 50_000);
    }

    #[test]
    fn test_pack_writes_before_reads() {
        let p = planner();
        let firings = vec![
            CellFiring {
                letter: "E".to_string(),
                op: OpKind::Read,
                firing_index: 4,
                manual: false,
            },
            CellFiring {
                letter: "F".to_string(),
                op: OpKind::Write,
                firing_index: 2,
                manual: false,
            },
            CellFiring {
                letter: "G".to_string(),
                op: OpKind::Read,
                firing_index: 9,
                manual: false,
            },
        ];

        let placed = p.pack_cell(100_000, firings, None, None);
        assert_eq!(placed.len(), 3);
        assert_eq!(placed[0].op, OpKind::Write);
        assert!(placed.iter().all(|op| op.pack_size == 3));
        assert!(placed.iter().all(|op| op.tie_epoch == 200));
    }

    #[test]
    fn test_pack_two_writes_one_second_apart() {
        let p = planner();
        let firings = vec![
            CellFiring {
                letter: "E".to_string(),
                op: OpKind::Write,
                firing_index: 0,
                manual: false,
            },
            CellFiring {
                letter: "F".to_string(),
                op: OpKind::Write,
                firing_index: 0,
                manual: false,
            },
        ];

        let placed = p.pack_cell(50_000, firings, None, None);
        assert_eq!(placed[0].at, 50_000);
        assert_eq!(placed[1].at, 51_000);

        // Hash rank decides who goes first
        let cell = 50_000 / GRID_MS;
        let expected_first = if p.tie_rank("E", cell) <= p.tie_rank("F", cell) {
            "E"
        } else {
            "F"
        };
        assert_eq!(placed[0].letter, expected_first);
    }

    #[test]
    fn test_pack_respects_previous_batch_spacing() {
        let p = planner();
        let firings = vec![CellFiring {
            letter: "E".to_string(),
            op: OpKind::Write,
            firing_index: 1,
            manual: false,
        }];

        // A write launched 500 ms ago forces this one a full second out
        let placed = p.pack_cell(50_000, firings, Some(49_500), Some(49_500));
        assert_eq!(placed[0].at, 50_500);
    }

    #[test]
    fn test_pack_spacing_holds_for_large_packs() {
        let p = planner();
        let firings: Vec<CellFiring> = ('E'..='P')
            .map(|c| CellFiring {
                letter: c.to_string(),
                op: if (c as u8) % 2 == 0 {
                    OpKind::Write
                } else {
                    OpKind::Read
                },
                firing_index: 0,
                manual: false,
            })
            .collect();

        let placed = p.pack_cell(10_000, firings, None, None);
        for pair in placed.windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= MIN_ANY_SPACING_MS, "any-any gap {gap} too small");
        }
        let writes: Vec<_> = placed.iter().filter(|o| o.op == OpKind::Write).collect();
        for pair in writes.windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= MIN_WRITE_SPACING_MS, "write-write gap {gap} too small");
        }
    }

    #[test]
    fn test_tie_rank_changes_with_cell() {
        let p = planner();
        // Ranks re-roll per cell so packing order rotates over the day
        let distinct: std::collections::HashSet<u64> =
            (0..32).map(|cell| p.tie_rank("E", cell)).collect();
        assert!(distinct.len() > 1);
    }
}
