//! Core data model: drives, probe outcomes, and published snapshots.

pub mod drive;
pub mod outcome;
pub mod snapshot;

pub use drive::{default_ping_dir, normalize_letter, Drive, DriveKind, DriveSpec, DriveState};
pub use outcome::{FailureClass, OpKind, Outcome, OutcomeCode, RecordedOutcome, NOTE_CREATED};
pub use snapshot::{DriveView, GlobalView, Snapshot};
