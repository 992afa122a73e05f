//! Drive Revenant - keeps selected storage volumes from spinning down by
//! issuing tiny, deterministically scheduled probe reads and writes.
//!
//! The scheduler runs as a single actor task: external callers enqueue
//! intents on a command channel and observe immutable snapshots, while the
//! engine owns all drive state. Timing is purely monotonic; a drift-free
//! grid cadence with keyed-hash jitter spreads probes so drives never bunch.
//!
//! # Modules
//!
//! - [`planner`] - drift-free cadence, deterministic jitter, HDD guard,
//!   collision packing
//! - [`probe`] - bounded-flush write probes and capped read probes
//! - [`policy`] - precedence-ordered pause arbitration and quarantine
//! - [`engine`] - the scheduler loop actor and its command handle
//! - [`config`] - closed configuration record with explicit defaults
//! - [`events`] - structured event records and NDJSON emission
//! - [`clock`] - injectable monotonic clock and grid math

pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod enumerate;
pub mod events;
pub mod planner;
pub mod policy;
pub mod probe;

// Re-export commonly used types
pub use clock::{Clock, FakeClock, MonoMs, TokioClock, GRID_MS};
pub use config::{Config, IoConfig, PolicyConfig, PolicyRule, SchedulingConfig};
pub use domain::{
    Drive, DriveKind, DriveSpec, DriveState, OpKind, Outcome, OutcomeCode, Snapshot,
};
pub use engine::{Engine, EngineCommand, EngineError, EngineHandle};
pub use enumerate::{ConfigEnumerator, DriveEnumerator, EnumeratedDrive};
pub use events::{Event, EventSink, MemorySink, NdjsonSink, NullSink};
pub use planner::JitterPlanner;
pub use policy::{DenyReason, PolicyArbiter, PolicyInputs, PolicySource, StaticPolicy};
pub use probe::{IoEngine, ProbeTarget, Prober};
