//! Command-channel payloads for the scheduler engine.
//!
//! External callers never touch drive state directly: every mutation is an
//! intent enqueued here and drained by the scheduler task at the top of a
//! tick, which serializes mutations without locks.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{DriveSpec, Snapshot};

/// Errors surfaced through the engine handle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine channel closed")]
    ChannelClosed,
}

/// Intents sent to the scheduler task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Create or update a drive's configuration.
    SetDriveConfig { letter: String, spec: DriveSpec },

    /// Forget a drive entirely.
    RemoveDrive { letter: String },

    /// User pause; sticky until explicitly resumed.
    PauseDrive { letter: String },

    ResumeDrive { letter: String },

    /// Clear a quarantine before its window expires.
    ReleaseQuarantine { letter: String },

    /// Schedule one extra probe at the earliest spacing-compliant cell.
    PingNow { letter: String },

    /// Request a freshly built snapshot.
    GetSnapshot {
        reply: oneshot::Sender<Arc<Snapshot>>,
    },

    /// Stop the loop; the in-flight probe is allowed to finish.
    Shutdown,
}
