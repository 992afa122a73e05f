//! Probe outcome taxonomy.

use serde::{Deserialize, Serialize};

use crate::clock::MonoMs;

/// Kind of probe issued against a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Read,
    Write,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Classification of a completed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Ok,
    SkipLocked,
    PartialFlush,
    Error,
}

/// Failure class attached to non-OK outcomes.
///
/// `Locked` is transient sharing contention, `DeviceGone` means the volume
/// vanished underneath us, `IoFatal` is everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Locked,
    DeviceGone,
    IoFatal,
}

/// Note attached to a read outcome when the canonical probe file was absent.
/// The missing file is healed by a write on the drive's next firing.
pub const NOTE_CREATED: &str = "created";

/// Outcome of one probe.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub code: OutcomeCode,
    pub latency_ms: u64,
    pub notes: String,
    pub failure: Option<FailureClass>,
}

impl Outcome {
    pub fn ok(latency_ms: u64, notes: impl Into<String>) -> Self {
        Self {
            code: OutcomeCode::Ok,
            latency_ms,
            notes: notes.into(),
            failure: None,
        }
    }

    pub fn partial_flush(latency_ms: u64, notes: impl Into<String>) -> Self {
        Self {
            code: OutcomeCode::PartialFlush,
            latency_ms,
            notes: notes.into(),
            failure: None,
        }
    }

    pub fn skip_locked(latency_ms: u64, notes: impl Into<String>) -> Self {
        Self {
            code: OutcomeCode::SkipLocked,
            latency_ms,
            notes: notes.into(),
            failure: Some(FailureClass::Locked),
        }
    }

    pub fn error(latency_ms: u64, notes: impl Into<String>, failure: FailureClass) -> Self {
        Self {
            code: OutcomeCode::Error,
            latency_ms,
            notes: notes.into(),
            failure: Some(failure),
        }
    }

    /// PARTIAL_FLUSH counts as success for quarantine purposes.
    pub fn is_success(&self) -> bool {
        matches!(self.code, OutcomeCode::Ok | OutcomeCode::PartialFlush)
    }

    pub fn is_device_gone(&self) -> bool {
        self.failure == Some(FailureClass::DeviceGone)
    }
}

/// Outcome retained in the per-drive ring buffer and surfaced in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedOutcome {
    pub op: OpKind,
    pub code: OutcomeCode,
    pub latency_ms: u64,
    pub at_ms: MonoMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_serialization() {
        assert_eq!(
            serde_json::to_string(&OutcomeCode::SkipLocked).unwrap(),
            "\"SKIP_LOCKED\""
        );
        assert_eq!(
            serde_json::to_string(&OutcomeCode::PartialFlush).unwrap(),
            "\"PARTIAL_FLUSH\""
        );
        assert_eq!(serde_json::to_string(&OpKind::Write).unwrap(), "\"write\"");
    }

    #[test]
    fn test_partial_flush_is_success() {
        assert!(Outcome::partial_flush(10, "flush deadline exceeded").is_success());
        assert!(Outcome::ok(1, "").is_success());
        assert!(!Outcome::skip_locked(751, "").is_success());
        assert!(!Outcome::error(5, "io error", FailureClass::IoFatal).is_success());
    }
}
