//! Structured event records and sinks.
//!
//! The core emits typed events to an [`EventSink`]; the NDJSON sink renders
//! one JSON object per line with a wall-clock `ts` stamped at emission.
//! Rotation of the output file is not the core's concern.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::clock::MonoMs;
use crate::domain::{OpKind, OutcomeCode};
use crate::policy::DenyReason;

/// One structured record from the scheduler core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A probe completed (any outcome).
    Probe {
        mono_ms: MonoMs,
        drive: String,
        op: OpKind,
        code: OutcomeCode,
        latency_ms: u64,
        tie_epoch: u64,
        tie_rank: u64,
        pack_size: u32,
        notes: String,
    },

    /// A firing was denied or a drive's deny reason changed.
    PolicyChange {
        mono_ms: MonoMs,
        drive: String,
        reason: DenyReason,
    },

    QuarantineEnter {
        mono_ms: MonoMs,
        drive: String,
        until_ms: MonoMs,
        failures: u32,
    },

    QuarantineExit {
        mono_ms: MonoMs,
        drive: String,
    },

    /// The monotonic clock jumped and future firings were rescheduled.
    ResumeSmooth {
        mono_ms: MonoMs,
        jump_ms: u64,
    },
}

/// Consumer of structured events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Sink that discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}

/// Sink that retains events in memory, for tests and diagnostics.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().expect("sink lock poisoned"))
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .push(event.clone());
    }
}

/// Sink appending one JSON object per line to a file.
pub struct NdjsonSink {
    writer: Mutex<BufWriter<File>>,
}

impl NdjsonSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl EventSink for NdjsonSink {
    fn emit(&self, event: &Event) {
        let mut value = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(?event, "Failed to serialize event");
                return;
            }
        };
        value.insert(
            "ts".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );

        let mut writer = self.writer.lock().expect("sink lock poisoned");
        let line = serde_json::Value::Object(value);
        if let Err(e) = writeln!(writer, "{}", line) {
            warn!(error = %e, "Failed to write event record");
            return;
        }
        if let Err(e) = writer.flush() {
            warn!(error = %e, "Failed to flush event record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_event_serialization() {
        let event = Event::Probe {
            mono_ms: 1500,
            drive: "E".to_string(),
            op: OpKind::Write,
            code: OutcomeCode::Ok,
            latency_ms: 12,
            tie_epoch: 3,
            tie_rank: 42,
            pack_size: 2,
            notes: "wrote 28 bytes".to_string(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "probe");
        assert_eq!(json["drive"], "E");
        assert_eq!(json["op"], "write");
        assert_eq!(json["code"], "OK");
        assert_eq!(json["pack_size"], 2);
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(&Event::ResumeSmooth {
            mono_ms: 10,
            jump_ms: 3600_000,
        });
        sink.emit(&Event::QuarantineExit {
            mono_ms: 20,
            drive: "E".to_string(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::ResumeSmooth { .. }));
        assert!(matches!(events[1], Event::QuarantineExit { .. }));
    }

    #[test]
    fn test_ndjson_sink_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let sink = NdjsonSink::create(&path).unwrap();

        sink.emit(&Event::QuarantineEnter {
            mono_ms: 100,
            drive: "E".to_string(),
            until_ms: 60_100,
            failures: 5,
        });
        sink.emit(&Event::QuarantineExit {
            mono_ms: 60_100,
            drive: "E".to_string(),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "quarantine_enter");
        assert_eq!(first["failures"], 5);
        assert!(first["ts"].is_string());
    }
}
