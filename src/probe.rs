//! Probe execution: bounded-flush writes, share-friendly reads, lock retry.
//!
//! A write probe stages a small payload in a sibling temp file, optionally
//! flushes it with a hard deadline, then atomically replaces the canonical
//! probe file. A read probe reads the canonical file back, capped at 4 KiB.
//! All failures are classified; nothing here ever panics the scheduler.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tracing::debug;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::IoConfig;
use crate::domain::{FailureClass, Outcome, NOTE_CREATED};

/// Canonical probe file name inside the ping directory (no extension).
pub const PROBE_FILE_NAME: &str = "drive_revenant";

/// Read probes cap the content they pull back.
const READ_CAP_BYTES: u64 = 4096;

/// Value-typed description of the volume a probe targets.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub letter: String,
    pub ping_dir: PathBuf,
}

impl ProbeTarget {
    pub fn canonical_path(&self) -> PathBuf {
        self.ping_dir.join(PROBE_FILE_NAME)
    }
}

/// Executes probes against a volume. The engine only sees this trait, so
/// tests script outcomes without touching a filesystem.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe_write(&self, target: &ProbeTarget) -> Outcome;
    async fn probe_read(&self, target: &ProbeTarget) -> Outcome;
}

/// Classify an I/O error into the failure taxonomy.
fn classify(err: &io::Error) -> FailureClass {
    #[cfg(windows)]
    if let Some(code) = err.raw_os_error() {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION / ERROR_ACCESS_DENIED
        if matches!(code, 32 | 33 | 5) {
            return FailureClass::Locked;
        }
        // ERROR_PATH_NOT_FOUND / ERROR_NOT_READY / ERROR_MEDIA_CHANGED /
        // ERROR_DEVICE_NOT_CONNECTED
        if matches!(code, 3 | 21 | 1110 | 1167) {
            return FailureClass::DeviceGone;
        }
    }

    match err.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock => FailureClass::Locked,
        io::ErrorKind::NotFound => FailureClass::DeviceGone,
        _ => FailureClass::IoFatal,
    }
}

/// Filesystem-backed probe engine.
pub struct IoEngine {
    fsync: bool,
    max_flush_ms: u64,
    lock_retry_ms: u64,
    clock: Arc<dyn Clock>,
}

impl IoEngine {
    pub fn new(config: &IoConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            fsync: config.fsync,
            max_flush_ms: config.max_flush_ms,
            lock_retry_ms: config.lock_retry_ms,
            clock,
        }
    }

    /// One write attempt. `Ok(true)` means the payload landed but the
    /// durability flush missed its deadline.
    async fn write_attempt(&self, target: &ProbeTarget) -> io::Result<bool> {
        fs::create_dir_all(&target.ping_dir).await?;

        let canonical = target.canonical_path();
        let suffix = Uuid::new_v4().simple().to_string();
        let staging = target
            .ping_dir
            .join(format!("{PROBE_FILE_NAME}.{}.tmp", &suffix[..8]));
        let payload = format!("{PROBE_FILE_NAME} {}\n", self.clock.now_ms());

        let mut partial = false;
        let result: io::Result<()> = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(payload.as_bytes()).await?;
            if self.fsync {
                match timeout(Duration::from_millis(self.max_flush_ms), file.sync_all()).await {
                    Ok(flushed) => flushed?,
                    Err(_) => {
                        // Deadline hit: abandon the wait, keep the write.
                        partial = true;
                    }
                }
            }
            drop(file);
            fs::rename(&staging, &canonical).await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&staging).await;
            return Err(err);
        }
        Ok(partial)
    }

    /// One read attempt. `Ok(None)` means the canonical file is missing.
    async fn read_attempt(&self, target: &ProbeTarget) -> io::Result<Option<usize>> {
        let file = match fs::File::open(target.canonical_path()).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut content = Vec::new();
        let n = file.take(READ_CAP_BYTES).read_to_end(&mut content).await?;
        Ok(Some(n))
    }
}

#[async_trait]
impl Prober for IoEngine {
    async fn probe_write(&self, target: &ProbeTarget) -> Outcome {
        let started = self.clock.now_ms();
        let mut retried = false;

        loop {
            match self.write_attempt(target).await {
                Ok(partial) => {
                    let latency = self.clock.now_ms().saturating_sub(started);
                    debug!(drive = %target.letter, latency, partial, "write probe completed");
                    return if partial {
                        Outcome::partial_flush(
                            latency,
                            format!("flush exceeded {}ms deadline", self.max_flush_ms),
                        )
                    } else {
                        Outcome::ok(latency, "replaced probe file")
                    };
                }
                Err(err) => {
                    let class = classify(&err);
                    let latency = self.clock.now_ms().saturating_sub(started);
                    match class {
                        FailureClass::Locked if !retried => {
                            retried = true;
                            debug!(drive = %target.letter, error = %err, "probe file locked, retrying once");
                            self.clock
                                .sleep_until(self.clock.now_ms() + self.lock_retry_ms)
                                .await;
                        }
                        FailureClass::Locked => {
                            return Outcome::skip_locked(
                                latency,
                                format!("still locked after {}ms retry: {err}", self.lock_retry_ms),
                            );
                        }
                        _ => {
                            return Outcome::error(latency, format!("write failed: {err}"), class);
                        }
                    }
                }
            }
        }
    }

    async fn probe_read(&self, target: &ProbeTarget) -> Outcome {
        let started = self.clock.now_ms();
        let mut retried = false;

        loop {
            match self.read_attempt(target).await {
                Ok(Some(bytes)) => {
                    let latency = self.clock.now_ms().saturating_sub(started);
                    return Outcome::ok(latency, format!("read {bytes} bytes"));
                }
                Ok(None) => {
                    // Missing probe file is not an error; the next firing
                    // writes it back.
                    let latency = self.clock.now_ms().saturating_sub(started);
                    return Outcome::ok(latency, NOTE_CREATED);
                }
                Err(err) => {
                    let class = classify(&err);
                    let latency = self.clock.now_ms().saturating_sub(started);
                    match class {
                        FailureClass::Locked if !retried => {
                            retried = true;
                            self.clock
                                .sleep_until(self.clock.now_ms() + self.lock_retry_ms)
                                .await;
                        }
                        FailureClass::Locked => {
                            return Outcome::skip_locked(
                                latency,
                                format!("still locked after {}ms retry: {err}", self.lock_retry_ms),
                            );
                        }
                        _ => {
                            return Outcome::error(latency, format!("read failed: {err}"), class);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::domain::OutcomeCode;
    use tempfile::TempDir;

    fn engine(fsync: bool) -> IoEngine {
        IoEngine::new(
            &IoConfig {
                fsync,
                max_flush_ms: 150,
                lock_retry_ms: 10,
            },
            Arc::new(TokioClock::new()),
        )
    }

    fn target(dir: &TempDir) -> ProbeTarget {
        ProbeTarget {
            letter: "E".to_string(),
            ping_dir: dir.path().join(".drive_revenant"),
        }
    }

    #[tokio::test]
    async fn test_write_creates_canonical_file() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let outcome = engine(true).probe_write(&target).await;
        assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");

        let content = std::fs::read_to_string(target.canonical_path()).unwrap();
        assert!(content.starts_with("drive_revenant "));
        assert!(content.ends_with('\n'));
        assert!(content.len() <= 64);
    }

    #[tokio::test]
    async fn test_write_leaves_no_staging_files() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        engine(false).probe_write(&target).await;
        engine(false).probe_write(&target).await;

        let names: Vec<String> = std::fs::read_dir(&target.ping_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PROBE_FILE_NAME.to_string()]);
    }

    #[tokio::test]
    async fn test_read_returns_content_length() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        let io = engine(false);

        io.probe_write(&target).await;
        let outcome = io.probe_read(&target).await;

        assert_eq!(outcome.code, OutcomeCode::Ok);
        assert!(outcome.notes.starts_with("read "));
    }

    #[tokio::test]
    async fn test_read_missing_file_reports_created() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);

        let outcome = engine(false).probe_read(&target).await;
        assert_eq!(outcome.code, OutcomeCode::Ok);
        assert_eq!(outcome.notes, NOTE_CREATED);
    }

    #[tokio::test]
    async fn test_read_caps_at_four_kib() {
        let dir = TempDir::new().unwrap();
        let target = target(&dir);
        std::fs::create_dir_all(&target.ping_dir).unwrap();
        std::fs::write(target.canonical_path(), vec![b'x'; 16_384]).unwrap();

        let outcome = engine(false).probe_read(&target).await;
        assert_eq!(outcome.code, OutcomeCode::Ok);
        assert_eq!(outcome.notes, "read 4096 bytes");
    }

    #[tokio::test]
    async fn test_classify_kinds() {
        assert_eq!(
            classify(&io::Error::new(io::ErrorKind::PermissionDenied, "locked")),
            FailureClass::Locked
        );
        assert_eq!(
            classify(&io::Error::new(io::ErrorKind::NotFound, "gone")),
            FailureClass::DeviceGone
        );
        assert_eq!(
            classify(&io::Error::new(io::ErrorKind::Other, "boom")),
            FailureClass::IoFatal
        );
    }
}
