//! Clone-able handle over the engine's command channel.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::domain::{DriveSpec, Snapshot};

use super::messages::{EngineCommand, EngineError};

/// API surface for collaborators (UI, CLI, tests). Commands enqueue on the
/// engine's channel; snapshots arrive either on demand or via `subscribe`.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    snapshots: broadcast::Sender<Arc<Snapshot>>,
}

impl EngineHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<EngineCommand>,
        snapshots: broadcast::Sender<Arc<Snapshot>>,
    ) -> Self {
        Self { tx, snapshots }
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn set_drive_config(
        &self,
        letter: impl Into<String>,
        spec: DriveSpec,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::SetDriveConfig {
            letter: letter.into(),
            spec,
        })
        .await
    }

    pub async fn remove_drive(&self, letter: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::RemoveDrive {
            letter: letter.into(),
        })
        .await
    }

    pub async fn pause_drive(&self, letter: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::PauseDrive {
            letter: letter.into(),
        })
        .await
    }

    pub async fn resume_drive(&self, letter: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::ResumeDrive {
            letter: letter.into(),
        })
        .await
    }

    pub async fn release_quarantine(&self, letter: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::ReleaseQuarantine {
            letter: letter.into(),
        })
        .await
    }

    pub async fn ping_now(&self, letter: impl Into<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::PingNow {
            letter: letter.into(),
        })
        .await
    }

    /// Fetch a freshly built snapshot from the scheduler task.
    pub async fn current_snapshot(&self) -> Result<Arc<Snapshot>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::GetSnapshot { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Subscribe to every published snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.send(EngineCommand::Shutdown).await
    }
}
