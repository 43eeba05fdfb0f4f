use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use super::storage::StoredFile;
use super::transfer::{Transfer, TransferStatus};
use crate::platform::MessageRef;

/// What a transfer is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Downloading,
    Uploading,
    /// Directory upload with `done` of `total` files stored.
    ComputingFolder { done: usize, total: usize },
}

/// Point-in-time progress of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub gid: String,
    pub name: String,
    pub status: TransferStatus,
    pub phase: ProgressPhase,
    pub completed: u64,
    pub total: u64,
    /// Bytes per second.
    pub speed: u64,
    pub eta: Option<Duration>,
}

impl ProgressRecord {
    pub fn from_transfer(transfer: &Transfer) -> Self {
        Self {
            gid: transfer.gid.clone(),
            name: transfer.name(),
            status: transfer.status,
            phase: ProgressPhase::Downloading,
            completed: transfer.completed_length,
            total: transfer.total_length,
            speed: transfer.download_speed,
            eta: transfer.eta(),
        }
    }

    /// Completion in percent, `0.0..=100.0`.
    pub fn percent(&self) -> f64 {
        match self.phase {
            ProgressPhase::ComputingFolder { total: 0, .. } => 0.0,
            ProgressPhase::ComputingFolder { done, total } => done as f64 * 100.0 / total as f64,
            _ if self.total == 0 => 0.0,
            _ => (self.completed as f64 * 100.0 / self.total as f64).min(100.0),
        }
    }
}

/// Allows one send per `interval`.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

/// The single status message shared by all live transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessage {
    /// Message that started the first live transfer.
    pub invoker: MessageRef,
    /// Progress message once one has been sent.
    pub progress: Option<MessageRef>,
}

impl StatusMessage {
    pub fn new(invoker: MessageRef) -> Self {
        Self {
            invoker,
            progress: None,
        }
    }
}

/// Final result of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Uploaded {
        name: String,
        file: StoredFile,
        index_link: Option<String>,
    },
    FolderUploaded {
        name: String,
        link: String,
        index_link: Option<String>,
    },
    /// The daemon reported a download error.
    Failed {
        name: String,
        status: TransferStatus,
        error_code: Option<i64>,
        error_message: String,
    },
    UploadFailed {
        name: String,
        error: String,
    },
    Aborted {
        name: String,
    },
}

impl TransferOutcome {
    pub fn name(&self) -> &str {
        match self {
            Self::Uploaded { name, .. }
            | Self::FolderUploaded { name, .. }
            | Self::Failed { name, .. }
            | Self::UploadFailed { name, .. }
            | Self::Aborted { name } => name,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    #[error("message not modified")]
    NotModified,
    #[error("notification failed: {0}")]
    Failed(String),
}

/// Where the orchestrator reports progress and outcomes.
#[async_trait]
pub trait TransferNotifier: Send + Sync {
    /// Send or edit the shared progress message and return its reference.
    async fn report_progress(
        &self,
        status: &StatusMessage,
        records: &[ProgressRecord],
    ) -> Result<MessageRef, NotifyError>;

    /// Reply to `invoker` with the final result of a transfer.
    async fn report_outcome(
        &self,
        invoker: MessageRef,
        outcome: &TransferOutcome,
    ) -> Result<(), NotifyError>;

    /// Called once no transfer is live any more.
    async fn release(&self, status: &StatusMessage) -> Result<(), NotifyError>;
}
