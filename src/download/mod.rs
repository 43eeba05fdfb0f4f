//! Remote download → cloud upload pipeline.

pub mod aria2;
pub mod daemon;
pub mod drive;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod seed;
pub mod storage;
pub mod transfer;
pub mod walker;

pub use aria2::{Aria2Client, listen_notifications, parse_notification};
pub use daemon::{DaemonError, DaemonNotification, DownloadDaemon, NotificationKind};
pub use drive::GoogleDrive;
pub use orchestrator::{
    DownloadOrchestrator, OrchestratorError, OrchestratorSettings, TransferSource,
};
pub use progress::{
    NotifyError, ProgressPhase, ProgressRecord, ProgressThrottle, StatusMessage, TransferNotifier,
    TransferOutcome,
};
pub use retry::RetryPolicy;
pub use seed::Seeder;
pub use storage::{
    CloudStorage, FileList, ResumableUpload, StorageError, StoredFile, UploadStep, index_link,
};
pub use transfer::{BitTorrentInfo, Transfer, TransferFile, TransferStatus};
pub use walker::{TreeWalk, UploadJob, WalkSummary, spawn_walk};
