//! Download → upload state machine driven by daemon notifications.
//!
//! Transfers, upload sets, owners and the cancellation set live in one
//! ledger behind one async mutex. Notification handlers hold it for each
//! status refresh and bookkeeping step, never while bytes are uploaded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::daemon::{DaemonError, DaemonNotification, DownloadDaemon, NotificationKind};
use super::progress::{
    NotifyError, ProgressPhase, ProgressRecord, ProgressThrottle, StatusMessage, TransferNotifier,
    TransferOutcome,
};
use super::retry::RetryPolicy;
use super::seed::Seeder;
use super::storage::{CloudStorage, ResumableUpload, StorageError, StoredFile, UploadStep, index_link};
use super::transfer::{Transfer, TransferStatus};
use super::walker::{self, UploadJob};
use crate::config::Config;
use crate::platform::MessageRef;

/// What to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Uri(String),
    Torrent(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{message}")]
    Daemon {
        gid: String,
        message: String,
        #[source]
        source: DaemonError,
    },
    #[error("__GID belongs to finished Metadata, can't be abort.__")]
    FinishedMetadata { gid: String },
}

impl OrchestratorError {
    fn daemon(gid: &str, source: DaemonError) -> Self {
        Self::Daemon {
            gid: gid.to_string(),
            message: source.user_message(Some(gid)),
            source,
        }
    }
}

/// Timing and sizing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub upload_concurrency: usize,
    pub index_link: Option<String>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.downloads.poll_interval(),
            progress_interval: config.downloads.progress_interval(),
            upload_concurrency: config.downloads.upload_concurrency.max(1),
            index_link: config.drive.index_link.clone().filter(|l| !l.is_empty()),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

enum UploadSet {
    Single {
        token: CancellationToken,
        uploaded: Arc<AtomicU64>,
        total: u64,
    },
    Folder {
        token: CancellationToken,
        completed: Arc<AtomicUsize>,
        /// Files the walker will queue; zero until it has counted them.
        total: Arc<AtomicUsize>,
    },
}

impl UploadSet {
    fn token(&self) -> &CancellationToken {
        match self {
            Self::Single { token, .. } | Self::Folder { token, .. } => token,
        }
    }
}

#[derive(Default)]
struct Ledger {
    transfers: HashMap<String, Transfer>,
    uploads: HashMap<String, UploadSet>,
    cancelled: BTreeSet<String>,
    /// Message each transfer reports its outcome to.
    owners: HashMap<String, MessageRef>,
    /// Gids whose completion has been handled.
    finished: HashSet<String>,
    status: Option<StatusMessage>,
}

impl Ledger {
    fn is_idle(&self) -> bool {
        self.transfers.is_empty() && self.uploads.is_empty()
    }

    fn upsert(&mut self, mut transfer: Transfer) {
        if let Some(previous) = self.transfers.get(&transfer.gid) {
            transfer.is_directory = previous.is_directory;
        }
        self.transfers.insert(transfer.gid.clone(), transfer);
    }

    /// A terminal status for a gid that is no longer tracked, such as a
    /// start notification handled after the completion that retired it.
    fn is_stale(&self, transfer: &Transfer) -> bool {
        transfer.status.is_terminal() && !self.transfers.contains_key(&transfer.gid)
    }

    fn discard(&mut self, gid: &str) {
        self.transfers.remove(gid);
        if let Some(set) = self.uploads.remove(gid) {
            set.token().cancel();
        }
    }

    fn records(&self) -> Vec<ProgressRecord> {
        let mut records: Vec<ProgressRecord> = self
            .transfers
            .values()
            .filter(|t| {
                !matches!(
                    t.status,
                    TransferStatus::Error | TransferStatus::Paused | TransferStatus::Removed
                ) && !(t.status == TransferStatus::Complete && t.is_metadata())
            })
            .map(|t| {
                let mut record = ProgressRecord::from_transfer(t);
                match self.uploads.get(&t.gid) {
                    Some(UploadSet::Single {
                        uploaded, total, ..
                    }) => {
                        record.phase = ProgressPhase::Uploading;
                        record.completed = uploaded.load(Ordering::Relaxed);
                        record.total = *total;
                        record.speed = 0;
                        record.eta = None;
                    }
                    Some(UploadSet::Folder {
                        completed, total, ..
                    }) => {
                        record.phase = ProgressPhase::ComputingFolder {
                            done: completed.load(Ordering::SeqCst),
                            total: total.load(Ordering::SeqCst),
                        };
                    }
                    None => {}
                }
                record
            })
            .collect();
        records.sort_by(|a, b| a.gid.cmp(&b.gid));
        records
    }
}

enum UploadFailure {
    Cancelled,
    Storage(String),
}

impl From<StorageError> for UploadFailure {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Owns every daemon and cloud storage call made on behalf of plugins.
pub struct DownloadOrchestrator {
    daemon: Arc<dyn DownloadDaemon>,
    storage: Arc<dyn CloudStorage>,
    notifier: Arc<dyn TransferNotifier>,
    retry: RetryPolicy,
    settings: OrchestratorSettings,
    seeder: Seeder,
    ledger: Mutex<Ledger>,
    stopping: CancellationToken,
}

impl DownloadOrchestrator {
    pub fn new(
        daemon: Arc<dyn DownloadDaemon>,
        storage: Arc<dyn CloudStorage>,
        notifier: Arc<dyn TransferNotifier>,
        retry: RetryPolicy,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            daemon,
            storage,
            notifier,
            retry,
            settings,
            seeder: Seeder::disabled(),
            ledger: Mutex::new(Ledger::default()),
            stopping: CancellationToken::new(),
        }
    }

    pub fn with_seeder(mut self, seeder: Seeder) -> Self {
        self.seeder = seeder;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Start consuming `notifications` and the background monitor loop.
    pub fn start(
        self: &Arc<Self>,
        notifications: mpsc::Receiver<DaemonNotification>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).pump(notifications)),
            tokio::spawn(Arc::clone(self).monitor()),
        ]
    }

    pub fn stop(&self) {
        self.stopping.cancel();
        self.seeder.stop_all();
    }

    async fn pump(self: Arc<Self>, mut notifications: mpsc::Receiver<DaemonNotification>) {
        loop {
            let notification = tokio::select! {
                () = self.stopping.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(n) => n,
                    None => break,
                },
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.handle_notification(notification).await });
        }
        debug!("Download notification pump stopped");
    }

    async fn monitor(self: Arc<Self>) {
        let mut throttle = ProgressThrottle::new(self.settings.progress_interval);
        loop {
            tokio::select! {
                () = self.stopping.cancelled() => break,
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
            if let Some(wait) = self.tick(&mut throttle).await {
                warn!("Progress updates rate limited, sleeping {}s", wait.as_secs());
                tokio::select! {
                    () = self.stopping.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
        debug!("Download monitor stopped");
    }

    /// Queue a download on behalf of `invoker` and return its gid.
    pub async fn schedule(
        &self,
        source: TransferSource,
        invoker: MessageRef,
    ) -> Result<String, OrchestratorError> {
        let gid = match &source {
            TransferSource::Uri(uri) => {
                let uris = vec![uri.clone()];
                self.retry
                    .run("addUri", || self.daemon.add_uri(&uris))
                    .await
            }
            TransferSource::Torrent(bytes) => {
                self.retry
                    .run("addTorrent", || self.daemon.add_torrent(bytes))
                    .await
            }
        }
        .map_err(|e| OrchestratorError::daemon("", e))?;

        let mut ledger = self.ledger.lock().await;
        ledger.owners.insert(gid.clone(), invoker);
        if ledger.status.is_none() {
            ledger.status = Some(StatusMessage::new(invoker));
        }
        info!(gid = %gid, "Download scheduled");
        Ok(gid)
    }

    /// Abort `gid`. Active downloads are removed at the daemon; everything
    /// else is torn down by the monitor loop on its next tick.
    pub async fn cancel(&self, gid: &str) -> Result<(), OrchestratorError> {
        let transfer = self.fetch(gid).await?;
        match transfer.status {
            TransferStatus::Complete if transfer.is_metadata() => {
                return Err(OrchestratorError::FinishedMetadata {
                    gid: gid.to_string(),
                });
            }
            TransferStatus::Active => {
                self.retry
                    .run("forcePause", || self.daemon.pause(gid, true))
                    .await
                    .map_err(|e| OrchestratorError::daemon(gid, e))?;
                self.retry
                    .run("forceRemove", || self.daemon.remove(gid, true))
                    .await
                    .map_err(|e| OrchestratorError::daemon(gid, e))?;
            }
            TransferStatus::Waiting | TransferStatus::Paused => {
                self.retry
                    .run("forceRemove", || self.daemon.remove(gid, true))
                    .await
                    .map_err(|e| OrchestratorError::daemon(gid, e))?;
            }
            _ => {}
        }
        self.ledger.lock().await.cancelled.insert(gid.to_string());
        info!(gid, "Transfer marked for cancellation");
        Ok(())
    }

    pub async fn pause(&self, gid: &str) -> Result<(), OrchestratorError> {
        self.retry
            .run("pause", || self.daemon.pause(gid, false))
            .await
            .map(drop)
            .map_err(|e| OrchestratorError::daemon(gid, e))
    }

    pub async fn resume(&self, gid: &str) -> Result<(), OrchestratorError> {
        self.retry
            .run("unpause", || self.daemon.unpause(gid))
            .await
            .map(drop)
            .map_err(|e| OrchestratorError::daemon(gid, e))
    }

    /// Progress of every reportable transfer, ordered by gid.
    pub async fn status_snapshot(&self) -> Vec<ProgressRecord> {
        self.ledger.lock().await.records()
    }

    /// Transfers that are downloading or uploading.
    pub async fn live_count(&self) -> usize {
        self.ledger.lock().await.transfers.len()
    }

    /// Whether any state is still held for `gid`.
    pub async fn tracks(&self, gid: &str) -> bool {
        let ledger = self.ledger.lock().await;
        ledger.transfers.contains_key(gid) || ledger.uploads.contains_key(gid)
    }

    async fn fetch(&self, gid: &str) -> Result<Transfer, OrchestratorError> {
        self.retry
            .run("tellStatus", || self.daemon.tell_status(gid))
            .await
            .map_err(|e| OrchestratorError::daemon(gid, e))
    }

    /// Process one daemon notification. Failures stay with that gid.
    pub async fn handle_notification(&self, notification: DaemonNotification) {
        let DaemonNotification { kind, gid } = notification;
        let result = match kind {
            NotificationKind::Start | NotificationKind::Pause => self.on_update(&gid).await,
            NotificationKind::Stop => self.on_stop(&gid).await,
            NotificationKind::Error => self.on_error(&gid).await,
            NotificationKind::Complete => self.on_complete(&gid).await,
        };
        if let Err(e) = result {
            error!(gid = %gid, kind = %kind, "Download handler failed: {e}");
        }
    }

    async fn on_update(&self, gid: &str) -> Result<(), OrchestratorError> {
        let mut ledger = self.ledger.lock().await;
        let transfer = self.fetch(gid).await?;
        if ledger.is_stale(&transfer) {
            debug!(gid, status = %transfer.status, "Ignoring update for retired transfer");
            return Ok(());
        }
        debug!(gid, status = %transfer.status, "Transfer updated");
        if ledger.status.is_none() {
            if let Some(owner) = ledger.owners.get(gid).copied() {
                ledger.status = Some(StatusMessage::new(owner));
            }
        }
        ledger.upsert(transfer);
        Ok(())
    }

    async fn on_stop(&self, gid: &str) -> Result<(), OrchestratorError> {
        let mut ledger = self.ledger.lock().await;
        let transfer = self.fetch(gid).await?;
        if transfer.status == TransferStatus::Removed {
            info!(gid, "Transfer removed");
            ledger.discard(gid);
            ledger.owners.remove(gid);
            self.release_if_idle(&mut ledger).await;
        } else if !ledger.is_stale(&transfer) {
            ledger.upsert(transfer);
        }
        Ok(())
    }

    async fn on_error(&self, gid: &str) -> Result<(), OrchestratorError> {
        let mut ledger = self.ledger.lock().await;
        let transfer = self.fetch(gid).await?;
        let outcome = TransferOutcome::Failed {
            name: transfer.name(),
            status: transfer.status,
            error_code: transfer.error_code,
            error_message: transfer.error_message.clone().unwrap_or_default(),
        };
        warn!(
            gid,
            code = transfer.error_code.unwrap_or_default(),
            "Download failed: {}",
            transfer.error_message.as_deref().unwrap_or("unknown error")
        );
        ledger.discard(gid);
        let owner = ledger.owners.remove(gid);
        self.report(&ledger, owner, &outcome).await;
        self.release_if_idle(&mut ledger).await;
        Ok(())
    }

    async fn on_complete(&self, gid: &str) -> Result<(), OrchestratorError> {
        let (transfer, set) = {
            let mut ledger = self.ledger.lock().await;
            if ledger.finished.contains(gid) {
                debug!(gid, "Completion already handled");
                return Ok(());
            }
            let mut transfer = self.fetch(gid).await?;
            ledger.finished.insert(gid.to_string());

            if transfer.is_metadata() {
                info!(gid, followed_by = ?transfer.followed_by, "Metadata fetched");
                ledger.transfers.remove(gid);
                if let Some(owner) = ledger.owners.remove(gid) {
                    for next in &transfer.followed_by {
                        ledger.owners.insert(next.clone(), owner);
                    }
                }
                return Ok(());
            }

            let path = transfer.local_path();
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => transfer.is_directory = true,
                Ok(meta) if meta.is_file() => {}
                _ => {
                    warn!(gid, path = %path.display(), "Completed payload is neither file nor directory");
                    ledger.discard(gid);
                    ledger.owners.remove(gid);
                    self.release_if_idle(&mut ledger).await;
                    return Ok(());
                }
            }

            let token = self.stopping.child_token();
            let (set, handle) = if transfer.is_directory {
                let completed = Arc::new(AtomicUsize::new(0));
                let total = Arc::new(AtomicUsize::new(0));
                (
                    UploadSet::Folder {
                        token: token.clone(),
                        completed: Arc::clone(&completed),
                        total: Arc::clone(&total),
                    },
                    UploadHandle::Folder {
                        token,
                        completed,
                        total,
                    },
                )
            } else {
                let uploaded = Arc::new(AtomicU64::new(0));
                (
                    UploadSet::Single {
                        token: token.clone(),
                        uploaded: Arc::clone(&uploaded),
                        total: transfer.total_length,
                    },
                    UploadHandle::Single { token, uploaded },
                )
            };
            ledger.uploads.insert(gid.to_string(), set);
            ledger.upsert(transfer.clone());
            (transfer, handle)
        };

        if transfer.bittorrent.is_some() {
            if let Some(hash) = &transfer.info_hash {
                self.seeder.seed(gid, transfer.dir(), hash);
            }
        }

        let name = transfer.name();
        info!(gid, name = %name, directory = transfer.is_directory, "Download complete, uploading");
        let result = match set {
            UploadHandle::Single { token, uploaded } => {
                self.upload_single(&transfer, &token, &uploaded).await
            }
            UploadHandle::Folder {
                token,
                completed,
                total,
            } => {
                self.upload_folder(&transfer, &token, &completed, total)
                    .await
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(UploadFailure::Cancelled) => {
                info!(gid, "Upload aborted");
                TransferOutcome::Aborted { name }
            }
            Err(UploadFailure::Storage(error)) => {
                error!(gid, "Upload failed: {error}");
                TransferOutcome::UploadFailed { name, error }
            }
        };

        let mut ledger = self.ledger.lock().await;
        ledger.discard(gid);
        ledger.cancelled.remove(gid);
        let owner = ledger.owners.remove(gid);
        self.report(&ledger, owner, &outcome).await;
        self.release_if_idle(&mut ledger).await;
        Ok(())
    }

    fn index_link_for(&self, name: &str, is_dir: bool) -> Option<String> {
        self.settings
            .index_link
            .as_deref()
            .map(|base| index_link(base, name, is_dir))
    }

    async fn upload_single(
        &self,
        transfer: &Transfer,
        token: &CancellationToken,
        uploaded: &AtomicU64,
    ) -> Result<TransferOutcome, UploadFailure> {
        let name = transfer.name();
        let local_path = transfer.local_path();
        let upload = tokio::select! {
            biased;
            () = token.cancelled() => return Err(UploadFailure::Cancelled),
            created = self.storage.create_file(&local_path, &name, None) => created?,
        };
        let file = drive_upload(upload, token, Some(uploaded)).await?;
        let index_link = self.index_link_for(&name, false);
        Ok(TransferOutcome::Uploaded {
            name,
            file,
            index_link,
        })
    }

    async fn upload_folder(
        &self,
        transfer: &Transfer,
        token: &CancellationToken,
        completed: &AtomicUsize,
        total: Arc<AtomicUsize>,
    ) -> Result<TransferOutcome, UploadFailure> {
        let name = transfer.name();
        let folder_id = self.storage.create_folder(&name, None).await?;
        let concurrency = self.settings.upload_concurrency.max(1);
        let walk = walker::spawn_walk(
            Arc::clone(&self.storage),
            transfer.local_path(),
            folder_id.clone(),
            token.clone(),
            concurrency * 2,
            total,
        );
        let mut jobs = walk.jobs;
        let mut pool: JoinSet<Result<StoredFile, UploadFailure>> = JoinSet::new();
        let mut queue_open = true;

        let failure = loop {
            if !queue_open && pool.is_empty() {
                break None;
            }
            tokio::select! {
                biased;
                () = token.cancelled() => break Some(UploadFailure::Cancelled),
                Some(joined) = pool.join_next(), if !pool.is_empty() => match joined {
                    Ok(Ok(file)) => {
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(file = %file.name, done, "Folder entry uploaded");
                    }
                    Ok(Err(e)) => break Some(e),
                    Err(e) => break Some(UploadFailure::Storage(format!("upload task failed: {e}"))),
                },
                job = jobs.recv(), if queue_open && pool.len() < concurrency => match job {
                    Some(job) => {
                        pool.spawn(upload_job(Arc::clone(&self.storage), job, token.clone()));
                    }
                    None => queue_open = false,
                },
            }
        };

        if let Some(failure) = failure {
            // Stops the walker and every in-flight upload.
            token.cancel();
            drop(jobs);
            pool.shutdown().await;
            walk.handle.abort();
            return Err(failure);
        }

        match walk.handle.await {
            Ok(Ok(summary)) if summary.finished => {}
            Ok(Ok(_)) => return Err(UploadFailure::Cancelled),
            Ok(Err(e)) => return Err(e.into()),
            Err(e) => return Err(UploadFailure::Storage(format!("directory walk failed: {e}"))),
        }

        Ok(TransferOutcome::FolderUploaded {
            link: self.storage.folder_link(&folder_id),
            index_link: self.index_link_for(&name, true),
            name,
        })
    }

    /// One monitor tick: drain cancellations, refresh live transfers, and
    /// send progress when the throttle allows. Returns the wait requested
    /// by a rate limited platform.
    pub async fn tick(&self, throttle: &mut ProgressThrottle) -> Option<Duration> {
        self.drain_cancellations().await;

        let live: Vec<String> = {
            let ledger = self.ledger.lock().await;
            ledger
                .transfers
                .values()
                .filter(|t| !t.status.is_terminal() && !ledger.uploads.contains_key(&t.gid))
                .map(|t| t.gid.clone())
                .collect()
        };
        let mut fresh = Vec::with_capacity(live.len());
        for gid in live {
            match self.daemon.tell_status(&gid).await {
                Ok(transfer) => fresh.push(transfer),
                Err(e) => debug!(gid = %gid, "Status refresh failed: {e}"),
            }
        }

        let mut ledger = self.ledger.lock().await;
        for transfer in fresh {
            if ledger.transfers.contains_key(&transfer.gid) && !ledger.uploads.contains_key(&transfer.gid) {
                ledger.upsert(transfer);
            }
        }

        let records = ledger.records();
        let now = tokio::time::Instant::now();
        if records.is_empty() || !throttle.ready(now) {
            return None;
        }
        let status = ledger.status?;

        match self.notifier.report_progress(&status, &records).await {
            Ok(message) => {
                if let Some(current) = ledger.status.as_mut() {
                    current.progress = Some(message);
                }
                throttle.mark(now);
                None
            }
            Err(NotifyError::RateLimited(wait)) => Some(wait),
            Err(NotifyError::NotModified) => {
                throttle.mark(now);
                None
            }
            Err(e) => {
                warn!("Progress update failed: {e}");
                throttle.mark(now);
                None
            }
        }
    }

    async fn drain_cancellations(&self) {
        let mut ledger = self.ledger.lock().await;
        if ledger.cancelled.is_empty() {
            return;
        }
        let cancelled = std::mem::take(&mut ledger.cancelled);
        for gid in &cancelled {
            let uploading = ledger.uploads.contains_key(gid);
            ledger.discard(gid);
            // Uploads report their own abort and drop the owner afterwards.
            if !uploading {
                ledger.owners.remove(gid);
            }
            info!(gid = %gid, uploading, "Transfer cancelled");
        }
        self.release_if_idle(&mut ledger).await;
    }

    async fn report(&self, ledger: &Ledger, owner: Option<MessageRef>, outcome: &TransferOutcome) {
        let Some(invoker) = owner.or_else(|| ledger.status.map(|s| s.invoker)) else {
            warn!(name = outcome.name(), "No message to report transfer outcome to");
            return;
        };
        if let Err(e) = self.notifier.report_outcome(invoker, outcome).await {
            warn!(name = outcome.name(), "Failed to report transfer outcome: {e}");
        }
    }

    async fn release_if_idle(&self, ledger: &mut Ledger) {
        if !ledger.is_idle() {
            return;
        }
        if let Some(status) = ledger.status.take() {
            if let Err(e) = self.notifier.release(&status).await {
                warn!("Failed to release status message: {e}");
            }
        }
    }
}

enum UploadHandle {
    Single {
        token: CancellationToken,
        uploaded: Arc<AtomicU64>,
    },
    Folder {
        token: CancellationToken,
        completed: Arc<AtomicUsize>,
        total: Arc<AtomicUsize>,
    },
}

async fn drive_upload(
    mut upload: Box<dyn ResumableUpload>,
    token: &CancellationToken,
    uploaded: Option<&AtomicU64>,
) -> Result<StoredFile, UploadFailure> {
    loop {
        let step = tokio::select! {
            biased;
            () = token.cancelled() => return Err(UploadFailure::Cancelled),
            step = upload.next_chunk() => step?,
        };
        match step {
            UploadStep::Progress { uploaded: sent, .. } => {
                if let Some(counter) = uploaded {
                    counter.store(sent, Ordering::Relaxed);
                }
            }
            UploadStep::Done(file) => {
                if let Some(counter) = uploaded {
                    counter.store(file.size, Ordering::Relaxed);
                }
                return Ok(file);
            }
        }
    }
}

async fn upload_job(
    storage: Arc<dyn CloudStorage>,
    job: UploadJob,
    token: CancellationToken,
) -> Result<StoredFile, UploadFailure> {
    let upload = tokio::select! {
        biased;
        () = token.cancelled() => return Err(UploadFailure::Cancelled),
        created = storage.create_file(&job.path, &job.name, Some(&job.parent)) => created?,
    };
    drive_upload(upload, &token, None).await
}
