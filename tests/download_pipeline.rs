//! End-to-end tests of the download orchestrator against in-memory ports.
//!
//! The daemon, cloud storage and notifier are hand-written fakes so every
//! scenario runs without aria2, Drive or Telegram.

use async_trait::async_trait;
use mirrorbot::download::{
    CloudStorage, DaemonError, DaemonNotification, DownloadDaemon, DownloadOrchestrator, FileList,
    NotificationKind, NotifyError, OrchestratorError, OrchestratorSettings, ProgressPhase,
    ProgressRecord,
    ProgressThrottle, ResumableUpload, RetryPolicy, StatusMessage, StorageError, StoredFile,
    Transfer, TransferNotifier, TransferOutcome, TransferSource, UploadStep,
};
use mirrorbot::platform::MessageRef;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

const INVOKER: MessageRef = MessageRef {
    chat_id: 42,
    message_id: 7,
};

// ── Fakes ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeDaemon {
    statuses: Mutex<HashMap<String, Value>>,
    transient_failures: AtomicU32,
    status_calls: AtomicU32,
    calls: Mutex<Vec<String>>,
    next_gid: AtomicU32,
}

impl FakeDaemon {
    fn set(&self, gid: &str, status: Value) {
        self.statuses.lock().insert(gid.to_string(), status);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DownloadDaemon for FakeDaemon {
    async fn add_uri(&self, uris: &[String]) -> Result<String, DaemonError> {
        let gid = format!("g{}", self.next_gid.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().push(format!("addUri {}", uris.join(" ")));
        Ok(gid)
    }

    async fn add_torrent(&self, torrent: &[u8]) -> Result<String, DaemonError> {
        let gid = format!("g{}", self.next_gid.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().push(format!("addTorrent {}", torrent.len()));
        Ok(gid)
    }

    async fn tell_status(&self, gid: &str) -> Result<Transfer, DaemonError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DaemonError::Transient("connection refused".into()));
        }
        let status = self.statuses.lock().get(gid).cloned();
        match status {
            Some(status) => Transfer::from_status(&status),
            None => Err(DaemonError::Rpc {
                code: 1,
                message: format!("GID {gid} is not found"),
            }),
        }
    }

    async fn pause(&self, gid: &str, force: bool) -> Result<String, DaemonError> {
        let method = if force { "forcePause" } else { "pause" };
        self.calls.lock().push(format!("{method} {gid}"));
        Ok(gid.to_string())
    }

    async fn remove(&self, gid: &str, force: bool) -> Result<String, DaemonError> {
        let method = if force { "forceRemove" } else { "remove" };
        self.calls.lock().push(format!("{method} {gid}"));
        Ok(gid.to_string())
    }

    async fn unpause(&self, gid: &str) -> Result<String, DaemonError> {
        self.calls.lock().push(format!("unpause {gid}"));
        Ok(gid.to_string())
    }
}

#[derive(Default)]
struct FakeStorage {
    folders: Mutex<Vec<(String, Option<String>)>>,
    files: Mutex<Vec<(String, Option<String>)>>,
    hang_uploads: AtomicBool,
    fail_name: Mutex<Option<String>>,
    /// Uploads of this file wait for `release_held`.
    held_name: Mutex<Option<String>>,
    release_held: Notify,
    next_folder: AtomicU32,
}

impl FakeStorage {
    fn folder_count(&self) -> usize {
        self.folders.lock().len()
    }

    fn file_count(&self) -> usize {
        self.files.lock().len()
    }
}

/// Reports half the file, then finishes.
struct TwoStepUpload {
    file: StoredFile,
    halfway: bool,
}

#[async_trait]
impl ResumableUpload for TwoStepUpload {
    async fn next_chunk(&mut self) -> Result<UploadStep, StorageError> {
        if self.halfway {
            return Ok(UploadStep::Done(self.file.clone()));
        }
        self.halfway = true;
        Ok(UploadStep::Progress {
            uploaded: self.file.size / 2,
            total: self.file.size,
        })
    }
}

#[async_trait]
impl CloudStorage for FakeStorage {
    async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<String, StorageError> {
        self.folders
            .lock()
            .push((name.to_string(), parent.map(str::to_string)));
        Ok(format!(
            "folder-{}",
            self.next_folder.fetch_add(1, Ordering::SeqCst) + 1
        ))
    }

    async fn create_file(
        &self,
        path: &Path,
        name: &str,
        parent: Option<&str>,
    ) -> Result<Box<dyn ResumableUpload>, StorageError> {
        self.files
            .lock()
            .push((name.to_string(), parent.map(str::to_string)));
        if self.hang_uploads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let held = self.held_name.lock().as_deref() == Some(name);
        if held {
            self.release_held.notified().await;
        }
        if self.fail_name.lock().as_deref() == Some(name) {
            return Err(StorageError::Api {
                status: 403,
                message: "storageQuotaExceeded".into(),
            });
        }
        let size = tokio::fs::metadata(path).await?.len();
        Ok(Box::new(TwoStepUpload {
            file: StoredFile {
                id: format!("file-{name}"),
                name: name.to_string(),
                size,
                mime_type: None,
                link: Some(format!("https://drive.example/file/{name}")),
            },
            halfway: false,
        }))
    }

    async fn copy_file(&self, _file_id: &str, _parent: Option<&str>) -> Result<StoredFile, StorageError> {
        Err(StorageError::Protocol("copy not supported".into()))
    }

    async fn list(
        &self,
        _query: &str,
        _page_size: u32,
        _page_token: Option<&str>,
    ) -> Result<FileList, StorageError> {
        Ok(FileList::default())
    }

    async fn get_metadata(&self, file_id: &str) -> Result<StoredFile, StorageError> {
        Err(StorageError::Protocol(format!("{file_id} not found")))
    }

    async fn delete(&self, _file_id: &str) -> Result<(), StorageError> {
        Ok(())
    }

    fn folder_link(&self, folder_id: &str) -> String {
        format!("https://drive.example/folders/{folder_id}")
    }
}

#[derive(Default)]
struct RecordingNotifier {
    progress: Mutex<Vec<Vec<ProgressRecord>>>,
    outcomes: Mutex<Vec<(MessageRef, TransferOutcome)>>,
    releases: AtomicUsize,
    rate_limit: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    fn progress_sends(&self) -> usize {
        self.progress.lock().len()
    }

    fn outcomes(&self) -> Vec<(MessageRef, TransferOutcome)> {
        self.outcomes.lock().clone()
    }
}

#[async_trait]
impl TransferNotifier for RecordingNotifier {
    async fn report_progress(
        &self,
        status: &StatusMessage,
        records: &[ProgressRecord],
    ) -> Result<MessageRef, NotifyError> {
        if let Some(wait) = self.rate_limit.lock().take() {
            return Err(NotifyError::RateLimited(wait));
        }
        self.progress.lock().push(records.to_vec());
        Ok(status.progress.unwrap_or(MessageRef {
            chat_id: status.invoker.chat_id,
            message_id: 900,
        }))
    }

    async fn report_outcome(
        &self,
        invoker: MessageRef,
        outcome: &TransferOutcome,
    ) -> Result<(), NotifyError> {
        self.outcomes.lock().push((invoker, outcome.clone()));
        Ok(())
    }

    async fn release(&self, _status: &StatusMessage) -> Result<(), NotifyError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

struct Harness {
    daemon: Arc<FakeDaemon>,
    storage: Arc<FakeStorage>,
    notifier: Arc<RecordingNotifier>,
    orchestrator: Arc<DownloadOrchestrator>,
}

fn harness(upload_concurrency: usize) -> Harness {
    let daemon = Arc::new(FakeDaemon::default());
    let storage = Arc::new(FakeStorage::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let settings = OrchestratorSettings {
        poll_interval: Duration::from_millis(500),
        progress_interval: Duration::from_secs(5),
        upload_concurrency,
        index_link: Some("https://index.example/0:".into()),
    };
    let orchestrator = Arc::new(DownloadOrchestrator::new(
        daemon.clone(),
        storage.clone(),
        notifier.clone(),
        RetryPolicy::immediate(5),
        settings,
    ));
    Harness {
        daemon,
        storage,
        notifier,
        orchestrator,
    }
}

/// A `tellStatus` result in the daemon's stringly-typed encoding.
fn status(gid: &str, state: &str, dir: &Path, files: &[PathBuf], total: u64) -> Value {
    let completed = if state == "complete" { total } else { 0 };
    let files: Vec<Value> = files
        .iter()
        .enumerate()
        .map(|(i, path)| {
            json!({
                "index": (i + 1).to_string(),
                "path": path.to_string_lossy(),
                "length": "1",
                "completedLength": "1",
                "selected": "true",
                "uris": [],
            })
        })
        .collect();
    json!({
        "gid": gid,
        "status": state,
        "totalLength": total.to_string(),
        "completedLength": completed.to_string(),
        "downloadSpeed": "1024",
        "dir": dir.to_string_lossy(),
        "files": files,
    })
}

fn write_files(root: &Path, relative: &[&str]) -> Vec<PathBuf> {
    relative
        .iter()
        .map(|rel| {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, rel.as_bytes()).unwrap();
            path
        })
        .collect()
}

async fn schedule(h: &Harness, uri: &str) -> String {
    h.orchestrator
        .schedule(TransferSource::Uri(uri.into()), INVOKER)
        .await
        .expect("schedule should succeed")
}

async fn notify(h: &Harness, kind: NotificationKind, gid: &str) {
    h.orchestrator
        .handle_notification(DaemonNotification::new(kind, gid))
        .await;
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_file_is_uploaded_once_and_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("ubuntu.iso");
    std::fs::File::create(&file)
        .unwrap()
        .set_len(10 * 1024 * 1024)
        .unwrap();

    let h = harness(4);
    let gid = schedule(&h, "https://mirror.example/ubuntu.iso").await;
    h.daemon.set(
        &gid,
        status(&gid, "active", tmp.path(), &[file.clone()], 10 * 1024 * 1024),
    );
    notify(&h, NotificationKind::Start, &gid).await;
    assert!(h.orchestrator.tracks(&gid).await);

    h.daemon.set(
        &gid,
        status(&gid, "complete", tmp.path(), &[file], 10 * 1024 * 1024),
    );
    notify(&h, NotificationKind::Complete, &gid).await;

    assert_eq!(h.storage.file_count(), 1, "exactly one create_file call");
    assert_eq!(h.storage.folder_count(), 0);

    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1, "exactly one outcome reply");
    let (invoker, outcome) = &outcomes[0];
    assert_eq!(*invoker, INVOKER);
    match outcome {
        TransferOutcome::Uploaded {
            name,
            file,
            index_link,
        } => {
            assert_eq!(name, "ubuntu.iso");
            assert_eq!(file.size, 10 * 1024 * 1024);
            assert_eq!(
                index_link.as_deref(),
                Some("https://index.example/0:/ubuntu.iso")
            );
        }
        other => panic!("expected Uploaded, got {other:?}"),
    }

    assert!(!h.orchestrator.tracks(&gid).await, "entries must be cleared");
    assert_eq!(h.orchestrator.live_count().await, 0);
    assert_eq!(h.notifier.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn directory_upload_mirrors_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let files = write_files(
        &tmp.path().join("album"),
        &[
            "a.txt",
            "b.txt",
            "sub1/c.txt",
            "sub1/deep/d.txt",
            "sub2/e.txt",
        ],
    );

    let h = harness(2);
    let gid = schedule(&h, "magnet:?xt=urn:btih:abc").await;
    h.daemon
        .set(&gid, status(&gid, "complete", tmp.path(), &files, 5));
    notify(&h, NotificationKind::Complete, &gid).await;

    assert_eq!(h.storage.file_count(), 5, "one create_file per file");
    assert_eq!(
        h.storage.folder_count(),
        4,
        "destination folder plus one per subdirectory"
    );

    let folders = h.storage.folders.lock().clone();
    assert_eq!(folders[0], ("album".to_string(), None));
    let deep = folders
        .iter()
        .find(|(name, _)| name == "deep")
        .expect("deep folder created");
    let sub1_index = folders.iter().position(|(name, _)| name == "sub1").unwrap();
    assert_eq!(
        deep.1.as_deref(),
        Some(format!("folder-{}", sub1_index + 1).as_str()),
        "nested folder is created inside its parent"
    );

    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].1,
        TransferOutcome::FolderUploaded {
            name: "album".into(),
            link: "https://drive.example/folders/folder-1".into(),
            index_link: Some("https://index.example/0:/album/".into()),
        }
    );
    assert!(!h.orchestrator.tracks(&gid).await);
}

#[tokio::test]
async fn folder_counter_tracks_walked_files() {
    let tmp = tempfile::tempdir().unwrap();
    let mut files = write_files(
        &tmp.path().join("album"),
        &["a.bin", "b.bin", "c.bin", "extra/partial.bin"],
    );
    // The daemon only reports the first three; the walk still finds four.
    files.truncate(3);

    let h = harness(4);
    *h.storage.held_name.lock() = Some("partial.bin".into());
    let gid = schedule(&h, "magnet:?xt=urn:btih:album").await;
    h.daemon
        .set(&gid, status(&gid, "complete", tmp.path(), &files, 3));

    let orchestrator = Arc::clone(&h.orchestrator);
    let completion = {
        let gid = gid.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_notification(DaemonNotification::new(NotificationKind::Complete, gid))
                .await;
        })
    };

    let mut counter = None;
    for _ in 0..500 {
        let snapshot = h.orchestrator.status_snapshot().await;
        if let Some(ProgressPhase::ComputingFolder { done, total }) =
            snapshot.first().map(|r| r.phase)
        {
            assert!(done <= total, "counter overshot: {done}/{total}");
            if done == 3 {
                counter = Some((done, total));
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(counter, Some((3, 4)), "held file keeps the counter short");
    assert!(h.notifier.outcomes().is_empty());

    h.storage.release_held.notify_one();
    tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .expect("upload should finish once released")
        .unwrap();

    assert_eq!(h.storage.file_count(), 4);
    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert!(
        matches!(&outcomes[0].1, TransferOutcome::FolderUploaded { name, .. } if name == "album"),
        "got {:?}",
        outcomes[0].1
    );
}

#[tokio::test]
async fn repeated_completion_uploads_once() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("debian.iso");
    std::fs::write(&file, b"payload").unwrap();

    let h = harness(1);
    let gid = schedule(&h, "magnet:?xt=urn:btih:debian").await;
    h.daemon
        .set(&gid, status(&gid, "complete", tmp.path(), &[file], 7));

    tokio::join!(
        notify(&h, NotificationKind::Complete, &gid),
        notify(&h, NotificationKind::Complete, &gid),
    );
    notify(&h, NotificationKind::Complete, &gid).await;

    assert_eq!(h.storage.file_count(), 1, "payload uploaded once");
    assert_eq!(h.notifier.outcomes().len(), 1);
    assert!(!h.orchestrator.tracks(&gid).await);
}

#[tokio::test]
async fn late_updates_do_not_revive_finished_transfer() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("notes.txt");
    std::fs::write(&file, b"notes").unwrap();

    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/notes.txt").await;
    h.daemon.set(
        &gid,
        status(&gid, "active", tmp.path(), &[file.clone()], 5),
    );
    notify(&h, NotificationKind::Start, &gid).await;

    h.daemon
        .set(&gid, status(&gid, "complete", tmp.path(), &[file], 5));
    notify(&h, NotificationKind::Complete, &gid).await;
    assert_eq!(h.notifier.releases.load(Ordering::SeqCst), 1);

    notify(&h, NotificationKind::Start, &gid).await;
    notify(&h, NotificationKind::Pause, &gid).await;
    notify(&h, NotificationKind::Stop, &gid).await;

    assert!(!h.orchestrator.tracks(&gid).await);
    assert_eq!(h.orchestrator.live_count().await, 0);
    assert!(h.orchestrator.status_snapshot().await.is_empty());
    assert_eq!(h.storage.file_count(), 1);
}

#[tokio::test]
async fn failed_file_fails_the_folder_upload() {
    let tmp = tempfile::tempdir().unwrap();
    let files = write_files(&tmp.path().join("set"), &["one.bin", "two.bin"]);

    let h = harness(1);
    *h.storage.fail_name.lock() = Some("two.bin".into());
    let gid = schedule(&h, "https://mirror.example/set").await;
    h.daemon
        .set(&gid, status(&gid, "complete", tmp.path(), &files, 2));
    notify(&h, NotificationKind::Complete, &gid).await;

    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0].1 {
        TransferOutcome::UploadFailed { name, error } => {
            assert_eq!(name, "set");
            assert!(error.contains("storageQuotaExceeded"), "got {error}");
        }
        other => panic!("expected UploadFailed, got {other:?}"),
    }
    assert!(!h.orchestrator.tracks(&gid).await);
}

#[tokio::test]
async fn cancel_during_folder_upload_stops_walk_and_clears_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let names: Vec<String> = (0..20).map(|i| format!("f{i:02}.bin")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let files = write_files(&tmp.path().join("big"), &refs);

    let h = harness(1);
    h.storage.hang_uploads.store(true, Ordering::SeqCst);
    let gid = schedule(&h, "https://mirror.example/big").await;
    h.daemon
        .set(&gid, status(&gid, "complete", tmp.path(), &files, 20));

    let orchestrator = Arc::clone(&h.orchestrator);
    let completion = {
        let gid = gid.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_notification(DaemonNotification::new(NotificationKind::Complete, gid))
                .await;
        })
    };

    for _ in 0..200 {
        if h.storage.file_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.storage.file_count(), 1, "first upload should be in flight");

    h.orchestrator.cancel(&gid).await.unwrap();
    let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
    h.orchestrator.tick(&mut throttle).await;

    tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .expect("upload should stop after cancel")
        .unwrap();

    assert!(!h.orchestrator.tracks(&gid).await, "no entries left for gid");
    assert_eq!(
        h.storage.file_count(),
        1,
        "no further uploads after cancellation"
    );
    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].1,
        TransferOutcome::Aborted { name: "big".into() }
    );
}

#[tokio::test]
async fn cancelling_active_download_force_pauses_then_removes() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/file.bin").await;
    h.daemon.set(
        &gid,
        status(&gid, "active", tmp.path(), &[tmp.path().join("file.bin")], 100),
    );
    notify(&h, NotificationKind::Start, &gid).await;

    h.orchestrator.cancel(&gid).await.unwrap();
    let calls = h.daemon.calls();
    assert_eq!(
        &calls[1..],
        &[format!("forcePause {gid}"), format!("forceRemove {gid}")]
    );

    let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
    h.orchestrator.tick(&mut throttle).await;
    assert!(!h.orchestrator.tracks(&gid).await);
    assert_eq!(h.notifier.releases.load(Ordering::SeqCst), 1);
    assert_eq!(h.notifier.progress_sends(), 0);
}

#[tokio::test]
async fn finished_metadata_cannot_be_cancelled() {
    let h = harness(1);
    let mut meta = status(
        "meta1",
        "complete",
        Path::new("/downloads"),
        &[PathBuf::from("[METADATA]abc")],
        0,
    );
    meta["followedBy"] = json!(["g9"]);
    h.daemon.set("meta1", meta);

    let err = h.orchestrator.cancel("meta1").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::FinishedMetadata { .. }));
    assert_eq!(
        err.to_string(),
        "__GID belongs to finished Metadata, can't be abort.__"
    );
}

#[tokio::test]
async fn metadata_owner_follows_payload_gid() {
    let tmp = tempfile::tempdir().unwrap();
    let payload = tmp.path().join("movie.mkv");
    std::fs::write(&payload, b"frames").unwrap();

    let h = harness(1);
    let meta_gid = schedule(&h, "magnet:?xt=urn:btih:def").await;
    let mut meta = status(
        &meta_gid,
        "complete",
        tmp.path(),
        &[PathBuf::from("[METADATA]def")],
        0,
    );
    meta["followedBy"] = json!(["payload1"]);
    h.daemon.set(&meta_gid, meta);
    notify(&h, NotificationKind::Complete, &meta_gid).await;

    assert!(h.notifier.outcomes().is_empty(), "metadata is not uploaded");
    assert_eq!(h.storage.file_count(), 0);

    h.daemon.set(
        "payload1",
        status("payload1", "complete", tmp.path(), &[payload], 6),
    );
    notify(&h, NotificationKind::Complete, "payload1").await;

    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, INVOKER, "payload reports to the magnet's invoker");
    assert!(matches!(outcomes[0].1, TransferOutcome::Uploaded { .. }));
}

#[tokio::test]
async fn download_error_is_reported_with_code() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/missing.bin").await;
    let mut failed = status(&gid, "error", tmp.path(), &[tmp.path().join("missing.bin")], 0);
    failed["errorCode"] = json!("3");
    failed["errorMessage"] = json!("Resource not found");
    h.daemon.set(&gid, failed);

    notify(&h, NotificationKind::Error, &gid).await;

    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0].1 {
        TransferOutcome::Failed {
            error_code,
            error_message,
            ..
        } => {
            assert_eq!(*error_code, Some(3));
            assert_eq!(error_message, "Resource not found");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(!h.orchestrator.tracks(&gid).await);
    assert_eq!(h.notifier.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_status_failures_are_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/retry.bin").await;
    h.daemon.set(
        &gid,
        status(&gid, "active", tmp.path(), &[tmp.path().join("retry.bin")], 10),
    );
    h.daemon.transient_failures.store(2, Ordering::SeqCst);

    notify(&h, NotificationKind::Start, &gid).await;

    assert_eq!(h.daemon.status_calls.load(Ordering::SeqCst), 3);
    assert!(h.orchestrator.tracks(&gid).await);
    assert!(h.notifier.outcomes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn progress_is_sent_at_most_once_per_interval() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/slow.bin").await;
    h.daemon.set(
        &gid,
        status(&gid, "active", tmp.path(), &[tmp.path().join("slow.bin")], 1000),
    );
    notify(&h, NotificationKind::Start, &gid).await;

    let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
    for _ in 0..20 {
        h.orchestrator.tick(&mut throttle).await;
        tokio::time::advance(Duration::from_millis(500)).await;
    }

    // Ticks span 0s..=9.5s: sends at 0s and 5s only.
    assert_eq!(h.notifier.progress_sends(), 2);
    let first = &h.notifier.progress.lock()[0];
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].gid, gid);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_progress_returns_wait() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/busy.bin").await;
    h.daemon.set(
        &gid,
        status(&gid, "active", tmp.path(), &[tmp.path().join("busy.bin")], 1000),
    );
    notify(&h, NotificationKind::Start, &gid).await;
    *h.notifier.rate_limit.lock() = Some(Duration::from_secs(3));

    let mut throttle = ProgressThrottle::new(Duration::from_secs(5));
    assert_eq!(
        h.orchestrator.tick(&mut throttle).await,
        Some(Duration::from_secs(3))
    );
    // The throttle was not marked, so the next tick sends right away.
    assert_eq!(h.orchestrator.tick(&mut throttle).await, None);
    assert_eq!(h.notifier.progress_sends(), 1);
}

#[tokio::test]
async fn removed_transfer_is_dropped_on_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let h = harness(1);
    let gid = schedule(&h, "https://mirror.example/gone.bin").await;
    let path = tmp.path().join("gone.bin");
    h.daemon
        .set(&gid, status(&gid, "active", tmp.path(), &[path.clone()], 10));
    notify(&h, NotificationKind::Start, &gid).await;

    h.daemon
        .set(&gid, status(&gid, "removed", tmp.path(), &[path], 10));
    notify(&h, NotificationKind::Stop, &gid).await;

    assert!(!h.orchestrator.tracks(&gid).await);
    assert_eq!(h.notifier.releases.load(Ordering::SeqCst), 1);
    assert!(h.notifier.outcomes().is_empty());
}
