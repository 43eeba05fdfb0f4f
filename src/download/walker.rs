use futures_util::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::storage::{CloudStorage, StorageError};

/// One file to upload into an already created remote folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub path: PathBuf,
    pub name: String,
    /// Remote folder id.
    pub parent: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files: usize,
    pub folders: usize,
    /// False when the walk stopped early.
    pub finished: bool,
}

/// A running directory walk. Jobs arrive on `jobs`; dropping the receiver
/// or cancelling the token stops the walker.
pub struct TreeWalk {
    pub jobs: mpsc::Receiver<UploadJob>,
    pub handle: JoinHandle<Result<WalkSummary, StorageError>>,
}

/// Walk `root` depth-first in name order, mirroring every subdirectory as a
/// remote folder below `parent_id` and queueing one job per file.
///
/// The number of files the walk will queue is stored in `total` before the
/// first job is sent.
pub fn spawn_walk(
    storage: Arc<dyn CloudStorage>,
    root: PathBuf,
    parent_id: String,
    token: CancellationToken,
    capacity: usize,
    total: Arc<AtomicUsize>,
) -> TreeWalk {
    let (tx, jobs) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        total.store(count_files(root.clone()).await?, Ordering::SeqCst);
        let mut summary = WalkSummary::default();
        summary.finished = walk_dir(
            storage.as_ref(),
            root,
            parent_id,
            &tx,
            &token,
            &mut summary,
        )
        .await?;
        tracing::debug!(
            files = summary.files,
            folders = summary.folders,
            finished = summary.finished,
            "Directory walk ended"
        );
        Ok(summary)
    });
    TreeWalk { jobs, handle }
}

struct Entry {
    name: String,
    path: PathBuf,
    is_dir: bool,
}

async fn read_sorted(dir: &Path) -> Result<Vec<Entry>, StorageError> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        let is_dir = if file_type.is_symlink() {
            // Linked directories are not followed.
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => false,
                _ => continue,
            }
        } else if file_type.is_dir() {
            true
        } else if file_type.is_file() {
            false
        } else {
            continue;
        };
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            is_dir,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Files below `dir`, following the same rules as [`walk_dir`].
fn count_files(dir: PathBuf) -> BoxFuture<'static, Result<usize, StorageError>> {
    Box::pin(async move {
        let mut files = 0;
        for entry in read_sorted(&dir).await? {
            files += if entry.is_dir {
                count_files(entry.path).await?
            } else {
                1
            };
        }
        Ok(files)
    })
}

/// Returns `Ok(false)` when stopped by cancellation or a closed queue.
fn walk_dir<'a>(
    storage: &'a dyn CloudStorage,
    dir: PathBuf,
    parent: String,
    tx: &'a mpsc::Sender<UploadJob>,
    token: &'a CancellationToken,
    summary: &'a mut WalkSummary,
) -> BoxFuture<'a, Result<bool, StorageError>> {
    Box::pin(async move {
        for entry in read_sorted(&dir).await? {
            if token.is_cancelled() {
                return Ok(false);
            }

            if entry.is_dir {
                let folder_id = storage.create_folder(&entry.name, Some(&parent)).await?;
                summary.folders += 1;
                if !walk_dir(storage, entry.path, folder_id, tx, token, summary).await? {
                    return Ok(false);
                }
                continue;
            }

            let job = UploadJob {
                path: entry.path,
                name: entry.name,
                parent: parent.clone(),
            };
            tokio::select! {
                biased;
                () = token.cancelled() => return Ok(false),
                sent = tx.send(job) => {
                    if sent.is_err() {
                        return Ok(false);
                    }
                }
            }
            summary.files += 1;
        }
        Ok(true)
    })
}
