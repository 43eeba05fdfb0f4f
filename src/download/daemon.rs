use async_trait::async_trait;
use std::fmt;

use super::transfer::Transfer;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonError {
    /// Daemon not reachable or not ready yet; worth retrying.
    #[error("download daemon unavailable: {0}")]
    Transient(String),
    /// Well-formed error response from the daemon.
    #[error("{message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected daemon response: {0}")]
    Protocol(String),
}

impl DaemonError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// User-facing text, with `gid` quoted wherever the message mentions it.
    pub fn user_message(&self, gid: Option<&str>) -> String {
        let text = match self {
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let text = match gid {
            Some(gid) if !gid.is_empty() && text.contains(gid) => {
                text.replace(gid, &format!("'{gid}'"))
            }
            _ => text,
        };
        format!("__{text}__")
    }
}

/// Push notification kinds emitted by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Start,
    Pause,
    Stop,
    Error,
    Complete,
}

impl NotificationKind {
    /// Map a JSON-RPC notification method such as `aria2.onDownloadStart`.
    pub fn from_method(method: &str) -> Option<Self> {
        match method.strip_prefix("aria2.").unwrap_or(method) {
            "onDownloadStart" => Some(Self::Start),
            "onDownloadPause" => Some(Self::Pause),
            "onDownloadStop" => Some(Self::Stop),
            "onDownloadError" => Some(Self::Error),
            "onDownloadComplete" => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "onDownloadStart",
            Self::Pause => "onDownloadPause",
            Self::Stop => "onDownloadStop",
            Self::Error => "onDownloadError",
            Self::Complete => "onDownloadComplete",
        };
        f.write_str(name)
    }
}

/// Lifecycle notification for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonNotification {
    pub kind: NotificationKind,
    pub gid: String,
}

impl DaemonNotification {
    pub fn new(kind: NotificationKind, gid: impl Into<String>) -> Self {
        Self {
            kind,
            gid: gid.into(),
        }
    }
}

/// Control surface of the download daemon.
#[async_trait]
pub trait DownloadDaemon: Send + Sync {
    /// Queue a download from one or more mirrors of the same resource.
    async fn add_uri(&self, uris: &[String]) -> Result<String, DaemonError>;

    /// Queue a download from raw `.torrent` bytes.
    async fn add_torrent(&self, torrent: &[u8]) -> Result<String, DaemonError>;

    async fn tell_status(&self, gid: &str) -> Result<Transfer, DaemonError>;

    async fn pause(&self, gid: &str, force: bool) -> Result<String, DaemonError>;

    async fn remove(&self, gid: &str, force: bool) -> Result<String, DaemonError>;

    async fn unpause(&self, gid: &str) -> Result<String, DaemonError>;
}
