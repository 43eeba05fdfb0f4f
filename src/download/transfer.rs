use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::daemon::DaemonError;

/// Lifecycle state reported by the download daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Waiting,
    Active,
    Paused,
    Error,
    Complete,
    Removed,
}

impl TransferStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "error" => Some(Self::Error),
            "complete" => Some(Self::Complete),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Removed => "removed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Complete | Self::Removed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    pub index: u32,
    pub path: PathBuf,
    pub length: u64,
    pub completed_length: u64,
    pub selected: bool,
    pub uris: Vec<String>,
}

impl TransferFile {
    /// Placeholder entry the daemon uses while fetching torrent metadata.
    pub fn is_metadata(&self) -> bool {
        self.path.to_string_lossy().starts_with("[METADATA]")
    }
}

/// Torrent information attached to BitTorrent transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitTorrentInfo {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub mode: Option<String>,
}

/// Live state of one transfer, as last reported by the daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub gid: String,
    pub status: TransferStatus,
    pub total_length: u64,
    pub completed_length: u64,
    pub download_speed: u64,
    pub dir: PathBuf,
    pub files: Vec<TransferFile>,
    /// Gids of transfers spawned from this one (metadata → payload).
    pub followed_by: Vec<String>,
    pub bittorrent: Option<BitTorrentInfo>,
    pub info_hash: Option<String>,
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
    /// Set once the completed payload is known to be a directory.
    pub is_directory: bool,
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

/// The daemon encodes every number as a decimal string.
fn num_field(data: &Value, key: &str) -> u64 {
    match data.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
        _ => 0,
    }
}

impl Transfer {
    /// Build a transfer from a `tellStatus` result.
    pub fn from_status(data: &Value) -> Result<Self, DaemonError> {
        let gid = str_field(data, "gid")
            .ok_or_else(|| DaemonError::Protocol("status without gid".into()))?
            .to_string();
        let status = str_field(data, "status")
            .and_then(TransferStatus::parse)
            .ok_or_else(|| DaemonError::Protocol(format!("unknown status for gid {gid}")))?;

        let files = data
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .map(|f| TransferFile {
                        index: u32::try_from(num_field(f, "index")).unwrap_or_default(),
                        path: PathBuf::from(str_field(f, "path").unwrap_or_default()),
                        length: num_field(f, "length"),
                        completed_length: num_field(f, "completedLength"),
                        selected: str_field(f, "selected") != Some("false"),
                        uris: f
                            .get("uris")
                            .and_then(Value::as_array)
                            .map(|uris| {
                                uris.iter()
                                    .filter_map(|u| str_field(u, "uri").map(str::to_string))
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let bittorrent = data.get("bittorrent").map(|bt| BitTorrentInfo {
            name: bt
                .get("info")
                .and_then(|info| str_field(info, "name"))
                .map(str::to_string),
            comment: str_field(bt, "comment").map(str::to_string),
            mode: str_field(bt, "mode").map(str::to_string),
        });

        Ok(Self {
            gid,
            status,
            total_length: num_field(data, "totalLength"),
            completed_length: num_field(data, "completedLength"),
            download_speed: num_field(data, "downloadSpeed"),
            dir: PathBuf::from(str_field(data, "dir").unwrap_or_default()),
            files,
            followed_by: data
                .get("followedBy")
                .and_then(Value::as_array)
                .map(|gids| {
                    gids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            bittorrent,
            info_hash: str_field(data, "infoHash").map(str::to_string),
            error_code: str_field(data, "errorCode").and_then(|c| c.parse().ok()),
            error_message: str_field(data, "errorMessage")
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            is_directory: false,
        })
    }

    /// A metadata-only transfer whose payload continues under another gid.
    pub fn is_metadata(&self) -> bool {
        !self.followed_by.is_empty()
    }

    /// Display name: torrent name, metadata placeholder, the first path
    /// component below the download dir, or the URI tail.
    pub fn name(&self) -> String {
        if let Some(name) = self.bittorrent.as_ref().and_then(|bt| bt.name.clone()) {
            return name;
        }

        let Some(first) = self.files.first() else {
            return self.gid.clone();
        };
        if first.is_metadata() {
            return first.path.to_string_lossy().into_owned();
        }

        if let Ok(relative) = first.path.strip_prefix(&self.dir) {
            if let Some(component) = relative.components().next() {
                return component.as_os_str().to_string_lossy().into_owned();
            }
        }

        first
            .uris
            .first()
            .and_then(|uri| uri.rsplit('/').next())
            .filter(|tail| !tail.is_empty())
            .map_or_else(|| self.gid.clone(), str::to_string)
    }

    /// Local path of the downloaded payload.
    pub fn local_path(&self) -> PathBuf {
        self.dir.join(self.name())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Completed fraction in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total_length == 0 {
            0.0
        } else {
            self.completed_length as f64 / self.total_length as f64
        }
    }

    /// Remaining time at the current speed; `None` while stalled.
    pub fn eta(&self) -> Option<Duration> {
        if self.download_speed == 0 {
            return None;
        }
        let remaining = self.total_length.saturating_sub(self.completed_length);
        Some(Duration::from_secs(remaining.div_ceil(self.download_speed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_status() -> Value {
        json!({
            "gid": "2089b05ecca3d829",
            "status": "active",
            "totalLength": "10485760",
            "completedLength": "2621440",
            "downloadSpeed": "1048576",
            "dir": "/downloads",
            "files": [{
                "index": "1",
                "path": "/downloads/ubuntu.iso",
                "length": "10485760",
                "completedLength": "2621440",
                "selected": "true",
                "uris": [{ "uri": "https://mirror.example/ubuntu.iso", "status": "used" }]
            }]
        })
    }

    #[test]
    fn parses_string_encoded_numbers() {
        let t = Transfer::from_status(&http_status()).unwrap();
        assert_eq!(t.status, TransferStatus::Active);
        assert_eq!(t.total_length, 10 * 1024 * 1024);
        assert_eq!(t.files.len(), 1);
        assert!(t.files[0].selected);
        assert!(!t.is_metadata());
        assert!((t.progress() - 0.25).abs() < f64::EPSILON);
        assert_eq!(t.eta(), Some(Duration::from_secs(8)));
    }

    #[test]
    fn name_uses_first_component_under_dir() {
        let mut status = http_status();
        status["files"][0]["path"] = json!("/downloads/album/disc1/track.flac");
        let t = Transfer::from_status(&status).unwrap();
        assert_eq!(t.name(), "album");
        assert_eq!(t.local_path(), PathBuf::from("/downloads/album"));
    }

    #[test]
    fn name_prefers_torrent_info() {
        let mut status = http_status();
        status["bittorrent"] = json!({ "info": { "name": "Some Torrent" }, "mode": "multi" });
        let t = Transfer::from_status(&status).unwrap();
        assert_eq!(t.name(), "Some Torrent");
        assert_eq!(t.bittorrent.unwrap().mode.as_deref(), Some("multi"));
    }

    #[test]
    fn name_falls_back_to_uri_tail() {
        let mut status = http_status();
        status["files"][0]["path"] = json!("");
        let t = Transfer::from_status(&status).unwrap();
        assert_eq!(t.name(), "ubuntu.iso");
    }

    #[test]
    fn metadata_transfer_is_detected() {
        let status = json!({
            "gid": "a1",
            "status": "complete",
            "totalLength": "0",
            "completedLength": "0",
            "downloadSpeed": "0",
            "dir": "/downloads",
            "followedBy": ["b2"],
            "files": [{ "index": "1", "path": "[METADATA]abcdef", "length": "0",
                        "completedLength": "0", "selected": "true", "uris": [] }]
        });
        let t = Transfer::from_status(&status).unwrap();
        assert!(t.is_metadata());
        assert_eq!(t.name(), "[METADATA]abcdef");
        assert_eq!(t.eta(), None);
        assert_eq!(t.progress(), 0.0);
    }

    #[test]
    fn unknown_status_is_a_protocol_error() {
        let err = Transfer::from_status(&json!({ "gid": "x", "status": "exploded" })).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }
}
