use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Top-level config ─────────────────────────────────────────────

/// Runtime configuration, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path the config was loaded from. Computed, never serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub downloads: DownloadsConfig,

    #[serde(default)]
    pub drive: DriveConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,
}

// ── Telegram ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// The only user besides `sudo_users` allowed to run commands.
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default)]
    pub sudo_users: Vec<i64>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Long-poll timeout passed to `getUpdates`.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_command_prefix() -> String {
    "/".into()
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            owner_id: 0,
            sudo_users: Vec::new(),
            command_prefix: default_command_prefix(),
            api_base: default_telegram_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl TelegramConfig {
    pub fn is_authorized(&self, user_id: i64) -> bool {
        (self.owner_id != 0 && user_id == self.owner_id) || self.sudo_users.contains(&user_id)
    }
}

// ── Downloads (aria2) ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadsConfig {
    /// Disable to run the bot without the mirror plugin.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,
    #[serde(default = "default_aria2_rpc_url")]
    pub aria2_rpc_url: String,
    #[serde(default = "default_aria2_ws_url")]
    pub aria2_ws_url: String,
    #[serde(default)]
    pub aria2_secret: Option<String>,
    /// Orchestrator tick, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Minimum gap between two progress edits of the status message.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    /// Size of the per-directory upload pool.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default)]
    pub seed_enabled: bool,
    #[serde(default = "default_seed_timeout_secs")]
    pub seed_timeout_secs: u64,
    #[serde(default = "default_seed_ratio")]
    pub seed_ratio: f64,
}

fn default_true() -> bool {
    true
}

fn default_download_path() -> PathBuf {
    UserDirs::new().map_or_else(
        || PathBuf::from("downloads"),
        |u| u.home_dir().join(".mirrorbot").join("downloads"),
    )
}

fn default_aria2_rpc_url() -> String {
    "http://127.0.0.1:6800/jsonrpc".into()
}

fn default_aria2_ws_url() -> String {
    "ws://127.0.0.1:6800/jsonrpc".into()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_progress_interval_secs() -> u64 {
    5
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_seed_timeout_secs() -> u64 {
    3600
}

fn default_seed_ratio() -> f64 {
    1.0
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            download_path: default_download_path(),
            aria2_rpc_url: default_aria2_rpc_url(),
            aria2_ws_url: default_aria2_ws_url(),
            aria2_secret: None,
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_secs: default_progress_interval_secs(),
            upload_concurrency: default_upload_concurrency(),
            seed_enabled: false,
            seed_timeout_secs: default_seed_timeout_secs(),
            seed_ratio: default_seed_ratio(),
        }
    }
}

impl DownloadsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

// ── Google Drive ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// OAuth bearer token for the Drive v3 API.
    #[serde(default)]
    pub access_token: String,
    /// Folder every mirror lands in when no explicit parent is given.
    #[serde(default)]
    pub parent_folder_id: Option<String>,
    /// Optional public index base URL; the uploaded name is appended.
    #[serde(default)]
    pub index_link: Option<String>,
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
    #[serde(default = "default_drive_api_base")]
    pub api_base: String,
    #[serde(default = "default_drive_upload_base")]
    pub upload_base: String,
}

fn default_chunk_size_mb() -> u64 {
    50
}

fn default_drive_api_base() -> String {
    "https://www.googleapis.com/drive/v3".into()
}

fn default_drive_upload_base() -> String {
    "https://www.googleapis.com/upload/drive/v3".into()
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            parent_folder_id: None,
            index_link: None,
            chunk_size_mb: default_chunk_size_mb(),
            api_base: default_drive_api_base(),
            upload_base: default_drive_upload_base(),
        }
    }
}

impl DriveConfig {
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb.max(1) * 1024 * 1024
    }
}

// ── Reliability / supervision ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Attempts per daemon RPC before the failure is surfaced.
    #[serde(default = "default_rpc_max_attempts")]
    pub rpc_max_attempts: u32,
    #[serde(default = "default_rpc_backoff_min_secs")]
    pub rpc_backoff_min_secs: f64,
    #[serde(default = "default_rpc_backoff_max_secs")]
    pub rpc_backoff_max_secs: f64,
    #[serde(default = "default_rpc_backoff_multiplier")]
    pub rpc_backoff_multiplier: f64,
    /// Initial backoff for platform/notification listener restarts.
    #[serde(default = "default_listener_backoff_secs")]
    pub listener_initial_backoff_secs: u64,
    /// Max backoff for platform/notification listener restarts.
    #[serde(default = "default_listener_backoff_max_secs")]
    pub listener_max_backoff_secs: u64,
}

fn default_rpc_max_attempts() -> u32 {
    5
}

fn default_rpc_backoff_min_secs() -> f64 {
    3.0
}

fn default_rpc_backoff_max_secs() -> f64 {
    6.0
}

fn default_rpc_backoff_multiplier() -> f64 {
    2.0
}

fn default_listener_backoff_secs() -> u64 {
    2
}

fn default_listener_backoff_max_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            rpc_max_attempts: default_rpc_max_attempts(),
            rpc_backoff_min_secs: default_rpc_backoff_min_secs(),
            rpc_backoff_max_secs: default_rpc_backoff_max_secs(),
            rpc_backoff_multiplier: default_rpc_backoff_multiplier(),
            listener_initial_backoff_secs: default_listener_backoff_secs(),
            listener_max_backoff_secs: default_listener_backoff_max_secs(),
        }
    }
}

// ── Conversations ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_conversation_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_conversation_max_messages")]
    pub default_max_messages: usize,
}

fn default_conversation_timeout_secs() -> u64 {
    7
}

fn default_conversation_max_messages() -> usize {
    7
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_conversation_timeout_secs(),
            default_max_messages: default_conversation_max_messages(),
        }
    }
}

impl ConversationConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Load `~/.mirrorbot/config.toml`, writing defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let mirrorbot_dir = home.join(".mirrorbot");

        if !mirrorbot_dir.exists() {
            fs::create_dir_all(&mirrorbot_dir).context("Failed to create .mirrorbot directory")?;
        }

        Self::load_from(&mirrorbot_dir.join("config.toml"))
    }

    /// Load a config from an explicit path, writing defaults when it does
    /// not exist yet.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.to_path_buf();
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path.to_path_buf();
            config.save()?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("MIRRORBOT_BOT_TOKEN") {
            if !token.is_empty() {
                self.telegram.bot_token = token;
            }
        }

        if let Ok(owner) = std::env::var("MIRRORBOT_OWNER_ID") {
            match owner.trim().parse::<i64>() {
                Ok(id) => self.telegram.owner_id = id,
                Err(_) if owner.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring MIRRORBOT_OWNER_ID={owner:?}: {e}"),
            }
        }

        if let Ok(token) = std::env::var("MIRRORBOT_DRIVE_TOKEN") {
            if !token.is_empty() {
                self.drive.access_token = token;
            }
        }

        if let Ok(path) = std::env::var("MIRRORBOT_DOWNLOAD_PATH") {
            if !path.is_empty() {
                self.downloads.download_path = PathBuf::from(path);
            }
        }

        if let Ok(url) = std::env::var("MIRRORBOT_ARIA2_URL") {
            if !url.is_empty() {
                self.downloads.aria2_rpc_url = url;
            }
        }

        if let Ok(secret) = std::env::var("MIRRORBOT_ARIA2_SECRET") {
            if !secret.is_empty() {
                self.downloads.aria2_secret = Some(secret);
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }
        fs::write(&self.config_path, toml_str).context("Failed to write config file")?;
        Ok(())
    }

    /// Every configured secret, for scrubbing outgoing replies.
    pub fn secrets(&self) -> Vec<String> {
        let mut secrets = vec![self.telegram.bot_token.clone(), self.drive.access_token.clone()];
        if let Some(secret) = &self.downloads.aria2_secret {
            secrets.push(secret.clone());
        }
        secrets.retain(|s| !s.is_empty());
        secrets
    }

    /// Serialized config with secrets masked, for `mirrorbot config`.
    pub fn masked_toml(&self) -> Result<String> {
        let rendered = toml::to_string_pretty(self).context("Failed to serialize config")?;
        Ok(crate::util::redact(&rendered, &self.secrets()))
    }
}
