use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::DownloadsConfig;

/// Background `aria2c` seeders for finished torrents, keyed by gid.
pub struct Seeder {
    enabled: bool,
    timeout: Duration,
    ratio: f64,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Seeder {
    pub fn from_config(config: &DownloadsConfig) -> Self {
        Self {
            enabled: config.seed_enabled,
            timeout: Duration::from_secs(config.seed_timeout_secs),
            ratio: config.seed_ratio,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            timeout: Duration::ZERO,
            ratio: 0.0,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Seed the torrent saved as `{dir}/{info_hash}.torrent`. Returns false
    /// when seeding is disabled or a seeder for `gid` is still running.
    pub fn seed(&self, gid: &str, dir: &Path, info_hash: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(gid) {
            return false;
        }

        let torrent = dir.join(format!("{info_hash}.torrent"));
        let timeout = self.timeout;
        let ratio = self.ratio;
        let owned_gid = gid.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = run_seed(&owned_gid, &torrent, timeout, ratio).await {
                tracing::warn!(gid = %owned_gid, "Seeding failed: {e}");
            }
        });
        tasks.insert(gid.to_string(), handle);
        true
    }

    /// Number of seeders still running.
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }

    pub fn stop_all(&self) {
        for (gid, handle) in self.tasks.lock().drain() {
            tracing::debug!(gid = %gid, "Stopping seeder");
            handle.abort();
        }
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

fn seed_command(torrent: &Path, port: u16, ratio: f64) -> Command {
    let mut cmd = Command::new("aria2c");
    cmd.arg("--enable-rpc")
        .arg("--rpc-listen-all=false")
        .arg(format!("--rpc-listen-port={port}"))
        .arg("--bt-seed-unverified=true")
        .arg(format!("--seed-ratio={ratio}"))
        .arg("-i")
        .arg(torrent)
        .kill_on_drop(true);
    cmd
}

async fn run_seed(gid: &str, torrent: &Path, timeout: Duration, ratio: f64) -> anyhow::Result<()> {
    if !tokio::fs::try_exists(torrent).await? {
        anyhow::bail!("torrent file {} not found", torrent.display());
    }
    let port = free_port()?;
    let mut child = seed_command(torrent, port, ratio).spawn()?;
    tracing::info!(gid, port, "Seeding started");

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => tracing::info!(gid, "Seeding finished: {}", status?),
        Err(_) => {
            child.kill().await?;
            tracing::info!(gid, "Seeding stopped after {}s", timeout.as_secs());
        }
    }
    Ok(())
}
