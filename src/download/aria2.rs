use async_trait::async_trait;
use base64::Engine as _;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::daemon::{DaemonError, DaemonNotification, DownloadDaemon, NotificationKind};
use super::transfer::Transfer;
use crate::config::DownloadsConfig;

/// aria2 JSON-RPC client over HTTP.
pub struct Aria2Client {
    rpc_url: String,
    secret: Option<String>,
    next_id: AtomicU64,
    client: reqwest::Client,
}

impl Aria2Client {
    pub fn new(rpc_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            secret: secret.filter(|s| !s.is_empty()),
            next_id: AtomicU64::new(1),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &DownloadsConfig) -> Self {
        Self::new(config.aria2_rpc_url.clone(), config.aria2_secret.clone())
    }

    fn request_body(&self, method: &str, params: Vec<Value>) -> Value {
        let mut all = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all.push(Value::String(format!("token:{secret}")));
        }
        all.extend(params);
        json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed).to_string(),
            "method": format!("aria2.{method}"),
            "params": all,
        })
    }

    /// Issue one RPC call. Connection failures and 5xx answers are
    /// transient; an `error` object is an RPC error.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, DaemonError> {
        let body = self.request_body(method, params);
        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DaemonError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(DaemonError::Transient(format!("aria2 answered {status}")));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| DaemonError::Protocol(format!("{method}: {e}")))?;

        if let Some(error) = data.get("error") {
            return Err(DaemonError::Rpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown aria2 error")
                    .to_string(),
            });
        }
        data.get("result")
            .cloned()
            .ok_or_else(|| DaemonError::Protocol(format!("{method}: response without result")))
    }

    async fn call_for_gid(&self, method: &str, params: Vec<Value>) -> Result<String, DaemonError> {
        match self.call(method, params).await? {
            Value::String(gid) => Ok(gid),
            other => Err(DaemonError::Protocol(format!(
                "{method}: expected gid, got {other}"
            ))),
        }
    }

    pub async fn get_version(&self) -> Result<String, DaemonError> {
        let result = self.call("getVersion", vec![]).await?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl DownloadDaemon for Aria2Client {
    async fn add_uri(&self, uris: &[String]) -> Result<String, DaemonError> {
        self.call_for_gid("addUri", vec![json!(uris)]).await
    }

    async fn add_torrent(&self, torrent: &[u8]) -> Result<String, DaemonError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(torrent);
        self.call_for_gid("addTorrent", vec![Value::String(encoded)]).await
    }

    async fn tell_status(&self, gid: &str) -> Result<Transfer, DaemonError> {
        let result = self.call("tellStatus", vec![json!(gid)]).await?;
        Transfer::from_status(&result)
    }

    async fn pause(&self, gid: &str, force: bool) -> Result<String, DaemonError> {
        let method = if force { "forcePause" } else { "pause" };
        self.call_for_gid(method, vec![json!(gid)]).await
    }

    async fn remove(&self, gid: &str, force: bool) -> Result<String, DaemonError> {
        let method = if force { "forceRemove" } else { "remove" };
        self.call_for_gid(method, vec![json!(gid)]).await
    }

    async fn unpause(&self, gid: &str) -> Result<String, DaemonError> {
        self.call_for_gid("unpause", vec![json!(gid)]).await
    }
}

/// Decode one WebSocket frame into a lifecycle notification.
pub fn parse_notification(frame: &str) -> Option<DaemonNotification> {
    let data: Value = serde_json::from_str(frame).ok()?;
    let kind = NotificationKind::from_method(data.get("method")?.as_str()?)?;
    let gid = data
        .get("params")?
        .as_array()?
        .first()?
        .get("gid")?
        .as_str()?;
    Some(DaemonNotification::new(kind, gid))
}

/// Forward aria2 push notifications from `ws_url` into `tx` until the
/// socket closes or the receiver is dropped.
pub async fn listen_notifications(
    ws_url: &str,
    tx: mpsc::Sender<DaemonNotification>,
) -> anyhow::Result<()> {
    tracing::info!("aria2: connecting to notification socket...");
    let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
    let (_write, mut read) = ws_stream.split();
    tracing::info!("aria2: listening for download notifications...");

    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!("aria2 WebSocket error: {e}");
                break;
            }
            _ => continue,
        };

        let Some(notification) = parse_notification(text.as_str()) else {
            continue;
        };
        tracing::debug!(gid = %notification.gid, kind = %notification.kind, "aria2 notification");
        if tx.send(notification).await.is_err() {
            return Ok(());
        }
    }

    anyhow::bail!("aria2 notification socket closed")
}
