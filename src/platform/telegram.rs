use super::traits::{
    CallbackQuery, ChatPlatform, InboundMessage, InlineQuery, MessageRef, PlatformError, Update,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Update kinds `getUpdates` can be asked for beyond plain messages.
const OPTIONAL_UPDATE_KINDS: [&str; 2] = ["callback_query", "inline_query"];

/// Telegram platform backed by Bot API long polling
pub struct TelegramPlatform {
    bot_token: String,
    api_base: String,
    poll_timeout_secs: u64,
    client: reqwest::Client,
}

impl TelegramPlatform {
    pub fn new(bot_token: String) -> Self {
        Self::with_api_base(bot_token, "https://api.telegram.org".into(), 30)
    }

    pub fn with_api_base(bot_token: String, api_base: String, poll_timeout_secs: u64) -> Self {
        Self {
            bot_token,
            api_base: api_base.trim_end_matches('/').to_string(),
            poll_timeout_secs,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &crate::config::TelegramConfig) -> Self {
        Self::with_api_base(
            config.bot_token.clone(),
            config.api_base.clone(),
            config.poll_timeout_secs,
        )
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    /// Call a Bot API method and unwrap its `result`, mapping the error
    /// envelope onto [`PlatformError`].
    async fn call(&self, method: &str, body: &Value) -> Result<Value, PlatformError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await?;
        let data: Value = resp.json().await?;
        parse_envelope(data)
    }

    fn allowed_updates(subscriptions: &BTreeSet<String>) -> Vec<&'static str> {
        let mut kinds = vec!["message"];
        kinds.extend(
            OPTIONAL_UPDATE_KINDS
                .iter()
                .copied()
                .filter(|kind| subscriptions.contains(*kind)),
        );
        kinds
    }
}

fn parse_envelope(data: Value) -> Result<Value, PlatformError> {
    if data.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
    }

    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    if let Some(retry_after) = data
        .get("parameters")
        .and_then(|p| p.get("retry_after"))
        .and_then(Value::as_u64)
    {
        return Err(PlatformError::RateLimited(Duration::from_secs(retry_after)));
    }

    let lowered = description.to_ascii_lowercase();
    if lowered.contains("message is not modified") {
        return Err(PlatformError::NotModified);
    }
    if lowered.contains("message to edit not found") || lowered.contains("message to delete not found")
    {
        return Err(PlatformError::NotFound);
    }

    Err(PlatformError::Api(description))
}

fn parse_message(message: &Value) -> Option<InboundMessage> {
    let message_id = message.get("message_id").and_then(Value::as_i64)?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?;
    let from = message.get("from");
    let sender_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .unwrap_or(chat_id);
    let sender_name = from
        .and_then(|f| f.get("username").or_else(|| f.get("first_name")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let reply_to = message
        .get("reply_to_message")
        .and_then(parse_message)
        .map(Box::new);

    Some(InboundMessage {
        message_id,
        chat_id,
        sender_id,
        sender_name,
        text,
        reply_to,
        timestamp: message.get("date").and_then(Value::as_i64).unwrap_or_default(),
    })
}

fn parse_update(update: &Value) -> Option<Update> {
    if let Some(message) = update.get("message") {
        return parse_message(message).map(Update::Message);
    }

    if let Some(query) = update.get("callback_query") {
        let message = query.get("message").and_then(|m| {
            Some(MessageRef {
                chat_id: m.get("chat")?.get("id")?.as_i64()?,
                message_id: m.get("message_id")?.as_i64()?,
            })
        });
        return Some(Update::CallbackQuery(CallbackQuery {
            id: query.get("id")?.as_str()?.to_string(),
            sender_id: query.get("from")?.get("id")?.as_i64()?,
            message,
            data: query.get("data").and_then(Value::as_str).map(str::to_string),
        }));
    }

    if let Some(query) = update.get("inline_query") {
        return Some(Update::InlineQuery(InlineQuery {
            id: query.get("id")?.as_str()?.to_string(),
            sender_id: query.get("from")?.get("id")?.as_i64()?,
            query: query
                .get("query")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }));
    }

    None
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<MessageRef, PlatformError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true
        });
        if let Some(reply_to) = reply_to {
            body["reply_to_message_id"] = Value::from(reply_to);
            body["allow_sending_without_reply"] = Value::Bool(true);
        }

        let result = self.call("sendMessage", &body).await?;
        let message_id = result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PlatformError::Api("sendMessage returned no message_id".into()))?;
        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    async fn edit_message(&self, target: MessageRef, text: &str) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "chat_id": target.chat_id,
            "message_id": target.message_id,
            "text": text,
            "disable_web_page_preview": true
        });
        self.call("editMessageText", &body).await.map(|_| ())
    }

    async fn delete_message(&self, target: MessageRef) -> Result<(), PlatformError> {
        let body = serde_json::json!({
            "chat_id": target.chat_id,
            "message_id": target.message_id
        });
        self.call("deleteMessage", &body).await.map(|_| ())
    }

    async fn chat_member_status(&self, chat_id: i64, user_id: i64) -> Result<String, PlatformError> {
        let body = serde_json::json!({ "chat_id": chat_id, "user_id": user_id });
        let result = self.call("getChatMember", &body).await?;
        result
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PlatformError::Api("getChatMember returned no status".into()))
    }

    async fn listen(
        &self,
        tx: mpsc::Sender<Update>,
        subscriptions: watch::Receiver<BTreeSet<String>>,
    ) -> anyhow::Result<()> {
        let mut offset: i64 = 0;

        tracing::info!("Telegram platform listening for updates...");

        loop {
            let allowed = Self::allowed_updates(&subscriptions.borrow());
            let body = serde_json::json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "allowed_updates": allowed
            });

            let results = match self.call("getUpdates", &body).await {
                Ok(results) => results,
                Err(PlatformError::RateLimited(wait)) => {
                    tracing::warn!("Telegram poll rate limited, sleeping {}s", wait.as_secs());
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Telegram poll error: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let Some(results) = results.as_array() else {
                continue;
            };

            for update in results {
                // Advance offset past this update
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = uid + 1;
                }

                let Some(parsed) = parse_update(update) else {
                    tracing::debug!("Telegram: skipping unsupported update");
                    continue;
                };

                if tx.send(parsed).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
