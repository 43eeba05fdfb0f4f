use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::command::PatternMatch;
use crate::platform::{ChatPlatform, InboundMessage, MessageRef, PlatformError};
use crate::util::{redact, truncate_with_ellipsis};

/// Telegram rejects messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// A command line split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Command token without the prefix or a trailing `@botname`.
    pub token: String,
    /// Whitespace-separated segments; the first one is the raw command token.
    pub segments: Vec<String>,
    /// Byte length of prefix, token and one separator.
    pub cmd_len: usize,
    /// Everything after the command token and its separator.
    pub input: String,
}

impl Invocation {
    /// Split `text` into a command invocation if it starts with `prefix`
    /// immediately followed by a token.
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        let body = text.strip_prefix(prefix)?;
        let raw = body.split_whitespace().next()?;
        if !body.starts_with(raw) {
            return None;
        }

        let token = raw.split('@').next().unwrap_or(raw);
        if token.is_empty() {
            return None;
        }

        let rest = &body[raw.len()..];
        let mut chars = rest.chars();
        let separator = chars.next().map_or(0, char::len_utf8);
        let input = rest[separator..].to_string();

        Some(Self {
            token: token.to_string(),
            segments: body.split_whitespace().map(str::to_string).collect(),
            cmd_len: prefix.len() + raw.len() + 1,
            input,
        })
    }
}

/// Posts and edits the single response message of one invocation.
pub struct Responder {
    platform: Arc<dyn ChatPlatform>,
    invoker: MessageRef,
    secrets: Arc<Vec<String>>,
    response: Mutex<Option<MessageRef>>,
}

impl Responder {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        invoker: MessageRef,
        secrets: Arc<Vec<String>>,
    ) -> Self {
        Self {
            platform,
            invoker,
            secrets,
            response: Mutex::new(None),
        }
    }

    /// Edit the existing response, or reply to the invoking message when
    /// there is none yet. Secrets are scrubbed first.
    pub async fn respond(&self, text: &str) -> Result<MessageRef, PlatformError> {
        let text = truncate_with_ellipsis(&redact(text, &self.secrets), MAX_MESSAGE_CHARS - 3);
        let existing = *self.response.lock();

        if let Some(target) = existing {
            match self.platform.edit_message(target, &text).await {
                Ok(()) | Err(PlatformError::NotModified) => return Ok(target),
                Err(PlatformError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let sent = self
            .platform
            .send_message(self.invoker.chat_id, &text, Some(self.invoker.message_id))
            .await?;
        *self.response.lock() = Some(sent);
        Ok(sent)
    }

    pub fn response(&self) -> Option<MessageRef> {
        *self.response.lock()
    }

    /// Delete the response message after `delay`, in the background.
    pub fn delete_after(&self, delay: Duration) {
        let Some(target) = self.response.lock().take() else {
            return;
        };
        let platform = Arc::clone(&self.platform);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = platform.delete_message(target).await {
                tracing::debug!("Failed to delete ephemeral response: {e}");
            }
        });
    }
}

/// Everything a command handler gets to see about its invocation.
#[derive(Clone)]
pub struct CommandContext {
    pub message: Arc<InboundMessage>,
    /// Token the user typed, canonical name or alias.
    pub invoker: String,
    pub segments: Vec<String>,
    pub cmd_len: usize,
    pub input: String,
    pub matches: PatternMatch,
    responder: Arc<Responder>,
}

impl CommandContext {
    pub fn new(
        message: Arc<InboundMessage>,
        invocation: Invocation,
        matches: PatternMatch,
        responder: Arc<Responder>,
    ) -> Self {
        Self {
            message,
            invoker: invocation.token,
            segments: invocation.segments,
            cmd_len: invocation.cmd_len,
            input: invocation.input,
            matches,
            responder,
        }
    }

    /// Segments after the command token.
    pub fn args(&self) -> &[String] {
        self.segments.get(1..).unwrap_or_default()
    }

    /// Text of the replied-to message, if the invocation is a reply.
    pub fn reply_text(&self) -> Option<&str> {
        self.message
            .reply_to
            .as_ref()
            .and_then(|r| r.text.as_deref())
    }

    pub fn chat_id(&self) -> i64 {
        self.message.chat_id
    }

    pub async fn respond(&self, text: &str) -> Result<MessageRef, PlatformError> {
        self.responder.respond(text).await
    }

    pub fn response(&self) -> Option<MessageRef> {
        self.responder.response()
    }
}

impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("invoker", &self.invoker)
            .field("segments", &self.segments)
            .field("input", &self.input)
            .field("matches", &self.matches)
            .finish_non_exhaustive()
    }
}
