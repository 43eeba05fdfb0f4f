use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Address of a message the bot can edit, delete or reply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// A text message received from the platform.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub message_id: i64,
    pub chat_id: i64,
    /// Conversation partner key: the sending user.
    pub sender_id: i64,
    pub sender_name: Option<String>,
    pub text: Option<String>,
    /// The message this one replies to, if any.
    pub reply_to: Option<Box<InboundMessage>>,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl InboundMessage {
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat_id,
            message_id: self.message_id,
        }
    }

    /// Message text, or the empty string for media-only messages.
    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

/// An inline keyboard button press.
#[derive(Debug, Clone, Default)]
pub struct CallbackQuery {
    pub id: String,
    pub sender_id: i64,
    pub message: Option<MessageRef>,
    pub data: Option<String>,
}

/// A query typed after the bot's username in any chat.
#[derive(Debug, Clone, Default)]
pub struct InlineQuery {
    pub id: String,
    pub sender_id: i64,
    pub query: String,
}

/// One item of the inbound feed.
#[derive(Debug, Clone)]
pub enum Update {
    Message(InboundMessage),
    CallbackQuery(CallbackQuery),
    InlineQuery(InlineQuery),
}

impl Update {
    /// Event name listeners register under for this kind of update.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::CallbackQuery(_) => "callback_query",
            Self::InlineQuery(_) => "inline_query",
        }
    }

    pub fn sender_id(&self) -> i64 {
        match self {
            Self::Message(m) => m.sender_id,
            Self::CallbackQuery(q) => q.sender_id,
            Self::InlineQuery(q) => q.sender_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The platform asked us to back off before the next call.
    #[error("rate limited, retry after {}s", .0.as_secs())]
    RateLimited(Duration),
    /// An edit carried the exact text already displayed.
    #[error("message is not modified")]
    NotModified,
    #[error("message not found")]
    NotFound,
    #[error("platform API error: {0}")]
    Api(String),
    #[error("platform transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Core chat platform trait, implemented once per messaging backend
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Human-readable platform name
    fn name(&self) -> &str;

    /// Send a text message, optionally as a reply.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<MessageRef, PlatformError>;

    /// Replace the text of a message the bot sent earlier.
    async fn edit_message(&self, target: MessageRef, text: &str) -> Result<(), PlatformError>;

    async fn delete_message(&self, target: MessageRef) -> Result<(), PlatformError>;

    /// Membership status of `user_id` in `chat_id` (`creator`, `administrator`, `member`, ...).
    async fn chat_member_status(&self, chat_id: i64, user_id: i64) -> Result<String, PlatformError>;

    /// Start pushing inbound updates (long-running). `subscriptions` carries
    /// the event names that currently have listeners.
    async fn listen(
        &self,
        tx: mpsc::Sender<Update>,
        subscriptions: watch::Receiver<BTreeSet<String>>,
    ) -> anyhow::Result<()>;

    /// Check if the platform is reachable
    async fn health_check(&self) -> bool {
        true
    }
}
