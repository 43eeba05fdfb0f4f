//! Request–response exchanges on top of the inbound message stream.
//!
//! A handler opens a [`Conversation`] with a chat, then suspends on
//! [`Conversation::await_next`] until the next matching message from that
//! chat arrives. While a conversation is live, messages from its chat are
//! claimed by the mailbox instead of reaching the listeners.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConversationConfig;
use crate::platform::{ChatPlatform, InboundMessage, MessageRef, PlatformError};

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("conversation with chat {partner} already exists")]
    AlreadyExists { partner: i64 },
    #[error("no response within {}s", .0.as_secs_f32())]
    Timeout(Duration),
    #[error("received max messages ({0})")]
    MaxMessages(usize),
    #[error("conversation closed")]
    Closed,
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

struct Mailbox {
    generation: u64,
    tx: mpsc::Sender<Arc<InboundMessage>>,
    closed: CancellationToken,
}

/// Per-chat bounded mailboxes; at most one live conversation per chat.
pub struct ConversationManager {
    mailboxes: Mutex<HashMap<i64, Mailbox>>,
    next_generation: AtomicU64,
    platform: Arc<dyn ChatPlatform>,
    defaults: ConversationConfig,
}

impl ConversationManager {
    pub fn new(platform: Arc<dyn ChatPlatform>, defaults: ConversationConfig) -> Self {
        Self {
            mailboxes: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            platform,
            defaults,
        }
    }

    /// Open a conversation with `partner`. `None` falls back to the
    /// configured default timeout / message limit.
    ///
    /// The returned handle closes the conversation when dropped.
    pub fn open(
        self: &Arc<Self>,
        partner: i64,
        timeout: Option<Duration>,
        max_messages: Option<usize>,
    ) -> Result<Conversation, ConversationError> {
        let timeout = timeout.unwrap_or_else(|| self.defaults.default_timeout());
        let max_messages = max_messages
            .unwrap_or(self.defaults.default_max_messages)
            .max(1);

        let mut mailboxes = self.mailboxes.lock();
        if mailboxes.contains_key(&partner) {
            return Err(ConversationError::AlreadyExists { partner });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(max_messages);
        let closed = CancellationToken::new();
        mailboxes.insert(
            partner,
            Mailbox {
                generation,
                tx,
                closed: closed.clone(),
            },
        );
        tracing::debug!(partner, "Conversation opened");

        Ok(Conversation {
            partner,
            generation,
            timeout,
            max_messages,
            received: 0,
            rx,
            closed,
            manager: Arc::clone(self),
        })
    }

    /// End the conversation with `partner`. A waiting or later
    /// [`Conversation::await_next`] returns [`ConversationError::Closed`];
    /// messages still buffered in the mailbox are discarded.
    pub fn close(&self, partner: i64) -> bool {
        let Some(mailbox) = self.mailboxes.lock().remove(&partner) else {
            return false;
        };
        mailbox.closed.cancel();
        tracing::debug!(partner, "Conversation closed");
        true
    }

    fn release(&self, partner: i64, generation: u64) {
        let mut mailboxes = self.mailboxes.lock();
        if mailboxes
            .get(&partner)
            .is_some_and(|m| m.generation == generation)
        {
            mailboxes.remove(&partner);
            tracing::debug!(partner, "Conversation closed");
        }
    }

    /// Offer `message` to the conversation with its chat. Returns `true`
    /// when a conversation claimed it, in which case normal handling must be
    /// skipped.
    pub fn route(&self, message: &Arc<InboundMessage>) -> bool {
        let partner = message.chat_id;
        let mut mailboxes = self.mailboxes.lock();
        let Some(mailbox) = mailboxes.get(&partner) else {
            return false;
        };

        match mailbox.tx.try_send(Arc::clone(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(partner, "Conversation mailbox full, dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                mailboxes.remove(&partner);
                false
            }
        }
    }

    pub fn is_open(&self, partner: i64) -> bool {
        self.mailboxes.lock().contains_key(&partner)
    }
}

/// A live conversation. Closing happens on drop.
pub struct Conversation {
    partner: i64,
    generation: u64,
    timeout: Duration,
    max_messages: usize,
    received: usize,
    rx: mpsc::Receiver<Arc<InboundMessage>>,
    closed: CancellationToken,
    manager: Arc<ConversationManager>,
}

impl Conversation {
    pub fn partner(&self) -> i64 {
        self.partner
    }

    /// Messages handed out so far.
    pub fn received(&self) -> usize {
        self.received
    }

    pub async fn send(&self, text: &str) -> Result<MessageRef, ConversationError> {
        Ok(self
            .manager
            .platform
            .send_message(self.partner, text, None)
            .await?)
    }

    /// Wait for the next message accepted by `predicate`. Messages the
    /// predicate rejects are discarded. The wait is bounded by the smaller of
    /// `timeout` and the conversation timeout, measured from the call.
    pub async fn await_next(
        &mut self,
        predicate: Option<&(dyn Fn(&InboundMessage) -> bool + Send + Sync)>,
        timeout: Option<Duration>,
    ) -> Result<Arc<InboundMessage>, ConversationError> {
        if self.received >= self.max_messages {
            return Err(ConversationError::MaxMessages(self.max_messages));
        }

        let limit = timeout.map_or(self.timeout, |t| t.min(self.timeout));
        let deadline = Instant::now() + limit;

        loop {
            let next = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(ConversationError::Closed),
                next = tokio::time::timeout_at(deadline, self.rx.recv()) => next,
            };
            let message = match next {
                Err(_) => return Err(ConversationError::Timeout(limit)),
                Ok(None) => return Err(ConversationError::Closed),
                Ok(Some(message)) => message,
            };

            if predicate.is_none_or(|accept| accept(&message)) {
                self.received += 1;
                return Ok(message);
            }
        }
    }

    pub async fn get_response(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Arc<InboundMessage>, ConversationError> {
        self.await_next(None, timeout).await
    }

    /// Next message that replies to another message.
    pub async fn get_reply(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Arc<InboundMessage>, ConversationError> {
        self.await_next(Some(&|m: &InboundMessage| m.is_reply()), timeout)
            .await
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.manager.release(self.partner, self.generation);
    }
}
