use futures_util::future::BoxFuture;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::platform::{CallbackQuery, InboundMessage, InlineQuery};

/// Listener priority used when a plugin does not pick one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Events whose payload carries text a pattern can be matched against.
pub const TEXT_EVENTS: [&str; 4] = ["message", "callback_query", "inline_query", "command"];

/// Handle returned by registration, used to unregister a single listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

/// Argument handed to every listener of an event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Lifecycle events (`load`, `start`, `started`, `stop`) carry nothing.
    Empty,
    Message(Arc<InboundMessage>),
    CallbackQuery(Arc<CallbackQuery>),
    InlineQuery(Arc<InlineQuery>),
    /// Fired after a command handler has run.
    Command {
        name: String,
        message: Arc<InboundMessage>,
    },
}

impl EventPayload {
    /// Text a pattern predicate matches against, when the payload has any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Message(m) | Self::Command { message: m, .. } => m.text.as_deref(),
            Self::CallbackQuery(q) => q.data.as_deref(),
            Self::InlineQuery(q) => Some(q.query.as_str()),
        }
    }

    pub fn sender_id(&self) -> Option<i64> {
        match self {
            Self::Empty => None,
            Self::Message(m) | Self::Command { message: m, .. } => Some(m.sender_id),
            Self::CallbackQuery(q) => Some(q.sender_id),
            Self::InlineQuery(q) => Some(q.sender_id),
        }
    }

    pub fn message(&self) -> Option<&Arc<InboundMessage>> {
        match self {
            Self::Message(m) | Self::Command { message: m, .. } => Some(m),
            _ => None,
        }
    }
}

/// Listener filter evaluated before a listener is scheduled.
pub type Predicate = Arc<dyn Fn(&EventPayload) -> bool + Send + Sync>;

/// Listener body. Errors are logged against the owning plugin.
pub type ListenerFn = Arc<dyn Fn(EventPayload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Box an async closure into a [`ListenerFn`].
pub fn listener_fn<F, Fut>(f: F) -> ListenerFn
where
    F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Declarative listener description a plugin hands to the registry.
#[derive(Clone)]
pub struct ListenerSpec {
    pub event: String,
    pub priority: i32,
    pub predicate: Option<Predicate>,
    pub pattern: Option<Regex>,
    pub callback: ListenerFn,
}

impl ListenerSpec {
    pub fn new(event: impl Into<String>, callback: ListenerFn) -> Self {
        Self {
            event: event.into(),
            priority: DEFAULT_PRIORITY,
            predicate: None,
            pattern: None,
            callback,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Only accept payloads whose text matches `pattern`.
    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

impl fmt::Debug for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSpec")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("predicate", &self.predicate.is_some())
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .finish_non_exhaustive()
    }
}

/// A registered listener.
pub struct Listener {
    pub id: ListenerId,
    pub event: String,
    pub owner: String,
    pub priority: i32,
    pub(crate) predicate: Option<Predicate>,
    pub(crate) callback: ListenerFn,
}

impl Listener {
    pub fn accepts(&self, payload: &EventPayload) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(payload))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener event name must not be empty")]
    EmptyEvent,
    #[error("event '{event}' carries no text and can't be used with a pattern")]
    PatternUnsupported { event: String },
}
