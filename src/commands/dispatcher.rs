use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::command::CommandOutput;
use super::context::{CommandContext, Invocation, Responder};
use super::registry::CommandRegistry;
use crate::config::TelegramConfig;
use crate::events::{EventPayload, ListenerRegistry, ListenerSpec, Predicate, listener_fn};
use crate::platform::{ChatPlatform, InboundMessage, PlatformError};

/// Turns authorized, prefixed messages into command invocations.
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    listeners: Arc<ListenerRegistry>,
    platform: Arc<dyn ChatPlatform>,
    telegram: TelegramConfig,
    secrets: Arc<Vec<String>>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        listeners: Arc<ListenerRegistry>,
        platform: Arc<dyn ChatPlatform>,
        telegram: TelegramConfig,
        secrets: Vec<String>,
    ) -> Self {
        Self {
            registry,
            listeners,
            platform,
            telegram,
            secrets: Arc::new(secrets),
        }
    }

    /// Whether `message` looks like a command from someone allowed to run one.
    pub fn accepts(&self, message: &InboundMessage) -> bool {
        message.text().starts_with(&self.telegram.command_prefix)
            && self.telegram.is_authorized(message.sender_id)
    }

    /// `message` listener that feeds this dispatcher. The listener only
    /// holds a weak handle to the dispatcher.
    pub fn listener(self: &Arc<Self>, priority: i32) -> ListenerSpec {
        let filter = Arc::downgrade(self);
        let predicate: Predicate = Arc::new(move |payload: &EventPayload| match payload {
            EventPayload::Message(message) => filter
                .upgrade()
                .is_some_and(|dispatcher| dispatcher.accepts(message)),
            _ => false,
        });

        let weak = Arc::downgrade(self);
        let callback = listener_fn(move |payload| {
            let dispatcher = weak.upgrade();
            async move {
                if let (Some(dispatcher), EventPayload::Message(message)) = (dispatcher, payload) {
                    dispatcher.handle(message).await;
                }
                Ok(())
            }
        });

        ListenerSpec::new("message", callback)
            .priority(priority)
            .filter(predicate)
    }

    /// Resolve and run the command in `message`. Returns `true` when a
    /// command ran, whether or not it succeeded.
    pub async fn handle(&self, message: Arc<InboundMessage>) -> bool {
        if !self.accepts(&message) {
            return false;
        }
        let Some(invocation) = Invocation::parse(message.text(), &self.telegram.command_prefix)
        else {
            return false;
        };
        let Some(command) = self.registry.resolve(&invocation.token) else {
            debug!(token = %invocation.token, "Ignoring unknown command");
            return false;
        };

        let reply_text = message.reply_to.as_ref().and_then(|r| r.text.as_deref());
        let matches = command.extract(reply_text, &invocation.input);
        let input = invocation.input.clone();
        let responder = Arc::new(Responder::new(
            Arc::clone(&self.platform),
            message.message_ref(),
            Arc::clone(&self.secrets),
        ));
        let ctx = CommandContext::new(
            Arc::clone(&message),
            invocation,
            matches,
            Arc::clone(&responder),
        );

        let handler = Arc::clone(&command.handler);
        let outcome = AssertUnwindSafe(async move { handler(ctx).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(output)) => deliver(&responder, output).await,
            Ok(Err(e)) => {
                if matches!(e.downcast_ref::<PlatformError>(), Some(PlatformError::NotModified)) {
                    warn!(
                        plugin = %command.owner,
                        command = %command.name,
                        "Command tried to set identical text"
                    );
                } else {
                    error!(
                        plugin = %command.owner,
                        command = %command.name,
                        "Error in command: {e:#}"
                    );
                    report_failure(&responder, &input, &format!("{e:#}")).await;
                }
            }
            Err(_) => {
                error!(
                    plugin = %command.owner,
                    command = %command.name,
                    "Command handler panicked"
                );
                report_failure(&responder, &input, "command handler panicked").await;
            }
        }

        self.listeners
            .dispatch(
                "command",
                EventPayload::Command {
                    name: command.name.clone(),
                    message,
                },
                true,
            )
            .await;
        true
    }
}

async fn deliver(responder: &Responder, output: CommandOutput) {
    match output {
        CommandOutput::None => {}
        CommandOutput::Text(text) => {
            if let Err(e) = responder.respond(&text).await {
                warn!("Failed to send command response: {e}");
            }
        }
        CommandOutput::Ephemeral { text, delete_after } => {
            match responder.respond(&text).await {
                Ok(_) => responder.delete_after(delete_after),
                Err(e) => warn!("Failed to send command response: {e}"),
            }
        }
    }
}

/// Reply text shown when a command fails.
pub fn format_error(input: &str, error: &str) -> String {
    format!("**In**:\n{input}\n\n**Out**:\n⚠️ Error executing command:\n```{error}```")
}

async fn report_failure(responder: &Responder, input: &str, error: &str) {
    if let Err(e) = responder.respond(&format_error(input, error)).await {
        warn!("Failed to report command error: {e}");
    }
}
