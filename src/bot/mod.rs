//! Composition root: one [`Bot`] owns every component and runs the event loop.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::commands::{CommandDispatcher, CommandRegistry};
use crate::config::Config;
use crate::conversation::ConversationManager;
use crate::download::{
    Aria2Client, DownloadOrchestrator, GoogleDrive, OrchestratorSettings, RetryPolicy, Seeder,
    listen_notifications,
};
use crate::events::{DEFAULT_PRIORITY, EventPayload, ListenerRegistry};
use crate::platform::{ChatPlatform, TelegramPlatform, Update};
use crate::plugins::{CorePlugin, MirrorNotifier, MirrorPlugin, Plugin, PluginError, PluginHost};

/// Owner name of listeners the bot registers for itself.
const BOT_OWNER: &str = "bot";

/// Restart `run_component` with exponential backoff whenever it returns.
fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            match run_component().await {
                Ok(()) => tracing::warn!("Bot component '{name}' exited unexpectedly"),
                Err(e) => tracing::error!("Bot component '{name}' failed: {e}"),
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

/// Requests shutdown of a running [`Bot`].
#[derive(Debug, Clone)]
pub struct BotHandle {
    shutdown: CancellationToken,
}

impl BotHandle {
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct Bot {
    config: Arc<Config>,
    platform: Arc<dyn ChatPlatform>,
    listeners: Arc<ListenerRegistry>,
    commands: Arc<CommandRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    conversations: Arc<ConversationManager>,
    plugins: PluginHost,
    downloads: Option<Arc<DownloadOrchestrator>>,
    shutdown: CancellationToken,
}

impl Bot {
    /// Wire the core components around `platform`. No plugin is loaded yet.
    pub fn new(config: Config, platform: Arc<dyn ChatPlatform>) -> Result<Self> {
        let config = Arc::new(config);
        let listeners = Arc::new(ListenerRegistry::new());
        let commands = Arc::new(CommandRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&commands),
            Arc::clone(&listeners),
            Arc::clone(&platform),
            config.telegram.clone(),
            config.secrets(),
        ));
        listeners.register(BOT_OWNER, dispatcher.listener(DEFAULT_PRIORITY))?;

        let conversations = Arc::new(ConversationManager::new(
            Arc::clone(&platform),
            config.conversation.clone(),
        ));
        let plugins = PluginHost::new(Arc::clone(&listeners), Arc::clone(&commands));

        Ok(Self {
            config,
            platform,
            listeners,
            commands,
            dispatcher,
            conversations,
            plugins,
            downloads: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Attach a download orchestrator and load the mirror plugin for it.
    pub fn with_downloads(mut self, orchestrator: Arc<DownloadOrchestrator>) -> Result<Self> {
        self.load_plugin(Arc::new(MirrorPlugin::new(Arc::clone(&orchestrator))))?;
        self.downloads = Some(orchestrator);
        Ok(self)
    }

    /// Build the full bot from configuration: Telegram, the core plugin and,
    /// when enabled, aria2 + Google Drive downloads.
    pub async fn from_config(config: Config) -> Result<Self> {
        let platform: Arc<dyn ChatPlatform> =
            Arc::new(TelegramPlatform::from_config(&config.telegram));
        let prefix = config.telegram.command_prefix.clone();
        let downloads = config.downloads.enabled;
        let mut bot = Self::new(config, Arc::clone(&platform))?;
        bot.load_plugin(Arc::new(CorePlugin::new(Arc::clone(&bot.commands), prefix)))?;

        if !downloads {
            tracing::info!("Downloads disabled; mirror plugin not loaded");
            return Ok(bot);
        }

        let aria2 = Arc::new(Aria2Client::from_config(&bot.config.downloads));
        match RetryPolicy::startup()
            .run("getVersion", || aria2.get_version())
            .await
        {
            Ok(version) => tracing::info!("aria2 {version} is ready"),
            Err(e) => tracing::warn!("aria2 is not reachable yet: {e}"),
        }

        let orchestrator = DownloadOrchestrator::new(
            aria2,
            Arc::new(GoogleDrive::new(&bot.config.drive)),
            Arc::new(MirrorNotifier::new(platform)),
            RetryPolicy::from_config(&bot.config.reliability),
            OrchestratorSettings::from_config(&bot.config),
        )
        .with_seeder(Seeder::from_config(&bot.config.downloads));
        bot = bot.with_downloads(Arc::new(orchestrator))?;
        Ok(bot)
    }

    pub fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.plugins.load(plugin)
    }

    pub fn unload_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.unload(name)
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&self) -> &Arc<dyn ChatPlatform> {
        &self.platform
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// The download orchestrator, when downloads are configured.
    pub fn downloads(&self) -> Option<&Arc<DownloadOrchestrator>> {
        self.downloads.as_ref()
    }

    pub fn handle(&self) -> BotHandle {
        BotHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Route one inbound update. Messages claimed by an open conversation
    /// never reach the listeners.
    pub async fn handle_update(&self, update: Update) {
        match update {
            Update::Message(message) => {
                let message = Arc::new(message);
                if self.conversations.route(&message) {
                    return;
                }
                self.listeners
                    .dispatch("message", EventPayload::Message(message), false)
                    .await;
            }
            Update::CallbackQuery(query) => {
                self.listeners
                    .dispatch("callback_query", EventPayload::CallbackQuery(Arc::new(query)), false)
                    .await;
            }
            Update::InlineQuery(query) => {
                self.listeners
                    .dispatch("inline_query", EventPayload::InlineQuery(Arc::new(query)), false)
                    .await;
            }
        }
    }

    /// Run until Ctrl+C or [`BotHandle::shutdown`].
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let reliability = &self.config.reliability;
        let initial_backoff = reliability.listener_initial_backoff_secs.max(1);
        let max_backoff = reliability.listener_max_backoff_secs.max(initial_backoff);

        self.listeners.dispatch("load", EventPayload::Empty, true).await;
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        if let Some(orchestrator) = &self.downloads {
            let (tx, rx) = mpsc::channel(64);
            let ws_url = self.config.downloads.aria2_ws_url.clone();
            handles.push(spawn_component_supervisor(
                "aria2-notifications",
                initial_backoff,
                max_backoff,
                move || {
                    let url = ws_url.clone();
                    let tx = tx.clone();
                    async move { listen_notifications(&url, tx).await }
                },
            ));
            handles.extend(orchestrator.start(rx));
        }

        self.listeners.dispatch("start", EventPayload::Empty, true).await;

        let (tx, mut rx) = mpsc::channel::<Update>(100);
        {
            let platform = Arc::clone(&self.platform);
            let listeners = Arc::clone(&self.listeners);
            handles.push(spawn_component_supervisor(
                "platform",
                initial_backoff,
                max_backoff,
                move || {
                    let platform = Arc::clone(&platform);
                    let subscriptions = listeners.subscribe();
                    let tx = tx.clone();
                    async move { platform.listen(tx, subscriptions).await }
                },
            ));
        }
        {
            let bot = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    bot.handle_update(update).await;
                }
            }));
        }

        self.listeners.dispatch("started", EventPayload::Empty, false).await;
        tracing::info!(
            platform = self.platform.name(),
            plugins = ?self.plugins.names(),
            downloads = self.downloads.is_some(),
            "mirrorbot started"
        );

        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            () = self.shutdown.cancelled() => {}
        }
        tracing::info!("Shutting down");

        self.listeners.dispatch("stop", EventPayload::Empty, true).await;
        if let Some(orchestrator) = &self.downloads {
            orchestrator.stop();
        }
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ListenerSpec, listener_fn};
    use crate::platform::{InboundMessage, MessageRef, PlatformError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    #[derive(Default)]
    struct RecordingPlatform {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatPlatform for RecordingPlatform {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            _reply_to: Option<i64>,
        ) -> Result<MessageRef, PlatformError> {
            let mut sent = self.sent.lock();
            sent.push(text.to_string());
            Ok(MessageRef {
                chat_id,
                message_id: i64::try_from(sent.len()).unwrap_or_default() + 1000,
            })
        }

        async fn edit_message(&self, _target: MessageRef, text: &str) -> Result<(), PlatformError> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn delete_message(&self, _target: MessageRef) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn chat_member_status(&self, _chat_id: i64, _user_id: i64) -> Result<String, PlatformError> {
            Ok("member".into())
        }

        async fn listen(
            &self,
            _tx: mpsc::Sender<Update>,
            _subscriptions: watch::Receiver<BTreeSet<String>>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.telegram.owner_id = 7;
        config.telegram.bot_token = "123:secret-token".into();
        config
    }

    fn message(text: &str) -> Update {
        Update::Message(InboundMessage {
            message_id: 1,
            chat_id: 42,
            sender_id: 7,
            text: Some(text.into()),
            ..InboundMessage::default()
        })
    }

    fn bot() -> (Bot, Arc<RecordingPlatform>) {
        let platform = Arc::new(RecordingPlatform::default());
        let bot = Bot::new(config(), platform.clone()).unwrap();
        bot.load_plugin(Arc::new(CorePlugin::new(Arc::clone(bot.commands()), "/")))
            .unwrap();
        (bot, platform)
    }

    #[tokio::test]
    async fn commands_are_answered() {
        let (bot, platform) = bot();
        bot.dispatcher()
            .handle(Arc::new(InboundMessage {
                message_id: 1,
                chat_id: 42,
                sender_id: 7,
                text: Some("/help".into()),
                ..InboundMessage::default()
            }))
            .await;

        let sent = platform.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("**core**: `help`, `ping`"), "{sent:?}");
    }

    #[tokio::test]
    async fn conversation_claims_messages() {
        let (bot, _platform) = bot();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bot.listeners()
            .register(
                "test",
                ListenerSpec::new(
                    "message",
                    listener_fn(move |_| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                ),
            )
            .unwrap();

        let mut conversation = bot.conversations().open(42, None, None).unwrap();
        bot.handle_update(message("hello")).await;
        let reply = conversation.get_response(None).await.unwrap();
        assert_eq!(reply.text(), "hello");
        drop(conversation);

        bot.handle_update(message("again")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn optional_capabilities_are_explicit() {
        let (bot, _platform) = bot();
        assert!(bot.downloads().is_none());
        assert!(bot.plugin("core").is_some());
        assert!(bot.plugin("mirror").is_none());
    }

    #[test]
    fn unload_plugin_frees_its_commands() {
        let (bot, _platform) = bot();
        assert!(bot.unload_plugin("core").is_some());
        assert!(bot.commands().resolve("help").is_none());
        bot.load_plugin(Arc::new(CorePlugin::new(Arc::clone(bot.commands()), "/")))
            .unwrap();
        assert!(bot.commands().resolve("help").is_some());
    }

    #[test]
    fn handle_signals_shutdown() {
        let (bot, _platform) = bot();
        let handle = bot.handle();
        assert!(!handle.is_shutdown());
        handle.shutdown();
        assert!(bot.handle().is_shutdown());
    }
}
