use std::sync::Arc;

use crate::commands::{Command, CommandError};
use crate::events::{ListenerError, ListenerSpec};

/// A bundle of listeners and commands loaded and unloaded as one unit.
///
/// Both tables are requested once, at load time. Handlers that need the
/// plugin itself capture the `Arc` they are given.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn listeners(self: Arc<Self>) -> Vec<ListenerSpec> {
        Vec::new()
    }

    fn commands(self: Arc<Self>) -> Vec<Command> {
        Vec::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin '{0}' is already loaded")]
    ExistingPlugin(String),
    #[error("plugin '{plugin}' failed to register a listener: {source}")]
    Listener {
        plugin: String,
        #[source]
        source: ListenerError,
    },
    #[error("plugin '{plugin}' failed to register a command: {source}")]
    Command {
        plugin: String,
        #[source]
        source: CommandError,
    },
}
