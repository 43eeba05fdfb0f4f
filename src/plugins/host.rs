use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use super::traits::{Plugin, PluginError};
use crate::commands::CommandRegistry;
use crate::events::ListenerRegistry;

/// Loads plugins into the listener and command registries.
pub struct PluginHost {
    listeners: Arc<ListenerRegistry>,
    commands: Arc<CommandRegistry>,
    loaded: Mutex<BTreeMap<String, Arc<dyn Plugin>>>,
}

impl PluginHost {
    pub fn new(listeners: Arc<ListenerRegistry>, commands: Arc<CommandRegistry>) -> Self {
        Self {
            listeners,
            commands,
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register every listener and command of `plugin`. On any conflict,
    /// everything registered for it so far is removed again.
    pub fn load(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        let mut loaded = self.loaded.lock();
        if loaded.contains_key(&name) {
            return Err(PluginError::ExistingPlugin(name));
        }

        if let Err(e) = self.register(&name, &plugin) {
            self.listeners.unregister_all(&name);
            self.commands.unregister_all(&name);
            error!(plugin = %name, "Failed to load plugin: {e}");
            return Err(e);
        }

        loaded.insert(name.clone(), plugin);
        info!(plugin = %name, "Plugin loaded");
        Ok(())
    }

    fn register(&self, name: &str, plugin: &Arc<dyn Plugin>) -> Result<(), PluginError> {
        for spec in Arc::clone(plugin).listeners() {
            self.listeners
                .register(name, spec)
                .map_err(|source| PluginError::Listener {
                    plugin: name.to_string(),
                    source,
                })?;
        }
        for command in Arc::clone(plugin).commands() {
            self.commands
                .register(name, command)
                .map_err(|source| PluginError::Command {
                    plugin: name.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Remove `name` and everything it registered. Returns the plugin.
    pub fn unload(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let plugin = self.loaded.lock().remove(name)?;
        let listeners = self.listeners.unregister_all(name);
        let commands = self.commands.unregister_all(name);
        info!(plugin = name, listeners, commands, "Plugin unloaded");
        Some(plugin)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.loaded.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.loaded.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.loaded.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.lock().is_empty()
    }
}
