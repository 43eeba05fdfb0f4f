use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::command::{Command, CommandError};

/// Name/alias → command table. Every token is unique registry-wide.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, Arc<Command>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `command` and all its aliases to `owner`.
    ///
    /// All-or-nothing: on a collision nothing stays registered and the error
    /// names the plugin that already holds the token.
    pub fn register(&self, owner: &str, mut command: Command) -> Result<Arc<Command>, CommandError> {
        if command.name.is_empty() {
            return Err(CommandError::EmptyName);
        }
        command.owner = owner.to_string();

        let mut seen = BTreeSet::new();
        seen.insert(command.name.clone());
        command.aliases.retain(|alias| !alias.is_empty() && seen.insert(alias.clone()));

        let command = Arc::new(command);
        let mut commands = self.commands.write();
        let mut inserted: Vec<String> = Vec::new();

        for (index, token) in command.tokens().enumerate() {
            if let Some(existing) = commands.get(token) {
                let err = CommandError::NameBound {
                    kind: if index == 0 { "Command" } else { "Alias" },
                    name: token.to_string(),
                    existing_owner: existing.owner.clone(),
                };
                for token in inserted {
                    commands.remove(&token);
                }
                tracing::error!(plugin = owner, "Failed to register command: {err}");
                return Err(err);
            }
            commands.insert(token.to_string(), Arc::clone(&command));
            inserted.push(token.to_string());
        }

        tracing::debug!(plugin = owner, command = %command.name, "Registered command");
        Ok(command)
    }

    /// Remove a command by canonical name, along with its aliases.
    pub fn unregister(&self, name: &str) -> Option<Arc<Command>> {
        let mut commands = self.commands.write();
        let command = commands.get(name).filter(|c| c.name == name).cloned()?;
        for token in command.tokens() {
            if commands
                .get(token)
                .is_some_and(|bound| Arc::ptr_eq(bound, &command))
            {
                commands.remove(token);
            }
        }
        Some(command)
    }

    /// Remove every command owned by `owner`. Returns how many were removed.
    pub fn unregister_all(&self, owner: &str) -> usize {
        let mut commands = self.commands.write();
        let mut names = BTreeSet::new();
        commands.retain(|_, command| {
            if command.owner == owner {
                names.insert(command.name.clone());
                false
            } else {
                true
            }
        });
        names.len()
    }

    /// Look up a command by name or alias.
    pub fn resolve(&self, token: &str) -> Option<Arc<Command>> {
        self.commands.read().get(token).cloned()
    }

    /// Every bound token, names and aliases alike.
    pub fn tokens(&self) -> BTreeSet<String> {
        self.commands.read().keys().cloned().collect()
    }

    /// Distinct commands sorted by owner, then name.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        let commands = self.commands.read();
        let mut unique: Vec<Arc<Command>> = commands
            .iter()
            .filter(|(token, command)| **token == command.name)
            .map(|(_, command)| Arc::clone(command))
            .collect();
        unique.sort_by(|a, b| a.owner.cmp(&b.owner).then_with(|| a.name.cmp(&b.name)));
        unique
    }
}
