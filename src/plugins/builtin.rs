use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use super::traits::Plugin;
use crate::commands::{Command, CommandContext, CommandRegistry, Usage};

/// Built-in `help` and `ping`.
pub struct CorePlugin {
    commands: Arc<CommandRegistry>,
    prefix: String,
}

impl CorePlugin {
    pub fn new(commands: Arc<CommandRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            commands,
            prefix: prefix.into(),
        }
    }

    fn help(&self, ctx: &CommandContext) -> String {
        match ctx.args().first() {
            Some(name) => command_help(&self.commands, &self.prefix, name),
            None => command_list(&self.commands),
        }
    }
}

/// Every command, grouped by owning plugin.
pub fn command_list(registry: &CommandRegistry) -> String {
    let mut by_owner: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for command in registry.commands() {
        by_owner
            .entry(command.owner.clone())
            .or_default()
            .push(format!("`{}`", command.name));
    }

    let mut text = String::from("**Available commands:**\n");
    for (owner, names) in by_owner {
        let _ = write!(text, "\n**{owner}**: {}", names.join(", "));
    }
    text
}

/// Details of one command, looked up by name or alias.
pub fn command_help(registry: &CommandRegistry, prefix: &str, token: &str) -> String {
    let token = token.trim_start_matches(prefix);
    let Some(command) = registry.resolve(token) else {
        return format!("__Command__ `{token}` __doesn't exist.__");
    };

    let mut text = format!("`{prefix}{}", command.name);
    if let Some(usage) = &command.usage {
        let _ = write!(text, " {usage}");
    }
    text.push('`');
    if let Some(description) = &command.description {
        let _ = write!(text, ": {description}");
    }
    if !command.aliases.is_empty() {
        let aliases: Vec<String> = command.aliases.iter().map(|a| format!("`{a}`")).collect();
        let _ = write!(text, "\nAliases: {}", aliases.join(", "));
    }
    let _ = write!(text, "\nModule: __{}__", command.owner);
    text
}

impl Plugin for CorePlugin {
    fn name(&self) -> &str {
        "core"
    }

    fn commands(self: Arc<Self>) -> Vec<Command> {
        let plugin = Arc::clone(&self);
        let help = Command::builder("help")
            .alias("h")
            .description("List the available commands or describe one")
            .usage(Usage::new("command").optional())
            .handler(move |ctx| {
                let text = plugin.help(&ctx);
                async move { Ok(text) }
            });

        let ping = Command::builder("ping")
            .description("Measure the response time of the chat platform")
            .handler(|ctx| async move {
                let started = Instant::now();
                ctx.respond("Calculating response time...").await?;
                let elapsed = started.elapsed().as_millis();
                ctx.respond(&format!("Request response time: **{elapsed} ms**"))
                    .await?;
                Ok(())
            });

        vec![help, ping]
    }
}
