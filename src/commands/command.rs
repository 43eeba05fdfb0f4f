use futures_util::future::BoxFuture;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::context::CommandContext;

/// Command body. Returning `Err` produces an in-chat error reply.
pub type CommandHandler =
    Arc<dyn Fn(CommandContext) -> BoxFuture<'static, anyhow::Result<CommandOutput>> + Send + Sync>;

/// What a handler wants posted once it returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommandOutput {
    /// Handler already responded (or has nothing to say).
    #[default]
    None,
    Text(String),
    /// Text reply deleted again after `delete_after`.
    Ephemeral { text: String, delete_after: Duration },
}

impl CommandOutput {
    pub fn ephemeral(text: impl Into<String>, delete_after: Duration) -> Self {
        Self::Ephemeral {
            text: text.into(),
            delete_after,
        }
    }
}

impl From<String> for CommandOutput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for CommandOutput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<()> for CommandOutput {
    fn from((): ()) -> Self {
        Self::None
    }
}

/// Argument usage shown by `help`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub text: String,
    /// The argument may be left out.
    pub optional: bool,
    /// The argument may come from the replied-to message instead.
    pub reply: bool,
}

impl Usage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            optional: false,
            reply: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn reply(mut self) -> Self {
        self.reply = true;
        self
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, close) = if self.optional { ("[", "]") } else { ("<", ">") };
        write!(f, "{open}{}{close}", self.text)?;
        if self.reply {
            write!(f, " (or reply)")?;
        }
        Ok(())
    }
}

/// One regex match: group 0 is the whole match, unmatched groups are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternCapture {
    pub groups: Vec<Option<String>>,
}

impl PatternCapture {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }
}

/// Outcome of matching a command's extraction pattern.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PatternMatch {
    /// The command declares no pattern.
    #[default]
    NotDeclared,
    /// A pattern is declared but nothing in the text matched.
    NoMatch,
    /// Every non-overlapping match, in order.
    Matched(Vec<PatternCapture>),
}

impl PatternMatch {
    pub fn first(&self) -> Option<&PatternCapture> {
        match self {
            Self::Matched(captures) => captures.first(),
            _ => None,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched(_))
    }
}

/// A command as registered: canonical name, aliases, metadata and handler.
#[derive(Clone)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    /// Owning plugin, assigned at registration.
    pub owner: String,
    pub description: Option<String>,
    pub usage: Option<Usage>,
    pub pattern: Option<Regex>,
    pub(crate) handler: CommandHandler,
}

impl Command {
    pub fn builder(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            name: name.into(),
            aliases: Vec::new(),
            description: None,
            usage: None,
            pattern: None,
        }
    }

    /// All tokens this command answers to, canonical name first.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Match the extraction pattern against the replied-to text when present,
    /// otherwise against the input after the command token.
    pub fn extract(&self, reply_text: Option<&str>, input: &str) -> PatternMatch {
        let Some(pattern) = &self.pattern else {
            return PatternMatch::NotDeclared;
        };

        let haystack = reply_text.unwrap_or(input);
        let captures: Vec<PatternCapture> = pattern
            .captures_iter(haystack)
            .map(|caps| PatternCapture {
                groups: caps
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_string()))
                    .collect(),
            })
            .collect();

        if captures.is_empty() {
            PatternMatch::NoMatch
        } else {
            PatternMatch::Matched(captures)
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("owner", &self.owner)
            .field("description", &self.description)
            .field("usage", &self.usage)
            .field("pattern", &self.pattern.as_ref().map(Regex::as_str))
            .finish_non_exhaustive()
    }
}

/// Builder for [`Command`]; supplying the handler finishes it.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    name: String,
    aliases: Vec<String>,
    description: Option<String>,
    usage: Option<Usage>,
    pattern: Option<Regex>,
}

impl CommandBuilder {
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn handler<F, Fut, O>(self, f: F) -> Command
    where
        F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Into<CommandOutput> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: CommandHandler = Arc::new(move |ctx| {
            let fut = f(ctx);
            Box::pin(async move { fut.await.map(Into::into) })
        });

        Command {
            name: self.name,
            aliases: self.aliases,
            owner: String::new(),
            description: self.description,
            usage: self.usage,
            pattern: self.pattern,
            handler,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{kind} '{name}' has already been registered by '{existing_owner}'")]
    NameBound {
        kind: &'static str,
        name: String,
        existing_owner: String,
    },
    #[error("command name must not be empty")]
    EmptyName,
}
