//! Command table, invocation parsing and dispatch.

pub mod command;
pub mod context;
pub mod dispatcher;
pub mod registry;

pub use command::{
    Command, CommandBuilder, CommandError, CommandHandler, CommandOutput, PatternCapture,
    PatternMatch, Usage,
};
pub use context::{CommandContext, Invocation, Responder};
pub use dispatcher::CommandDispatcher;
pub use registry::CommandRegistry;
