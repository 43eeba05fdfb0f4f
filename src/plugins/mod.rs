//! Plugin host and the built-in plugins.

pub mod builtin;
pub mod host;
pub mod mirror;
pub mod traits;

pub use builtin::CorePlugin;
pub use host::PluginHost;
pub use mirror::{MirrorNotifier, MirrorPlugin};
pub use traits::{Plugin, PluginError};
