//! Event fan-out: per-event listener lists, priority-ordered concurrent dispatch.

pub mod registry;
pub mod traits;

pub use registry::ListenerRegistry;
pub use traits::{
    DEFAULT_PRIORITY, EventPayload, Listener, ListenerError, ListenerFn, ListenerId, ListenerSpec,
    Predicate, listener_fn,
};
