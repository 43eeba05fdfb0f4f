use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::traits::{
    EventPayload, Listener, ListenerError, ListenerId, ListenerSpec, Predicate, TEXT_EVENTS,
};

/// Per-event listener lists ordered by ascending priority.
///
/// Dispatch spawns every accepted listener as its own task, in list order,
/// before awaiting any of them. An event name is either absent or maps to a
/// non-empty list.
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Vec<Arc<Listener>>>>,
    next_id: AtomicU64,
    subscriptions: watch::Sender<BTreeSet<String>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        let (subscriptions, _) = watch::channel(BTreeSet::new());
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            subscriptions,
        }
    }

    /// Insert a listener after every existing listener of the same or lower
    /// priority.
    pub fn register(&self, owner: &str, spec: ListenerSpec) -> Result<ListenerId, ListenerError> {
        if spec.event.is_empty() {
            return Err(ListenerError::EmptyEvent);
        }

        let predicate = match spec.pattern {
            Some(pattern) => {
                if !TEXT_EVENTS.contains(&spec.event.as_str()) {
                    error!(
                        plugin = owner,
                        event = %spec.event,
                        "Event can't be used with pattern"
                    );
                    return Err(ListenerError::PatternUnsupported { event: spec.event });
                }
                let inner = spec.predicate;
                Some(Arc::new(move |payload: &EventPayload| {
                    payload.text().is_some_and(|text| pattern.is_match(text))
                        && inner.as_ref().is_none_or(|p| p(payload))
                }) as Predicate)
            }
            None => spec.predicate,
        };

        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            id,
            event: spec.event.clone(),
            owner: owner.to_string(),
            priority: spec.priority,
            predicate,
            callback: spec.callback,
        });

        let mut listeners = self.listeners.write();
        let list = listeners.entry(spec.event).or_default();
        let index = list.partition_point(|l| l.priority <= listener.priority);
        debug!(
            plugin = owner,
            event = %listener.event,
            priority = listener.priority,
            "Registered listener"
        );
        list.insert(index, listener);
        self.publish(&listeners);

        Ok(id)
    }

    /// Remove a single listener. Returns `false` when it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(event) = listeners
            .iter()
            .find(|(_, list)| list.iter().any(|l| l.id == id))
            .map(|(event, _)| event.clone())
        else {
            return false;
        };

        if let Some(list) = listeners.get_mut(&event) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                listeners.remove(&event);
            }
        }
        self.publish(&listeners);
        true
    }

    /// Remove every listener registered by `owner`. Returns how many were removed.
    pub fn unregister_all(&self, owner: &str) -> usize {
        let mut listeners = self.listeners.write();
        let mut removed = 0;
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|l| l.owner != owner);
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            self.publish(&listeners);
        }
        removed
    }

    /// Run every listener of `event` whose predicate accepts `payload`.
    ///
    /// All accepted listeners are spawned before any is awaited. With `wait`
    /// the call returns once all of them finished, otherwise immediately.
    /// Returns the number of listeners scheduled.
    pub async fn dispatch(&self, event: &str, payload: EventPayload, wait: bool) -> usize {
        let candidates: Vec<Arc<Listener>> = match self.listeners.read().get(event) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let handles: Vec<JoinHandle<()>> = candidates
            .into_iter()
            .filter(|l| l.accepts(&payload))
            .map(|listener| tokio::spawn(run_listener(listener, payload.clone())))
            .collect();
        let scheduled = handles.len();

        if wait {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(event, "Listener task failed to complete: {e}");
                }
            }
        }

        scheduled
    }

    /// Event names that currently have at least one listener.
    pub fn events(&self) -> BTreeSet<String> {
        self.listeners.read().keys().cloned().collect()
    }

    /// `(owner, priority)` of each listener of `event`, in dispatch order.
    pub fn listeners_of(&self, event: &str) -> Vec<(String, i32)> {
        self.listeners
            .read()
            .get(event)
            .map(|list| {
                list.iter()
                    .map(|l| (l.owner.clone(), l.priority))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Receiver that observes the set of subscribed event names.
    pub fn subscribe(&self) -> watch::Receiver<BTreeSet<String>> {
        self.subscriptions.subscribe()
    }

    fn publish(&self, listeners: &HashMap<String, Vec<Arc<Listener>>>) {
        let events: BTreeSet<String> = listeners.keys().cloned().collect();
        self.subscriptions.send_if_modified(|current| {
            if *current == events {
                false
            } else {
                *current = events;
                true
            }
        });
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_listener(listener: Arc<Listener>, payload: EventPayload) {
    let callback = Arc::clone(&listener.callback);
    let outcome = AssertUnwindSafe(async move { callback(payload).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(
                plugin = %listener.owner,
                event = %listener.event,
                "Listener failed: {e:#}"
            );
        }
        Err(_) => {
            error!(
                plugin = %listener.owner,
                event = %listener.event,
                "Listener panicked, continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::listener_fn;
    use crate::platform::InboundMessage;
    use parking_lot::Mutex;
    use regex::Regex;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> crate::events::ListenerFn {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        listener_fn(move |_| {
            let log = Arc::clone(&log);
            let tag = tag.clone();
            async move {
                log.lock().push(tag);
                Ok(())
            }
        })
    }

    fn message(text: &str) -> EventPayload {
        EventPayload::Message(Arc::new(InboundMessage {
            text: Some(text.to_string()),
            ..InboundMessage::default()
        }))
    }

    #[tokio::test]
    async fn lower_priority_starts_first_and_ties_keep_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry
            .register("a", ListenerSpec::new("message", recorder(&log, "late")).priority(200))
            .unwrap();
        registry
            .register("b", ListenerSpec::new("message", recorder(&log, "first")).priority(10))
            .unwrap();
        registry
            .register("c", ListenerSpec::new("message", recorder(&log, "tie-1")))
            .unwrap();
        registry
            .register("d", ListenerSpec::new("message", recorder(&log, "tie-2")))
            .unwrap();

        assert_eq!(
            registry.listeners_of("message"),
            vec![
                ("b".to_string(), 10),
                ("c".to_string(), 100),
                ("d".to_string(), 100),
                ("a".to_string(), 200),
            ]
        );

        let scheduled = registry.dispatch("message", message("hi"), true).await;
        assert_eq!(scheduled, 4);
        assert_eq!(*log.lock(), vec!["first", "tie-1", "tie-2", "late"]);
    }

    #[tokio::test]
    async fn unknown_event_is_noop() {
        let registry = ListenerRegistry::new();
        assert_eq!(registry.dispatch("nope", EventPayload::Empty, true).await, 0);
    }

    #[tokio::test]
    async fn predicate_filters_listeners() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                "p",
                ListenerSpec::new("message", recorder(&log, "matched"))
                    .pattern(Regex::new(r"^ping$").unwrap()),
            )
            .unwrap();

        assert_eq!(registry.dispatch("message", message("pong"), true).await, 0);
        assert_eq!(registry.dispatch("message", message("ping"), true).await, 1);
        assert_eq!(*log.lock(), vec!["matched"]);
    }

    #[test]
    fn pattern_on_lifecycle_event_is_rejected() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = registry
            .register(
                "p",
                ListenerSpec::new("start", recorder(&log, "x")).pattern(Regex::new("x").unwrap()),
            )
            .unwrap_err();
        assert!(matches!(err, ListenerError::PatternUnsupported { .. }));
        assert!(registry.events().is_empty());
    }

    #[test]
    fn unregister_removes_emptied_lists() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = registry
            .register("a", ListenerSpec::new("message", recorder(&log, "x")))
            .unwrap();
        assert!(registry.events().contains("message"));

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.events().is_empty());
    }

    #[test]
    fn unregister_all_only_touches_owner() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register("a", ListenerSpec::new("message", recorder(&log, "1")))
            .unwrap();
        registry
            .register("a", ListenerSpec::new("start", recorder(&log, "2")))
            .unwrap();
        registry
            .register("b", ListenerSpec::new("message", recorder(&log, "3")))
            .unwrap();

        assert_eq!(registry.unregister_all("a"), 2);
        assert_eq!(registry.listeners_of("message"), vec![("b".to_string(), 100)]);
        assert!(!registry.events().contains("start"));
    }

    #[tokio::test]
    async fn failing_listener_does_not_stop_others() {
        let registry = ListenerRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));

        registry
            .register(
                "broken",
                ListenerSpec::new(
                    "message",
                    listener_fn(|_| async { anyhow::bail!("boom") }),
                )
                .priority(1),
            )
            .unwrap();
        registry
            .register(
                "panicky",
                ListenerSpec::new(
                    "message",
                    listener_fn(|_| async {
                        if std::hint::black_box(true) {
                            panic!("listener panic");
                        }
                        Ok(())
                    }),
                )
                .priority(2),
            )
            .unwrap();
        let counter = Arc::clone(&ran);
        registry
            .register(
                "ok",
                ListenerSpec::new(
                    "message",
                    listener_fn(move |_| {
                        let counter = Arc::clone(&counter);
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .priority(3),
            )
            .unwrap();

        assert_eq!(registry.dispatch("message", message("x"), true).await, 3);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fire_and_forget_returns_before_listener_finishes() {
        let registry = ListenerRegistry::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Arc::new(Mutex::new(Some(rx)));
        let done = Arc::new(AtomicUsize::new(0));
        let done_in_listener = Arc::clone(&done);

        registry
            .register(
                "slow",
                ListenerSpec::new(
                    "message",
                    listener_fn(move |_| {
                        let rx = rx.lock().take();
                        let done = Arc::clone(&done_in_listener);
                        async move {
                            if let Some(rx) = rx {
                                let _ = rx.await;
                            }
                            done.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                ),
            )
            .unwrap();

        assert_eq!(registry.dispatch("message", message("x"), false).await, 1);
        assert_eq!(done.load(Ordering::SeqCst), 0);
        tx.send(()).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriptions_track_event_names() {
        let registry = ListenerRegistry::new();
        let rx = registry.subscribe();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = registry
            .register("a", ListenerSpec::new("inline_query", recorder(&log, "x")))
            .unwrap();
        assert!(rx.borrow().contains("inline_query"));

        registry.unregister(id);
        assert!(rx.borrow().is_empty());
    }
}
