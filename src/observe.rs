//! Synchronous publish/subscribe registry.
//!
//! Handlers are registered per event kind and invoked in registration order,
//! on the emitting task, at the point the state change happens. Handlers
//! must be cheap; anything slow should forward into a channel.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Events that can be routed by kind.
pub trait Event {
    type Kind: Copy + Eq + Hash + Send + Sync + std::fmt::Debug;

    fn kind(&self) -> Self::Kind;
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`Observers::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of `kind -> handlers`.
pub struct Observers<E: Event> {
    handlers: RwLock<HashMap<E::Kind, Vec<(SubscriptionId, Handler<E>)>>>,
    catch_all: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E: Event> Default for Observers<E> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            catch_all: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: Event> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscriptions", &self.len())
            .finish()
    }
}

impl<E: Event> Observers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to one kind of event.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every event regardless of kind.
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.catch_all
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        let mut catch_all = self.catch_all.write().unwrap_or_else(|p| p.into_inner());
        let before = catch_all.len();
        catch_all.retain(|(sid, _)| *sid != id);
        removed | (catch_all.len() != before)
    }

    /// Deliver `event` to kind-specific handlers, then catch-all handlers.
    ///
    /// The handler list is cloned before invocation so a handler may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &E) {
        let specific: Vec<Handler<E>> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        let general: Vec<Handler<E>> = self
            .catch_all
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in specific.iter().chain(general.iter()) {
            handler(event);
        }
    }

    /// Detach every handler.
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.catch_all
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Total number of live subscriptions.
    pub fn len(&self) -> usize {
        let specific: usize = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(Vec::len)
            .sum();
        specific + self.catch_all.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    #[derive(Debug)]
    struct Msg(Kind, u32);

    impl Event for Msg {
        type Kind = Kind;
        fn kind(&self) -> Kind {
            self.0
        }
    }

    #[test]
    fn test_handlers_receive_only_their_kind() {
        let observers: Observers<Msg> = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        observers.on(Kind::Ping, move |m| sink.lock().unwrap().push(m.1));

        observers.emit(&Msg(Kind::Ping, 1));
        observers.emit(&Msg(Kind::Pong, 2));
        observers.emit(&Msg(Kind::Ping, 3));

        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_catch_all_and_off() {
        let observers: Observers<Msg> = Observers::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = observers.on_any(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&Msg(Kind::Ping, 0));
        observers.emit(&Msg(Kind::Pong, 0));
        assert!(observers.off(id));
        assert!(!observers.off(id));
        observers.emit(&Msg(Kind::Pong, 0));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_detaches_everything() {
        let observers: Observers<Msg> = Observers::new();
        observers.on(Kind::Ping, |_| {});
        observers.on_any(|_| {});
        assert_eq!(observers.len(), 2);
        observers.clear();
        assert!(observers.is_empty());
    }
}
