//! Listener registry.
//!
//! Components that report lifecycle events (stream connections, live
//! sources) hold an [`EventBus`] instead of ad hoc callback fields.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(ListenerId, Handler<E>)>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler. Handlers run in registration order.
    pub fn on<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Deliver an event to every handler registered at the time of the call.
    ///
    /// The lock is released before handlers run, so a handler may call
    /// `on`/`off` on the same bus.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_all_handlers_in_order() {
        let bus = EventBus::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        bus.on(move |e| a.lock().push(("a", *e)));
        let b = Arc::clone(&seen);
        bus.on(move |e| b.lock().push(("b", *e)));

        bus.emit(&7);
        assert_eq!(*seen.lock(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(&());
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_handler_may_register_during_emit() {
        let bus = Arc::new(EventBus::<()>::new());
        let inner = Arc::clone(&bus);
        bus.on(move |_| {
            inner.on(|_| {});
        });
        bus.emit(&());
        assert_eq!(bus.len(), 2);
    }
}
