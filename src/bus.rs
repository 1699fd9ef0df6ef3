use crate::error::HandlerError;
use crate::event::Event;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub type HandlerResult = Result<(), HandlerError>;

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> HandlerResult + Send + Sync,
{
    fn handle(&self, event: &Event) -> HandlerResult {
        self(event)
    }
}

/// Token returned by [`EventBus::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Entry = (HandlerId, Arc<dyn EventHandler>);

/// Synchronous fan-out of events to handlers, in registration order.
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: impl EventHandler + 'static) -> HandlerId {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, handler));
        id
    }

    /// Returns false if the handler was already removed.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.entries();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handlers registered or removed while this runs take effect on the next
    /// dispatch. Handler failures and panics are logged and swallowed.
    pub fn dispatch(&self, event: &Event) {
        let snapshot: Vec<Entry> = self.entries().clone();

        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(handler = id.0, kind = %event.kind(), "Event handler failed: {}", err);
                }
                Err(_) => {
                    tracing::warn!(handler = id.0, kind = %event.kind(), "Event handler panicked");
                }
            }
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        // A handler never runs while the lock is held, so poisoning carries no
        // broken invariant.
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl EventHandler + 'static {
        let log = Arc::clone(log);
        move |event: &Event| -> HandlerResult {
            log.lock()
                .unwrap()
                .push(format!("{}:{}", name, event.kind()));
            Ok(())
        }
    }

    #[test]
    fn dispatches_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(recorder(&log, "a"));
        bus.register(recorder(&log, "b"));
        bus.register(recorder(&log, "c"));

        bus.dispatch(&Event::delta("x"));
        bus.dispatch(&Event::SessionIdle);

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "a:assistant.message_delta",
                "b:assistant.message_delta",
                "c:assistant.message_delta",
                "a:session.idle",
                "b:session.idle",
                "c:session.idle",
            ]
        );
    }

    #[test]
    fn failing_handlers_do_not_stop_dispatch() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(|_: &Event| -> HandlerResult { Err("console closed".into()) });
        bus.register(|_: &Event| -> HandlerResult { panic!("boom") });
        bus.register(recorder(&log, "after"));

        bus.dispatch(&Event::SessionIdle);

        assert_eq!(*log.lock().unwrap(), vec!["after:session.idle"]);
    }

    #[test]
    fn unregister_removes_once() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = bus.register(recorder(&log, "first"));
        bus.register(recorder(&log, "second"));

        assert!(bus.unregister(first));
        assert!(!bus.unregister(first));
        assert_eq!(bus.len(), 1);

        bus.dispatch(&Event::SessionIdle);
        assert_eq!(*log.lock().unwrap(), vec!["second:session.idle"]);
    }

    #[test]
    fn registration_during_dispatch_applies_next_time() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let bus_inner = Arc::clone(&bus);
        let log_inner = Arc::clone(&log);
        bus.register(move |_: &Event| -> HandlerResult {
            bus_inner.register(recorder(&log_inner, "late"));
            Ok(())
        });

        bus.dispatch(&Event::delta("1"));
        assert!(log.lock().unwrap().is_empty());

        bus.dispatch(&Event::delta("2"));
        assert_eq!(*log.lock().unwrap(), vec!["late:assistant.message_delta"]);
    }
}
