//! Minimal per-instance event emitter: `on`/`once`/`off`/`emit` plus a
//! listener-presence query, implemented over a plain `Vec` rather than
//! pulling in a dependency for what is a handful of methods.
//!
//! Listeners run synchronously, inline in `emit`, on whatever task
//! calls it, matching the single-threaded, cooperative model the rest
//! of this crate uses. A listener that panics is caught; the panic is
//! turned into an `error` event and re-emitted so other listeners can
//! react to it, except when the panic happened inside an `error`
//! listener itself, where re-emitting would recurse forever, so that
//! case is only logged via `tracing::error!`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lets [`Emitter::emit`] recognize an event kind's `error` variant, so
/// a listener panic can be turned into one and re-emitted instead of
/// only logged, and so that re-emission doesn't recurse when the panic
/// happened inside an `error` handler.
pub trait EventTaxonomy: Sized {
    /// True if `self` is this event kind's `error` variant.
    fn is_error(&self) -> bool;

    /// Build the `error` variant carrying a listener panic's message.
    fn from_listener_panic(message: String) -> Self;
}

/// A listener identifier returned by [`Emitter::on`]/[`Emitter::once`],
/// usable with [`Emitter::off`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ListenerId(u64);

struct Listener<E> {
    id: ListenerId,
    once: bool,
    callback: Box<dyn FnMut(&E) + Send>,
}

/// A synchronous multi-subscriber broadcaster for one stream's events.
///
/// `E` is typically an enum of the events a stream kind documents, e.g.
/// `ReadableEvent` in [`crate::readable`].
pub struct Emitter<E> {
    listeners: Vec<Listener<E>>,
    next_id: AtomicU64,
    name: &'static str,
}

impl<E> Emitter<E> {
    /// Create an emitter. `name` is used only in log lines, to identify
    /// which stream's events are being traced.
    pub fn new(name: &'static str) -> Self {
        Self {
            listeners: Vec::new(),
            next_id: AtomicU64::new(1),
            name,
        }
    }

    fn alloc_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a listener that fires on every emission of this event
    /// stream until removed with [`Emitter::off`].
    pub fn on(&mut self, callback: impl FnMut(&E) + Send + 'static) -> ListenerId {
        let id = self.alloc_id();
        self.listeners.push(Listener {
            id,
            once: false,
            callback: Box::new(callback),
        });
        id
    }

    /// Register a listener that fires at most once, then is removed
    /// automatically.
    pub fn once(&mut self, callback: impl FnMut(&E) + Send + 'static) -> ListenerId {
        let id = self.alloc_id();
        self.listeners.push(Listener {
            id,
            once: true,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a previously-registered listener. No-op if already removed
    /// (once-fired or explicitly `off`'d).
    pub fn off(&mut self, id: ListenerId) {
        self.listeners.retain(|l| l.id != id);
    }

    /// Whether any listener is currently registered.
    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Fire `event` to every registered listener, in registration order,
    /// then drop any `once` listeners that just ran.
    ///
    /// If a listener panics, the panic is caught and turned into this
    /// event kind's `error` variant, re-emitted once every listener in
    /// this pass has run. A panic caught while already emitting an
    /// `error` event is only logged, to avoid recursing forever.
    pub fn emit(&mut self, event: &E)
    where
        E: EventTaxonomy,
    {
        let is_error_event = event.is_error();
        let mut finished_once = Vec::new();
        let mut panics = Vec::new();
        for listener in &mut self.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| (listener.callback)(event)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<opaque panic>".to_string());
                if is_error_event {
                    tracing::error!(stream = self.name, "listener panicked while handling an error event: {message}");
                } else {
                    panics.push(message);
                }
            }
            if listener.once {
                finished_once.push(listener.id);
            }
        }
        if !finished_once.is_empty() {
            self.listeners.retain(|l| !finished_once.contains(&l.id));
        }
        for message in panics {
            let error_event = E::from_listener_panic(message);
            self.emit(&error_event);
        }
    }
}
