//! The cancellable, single-resolution future returned by every
//! `read*`/`write*`/`end`/`pipe` call.
//!
//! A concrete struct implementing [`Future`] rather than an opaque
//! `async fn` return, so callers can still call inherent methods
//! (`cancel`, `is_cancelled`) on the value before or instead of
//! `.await`ing it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::StreamError;

/// Shared cancellation flag for one pending-read or pending-write entry.
///
/// Cloning gives a second handle to the same flag; the core's queue
/// entry holds one clone, the [`Cancellable`] future holds the other, so
/// a core can check `is_set()` to skip resolving an entry whose caller
/// has already walked away — a cancelled pending read or write never
/// resolves, not even with an error.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One end of a resolver/future pair: the producer side, held inside a
/// core's pending-read or pending-write queue entry.
pub type Resolver<T> = oneshot::Sender<Result<T, StreamError>>;

/// Create a resolver/future pair plus the shared cancel flag the core
/// should stash alongside the resolver in its pending queue.
pub fn pair<T>() -> (Resolver<T>, CancelFlag, Cancellable<T>) {
    let (tx, rx) = oneshot::channel();
    let flag = CancelFlag::new();
    let future = Cancellable {
        rx,
        cancelled: flag.clone(),
        on_cancel: None,
    };
    (tx, flag, future)
}

/// Build a future that is already resolved, for operations rejected
/// synchronously (e.g. `read()` on a non-readable stream).
pub fn ready<T>(result: Result<T, StreamError>) -> Cancellable<T> {
    let (tx, _flag, future) = pair();
    let _ = tx.send(result);
    future
}

/// A cancellable, single-resolution future.
///
/// Dropping it without calling [`Cancellable::cancel`] is equivalent to
/// never cancelling: the underlying request stays queued and, if never
/// polled again, simply never has its result observed (the entry itself
/// is still removed by the core once it resolves, so no core-side state
/// leaks).
pub struct Cancellable<T> {
    rx: oneshot::Receiver<Result<T, StreamError>>,
    cancelled: CancelFlag,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Cancellable<T> {
    /// Attach a hook that is run synchronously, exactly once, the first
    /// time [`Cancellable::cancel`] is called. Used by cores to detach
    /// the matching pending-queue entry (and, for writes, trim
    /// not-yet-flushed bytes from the tail of the buffer).
    pub fn set_cancel_handler(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_cancel = Some(Box::new(hook));
    }

    /// Abort the operation. Idempotent: calling it twice runs the
    /// cancellation hook only once.
    pub fn cancel(&mut self) {
        if self.cancelled.is_set() {
            return;
        }
        self.cancelled.set();
        if let Some(hook) = self.on_cancel.take() {
            hook();
        }
    }

    /// Whether this future has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_set()
    }
}

impl<T> Future for Cancellable<T> {
    type Output = Result<T, StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cancelled.is_set() {
            return Poll::Ready(Err(StreamError::Cancelled));
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_dropped)) => Poll::Ready(Err(StreamError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn resolves_with_value() {
        let (tx, _flag, fut) = pair::<u32>();
        tx.send(Ok(7)).unwrap();
        assert_eq!(fut.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancel_short_circuits_before_poll() {
        let (_tx, _flag, mut fut) = pair::<u32>();
        fut.cancel();
        assert!(matches!(fut.await, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_runs_hook_exactly_once() {
        let (_tx, _flag, mut fut) = pair::<u32>();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = calls.clone();
        fut.set_cancel_handler(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        fut.cancel();
        fut.cancel();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_sender_resolves_closed() {
        let (tx, _flag, fut) = pair::<u32>();
        drop(tx);
        assert!(matches!(fut.await, Err(StreamError::Closed)));
    }
}
