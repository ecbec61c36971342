//! The readiness-watcher / event-loop collaborator.
//!
//! The event loop is treated as an external collaborator: `watch(fd,
//! direction, callback) -> handle`, `unwatch(handle)`,
//! `schedule(callback)`. The single-resolution-per-register nature of
//! `watch` maps directly onto an `async fn ready(fd, interest) ->
//! io::Result<()>` call: awaiting it is "watch then get called back
//! once"; dropping the returned future before it resolves is "unwatch".
//!
//! [`TokioReactor`] is the one production implementation, backing each
//! watched descriptor with a [`tokio::io::unix::AsyncFd`]. [`TestReactor`]
//! is a manually-driven double so unit tests can exercise every
//! readiness path without a real descriptor.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Which direction of readiness is being waited for.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Interest {
    Readable,
    Writable,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Event-loop collaborator: wait for a descriptor to become ready, and
/// run deferred callbacks on the next tick.
pub trait Reactor: Send + Sync + 'static {
    /// Resolve once `fd` is ready for `interest`. Dropping the returned
    /// future before it resolves is the "unwatch" half of the contract.
    fn ready(&self, fd: RawFd, interest: Interest) -> BoxFuture<'static, io::Result<()>>;

    /// Queue `task` to run on the next loop tick, used to defer checks
    /// like "has everything pending finished flushing" out of the
    /// current call stack.
    fn schedule(&self, task: BoxFuture<'static, ()>);

    /// Drop any registration held for `fd`, called when a stream closes
    /// its descriptor so a reused fd number doesn't inherit stale
    /// readiness state. No-op by default; only [`TokioReactor`] keeps a
    /// per-fd registration worth dropping.
    fn forget(&self, _fd: RawFd) {}
}

/// Production [`Reactor`] backed by Tokio's `AsyncFd`.
///
/// One `AsyncFd` is created per distinct raw descriptor the first time
/// it is watched, then reused for every subsequent `ready` call on that
/// descriptor (an `AsyncFd` supports awaiting both readable and
/// writable interest concurrently).
#[derive(Default)]
pub struct TokioReactor {
    registered: Mutex<HashMap<RawFd, Arc<tokio::io::unix::AsyncFd<RawFdHandle>>>>,
}

/// Thin `AsRawFd` wrapper so a bare [`RawFd`] can be handed to
/// `AsyncFd::new`. Does not own or close the descriptor — the owning
/// [`crate::fd::FdSource`] is responsible for that.
pub struct RawFdHandle(RawFd);

impl std::os::fd::AsRawFd for RawFdHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl TokioReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn get_or_register(&self, fd: RawFd) -> io::Result<Arc<tokio::io::unix::AsyncFd<RawFdHandle>>> {
        let mut table = self.registered.lock().expect("reactor table poisoned");
        if let Some(existing) = table.get(&fd) {
            return Ok(existing.clone());
        }
        let async_fd = Arc::new(tokio::io::unix::AsyncFd::new(RawFdHandle(fd))?);
        table.insert(fd, async_fd.clone());
        Ok(async_fd)
    }
}

impl Reactor for TokioReactor {
    fn ready(&self, fd: RawFd, interest: Interest) -> BoxFuture<'static, io::Result<()>> {
        let registration = self.get_or_register(fd);
        Box::pin(async move {
            let async_fd = registration?;
            match interest {
                Interest::Readable => {
                    let mut guard = async_fd.readable().await?;
                    guard.clear_ready();
                }
                Interest::Writable => {
                    let mut guard = async_fd.writable().await?;
                    guard.clear_ready();
                }
            }
            Ok(())
        })
    }

    fn schedule(&self, task: BoxFuture<'static, ()>) {
        tokio::task::spawn(task);
    }

    /// Drop the registration for `fd`, called from `Readable`/`Writable`
    /// close paths so a reused fd number from a later `open()` doesn't
    /// inherit stale readiness state.
    fn forget(&self, fd: RawFd) {
        self.registered.lock().expect("reactor table poisoned").remove(&fd);
    }
}

/// Test double for the reactor contract. Readiness is driven manually
/// via [`TestReactor::fire`], decoupling unit tests from real
/// descriptors entirely — fake keys are fine.
#[derive(Default)]
pub struct TestReactor {
    waiters: Mutex<HashMap<(RawFd, Interest), Vec<oneshot::Sender<()>>>>,
    scheduled: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl TestReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake every task currently waiting on `(fd, interest)`.
    pub fn fire(&self, fd: RawFd, interest: Interest) {
        let senders = {
            let mut waiters = self.waiters.lock().expect("waiters poisoned");
            waiters.remove(&(fd, interest)).unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(());
        }
    }

    /// Run every task queued via [`Reactor::schedule`] to completion.
    pub async fn drain_scheduled(&self) {
        let tasks = std::mem::take(&mut *self.scheduled.lock().expect("scheduled poisoned"));
        for task in tasks {
            task.await;
        }
    }
}

impl Reactor for TestReactor {
    fn ready(&self, fd: RawFd, interest: Interest) -> BoxFuture<'static, io::Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiters poisoned")
            .entry((fd, interest))
            .or_default()
            .push(tx);
        Box::pin(async move {
            rx.await
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "test reactor dropped"))
        })
    }

    fn schedule(&self, task: BoxFuture<'static, ()>) {
        self.scheduled.lock().expect("scheduled poisoned").push(task);
    }
}
