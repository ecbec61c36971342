//! The writable-stream state machine.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::cancel::{self, Cancellable, Resolver};
use crate::emitter::{Emitter, EventTaxonomy, ListenerId};
use crate::error::StreamError;
use crate::fd::IoSource;
use crate::reactor::{Interest, Reactor};

/// Soft limit (bytes buffered but not yet flushed) above which `write`
/// reports backpressure.
pub const DEFAULT_SOFT_LIMIT: usize = 1 << 16;

#[derive(Debug, Clone)]
pub enum WritableEvent {
    Drain,
    Finish,
    Error(StreamError),
    Close,
}

impl EventTaxonomy for WritableEvent {
    fn is_error(&self) -> bool {
        matches!(self, WritableEvent::Error(_))
    }

    fn from_listener_panic(message: String) -> Self {
        WritableEvent::Error(io::Error::new(io::ErrorKind::Other, message).into())
    }
}

struct PendingWrite {
    byte_len: usize,
    bytes_remaining: usize,
    resolver: Resolver<usize>,
    cancelled: crate::cancel::CancelFlag,
}

struct WritableState {
    sink: Box<dyn IoSource>,
    soft_limit: usize,
    buffer: crate::buf::ByteQueue,
    pending_writes: VecDeque<PendingWrite>,
    writable: bool,
    ending: bool,
    closed: bool,
    corked: bool,
    emitter: Emitter<WritableEvent>,
    end_waiters: Vec<Resolver<()>>,
}

impl WritableState {
    fn should_arm(&self) -> bool {
        self.writable && !self.closed && !self.corked && !self.buffer.is_empty()
    }

    /// Bytes queued but not yet handed to the OS.
    fn bytes_buffered(&self) -> usize {
        self.buffer.len()
    }
}

struct WritableInner {
    state: Mutex<WritableState>,
    reactor: Arc<dyn Reactor>,
    notify: Notify,
}

/// A writable byte stream over a non-blocking descriptor.
///
/// Exclusively owns its `sink`; dropping it closes the descriptor if it
/// was not already closed.
pub struct Writable {
    inner: Arc<WritableInner>,
}

impl Writable {
    pub fn new(sink: Box<dyn IoSource>, reactor: Arc<dyn Reactor>) -> Self {
        Self::with_soft_limit(sink, reactor, DEFAULT_SOFT_LIMIT)
    }

    pub fn with_soft_limit(sink: Box<dyn IoSource>, reactor: Arc<dyn Reactor>, soft_limit: usize) -> Self {
        let state = WritableState {
            sink,
            soft_limit: soft_limit.max(1),
            buffer: crate::buf::ByteQueue::new(),
            pending_writes: VecDeque::new(),
            writable: true,
            ending: false,
            closed: false,
            corked: false,
            emitter: Emitter::new("writable"),
            end_waiters: Vec::new(),
        };
        let inner = Arc::new(WritableInner {
            state: Mutex::new(state),
            reactor,
            notify: Notify::new(),
        });
        let weak = Arc::downgrade(&inner);
        tokio::task::spawn(Self::pump(weak));
        Self { inner }
    }

    pub fn bytes_buffered(&self) -> usize {
        self.inner.state.lock().expect("writable state poisoned").bytes_buffered()
    }

    pub fn is_writable(&self) -> bool {
        self.inner.state.lock().expect("writable state poisoned").writable
    }

    pub fn is_ending(&self) -> bool {
        self.inner.state.lock().expect("writable state poisoned").ending
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("writable state poisoned").closed
    }

    pub fn on(&self, callback: impl FnMut(&WritableEvent) + Send + 'static) -> ListenerId {
        self.inner.state.lock().expect("writable state poisoned").emitter.on(callback)
    }

    pub fn off(&self, id: ListenerId) {
        self.inner.state.lock().expect("writable state poisoned").emitter.off(id);
    }

    /// Hold writes in the buffer without arming the pump until
    /// [`Writable::uncork`], so several small `write` calls can be
    /// coalesced into one syscall.
    pub fn cork(&self) {
        self.inner.state.lock().expect("writable state poisoned").corked = true;
    }

    pub fn uncork(&self) {
        let mut state = self.inner.state.lock().expect("writable state poisoned");
        state.corked = false;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Queue `bytes` for writing. Resolves with the number of bytes
    /// flushed to the OS for this call once they have been handed off
    /// (not necessarily flushed to the peer). The boolean return
    /// describes backpressure: `false` means the buffered-but-unwritten
    /// total now exceeds `soft_limit` and the caller should wait for a
    /// `drain` event before writing more.
    pub fn write(&self, bytes: &[u8]) -> (Cancellable<usize>, bool) {
        Self::write_via(&self.inner, bytes)
    }

    fn write_via(inner: &Arc<WritableInner>, bytes: &[u8]) -> (Cancellable<usize>, bool) {
        let mut state = inner.state.lock().expect("writable state poisoned");
        if state.closed {
            return (cancel::ready(Err(StreamError::Closed)), true);
        }
        if !state.writable || state.ending {
            return (cancel::ready(Err(StreamError::NotWritable)), true);
        }
        state.buffer.append(bytes);
        let (resolver, flag, mut future) = cancel::pair();
        state.pending_writes.push_back(PendingWrite {
            byte_len: bytes.len(),
            bytes_remaining: bytes.len(),
            resolver,
            cancelled: flag,
        });
        let below_limit = state.bytes_buffered() <= state.soft_limit;
        drop(state);
        inner.notify.notify_waiters();
        let inner_for_cancel = inner.clone();
        future.set_cancel_handler(move || {
            let mut state = inner_for_cancel.state.lock().expect("writable state poisoned");
            // The bytes for this write are already appended to the
            // shared tail buffer, intermixed with any writes queued
            // after it; trimming them back out would shift every
            // subsequent pending write's offset, so a cancelled write's
            // bytes are still flushed — only the caller's notification
            // of completion is suppressed.
            state.pending_writes.retain(|p| !p.cancelled.is_set());
            drop(state);
            inner_for_cancel.notify.notify_waiters();
        });
        (future, below_limit)
    }

    /// Convenience: write a line, appending `\n` if `line` doesn't
    /// already end with one.
    pub fn write_line(&self, line: &[u8]) -> (Cancellable<usize>, bool) {
        if line.last() == Some(&b'\n') {
            self.write(line)
        } else {
            let mut owned = line.to_vec();
            owned.push(b'\n');
            self.write(&owned)
        }
    }

    /// Queue all of `bytes`, resolving only once every chunk has been
    /// handed to the OS, ignoring backpressure — the caller has already
    /// decided to send everything.
    pub fn write_all(&self, bytes: Vec<u8>) -> Cancellable<()> {
        let inner = self.inner.clone();
        self.spawn_composed(async move {
            let (fut, _below_limit) = Writable::write_via(&inner, &bytes);
            fut.await?;
            Ok(())
        })
    }

    fn spawn_composed<F>(&self, fut: F) -> Cancellable<()>
    where
        F: std::future::Future<Output = Result<(), StreamError>> + Send + 'static,
    {
        let (tx, _flag, mut future) = cancel::pair();
        let handle = tokio::task::spawn(async move {
            let _ = tx.send(fut.await);
        });
        future.set_cancel_handler(move || handle.abort());
        future
    }

    /// Signal that no further writes will be issued. Resolves once the
    /// buffer has fully drained and `finish` has been emitted.
    pub fn end(&self) -> Cancellable<()> {
        let mut state = self.inner.state.lock().expect("writable state poisoned");
        if state.closed {
            return cancel::ready(Err(StreamError::Closed));
        }
        state.ending = true;
        if state.buffer.is_empty() && state.pending_writes.is_empty() {
            Self::finish_locked(&mut state, &self.inner.reactor);
            return cancel::ready(Ok(()));
        }
        let (resolver, _flag, future) = cancel::pair();
        state.end_waiters.push(resolver);
        drop(state);
        self.inner.notify.notify_waiters();
        future
    }

    fn finish_locked(state: &mut WritableState, reactor: &Arc<dyn Reactor>) {
        if state.closed {
            return;
        }
        state.writable = false;
        state.emitter.emit(&WritableEvent::Finish);
        for waiter in state.end_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        Self::close_locked(state, reactor);
    }

    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("writable state poisoned");
        Self::close_locked(&mut state, &self.inner.reactor);
    }

    fn close_locked(state: &mut WritableState, reactor: &Arc<dyn Reactor>) {
        if state.closed {
            return;
        }
        state.closed = true;
        state.writable = false;
        let key = state.sink.reactor_key();
        let _ = state.sink.close();
        reactor.forget(key);
        for pending in state.pending_writes.drain(..) {
            if !pending.cancelled.is_set() {
                let _ = pending.resolver.send(Err(StreamError::Closed));
            }
        }
        for waiter in state.end_waiters.drain(..) {
            let _ = waiter.send(Err(StreamError::Closed));
        }
        state.emitter.emit(&WritableEvent::Close);
    }

    async fn pump(weak: Weak<WritableInner>) {
        loop {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            loop {
                let armed = {
                    let state = inner.state.lock().expect("writable state poisoned");
                    if state.closed {
                        return;
                    }
                    state.should_arm()
                };
                if armed {
                    break;
                }
                inner.notify.notified().await;
            }
            let (key, kind) = {
                let state = inner.state.lock().expect("writable state poisoned");
                (state.sink.reactor_key(), state.sink.kind())
            };
            if kind.needs_readiness_wait() {
                if let Err(err) = inner.reactor.ready(key, Interest::Writable).await {
                    Self::fail(&inner, err.into());
                    continue;
                }
            }
            Self::on_writable(&inner);
            tokio::task::yield_now().await;
        }
    }

    fn on_writable(inner: &Arc<WritableInner>) {
        let mut state = inner.state.lock().expect("writable state poisoned");
        if state.corked || state.buffer.is_empty() {
            return;
        }
        let chunk = state.buffer.as_slice().to_vec();
        let was_over_limit = state.bytes_buffered() > state.soft_limit;
        match state.sink.try_write(&chunk) {
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                let stream_err: StreamError = err.into();
                drop(state);
                Self::fail(inner, stream_err);
            }
            Ok(0) => {
                // A non-blocking write reported ready that then accepts
                // zero bytes would otherwise spin the pump forever.
                drop(state);
                let err = io::Error::new(io::ErrorKind::WriteZero, "write accepted zero bytes").into();
                Self::fail(inner, err);
            }
            Ok(n) => {
                state.buffer.consume(n);
                Self::settle_pending(&mut state, n);
                let drained_to_zero = state.buffer.is_empty();
                if was_over_limit || drained_to_zero {
                    state.emitter.emit(&WritableEvent::Drain);
                }
                if drained_to_zero && state.ending && state.pending_writes.is_empty() {
                    Self::finish_locked(&mut state, &inner.reactor);
                }
            }
        }
    }

    /// Resolve every pending write fully covered by the `n` bytes just
    /// handed to the OS, in FIFO order — preserves the ordering
    /// guarantee a caller relies on when awaiting several `write` calls
    /// back to back. A pending write only partially covered by `n` (a
    /// short `try_write`) has its remaining count reduced instead of
    /// being resolved, so it stays at the front of the queue until a
    /// later flush finishes it off.
    fn settle_pending(state: &mut WritableState, mut n: usize) {
        while n > 0 {
            let Some(front) = state.pending_writes.front_mut() else { break };
            if front.bytes_remaining > n {
                front.bytes_remaining -= n;
                break;
            }
            n -= front.bytes_remaining;
            let pending = state.pending_writes.pop_front().expect("front existed");
            if !pending.cancelled.is_set() {
                let _ = pending.resolver.send(Ok(pending.byte_len));
            }
        }
    }

    fn fail(inner: &Arc<WritableInner>, err: StreamError) {
        let mut state = inner.state.lock().expect("writable state poisoned");
        state.emitter.emit(&WritableEvent::Error(err.clone()));
        for pending in state.pending_writes.drain(..) {
            if !pending.cancelled.is_set() {
                let _ = pending.resolver.send(Err(err.clone()));
            }
        }
        for waiter in state.end_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        Self::close_locked(&mut state, &inner.reactor);
    }
}

impl Drop for Writable {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("writable state poisoned");
        Self::close_locked(&mut state, &self.inner.reactor);
    }
}
