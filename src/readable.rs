//! The readable-stream state machine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::cancel::{self, CancelFlag, Cancellable, Resolver};
use crate::emitter::{Emitter, EventTaxonomy, ListenerId};
use crate::error::StreamError;
use crate::fd::IoSource;
use crate::reactor::{Interest, Reactor};

/// Default read quantum used when `read(None)` doesn't specify one.
pub const DEFAULT_CHUNK_SIZE: usize = 65_536;

/// The result of one `read*` call: either a non-empty chunk, or the
/// distinguished "no-more-data" sentinel delivered at EOF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    NoMoreData,
}

impl ReadOutcome {
    pub fn is_eof(&self) -> bool {
        matches!(self, ReadOutcome::NoMoreData)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ReadOutcome::Data(bytes) => bytes,
            ReadOutcome::NoMoreData => Vec::new(),
        }
    }
}

/// Events a [`Readable`] emits.
#[derive(Debug, Clone)]
pub enum ReadableEvent {
    Data(Vec<u8>),
    End,
    Error(StreamError),
    Close,
    Pause,
    Resume,
}

impl EventTaxonomy for ReadableEvent {
    fn is_error(&self) -> bool {
        matches!(self, ReadableEvent::Error(_))
    }

    fn from_listener_panic(message: String) -> Self {
        ReadableEvent::Error(std::io::Error::new(std::io::ErrorKind::Other, message).into())
    }
}

struct PendingRead {
    requested_length: Option<usize>,
    resolver: Resolver<ReadOutcome>,
    cancelled: CancelFlag,
}

struct ReadableState {
    source: Box<dyn IoSource>,
    chunk_size: usize,
    buffer: crate::buf::ByteQueue,
    pending_reads: VecDeque<PendingRead>,
    readable: bool,
    paused: bool,
    closed: bool,
    eof: bool,
    emitter: Emitter<ReadableEvent>,
}

impl ReadableState {
    fn should_arm(&self) -> bool {
        self.readable && !self.closed && !self.eof && (!self.paused || !self.pending_reads.is_empty())
    }
}

struct ReadableInner {
    state: Mutex<ReadableState>,
    reactor: Arc<dyn Reactor>,
    notify: Notify,
}

/// A readable byte stream over a non-blocking descriptor.
///
/// Exclusively owns its `source`; dropping it closes the descriptor if
/// it was not already closed.
pub struct Readable {
    inner: Arc<ReadableInner>,
}

impl Readable {
    /// Build a readable stream, starting `paused` with an empty buffer.
    pub fn new(source: Box<dyn IoSource>, reactor: Arc<dyn Reactor>) -> Self {
        Self::with_chunk_size(source, reactor, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(source: Box<dyn IoSource>, reactor: Arc<dyn Reactor>, chunk_size: usize) -> Self {
        let state = ReadableState {
            source,
            chunk_size: chunk_size.max(1),
            buffer: crate::buf::ByteQueue::new(),
            pending_reads: VecDeque::new(),
            readable: true,
            paused: true,
            closed: false,
            eof: false,
            emitter: Emitter::new("readable"),
        };
        let inner = Arc::new(ReadableInner {
            state: Mutex::new(state),
            reactor,
            notify: Notify::new(),
        });
        let weak = Arc::downgrade(&inner);
        tokio::task::spawn(Self::pump(weak));
        Self { inner }
    }

    /// Default read quantum used when `read(None)` is called.
    pub fn chunk_size(&self) -> usize {
        self.inner.state.lock().expect("readable state poisoned").chunk_size
    }

    /// Current number of unread, buffered bytes.
    pub fn bytes_buffered(&self) -> usize {
        self.inner.state.lock().expect("readable state poisoned").buffer.len()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().expect("readable state poisoned").paused
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("readable state poisoned").closed
    }

    pub fn is_eof(&self) -> bool {
        self.inner.state.lock().expect("readable state poisoned").eof
    }

    pub fn on(&self, callback: impl FnMut(&ReadableEvent) + Send + 'static) -> ListenerId {
        self.inner.state.lock().expect("readable state poisoned").emitter.on(callback)
    }

    pub fn off(&self, id: ListenerId) {
        self.inner.state.lock().expect("readable state poisoned").emitter.off(id);
    }

    /// Resolve with a non-empty chunk of at most `length` (or the
    /// stream's `chunk_size`) bytes, or [`ReadOutcome::NoMoreData`] at
    /// EOF. Fails with [`StreamError::NotReadable`] if not readable.
    pub fn read(&self, length: Option<usize>) -> Cancellable<ReadOutcome> {
        Self::read_via(&self.inner, length)
    }

    /// The actual body of [`Readable::read`], over a borrowed `Arc` so
    /// composed operations (`read_line`, `read_all`, `read_exact`) can
    /// reuse it without constructing a second [`Readable`] owner — this
    /// type's `Drop` closes the descriptor, so a temporary second owner
    /// would close the stream out from under its real owner the moment
    /// it went out of scope.
    fn read_via(inner: &Arc<ReadableInner>, length: Option<usize>) -> Cancellable<ReadOutcome> {
        let mut state = inner.state.lock().expect("readable state poisoned");
        if state.closed {
            return cancel::ready(Err(StreamError::Closed));
        }
        if !state.readable {
            return cancel::ready(Err(StreamError::NotReadable));
        }
        if !state.buffer.is_empty() {
            let want = length.unwrap_or(state.chunk_size).max(1).min(state.buffer.len());
            let bytes = state.buffer.take_prefix(want);
            return cancel::ready(Ok(ReadOutcome::Data(bytes)));
        }
        if state.eof {
            return cancel::ready(Ok(ReadOutcome::NoMoreData));
        }
        let (resolver, flag, future) = cancel::pair();
        state.pending_reads.push_back(PendingRead {
            requested_length: length,
            resolver,
            cancelled: flag,
        });
        drop(state);
        inner.notify.notify_waiters();
        Self::attach_pending_read_cancel(inner, future)
    }

    fn attach_pending_read_cancel(inner: &Arc<ReadableInner>, mut future: Cancellable<ReadOutcome>) -> Cancellable<ReadOutcome> {
        let inner = inner.clone();
        future.set_cancel_handler(move || {
            let mut state = inner.state.lock().expect("readable state poisoned");
            // The entry's own cancel flag (shared with this hook via
            // `cancel::pair`) is what actually lets the pump skip it;
            // here we also drop it from the queue promptly so an empty
            // queue with no `data` listeners can disarm the watcher
            // immediately instead of waiting for the next fill.
            state.pending_reads.retain(|p| !p.cancelled.is_set());
            drop(state);
            inner.notify.notify_waiters();
        });
        future
    }

    /// Resolve with bytes up to and including the first `\n`, or up to
    /// `max_length`, or whatever precedes EOF.
    pub fn read_line(&self, max_length: Option<usize>) -> Cancellable<ReadOutcome> {
        let inner = self.inner.clone();
        self.spawn_composed(async move { Readable::read_line_inner(inner, max_length).await })
    }

    async fn read_line_inner(inner: Arc<ReadableInner>, max_length: Option<usize>) -> Result<ReadOutcome, StreamError> {
        {
            let mut state = inner.state.lock().expect("readable state poisoned");
            if let Some(outcome) = Self::try_take_line(&mut state, max_length) {
                return outcome;
            }
        }
        let mut scratch = Vec::new();
        loop {
            match Readable::read_via(&inner, None).await? {
                ReadOutcome::NoMoreData => {
                    if scratch.is_empty() {
                        return Ok(ReadOutcome::NoMoreData);
                    }
                    return Ok(ReadOutcome::Data(scratch));
                }
                ReadOutcome::Data(bytes) => {
                    scratch.extend_from_slice(&bytes);
                    let limit_hit = max_length.is_some_and(|m| scratch.len() >= m);
                    if let Some(pos) = scratch.iter().position(|&b| b == b'\n') {
                        let remainder = scratch.split_off(pos + 1);
                        let mut state = inner.state.lock().expect("readable state poisoned");
                        state.buffer.unshift(&remainder);
                        return Ok(ReadOutcome::Data(scratch));
                    }
                    if limit_hit {
                        let max = max_length.expect("limit_hit implies Some");
                        let remainder = scratch.split_off(max);
                        let mut state = inner.state.lock().expect("readable state poisoned");
                        state.buffer.unshift(&remainder);
                        return Ok(ReadOutcome::Data(scratch));
                    }
                }
            }
        }
    }

    fn try_take_line(state: &mut ReadableState, max_length: Option<usize>) -> Option<Result<ReadOutcome, StreamError>> {
        if state.buffer.is_empty() {
            return None;
        }
        let cap = max_length.unwrap_or(usize::MAX);
        if let Some(pos) = state.buffer.as_slice().iter().take(cap).position(|&b| b == b'\n') {
            return Some(Ok(ReadOutcome::Data(state.buffer.take_prefix(pos + 1))));
        }
        if state.buffer.len() >= cap {
            return Some(Ok(ReadOutcome::Data(state.buffer.take_prefix(cap))));
        }
        None
    }

    /// Resolve with all bytes up to EOF, capped at `max_length`.
    pub fn read_all(&self, max_length: usize) -> Cancellable<ReadOutcome> {
        let inner = self.inner.clone();
        self.spawn_composed(async move { Readable::read_all_inner(inner, max_length).await })
    }

    async fn read_all_inner(inner: Arc<ReadableInner>, max_length: usize) -> Result<ReadOutcome, StreamError> {
        let chunk_size = inner.state.lock().expect("readable state poisoned").chunk_size;
        let mut accumulated = Vec::new();
        while accumulated.len() < max_length {
            let want = (max_length - accumulated.len()).min(chunk_size);
            match Readable::read_via(&inner, Some(want)).await? {
                ReadOutcome::NoMoreData => break,
                ReadOutcome::Data(bytes) => accumulated.extend_from_slice(&bytes),
            }
        }
        Ok(ReadOutcome::Data(accumulated))
    }

    /// Read exactly `n` bytes, failing if EOF arrives first.
    pub fn read_exact(&self, n: usize) -> Cancellable<Vec<u8>> {
        let inner = self.inner.clone();
        self.spawn_composed(async move {
            let mut out = Vec::with_capacity(n);
            while out.len() < n {
                match Readable::read_via(&inner, Some(n - out.len())).await? {
                    ReadOutcome::NoMoreData => {
                        return Err(StreamError::IoFailure(Arc::new(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "read_exact: EOF before the requested length was reached",
                        ))));
                    }
                    ReadOutcome::Data(bytes) => out.extend_from_slice(&bytes),
                }
            }
            Ok(out)
        })
    }

    fn spawn_composed<T, F>(&self, fut: F) -> Cancellable<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T, StreamError>> + Send + 'static,
    {
        let (tx, _flag, mut future) = cancel::pair();
        let handle = tokio::task::spawn(async move {
            let _ = tx.send(fut.await);
        });
        future.set_cancel_handler(move || handle.abort());
        future
    }

    pub fn pause(&self) {
        let mut state = self.inner.state.lock().expect("readable state poisoned");
        if state.paused {
            return;
        }
        state.paused = true;
        state.emitter.emit(&ReadableEvent::Pause);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn resume(&self) {
        let mut state = self.inner.state.lock().expect("readable state poisoned");
        if !state.paused {
            return;
        }
        state.paused = false;
        if state.readable && !state.closed {
            state.emitter.emit(&ReadableEvent::Resume);
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Clear the internal buffer and reset EOF, then reposition the
    /// underlying descriptor. Refused while reads are queued, or on a
    /// closed/non-seekable descriptor.
    pub fn seek(&self, offset: i64, whence: std::io::SeekFrom) -> Result<u64, StreamError> {
        let _ = offset;
        let mut state = self.inner.state.lock().expect("readable state poisoned");
        if state.closed {
            return Err(StreamError::Closed);
        }
        if !state.pending_reads.is_empty() {
            return Err(StreamError::NotReadable);
        }
        if !state.source.seekable() {
            return Err(StreamError::NotReadable);
        }
        let pos = state.source.seek(whence).map_err(StreamError::from)?;
        state.buffer = crate::buf::ByteQueue::new();
        state.eof = false;
        Ok(pos)
    }

    /// Idempotent. Rejects all pending reads with [`StreamError::Closed`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("readable state poisoned");
        Self::close_locked(&mut state, &self.inner.reactor);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    fn close_locked(state: &mut ReadableState, reactor: &Arc<dyn Reactor>) {
        if state.closed {
            return;
        }
        state.closed = true;
        state.readable = false;
        let key = state.source.reactor_key();
        let _ = state.source.close();
        reactor.forget(key);
        for pending in state.pending_reads.drain(..) {
            if !pending.cancelled.is_set() {
                let _ = pending.resolver.send(Err(StreamError::Closed));
            }
        }
        state.emitter.emit(&ReadableEvent::Close);
    }

    async fn pump(weak: Weak<ReadableInner>) {
        loop {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            loop {
                let armed = {
                    let state = inner.state.lock().expect("readable state poisoned");
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
                let state = inner.state.lock().expect("readable state poisoned");
                (state.source.reactor_key(), state.source.kind())
            };
            if kind.needs_readiness_wait() {
                if let Err(err) = inner.reactor.ready(key, Interest::Readable).await {
                    Self::fail(&inner, err.into());
                    continue;
                }
            }
            Self::on_readable(&inner);
            // Yield so a closed-in-the-meantime stream (or a burst of
            // other tasks) gets a chance to run between fills, rather
            // than this task monopolising the executor on a hot file.
            tokio::task::yield_now().await;
        }
    }

    fn on_readable(inner: &Arc<ReadableInner>) {
        let mut state = inner.state.lock().expect("readable state poisoned");
        if state.paused && state.pending_reads.is_empty() {
            return;
        }
        let read_len = state
            .pending_reads
            .front()
            .and_then(|p| p.requested_length)
            .unwrap_or(state.chunk_size)
            .max(1);
        let mut scratch = vec![0u8; read_len];
        match state.source.try_read(&mut scratch) {
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                let stream_err: StreamError = err.into();
                drop(state);
                Self::fail(inner, stream_err);
            }
            Ok(0) => {
                state.eof = true;
                state.emitter.emit(&ReadableEvent::End);
                for pending in state.pending_reads.drain(..) {
                    if !pending.cancelled.is_set() {
                        let _ = pending.resolver.send(Ok(ReadOutcome::NoMoreData));
                    }
                }
            }
            Ok(n) => {
                scratch.truncate(n);
                state.emitter.emit(&ReadableEvent::Data(scratch.clone()));
                if let Some(pending) = state.pending_reads.pop_front() {
                    if pending.cancelled.is_set() {
                        state.buffer.append(&scratch);
                    } else {
                        let _ = pending.resolver.send(Ok(ReadOutcome::Data(scratch)));
                    }
                } else {
                    state.buffer.append(&scratch);
                }
                if state.pending_reads.is_empty() && !state.emitter.has_listeners() {
                    state.paused = true;
                }
            }
        }
    }

    fn fail(inner: &Arc<ReadableInner>, err: StreamError) {
        let mut state = inner.state.lock().expect("readable state poisoned");
        state.emitter.emit(&ReadableEvent::Error(err.clone()));
        for pending in state.pending_reads.drain(..) {
            if !pending.cancelled.is_set() {
                let _ = pending.resolver.send(Err(err.clone()));
            }
        }
        Self::close_locked(&mut state, &inner.reactor);
    }
}

impl Drop for Readable {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("readable state poisoned");
        Self::close_locked(&mut state, &self.inner.reactor);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fd::MemorySource;
    use crate::reactor::TestReactor;
    use std::future::Future;
    use std::task::Poll;

    fn make(reactor: Arc<TestReactor>) -> (Readable, i32) {
        let source = MemorySource::new();
        let key = source.reactor_key();
        (Readable::new(Box::new(source), reactor), key)
    }

    /// Keep firing `key` across yields until `fut` resolves. The pump
    /// task only registers its readiness waiter once it is actually
    /// polled, so a single `fire` issued right after a state change can
    /// race a waiter that does not exist yet; retrying a few times
    /// sidesteps that instead of asserting exact scheduler interleaving.
    async fn fire_until_ready<T>(reactor: &Arc<TestReactor>, key: i32, fut: Cancellable<T>) -> Result<T, StreamError> {
        tokio::pin!(fut);
        for _ in 0..32 {
            reactor.fire(key, Interest::Readable);
            let polled = std::future::poll_fn(|cx| match fut.as_mut().poll(cx) {
                Poll::Ready(v) => Poll::Ready(Some(v)),
                Poll::Pending => Poll::Ready(None),
            })
            .await;
            if let Some(result) = polled {
                return result;
            }
            tokio::task::yield_now().await;
        }
        panic!("fire_until_ready: future did not resolve within the retry budget");
    }

    #[tokio::test]
    async fn read_returns_no_more_data_at_eof_on_empty_source() {
        let reactor = TestReactor::new();
        let mut source = MemorySource::new();
        source.feed_eof();
        let key = source.reactor_key();
        let readable = Readable::new(Box::new(source), reactor.clone());
        readable.resume();
        let fut = readable.read(None);
        let outcome = fire_until_ready(&reactor, key, fut).await.unwrap();
        assert_eq!(outcome, ReadOutcome::NoMoreData);
    }

    #[tokio::test]
    async fn pause_then_resume_preserves_data_order() {
        let reactor = TestReactor::new();
        let mut source = MemorySource::new();
        source.feed(b"abc");
        source.feed_eof();
        let key = source.reactor_key();
        let readable = Readable::new(Box::new(source), reactor.clone());
        readable.resume();

        let first = fire_until_ready(&reactor, key, readable.read(None)).await.unwrap();
        assert_eq!(first, ReadOutcome::Data(b"abc".to_vec()));

        let second = fire_until_ready(&reactor, key, readable.read(None)).await.unwrap();
        assert_eq!(second, ReadOutcome::NoMoreData);
    }

    #[tokio::test]
    async fn cancel_removes_pending_read() {
        let reactor = TestReactor::new();
        let (readable, _key) = make(reactor.clone());
        let mut fut = readable.read(None);
        fut.cancel();
        assert!(matches!(fut.await, Err(StreamError::Cancelled)));
        assert_eq!(readable.bytes_buffered(), 0);
    }
}
