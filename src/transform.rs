//! The transform stream: an in-memory duplex whose output is produced
//! by applying a transformer function to each chunk written to its
//! input, defaulting to pass-through.
//!
//! Unlike [`crate::readable::Readable`]/[`crate::writable::Writable`],
//! there is no OS descriptor and no reactor wait involved: a write is
//! transformed and appended to the output buffer synchronously, so the
//! only asynchrony left is "wait for the next write, or for `end`".

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::cancel::{self, CancelFlag, Cancellable, Resolver};
use crate::emitter::{Emitter, EventTaxonomy, ListenerId};
use crate::error::StreamError;
use crate::readable::ReadOutcome;

/// A chunk transformer. The default (`Transform::new(None)`) is the
/// identity function — a pass-through duplex, useful for tests and as
/// a building block piped into something that does the real work.
pub type Transformer = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum TransformEvent {
    Data(Vec<u8>),
    Drain,
    End,
    Finish,
    Error(StreamError),
    Close,
    Pause,
    Resume,
}

impl EventTaxonomy for TransformEvent {
    fn is_error(&self) -> bool {
        matches!(self, TransformEvent::Error(_))
    }

    fn from_listener_panic(message: String) -> Self {
        TransformEvent::Error(std::io::Error::new(std::io::ErrorKind::Other, message).into())
    }
}

struct PendingRead {
    requested_length: Option<usize>,
    resolver: Resolver<ReadOutcome>,
    cancelled: CancelFlag,
}

struct TransformState {
    output: crate::buf::ByteQueue,
    pending_reads: VecDeque<PendingRead>,
    readable: bool,
    writable: bool,
    paused: bool,
    ending: bool,
    eof: bool,
    closed: bool,
    draining_flag: bool,
    emitter: Emitter<TransformEvent>,
}

/// An in-memory duplex stream that applies a transformer to everything
/// written to it before making it available to read.
pub struct Transform {
    state: Arc<Mutex<TransformState>>,
    transformer: Transformer,
    chunk_size: usize,
}

impl Transform {
    /// Build a pass-through transform: what is written is exactly what
    /// comes back out.
    pub fn passthrough() -> Self {
        Self::new(None)
    }

    /// Build a transform that maps every written chunk through `f`
    /// before appending it to the output.
    pub fn with_transformer(f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self::new(Some(Arc::new(f)))
    }

    fn new(transformer: Option<Transformer>) -> Self {
        let state = TransformState {
            output: crate::buf::ByteQueue::new(),
            pending_reads: VecDeque::new(),
            readable: true,
            writable: true,
            paused: false,
            ending: false,
            eof: false,
            closed: false,
            draining_flag: false,
            emitter: Emitter::new("transform"),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            transformer: transformer.unwrap_or_else(|| Arc::new(|chunk: &[u8]| chunk.to_vec())),
            chunk_size: crate::readable::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn on(&self, callback: impl FnMut(&TransformEvent) + Send + 'static) -> ListenerId {
        self.state.lock().expect("transform state poisoned").emitter.on(callback)
    }

    pub fn off(&self, id: ListenerId) {
        self.state.lock().expect("transform state poisoned").emitter.off(id);
    }

    pub fn bytes_buffered(&self) -> usize {
        self.state.lock().expect("transform state poisoned").output.len()
    }

    pub fn is_ending(&self) -> bool {
        self.state.lock().expect("transform state poisoned").ending
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().expect("transform state poisoned").paused
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("transform state poisoned").closed
    }

    /// Stop producing `data` from writes until [`Transform::resume`].
    /// Writes issued while paused are accepted (the input is consumed)
    /// but resolve with zero bytes, matching the backpressure signal a
    /// caller gets from a full `Writable`.
    pub fn pause(&self) {
        let mut state = self.state.lock().expect("transform state poisoned");
        if state.paused || state.closed {
            return;
        }
        state.paused = true;
        state.emitter.emit(&TransformEvent::Pause);
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().expect("transform state poisoned");
        if !state.paused || state.closed {
            return;
        }
        state.paused = false;
        state.emitter.emit(&TransformEvent::Resume);
        if state.draining_flag {
            state.draining_flag = false;
            state.emitter.emit(&TransformEvent::Drain);
        }
    }

    /// Feed `bytes` through the transformer and append the result to
    /// the output buffer, resolving at most one pending read. Returns
    /// the number of input bytes accepted: zero while paused, signaling
    /// the caller to wait for `drain`.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        let mut state = self.state.lock().expect("transform state poisoned");
        if state.closed {
            return Err(StreamError::Closed);
        }
        if !state.writable || state.ending {
            return Err(StreamError::NotWritable);
        }
        if state.paused {
            state.draining_flag = true;
            return Ok(0);
        }
        let produced = (self.transformer)(bytes);
        if produced.is_empty() {
            return Ok(bytes.len());
        }
        state.emitter.emit(&TransformEvent::Data(produced.clone()));
        if let Some(pending) = state.pending_reads.pop_front() {
            if pending.cancelled.is_set() {
                state.output.append(&produced);
            } else {
                let want = pending.requested_length.unwrap_or(produced.len()).min(produced.len());
                if want == produced.len() {
                    let _ = pending.resolver.send(Ok(ReadOutcome::Data(produced)));
                } else {
                    let (head, tail) = produced.split_at(want);
                    let _ = pending.resolver.send(Ok(ReadOutcome::Data(head.to_vec())));
                    state.output.append(tail);
                }
            }
        } else {
            state.output.append(&produced);
        }
        Ok(bytes.len())
    }

    /// Signal no further writes, optionally feeding one last payload
    /// first. Once the output buffer drains, emits `end` then `finish`
    /// and closes.
    pub fn end(&self, payload: Option<&[u8]>) {
        if let Some(bytes) = payload {
            if !bytes.is_empty() {
                let _ = self.write(bytes);
            }
        }
        let mut state = self.state.lock().expect("transform state poisoned");
        if state.ending {
            return;
        }
        state.ending = true;
        state.writable = false;
        Self::maybe_finish(&mut state);
    }

    pub fn read(&self, length: Option<usize>) -> Cancellable<ReadOutcome> {
        let mut state = self.state.lock().expect("transform state poisoned");
        if state.closed {
            return cancel::ready(Err(StreamError::Closed));
        }
        if !state.output.is_empty() {
            let want = length.unwrap_or(self.chunk_size).max(1).min(state.output.len());
            let bytes = state.output.take_prefix(want);
            let outcome = ReadOutcome::Data(bytes);
            Self::maybe_finish(&mut state);
            return cancel::ready(Ok(outcome));
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
        future
    }

    /// Once `end` has been called and the output buffer has fully
    /// drained, surface EOF to readers and run the end/finish/close
    /// sequence exactly once.
    fn maybe_finish(state: &mut TransformState) {
        if state.ending && !state.eof && state.output.is_empty() {
            state.eof = true;
            state.readable = false;
            state.emitter.emit(&TransformEvent::End);
            for pending in state.pending_reads.drain(..) {
                if !pending.cancelled.is_set() {
                    let _ = pending.resolver.send(Ok(ReadOutcome::NoMoreData));
                }
            }
            state.emitter.emit(&TransformEvent::Finish);
            Self::close_locked(state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().expect("transform state poisoned");
        Self::close_locked(&mut state);
    }

    fn close_locked(state: &mut TransformState) {
        if state.closed {
            return;
        }
        state.closed = true;
        state.readable = false;
        state.writable = false;
        for pending in state.pending_reads.drain(..) {
            if !pending.cancelled.is_set() {
                let _ = pending.resolver.send(Err(StreamError::Closed));
            }
        }
        state.emitter.emit(&TransformEvent::Close);
    }
}

impl Drop for Transform {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("transform state poisoned");
        Self::close_locked(&mut state);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn passthrough_round_trips_bytes() {
        let t = Transform::passthrough();
        t.write(b"abc").unwrap();
        let out = t.read(None).await.unwrap();
        assert_eq!(out, ReadOutcome::Data(b"abc".to_vec()));
    }

    #[tokio::test]
    async fn uppercasing_transformer_applies_before_buffering() {
        let t = Transform::with_transformer(|chunk| chunk.to_ascii_uppercase());
        t.write(b"hello").unwrap();
        let out = t.read(None).await.unwrap();
        assert_eq!(out, ReadOutcome::Data(b"HELLO".to_vec()));
    }

    #[tokio::test]
    async fn read_queued_before_write_resolves_on_write() {
        let t = Transform::passthrough();
        let fut = t.read(None);
        t.write(b"later").unwrap();
        let out = fut.await.unwrap();
        assert_eq!(out, ReadOutcome::Data(b"later".to_vec()));
    }

    #[tokio::test]
    async fn end_with_empty_buffer_surfaces_eof_immediately() {
        let t = Transform::passthrough();
        t.end(None);
        let out = t.read(None).await.unwrap();
        assert_eq!(out, ReadOutcome::NoMoreData);
    }

    #[tokio::test]
    async fn end_with_payload_delivers_it_before_eof() {
        let t = Transform::passthrough();
        t.end(Some(b"tail"));
        let out = t.read(None).await.unwrap();
        assert_eq!(out, ReadOutcome::Data(b"tail".to_vec()));
        let eof = t.read(None).await.unwrap();
        assert_eq!(eof, ReadOutcome::NoMoreData);
        assert!(t.is_closed());
    }

    #[tokio::test]
    async fn write_while_paused_accepts_zero_bytes_until_resume() {
        let t = Transform::passthrough();
        t.pause();
        let accepted = t.write(b"blocked").unwrap();
        assert_eq!(accepted, 0);

        let drains = Arc::new(Mutex::new(0usize));
        let drains_for_listener = drains.clone();
        t.on(move |event| {
            if matches!(event, TransformEvent::Drain) {
                *drains_for_listener.lock().expect("drains poisoned") += 1;
            }
        });
        t.resume();
        assert_eq!(*drains.lock().expect("drains poisoned"), 1);

        let accepted = t.write(b"flowing").unwrap();
        assert_eq!(accepted, b"flowing".len());
    }
}
