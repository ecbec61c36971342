//! Error taxonomy shared by every stream kind.
//!
//! Every fallible operation in this crate resolves its returned future
//! with one of these variants. Terminal failures (`IoFailure`, a
//! zero-byte write reported ready) are also raised as an `error` event
//! before the stream closes — see `emitter` and `readable`/`writable`.

use std::io;
use std::sync::Arc;

/// Errors surfaced by readable, writable, duplex, pipe and transform
/// streams.
///
/// `Clone` is needed because a single terminal I/O failure must be
/// delivered to every pending read/write future at once; the
/// underlying `io::Error` is kept behind an `Arc` so one syscall
/// failure can be cheaply fanned out to the whole pending queue.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StreamError {
    /// Constructor rejected a file descriptor that did not match the
    /// expected kind or access mode (e.g. a duplex built over a
    /// write-only pipe end).
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Operation invoked on a stream that is not readable: closed,
    /// write-only, or (for `seek`) has pending reads queued.
    #[error("stream is not readable")]
    NotReadable,

    /// Operation invoked on a stream that is not writable: closed,
    /// read-only, or already ending.
    #[error("stream is not writable")]
    NotWritable,

    /// A non-blocking read or write syscall reported a hard failure.
    /// Terminal: the stream closes after this is raised.
    #[error("I/O failure: {0}")]
    IoFailure(Arc<io::Error>),

    /// The destination of a pipe closed before the source reached EOF.
    #[error("destination closed before transfer completed")]
    EarlyClose,

    /// The operation was aborted via `cancel()`. Never delivered to an
    /// awaiter that asked not to be cancelled; always the result of an
    /// explicit, local `cancel()` call.
    #[error("operation cancelled")]
    Cancelled,

    /// The stream was already closed when the operation was issued.
    #[error("stream closed")]
    Closed,
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::IoFailure(Arc::new(err))
    }
}

impl StreamError {
    /// True for the failures that are terminal for the owning stream:
    /// once raised, the stream emits `error` and then `close`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::IoFailure(_))
    }
}
