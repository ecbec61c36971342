//! The pipe engine: move bytes from a [`Readable`] to a [`Writable`],
//! chunk by chunk, respecting backpressure and bounding memory to
//! roughly one chunk plus the destination's soft limit.

use std::sync::Arc;

use crate::cancel::{self, Cancellable};
use crate::error::StreamError;
use crate::readable::{ReadOutcome, Readable};
use crate::writable::Writable;

/// Copy everything from `src` to `dst`, then end `dst`. Resolves with
/// the number of bytes moved once `src` reaches EOF and `dst` has
/// finished. Fails with [`StreamError::EarlyClose`] if `dst` stops
/// accepting writes first.
pub fn pipe(src: Arc<Readable>, dst: Arc<Writable>) -> Cancellable<u64> {
    pipe_with_options(src, dst, u64::MAX, true)
}

/// As [`pipe`], but stops (successfully) after `max_bytes` bytes have
/// been moved, leaving any remainder unread on `src` — bounds a
/// transfer without handing the caller a manual read/write loop.
pub fn pipe_with_limit(src: Arc<Readable>, dst: Arc<Writable>, max_bytes: u64) -> Cancellable<u64> {
    pipe_with_options(src, dst, max_bytes, true)
}

/// Full form of the pipe engine: copy at most `max_bytes` from `src` to
/// `dst`, then call `dst.end()` and wait for it to finish only if
/// `end` is true. Passing `end: false` leaves `dst` open for further
/// writes from other sources once the transfer completes.
pub fn pipe_with_options(src: Arc<Readable>, dst: Arc<Writable>, max_bytes: u64, end: bool) -> Cancellable<u64> {
    let src_for_cancel = src.clone();
    let (tx, _flag, mut future) = cancel::pair();
    let handle = tokio::task::spawn(async move {
        let result = run_pipe(src, dst, max_bytes, end).await;
        let _ = tx.send(result);
    });
    future.set_cancel_handler(move || {
        handle.abort();
        // Aborting the copy loop stops further reads, but the source's
        // pump task is independent of it and would otherwise keep
        // filling the buffer from underneath the now-abandoned copy.
        src_for_cancel.pause();
    });
    future
}

async fn run_pipe(src: Arc<Readable>, dst: Arc<Writable>, max_bytes: u64, end: bool) -> Result<u64, StreamError> {
    let mut moved: u64 = 0;
    src.resume();
    while moved < max_bytes {
        let want = max_bytes.saturating_sub(moved).min(src.chunk_size() as u64) as usize;
        let outcome = src.read(Some(want.max(1))).await?;
        let bytes = match outcome {
            ReadOutcome::NoMoreData => break,
            ReadOutcome::Data(bytes) => bytes,
        };
        moved += bytes.len() as u64;
        let (write_done, _below_limit) = dst.write(&bytes);
        match write_done.await {
            Ok(_) => {}
            Err(StreamError::Closed) | Err(StreamError::NotWritable) => {
                return Err(StreamError::EarlyClose);
            }
            Err(other) => return Err(other),
        }
    }
    if end {
        match dst.end().await {
            Ok(()) | Err(StreamError::Closed) => {}
            Err(other) => return Err(other),
        }
    }
    Ok(moved)
}
