//! Duplex streams: two-way byte streams built from either one shared
//! descriptor (Resource Variant — a socket, a TTY) or two
//! independently-owned halves (Composite Variant — a pipe pair, a
//! child process's stdin/stdout).

use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::cancel::Cancellable;
use crate::error::StreamError;
use crate::fd::{dup_fd, DescriptorKind, FdSource, IoSource};
use crate::reactor::Reactor;
use crate::readable::{Readable, ReadableEvent};
use crate::writable::{Writable, WritableEvent};

/// A two-way stream.
///
/// Both variants expose the same `read`/`write`/`close` surface; the
/// difference is only in what `close` does underneath and whether
/// closing one half closes the other.
pub struct Duplex {
    readable: Arc<Readable>,
    writable: Arc<Writable>,
}

impl Duplex {
    /// Resource Variant: one descriptor used for both directions. The
    /// descriptor is `dup`'d so the readable half and writable half can
    /// each run their own non-blocking pump independently; either half
    /// closing does not affect the other; dropping the `Duplex` closes
    /// both.
    pub fn from_shared_fd(fd: OwnedFd, kind: DescriptorKind, reactor: Arc<dyn Reactor>) -> Result<Self, StreamError> {
        let write_fd = dup_fd(&fd).map_err(StreamError::from)?;
        let read_source: Box<dyn IoSource> = Box::new(FdSource::new(fd, kind)?);
        let write_source: Box<dyn IoSource> = Box::new(FdSource::new(write_fd, kind)?);
        Ok(Self {
            readable: Arc::new(Readable::new(read_source, reactor.clone())),
            writable: Arc::new(Writable::new(write_source, reactor)),
        })
    }

    /// Composite Variant: two already-independent streams (e.g. a child
    /// process's stdout paired with its stdin) wrapped as a single
    /// two-way handle. Each half owns its own descriptor. Closing the
    /// readable half closes the writable half once the writable half is
    /// already not writable, and vice versa, so one side finishing
    /// naturally brings the other down with it.
    pub fn from_halves(readable: Readable, writable: Writable) -> Self {
        let readable = Arc::new(readable);
        let writable = Arc::new(writable);

        let writable_for_readable_close = writable.clone();
        readable.on(move |event| {
            if matches!(event, ReadableEvent::Close) && !writable_for_readable_close.is_writable() {
                writable_for_readable_close.close();
            }
        });
        let readable_for_writable_close = readable.clone();
        writable.on(move |event| {
            if matches!(event, WritableEvent::Close)
                && (readable_for_writable_close.is_closed() || readable_for_writable_close.is_eof())
            {
                readable_for_writable_close.close();
            }
        });

        Self { readable, writable }
    }

    pub fn readable(&self) -> &Readable {
        &self.readable
    }

    pub fn writable(&self) -> &Writable {
        &self.writable
    }

    pub fn into_halves(self) -> (Arc<Readable>, Arc<Writable>) {
        (self.readable, self.writable)
    }

    /// Resume the readable half, but only if the writable half is still
    /// writable — resuming a read side whose write side is already dead
    /// just reads into a pipe nobody will drain.
    pub fn resume(&self) {
        if self.writable.is_writable() {
            self.readable.resume();
        }
    }

    /// Pause the readable half first, then end the writable half.
    pub fn end(&self) -> Cancellable<()> {
        self.readable.pause();
        self.writable.end()
    }

    /// Close both halves. Idempotent per-half.
    pub fn close(&self) {
        self.readable.close();
        self.writable.close();
    }
}
