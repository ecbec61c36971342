//! The I/O primitive: a non-blocking abstraction over an OS descriptor
//! with read-up-to-N, write-some, seek and close.
//!
//! This is the one module in the crate that deals in raw syscalls,
//! calling `libc::read`/`libc::write` directly against a raw file
//! descriptor and classifying `EAGAIN`/`EWOULDBLOCK` as "would block".
//! Everything above this module (readable/writable/duplex/pipe/transform)
//! only ever sees the [`IoSource`] trait, never a raw fd.

use std::io::{self, SeekFrom};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::StreamError;

/// What kind of descriptor is behind an [`IoSource`].
///
/// Governs two things: whether non-blocking mode can/should be toggled
/// (sockets always, regular files on non-Windows, skipped on Windows
/// for regular files), and whether the reactor needs to be consulted at
/// all before attempting I/O (a regular file is always "ready" for both
/// read and write — `epoll` does not support watching them, and a
/// non-blocking read/write on one never returns `EAGAIN`).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DescriptorKind {
    RegularFile,
    Pipe,
    Socket,
    Stdio,
    /// An in-process, descriptor-free source (used by
    /// [`crate::transform::Transform`] and by tests).
    Memory,
}

impl DescriptorKind {
    /// Whether the reactor's readiness wait should be consulted before
    /// attempting a non-blocking read/write.
    pub fn needs_readiness_wait(self) -> bool {
        !matches!(self, DescriptorKind::RegularFile)
    }

    /// Whether [`FdSource`] should flip `O_NONBLOCK` for this kind:
    /// sockets always; non-socket kinds on Unix platforms; suppressed
    /// for non-socket kinds on Windows (handled by `cfg` at the call
    /// site, not here).
    pub fn toggles_nonblocking(self) -> bool {
        !matches!(self, DescriptorKind::Memory)
    }
}

/// Abstraction over a non-blocking OS descriptor.
///
/// Every method is expected to return immediately: reads/writes signal
/// "no progress right now" with `io::ErrorKind::WouldBlock` rather than
/// blocking the calling thread.
pub trait IoSource: Send {
    /// Key used to register with a [`crate::reactor::Reactor`]. Two
    /// `IoSource`s must never share a key while both are open.
    fn reactor_key(&self) -> RawFd;

    fn kind(&self) -> DescriptorKind;

    /// Attempt to fill `buf`. `Ok(0)` means EOF; `Err(WouldBlock)` means
    /// try again after the reactor reports readiness.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Attempt to write `buf`. `Err(WouldBlock)` means try again after
    /// the reactor reports writability.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn seekable(&self) -> bool {
        false
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn close(&mut self) -> io::Result<()>;
}

/// Real Unix descriptor backed `IoSource`, used for files, pipes,
/// sockets and standard streams.
pub struct FdSource {
    fd: Option<OwnedFd>,
    kind: DescriptorKind,
}

impl FdSource {
    /// Take ownership of `fd`, validate it matches `kind`, and switch it
    /// to non-blocking mode unless `kind` says not to.
    pub fn new(fd: OwnedFd, kind: DescriptorKind) -> Result<Self, StreamError> {
        let mut source = Self { fd: Some(fd), kind };
        if source.should_toggle_nonblocking() {
            source.set_nonblocking()?;
        }
        Ok(source)
    }

    #[cfg(unix)]
    fn should_toggle_nonblocking(&self) -> bool {
        self.kind.toggles_nonblocking()
    }

    #[cfg(not(unix))]
    fn should_toggle_nonblocking(&self) -> bool {
        // Windows regular-file semantics differ enough (no real
        // non-blocking mode for files) to skip the toggle there; sockets
        // are handled by the OS overlapped-I/O model instead and are
        // left alone here too, since this crate's non-blocking layer
        // targets Unix.
        false
    }

    #[cfg(unix)]
    fn set_nonblocking(&mut self) -> Result<(), StreamError> {
        let raw = self.fd.as_ref().expect("fd already closed").as_raw_fd();
        // SAFETY: `raw` is a valid, open descriptor for the lifetime of
        // this call: it is owned by `self.fd` and not closed until
        // `close()` runs.
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL, 0);
            if flags < 0 {
                return Err(io::Error::last_os_error().into());
            }
            if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_nonblocking(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn raw(&self) -> io::Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "descriptor already closed"))
    }
}

impl IoSource for FdSource {
    fn reactor_key(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    fn kind(&self) -> DescriptorKind {
        self.kind
    }

    #[cfg(unix)]
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.raw()?;
        // SAFETY: `fd` is open and owned by `self.fd`; `buf` is a valid
        // mutable slice for its stated length for the duration of the
        // call.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    #[cfg(unix)]
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.raw()?;
        // SAFETY: as above, for a read-only view of `buf`.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            Ok(n as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn seekable(&self) -> bool {
        self.kind == DescriptorKind::RegularFile
    }

    #[cfg(unix)]
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if !self.seekable() {
            return Err(io::ErrorKind::Unsupported.into());
        }
        let fd = self.raw()?;
        let (whence, offset) = match pos {
            SeekFrom::Start(n) => (libc::SEEK_SET, n as i64),
            SeekFrom::End(n) => (libc::SEEK_END, n),
            SeekFrom::Current(n) => (libc::SEEK_CUR, n),
        };
        // SAFETY: `fd` is open and owned by `self.fd`.
        let result = unsafe { libc::lseek(fd, offset, whence) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(result as u64)
        }
    }

    #[cfg(not(unix))]
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the `OwnedFd` runs `close(2)`; taking it here makes
        // repeat calls a no-op instead of a double-close.
        self.fd.take();
        Ok(())
    }
}

/// Turn any type that owns a raw descriptor into an [`OwnedFd`] for
/// [`FdSource::new`].
pub fn owned_fd_from(raw_owner: impl IntoRawFd) -> OwnedFd {
    let raw = raw_owner.into_raw_fd();
    // SAFETY: `raw` was just produced by `IntoRawFd::into_raw_fd`, which
    // guarantees a valid, uniquely-owned descriptor.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

/// Duplicate `fd` so a [`crate::duplex::Duplex`] Resource Variant can
/// give its read half and write half independent descriptors over the
/// same open file description, each with its own non-blocking toggle
/// and its own close.
#[cfg(unix)]
pub fn dup_fd(fd: &OwnedFd) -> io::Result<OwnedFd> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is valid for the duration of this call since it is
    // borrowed from `fd`, which outlives it.
    let dup = unsafe { libc::dup(raw) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `dup` was just returned by a successful `dup(2)`, so it is
    // a valid, uniquely-owned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

#[cfg(not(unix))]
pub fn dup_fd(_fd: &OwnedFd) -> io::Result<OwnedFd> {
    Err(io::ErrorKind::Unsupported.into())
}

use std::os::fd::FromRawFd;

/// In-memory [`IoSource`], used for `DescriptorKind::Memory` streams
/// and for tests that would otherwise need a real descriptor. Reads
/// drain an input queue fed by [`MemorySource::feed`]/
/// [`MemorySource::feed_eof`]; writes append to an output buffer
/// retrievable with [`MemorySource::written`].
pub struct MemorySource {
    key: RawFd,
    inbox: std::collections::VecDeque<u8>,
    inbox_eof: bool,
    outbox: Vec<u8>,
}

impl MemorySource {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicI32, Ordering};
        static NEXT_KEY: AtomicI32 = AtomicI32::new(-2);
        Self {
            key: NEXT_KEY.fetch_sub(1, Ordering::Relaxed),
            inbox: std::collections::VecDeque::new(),
            inbox_eof: false,
            outbox: Vec::new(),
        }
    }

    /// Queue bytes to be returned by subsequent `try_read` calls.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbox.extend(bytes.iter().copied());
    }

    /// Mark the input queue as ended: once drained, `try_read` reports
    /// EOF instead of `WouldBlock`.
    pub fn feed_eof(&mut self) {
        self.inbox_eof = true;
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.outbox
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSource for MemorySource {
    fn reactor_key(&self) -> RawFd {
        self.key
    }

    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Memory
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbox.is_empty() {
            return if self.inbox_eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.inbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.inbox.pop_front().expect("checked non-empty above");
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbox.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn fd_source_reads_and_detects_eof() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();
        use std::io::Seek;
        file.seek(SeekFrom::Start(0)).unwrap();
        let owned = owned_fd_from(file);
        let mut source = FdSource::new(owned, DescriptorKind::RegularFile).unwrap();

        let mut buf = [0u8; 16];
        let n = source.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let n2 = source.try_read(&mut buf).unwrap();
        assert_eq!(n2, 0, "expected EOF");
    }

    #[test]
    fn fd_source_seek_round_trips() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();
        let owned = owned_fd_from(file);
        let mut source = FdSource::new(owned, DescriptorKind::RegularFile).unwrap();
        source.seek(SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 4];
        let n = source.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"3456");
    }
}
