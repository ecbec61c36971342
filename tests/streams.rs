//! End-to-end coverage of the stream types working together: a file
//! copy through the pipe engine, a line reader over a real file,
//! backpressure draining, a transform stage wired by hand into a
//! destination writable, cancelling a pipe partway through, and bounded
//! memory use while streaming a large payload through a slow sink.

use std::io::{self, Seek, Write as _};
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use evio::cancel::Cancellable;
use evio::error::StreamError;
use evio::fd::{owned_fd_from, DescriptorKind, FdSource, IoSource, MemorySource};
use evio::reactor::{Interest, TestReactor, TokioReactor};
use evio::readable::{ReadOutcome, Readable};
use evio::transform::Transform;
use evio::writable::Writable;
use evio::{pipe, pipe_with_limit};

/// Drive a `TestReactor`-backed future to completion by repeatedly
/// firing both interests and yielding, since `TestReactor::fire` only
/// wakes waiters already registered at the moment it's called.
async fn fire_until_ready<T>(
    reactor: &Arc<TestReactor>,
    read_key: RawFd,
    write_key: RawFd,
    fut: Cancellable<T>,
) -> Result<T, StreamError> {
    use std::future::Future;
    use std::task::Poll;
    tokio::pin!(fut);
    for _ in 0..256 {
        reactor.fire(read_key, Interest::Readable);
        reactor.fire(write_key, Interest::Writable);
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

/// A writable `IoSource` that never blocks and exposes what it has
/// received, for cancellation tests where the bytes must be inspected
/// after the sink has been handed off to a `Writable`.
struct RecordingSink {
    key: RawFd,
    data: Arc<Mutex<Vec<u8>>>,
}

impl RecordingSink {
    fn new(key: RawFd, data: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { key, data }
    }
}

impl IoSource for RecordingSink {
    fn reactor_key(&self) -> RawFd {
        self.key
    }

    fn kind(&self) -> DescriptorKind {
        DescriptorKind::Memory
    }

    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.lock().expect("recording sink poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn file_copy_round_trips_identical_bytes() {
    let payload = vec![0x58u8; 1_048_576];
    let mut src_tmp = tempfile::NamedTempFile::new().unwrap();
    src_tmp.write_all(&payload).unwrap();
    src_tmp.flush().unwrap();
    let dst_tmp = tempfile::NamedTempFile::new().unwrap();
    let dst_path = dst_tmp.path().to_path_buf();

    let reactor = TokioReactor::new();
    let src_file = std::fs::File::open(src_tmp.path()).unwrap();
    let dst_file = std::fs::OpenOptions::new().write(true).open(&dst_path).unwrap();
    let src_source = FdSource::new(owned_fd_from(src_file), DescriptorKind::RegularFile).unwrap();
    let dst_source = FdSource::new(owned_fd_from(dst_file), DescriptorKind::RegularFile).unwrap();
    let src = Arc::new(Readable::new(Box::new(src_source), reactor.clone()));
    let dst = Arc::new(Writable::new(Box::new(dst_source), reactor));

    let moved = pipe(src, dst.clone()).await.unwrap();
    assert_eq!(moved, payload.len() as u64);
    assert!(dst.is_closed(), "pipe ends the destination by default");
    drop(dst);

    let on_disk = std::fs::read(&dst_path).unwrap();
    assert_eq!(on_disk, payload);
}

#[tokio::test]
async fn line_reader_yields_each_line_then_sentinel() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"Line 1\nLine 2\nLine 3").unwrap();
    file.flush().unwrap();
    file.seek(io::SeekFrom::Start(0)).unwrap();

    let reactor = TokioReactor::new();
    let source = FdSource::new(owned_fd_from(file), DescriptorKind::RegularFile).unwrap();
    let readable = Readable::new(Box::new(source), reactor);
    readable.resume();

    let first = readable.read_line(None).await.unwrap();
    assert_eq!(first, ReadOutcome::Data(b"Line 1\n".to_vec()));
    let second = readable.read_line(None).await.unwrap();
    assert_eq!(second, ReadOutcome::Data(b"Line 2\n".to_vec()));
    let third = readable.read_line(None).await.unwrap();
    assert_eq!(third, ReadOutcome::Data(b"Line 3".to_vec()));
    let fourth = readable.read_line(None).await.unwrap();
    assert_eq!(fourth, ReadOutcome::NoMoreData);
}

#[tokio::test]
async fn backpressure_drains_in_a_single_emission() {
    let reactor = TestReactor::new();
    let sink = MemorySource::new();
    let key = sink.reactor_key();
    let writable = Writable::with_soft_limit(Box::new(sink), reactor.clone(), 1024);

    let drains = Arc::new(Mutex::new(0usize));
    let drains_for_listener = drains.clone();
    writable.on(move |event| {
        if matches!(event, evio::writable::WritableEvent::Drain) {
            *drains_for_listener.lock().expect("drains poisoned") += 1;
        }
    });

    let payload = vec![b'x'; 5000];
    let (write_fut, below_limit) = writable.write(&payload);
    assert!(!below_limit, "5000 bytes exceeds the 1024-byte soft limit");

    fire_until_ready(&reactor, key, key, write_fut).await.unwrap();

    assert_eq!(writable.bytes_buffered(), 0);
    assert_eq!(*drains.lock().expect("drains poisoned"), 1);
}

#[tokio::test]
async fn transform_uppercases_before_reaching_the_destination() {
    let transform = Transform::with_transformer(|chunk| chunk.to_ascii_uppercase());
    transform.write(b"hello").unwrap();
    transform.end(None);

    let reactor = TestReactor::new();
    let dst_sink = MemorySource::new();
    let dst_key = dst_sink.reactor_key();
    let dst = Writable::new(Box::new(dst_sink), reactor.clone());

    let finishes = Arc::new(Mutex::new(0usize));
    let finishes_for_listener = finishes.clone();
    dst.on(move |event| {
        if matches!(event, evio::writable::WritableEvent::Finish) {
            *finishes_for_listener.lock().expect("finishes poisoned") += 1;
        }
    });

    loop {
        match transform.read(None).await.unwrap() {
            ReadOutcome::NoMoreData => break,
            ReadOutcome::Data(bytes) => {
                let (write_fut, _below_limit) = dst.write(&bytes);
                fire_until_ready(&reactor, dst_key, dst_key, write_fut).await.unwrap();
            }
        }
    }
    let end_fut = dst.end();
    fire_until_ready(&reactor, dst_key, dst_key, end_fut).await.unwrap();

    assert_eq!(*finishes.lock().expect("finishes poisoned"), 1);
    assert!(dst.is_closed());
}

#[tokio::test]
async fn cancelling_a_pipe_stops_the_transfer_and_pauses_the_source() {
    let reactor = TestReactor::new();

    let total = 1_000_000usize;
    let mut src_source = MemorySource::new();
    src_source.feed(&vec![b'a'; total]);
    src_source.feed_eof();
    let read_key = src_source.reactor_key();
    let src = Arc::new(Readable::with_chunk_size(Box::new(src_source), reactor.clone(), 4096));

    let received = Arc::new(Mutex::new(Vec::new()));
    let write_key: RawFd = -999;
    let dst_source = RecordingSink::new(write_key, received.clone());
    let dst = Arc::new(Writable::new(Box::new(dst_source), reactor.clone()));

    let mut fut = pipe_with_limit(src.clone(), dst.clone(), total as u64);

    // Let a handful of read/write cycles complete, far short of the
    // ~244 needed to move all of `total`, then cancel mid-flight.
    for _ in 0..10 {
        reactor.fire(read_key, Interest::Readable);
        reactor.fire(write_key, Interest::Writable);
        tokio::task::yield_now().await;
    }

    fut.cancel();
    let result = fut.await;
    assert!(matches!(result, Err(StreamError::Cancelled)));

    let written_len = received.lock().expect("received poisoned").len();
    assert!(written_len > 0, "expected some bytes to have moved before cancellation");
    assert!(written_len < total, "expected cancellation to stop the transfer early");
    assert!(src.is_paused(), "cancelling a pipe should pause its source");
}

/// A writable `IoSource` that only ever accepts a handful of bytes per
/// call, so a pipe draining into it sees many backpressure cycles
/// instead of flushing in one shot. Total received bytes stay
/// inspectable via the shared counter after the sink is moved into a
/// `Writable`.
struct ThrottledSink {
    key: RawFd,
    max_per_write: usize,
    total_received: Arc<Mutex<u64>>,
}

impl IoSource for ThrottledSink {
    fn reactor_key(&self) -> RawFd { self.key }
    fn kind(&self) -> DescriptorKind { DescriptorKind::Memory }
    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let accepted = buf.len().min(self.max_per_write);
        *self.total_received.lock().expect("total poisoned") += accepted as u64;
        Ok(accepted)
    }
    fn close(&mut self) -> io::Result<()> { Ok(()) }
}

#[tokio::test]
async fn large_transfer_keeps_peak_buffering_bounded() {
    let reactor = TestReactor::new();

    let total: usize = 4 * 1024 * 1024;
    let chunk_size = 8192;
    let soft_limit = 16384;

    let mut src_source = MemorySource::new();
    src_source.feed(&vec![b'z'; total]);
    src_source.feed_eof();
    let read_key = src_source.reactor_key();
    let src = Arc::new(Readable::with_chunk_size(Box::new(src_source), reactor.clone(), chunk_size));

    let total_received = Arc::new(Mutex::new(0u64));
    let write_key: RawFd = -500;
    let dst_source = ThrottledSink {
        key: write_key,
        max_per_write: 512,
        total_received: total_received.clone(),
    };
    let dst = Arc::new(Writable::with_soft_limit(Box::new(dst_source), reactor.clone(), soft_limit));

    let mut fut = pipe(src.clone(), dst.clone());
    tokio::pin!(fut);

    // The pipe reads one chunk at a time and awaits each write before
    // issuing the next read, so the combined buffering on both ends
    // should never grow much past one chunk plus the destination's
    // soft limit, no matter how large `total` is.
    let bound = chunk_size + soft_limit + 4096;
    let mut peak = 0usize;
    let result = loop {
        reactor.fire(read_key, Interest::Readable);
        reactor.fire(write_key, Interest::Writable);
        let buffered = src.bytes_buffered() + dst.bytes_buffered();
        peak = peak.max(buffered);
        assert!(
            buffered <= bound,
            "buffered {buffered} exceeded bound {bound} mid-transfer"
        );
        let polled = std::future::poll_fn(|cx| match fut.as_mut().poll(cx) {
            std::task::Poll::Ready(v) => std::task::Poll::Ready(Some(v)),
            std::task::Poll::Pending => std::task::Poll::Ready(None),
        })
        .await;
        if let Some(result) = polled {
            break result;
        }
        tokio::task::yield_now().await;
    };

    assert_eq!(result.unwrap(), total as u64);
    assert_eq!(*total_received.lock().expect("total poisoned"), total as u64);
    assert!(peak <= bound, "peak buffered {peak} exceeded bound {bound}");
}
