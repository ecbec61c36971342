//! Non-blocking, event-loop-driven byte streams
//!
//! This crate provides `Readable`, `Writable`, `Duplex` and `Transform`
//! stream types built on top of a single non-blocking I/O primitive
//! ([`fd::IoSource`]). Every stream owns its descriptor exclusively and
//! closes it exactly once, either explicitly via `close()` or
//! implicitly on `Drop`.
//!
//! # Layout
//!
//! - [`buf`] — the growable byte buffer shared by the readable and
//!   writable cores.
//! - [`fd`] — the non-blocking I/O primitive: real Unix descriptors
//!   ([`fd::FdSource`]) and an in-memory test/transform double
//!   ([`fd::MemorySource`]).
//! - [`reactor`] — the readiness-watcher collaborator: a production
//!   implementation backed by Tokio ([`reactor::TokioReactor`]) and a
//!   manually-driven test double ([`reactor::TestReactor`]).
//! - [`cancel`] — the cancellable future returned by every async
//!   operation in this crate.
//! - [`emitter`] — a minimal per-stream event broadcaster.
//! - [`error`] — the error taxonomy shared by every stream kind.
//! - [`readable`] — the Readable Core.
//! - [`writable`] — the Writable Core.
//! - [`duplex`] — two-way streams, built from one shared descriptor or
//!   two independent halves.
//! - [`pipe`] — the pipe engine: move bytes from a readable to a
//!   writable with backpressure.
//! - [`transform`] — an in-memory duplex stream that maps its input
//!   through a transformer function before it is readable as output.
//!
//! # A minimal example
//!
//! ```no_run
//! use std::sync::Arc;
//! use evio::fd::{owned_fd_from, DescriptorKind, FdSource};
//! use evio::reactor::TokioReactor;
//! use evio::readable::Readable;
//!
//! # async fn run() -> Result<(), evio::error::StreamError> {
//! let file = std::fs::File::open("Cargo.toml")?;
//! let reactor = TokioReactor::new();
//! let source = FdSource::new(owned_fd_from(file), DescriptorKind::RegularFile)?;
//! let readable = Readable::new(Box::new(source), reactor);
//! readable.resume();
//! let chunk = readable.read(None).await?;
//! println!("read {} bytes", chunk.into_bytes().len());
//! # Ok(())
//! # }
//! ```

pub mod buf;
pub mod cancel;
pub mod duplex;
pub mod emitter;
pub mod error;
pub mod fd;
pub mod pipe;
pub mod reactor;
pub mod readable;
pub mod transform;
pub mod writable;

pub use cancel::Cancellable;
pub use duplex::Duplex;
pub use error::StreamError;
pub use pipe::{pipe, pipe_with_limit, pipe_with_options};
pub use readable::{ReadOutcome, Readable};
pub use reactor::{Reactor, TokioReactor};
pub use transform::Transform;
pub use writable::Writable;
