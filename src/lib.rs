//! ringcall — callback-driven TCP networking on io_uring.
//!
//! ringcall runs TCP servers and clients without any application-side
//! system-call code. A single event-loop thread owns the kernel ring;
//! resources translate method calls into ring requests and deliver
//! completions to typed callbacks:
//!
//! - [`Acceptor`] arms a multishot accept and manufactures a
//!   [`Connection`] per accepted descriptor.
//! - [`Connector`] resolves a host, connects asynchronously, and hands
//!   over a [`Connection`] on success.
//! - [`Connection`] exposes multishot reads (kernel-provided buffers)
//!   and single-shot writes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//!
//! use ringcall::{Acceptor, Connection, EventLoop};
//!
//! fn main() -> Result<(), ringcall::Error> {
//!     let event_loop = EventLoop::new(1024)?;
//!
//!     let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
//!     let mut server = Acceptor::new(&event_loop, 1024);
//!     let store = Arc::clone(&connections);
//!     server.on_new_connection(move |connection| {
//!         connection.on_read(|event| {
//!             println!("{} bytes from fd {}", event.bytes_read.len(), event.fd);
//!         });
//!         assert!(connection.async_read().success());
//!         store.lock().unwrap().push(connection);
//!     });
//!     let status = server.listen("127.0.0.1", 7878);
//!     assert!(status.success(), "{}", status.what());
//!
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux 6.0+ only. Requires io_uring with multishot accept, multishot
//! recv, and ring-provided buffers.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod engine;
pub(crate) mod pool;
pub(crate) mod ring;

// ── Public modules ──────────────────────────────────────────────────────
pub mod acceptor;
pub mod config;
pub mod connection;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod metrics;
pub mod request;
pub mod socket;
pub mod subscriber;

// ── Re-exports: Resources ───────────────────────────────────────────────

/// Listening resource: multishot accept, one Connection per client.
pub use acceptor::Acceptor;
/// Per-socket façade for async reads and writes.
pub use connection::Connection;
/// Outbound resource: async connect delivering a Connection.
pub use connector::Connector;
/// Identifier for a connection, usable as a map key.
pub use endpoint::Endpoint;

// ── Re-exports: Engine ──────────────────────────────────────────────────

/// Event loop configuration.
pub use config::Config;
/// Engine errors.
pub use error::Error;
/// Errors surfaced through the loop's error handler.
pub use error::EngineError;
/// Success-or-message status returned by resource methods.
pub use error::MessagedStatus;
/// The event loop driving the submission engine.
pub use event_loop::EventLoop;
/// A request as handed to [`EventLoop::add`].
pub use request::Request;
/// Per-resource sink of typed event callbacks.
pub use subscriber::Subscriber;

// ── Re-exports: Events ──────────────────────────────────────────────────

/// A new connection was accepted.
pub use event::AcceptEvent;
/// An outbound connect finished.
pub use event::ConnectEvent;
/// A kernel operation failed.
pub use event::ErrorEvent;
/// Data arrived on a socket.
pub use event::ReadEvent;
/// A write finished.
pub use event::WriteEvent;

// ── Re-exports: Socket primitives ───────────────────────────────────────

/// Owning handle over a kernel file descriptor.
pub use socket::FileDescriptor;
/// IP version of a resolved address.
pub use socket::IpVersion;
/// An IPv4 or IPv6 socket address.
pub use socket::SocketAddress;
