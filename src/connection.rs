//! Per-socket façade for asynchronous reading and writing.
//!
//! A connection holds everything required to keep requests submitted to
//! the ring from dangling: the owned socket, and a subscriber behind an
//! `Arc` whose address survives moves of the connection itself. Dropping
//! the connection cancels all outstanding kernel operations on its
//! descriptor before the socket closes.

use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::{Error, MessagedStatus};
use crate::event::{ErrorEvent, ReadEvent, WriteEvent};
use crate::event_loop::EventLoop;
use crate::request::Request;
use crate::socket::FileDescriptor;
use crate::subscriber::Subscriber;

pub struct Connection {
    event_loop: Weak<EventLoop>,
    socket: FileDescriptor,
    endpoint: Endpoint,
    subscriber: Arc<Subscriber>,
}

impl Connection {
    /// Wrap an established socket. Connections are normally manufactured
    /// by an [`Acceptor`](crate::Acceptor) or
    /// [`Connector`](crate::Connector).
    pub fn new(event_loop: &Arc<EventLoop>, socket: FileDescriptor) -> Self {
        let endpoint = Endpoint { fd: socket.raw() };
        Connection {
            event_loop: Arc::downgrade(event_loop),
            socket,
            endpoint,
            subscriber: Arc::new(Subscriber::new()),
        }
    }

    /// Arm a multishot read. Read events flow to the read callback until
    /// the socket is cancelled; a duplicate call arms a fresh
    /// registration.
    pub fn async_read(&self) -> MessagedStatus {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return MessagedStatus::error("Event loop is gone");
        };
        match event_loop.add(
            Request::ReadMultishot {
                fd: self.socket.raw(),
            },
            &self.subscriber,
        ) {
            Ok(()) => MessagedStatus::ok("Success"),
            Err(Error::QueueFull) => MessagedStatus::error("Request queue is full"),
            Err(e) => MessagedStatus::error(e.to_string()),
        }
    }

    /// Submit a single-shot write. The engine keeps the bytes alive
    /// until the WriteEvent has fired.
    pub fn async_write(&self, bytes: Bytes) -> MessagedStatus {
        let Some(event_loop) = self.event_loop.upgrade() else {
            return MessagedStatus::error("Event loop is gone");
        };
        match event_loop.add(
            Request::Write {
                fd: self.socket.raw(),
                bytes,
            },
            &self.subscriber,
        ) {
            Ok(()) => MessagedStatus::ok("Success"),
            Err(Error::QueueFull) => MessagedStatus::error("Request queue is full"),
            Err(e) => MessagedStatus::error(e.to_string()),
        }
    }

    pub fn on_error(&self, callback: impl FnMut(ErrorEvent) + Send + 'static) {
        self.subscriber.on_error(callback);
    }

    pub fn on_read(&self, callback: impl FnMut(ReadEvent<'_>) + Send + 'static) {
        self.subscriber.on_read(callback);
    }

    pub fn on_write(&self, callback: impl FnMut(WriteEvent<'_>) + Send + 'static) {
        self.subscriber.on_write(callback);
    }

    /// Identifier for this connection, usable as a map key.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.socket.is_open() {
            if let Some(event_loop) = self.event_loop.upgrade() {
                event_loop.cancel(self.socket.raw());
            }
        }
    }
}
