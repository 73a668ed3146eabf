//! Listening resource: bind, listen, and accept incoming connections.
//!
//! A single multishot accept registration covers the listening socket;
//! every accepted descriptor is wrapped in a [`Connection`] and handed to
//! the new-connection callback.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::connection::Connection;
use crate::error::{Error, MessagedStatus};
use crate::event::ErrorEvent;
use crate::event_loop::EventLoop;
use crate::request::Request;
use crate::socket::{self, FileDescriptor};
use crate::subscriber::Subscriber;

const NOT_LISTENING: u8 = 0;
const LISTENING: u8 = 1;

pub struct Acceptor {
    event_loop: Weak<EventLoop>,
    subscriber: Arc<Subscriber>,
    listening_socket: FileDescriptor,
    status: AtomicU8,
    max_connections: usize,
}

impl Acceptor {
    /// Construction only; no kernel work happens until
    /// [`listen`](Acceptor::listen).
    pub fn new(event_loop: &Arc<EventLoop>, max_connections: usize) -> Self {
        Acceptor {
            event_loop: Arc::downgrade(event_loop),
            subscriber: Arc::new(Subscriber::new()),
            listening_socket: FileDescriptor::invalid(),
            status: AtomicU8::new(NOT_LISTENING),
            max_connections,
        }
    }

    pub fn on_error(&self, callback: impl FnMut(ErrorEvent) + Send + 'static) {
        self.subscriber.on_error(callback);
    }

    /// Set the callback invoked for every accepted connection. The
    /// callback receives the new [`Connection`] by value.
    pub fn on_new_connection(&self, mut callback: impl FnMut(Connection) + Send + 'static) {
        let event_loop = self.event_loop.clone();
        self.subscriber.on_accept(move |event| {
            let client = FileDescriptor::from_raw(event.client_fd);
            // Loop gone: dropping `client` closes the descriptor.
            if let Some(event_loop) = event_loop.upgrade() {
                callback(Connection::new(&event_loop, client));
            }
        });
    }

    /// Bind, listen, and arm the multishot accept. Idempotent in the
    /// sense that a second call while listening fails.
    pub fn listen(&mut self, listening_address: &str, listening_port: u16) -> MessagedStatus {
        if self.status.load(Ordering::Acquire) == LISTENING {
            return MessagedStatus::error("Already listening");
        }

        let resolved = match socket::resolve(listening_address, listening_port, true) {
            Ok(address) => address,
            Err(e) => {
                return MessagedStatus::error(format!(
                    "Error resolving address {listening_address}:{listening_port}: {e}"
                ))
            }
        };

        let listening_socket = match socket::stream_socket(resolved.ip_version()) {
            Ok(socket) => socket,
            Err(e) => {
                return MessagedStatus::error(format!(
                    "Error creating socket for {listening_address}:{listening_port}: {e}"
                ))
            }
        };

        if let Err(e) = socket::set_option(&listening_socket, libc::SO_REUSEADDR, true) {
            return MessagedStatus::error(format!(
                "Error setting SO_REUSEADDR option to socket {listening_address}:{listening_port}: {e}"
            ));
        }
        if let Err(e) = socket::bind(&listening_socket, &resolved) {
            return MessagedStatus::error(format!(
                "Error binding to {listening_address}:{listening_port}: {e}"
            ));
        }
        if let Err(e) = socket::listen(&listening_socket, self.max_connections) {
            return MessagedStatus::error(format!(
                "Error listening to {listening_address}:{listening_port}: {e}"
            ));
        }

        let Some(event_loop) = self.event_loop.upgrade() else {
            return MessagedStatus::error("Event loop is gone");
        };
        match event_loop.add(
            Request::Accept {
                listening_socket_fd: listening_socket.raw(),
            },
            &self.subscriber,
        ) {
            Ok(()) => {}
            Err(Error::QueueFull) => return MessagedStatus::error("Request queue is full"),
            Err(e) => return MessagedStatus::error(e.to_string()),
        }

        self.listening_socket = listening_socket;
        self.status.store(LISTENING, Ordering::Release);

        MessagedStatus::ok("Pending connection requests")
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.listening_socket.is_open() {
            if let Some(event_loop) = self.event_loop.upgrade() {
                event_loop.cancel(self.listening_socket.raw());
            }
        }
    }
}
