//! Outbound resource: resolve a host and connect to it asynchronously,
//! delivering a [`Connection`] exactly once on success.

use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::connection::Connection;
use crate::error::{Error, MessagedStatus};
use crate::event::ErrorEvent;
use crate::event_loop::EventLoop;
use crate::request::Request;
use crate::socket::{self, FileDescriptor};
use crate::subscriber::Subscriber;

const DISCONNECTED: i8 = -2;
const PENDING: i8 = -1;
const CONNECTED: i8 = 0;

type ConnectionCallback = Box<dyn FnMut(Connection) + Send>;
type ErrorCallback = Box<dyn FnMut(ErrorEvent) + Send>;

pub struct Connector {
    event_loop: Weak<EventLoop>,
    subscriber: Arc<Subscriber>,
    /// The connecting socket. Ownership transfers out when the
    /// ConnectEvent wraps it into a Connection.
    socket: Arc<Mutex<FileDescriptor>>,
    status: Arc<AtomicI8>,
    on_connection: Arc<Mutex<Option<ConnectionCallback>>>,
    on_error: Arc<Mutex<Option<ErrorCallback>>>,
}

impl Connector {
    pub fn new(event_loop: &Arc<EventLoop>) -> Self {
        let connector = Connector {
            event_loop: Arc::downgrade(event_loop),
            subscriber: Arc::new(Subscriber::new()),
            socket: Arc::new(Mutex::new(FileDescriptor::invalid())),
            status: Arc::new(AtomicI8::new(DISCONNECTED)),
            on_connection: Arc::new(Mutex::new(None)),
            on_error: Arc::new(Mutex::new(None)),
        };

        // Hand the established socket to the user exactly once.
        let weak = connector.event_loop.clone();
        let socket = Arc::clone(&connector.socket);
        let status = Arc::clone(&connector.status);
        let callback = Arc::clone(&connector.on_connection);
        connector.subscriber.on_connect(move |_| {
            let established = socket.lock().unwrap().take();
            status.store(CONNECTED, Ordering::Release);
            if !established.is_open() {
                return;
            }
            let Some(event_loop) = weak.upgrade() else {
                return;
            };
            if let Some(callback) = callback.lock().unwrap().as_mut() {
                callback(Connection::new(&event_loop, established));
            }
        });

        // A failed connect returns the connector to Disconnected before
        // the user's error callback runs.
        let status = Arc::clone(&connector.status);
        let callback = Arc::clone(&connector.on_error);
        connector.subscriber.on_error(move |event| {
            let _ = status.compare_exchange(
                PENDING,
                DISCONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if let Some(callback) = callback.lock().unwrap().as_mut() {
                callback(event);
            }
        });

        connector
    }

    pub fn on_error(&self, callback: impl FnMut(ErrorEvent) + Send + 'static) {
        *self.on_error.lock().unwrap() = Some(Box::new(callback));
    }

    /// Set the callback invoked once the connection is established. The
    /// callback receives the [`Connection`] by value.
    pub fn on_connection(&self, callback: impl FnMut(Connection) + Send + 'static) {
        *self.on_connection.lock().unwrap() = Some(Box::new(callback));
    }

    /// Resolve the server and submit an asynchronous connect.
    pub fn async_connect(&mut self, server_address: &str, server_port: u16) -> MessagedStatus {
        if self.status.load(Ordering::Acquire) == PENDING {
            return MessagedStatus::error("Already pending connection");
        }

        let resolved = match socket::resolve(server_address, server_port, false) {
            Ok(address) => address,
            Err(e) => {
                return MessagedStatus::error(format!(
                    "Error resolving address {server_address}:{server_port}: {e}"
                ))
            }
        };

        let connecting = match socket::stream_socket(resolved.ip_version()) {
            Ok(socket) => socket,
            Err(e) => {
                return MessagedStatus::error(format!(
                    "Error creating socket for {server_address}:{server_port}: {e}"
                ))
            }
        };

        if let Err(e) = socket::set_option(&connecting, libc::SO_REUSEADDR, true) {
            return MessagedStatus::error(format!(
                "Error setting SO_REUSEADDR option to socket {server_address}:{server_port}: {e}"
            ));
        }

        let Some(event_loop) = self.event_loop.upgrade() else {
            return MessagedStatus::error("Event loop is gone");
        };

        // Store the socket and the Pending state before submitting: the
        // ConnectEvent may fire on the loop thread before add() returns
        // here.
        let fd = connecting.raw();
        *self.socket.lock().unwrap() = connecting;
        self.status.store(PENDING, Ordering::Release);

        match event_loop.add(Request::Connect { fd, addr: resolved }, &self.subscriber) {
            Ok(()) => MessagedStatus::ok("Pending connection"),
            Err(e) => {
                // Retract the socket; nothing was submitted.
                let _ = self.socket.lock().unwrap().take();
                self.status.store(DISCONNECTED, Ordering::Release);
                match e {
                    Error::QueueFull => MessagedStatus::error("Request queue is full"),
                    other => MessagedStatus::error(other.to_string()),
                }
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let socket = self.socket.lock().unwrap();
        if socket.is_open() {
            if let Some(event_loop) = self.event_loop.upgrade() {
                event_loop.cancel(socket.raw());
            }
        }
    }
}
