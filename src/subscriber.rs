//! Per-resource event sink.
//!
//! A subscriber holds one callback slot per event kind. Its address is
//! associated with every request the owning resource submits, so the
//! engine can route completions back; resources therefore keep their
//! subscriber behind an `Arc` whose pointee never moves.

use std::sync::Mutex;

use crate::event::{AcceptEvent, ConnectEvent, ErrorEvent, ReadEvent, WriteEvent};

type ErrorCallback = Box<dyn FnMut(ErrorEvent) + Send>;
type AcceptCallback = Box<dyn FnMut(AcceptEvent) + Send>;
type ConnectCallback = Box<dyn FnMut(ConnectEvent) + Send>;
type ReadCallback = Box<dyn FnMut(ReadEvent<'_>) + Send>;
type WriteCallback = Box<dyn FnMut(WriteEvent<'_>) + Send>;

#[derive(Default)]
struct Slots {
    on_error: Option<ErrorCallback>,
    on_accept: Option<AcceptCallback>,
    on_connect: Option<ConnectCallback>,
    on_read: Option<ReadCallback>,
    on_write: Option<WriteCallback>,
}

/// Typed multi-callback sink, one per resource.
///
/// Installation may happen from any thread while the event-loop thread
/// is invoking handlers. Installing a callback for an event kind
/// replaces the previous one; the previous one is dropped.
#[derive(Default)]
pub struct Subscriber {
    slots: Mutex<Slots>,
}

/// Invoke the callback for one event kind without holding the slot lock
/// across the call. The callback is taken out, invoked, and restored
/// only if the slot is still empty, so a handler may install callbacks
/// (including on its own subscriber) and a replacement installed during
/// invocation wins.
macro_rules! dispatch {
    ($self:ident, $slot:ident, $event:expr) => {{
        let callback = $self.slots.lock().unwrap().$slot.take();
        if let Some(mut callback) = callback {
            callback($event);
            let mut slots = $self.slots.lock().unwrap();
            if slots.$slot.is_none() {
                slots.$slot = Some(callback);
            }
        }
    }};
}

impl Subscriber {
    pub fn new() -> Self {
        Subscriber::default()
    }

    pub fn on_error(&self, callback: impl FnMut(ErrorEvent) + Send + 'static) {
        self.slots.lock().unwrap().on_error = Some(Box::new(callback));
    }

    pub fn on_accept(&self, callback: impl FnMut(AcceptEvent) + Send + 'static) {
        self.slots.lock().unwrap().on_accept = Some(Box::new(callback));
    }

    pub fn on_connect(&self, callback: impl FnMut(ConnectEvent) + Send + 'static) {
        self.slots.lock().unwrap().on_connect = Some(Box::new(callback));
    }

    pub fn on_read(&self, callback: impl FnMut(ReadEvent<'_>) + Send + 'static) {
        self.slots.lock().unwrap().on_read = Some(Box::new(callback));
    }

    pub fn on_write(&self, callback: impl FnMut(WriteEvent<'_>) + Send + 'static) {
        self.slots.lock().unwrap().on_write = Some(Box::new(callback));
    }

    pub fn handle_error(&self, event: ErrorEvent) {
        dispatch!(self, on_error, event);
    }

    pub fn handle_accept(&self, event: AcceptEvent) {
        dispatch!(self, on_accept, event);
    }

    pub fn handle_connect(&self, event: ConnectEvent) {
        dispatch!(self, on_connect, event);
    }

    pub fn handle_read(&self, event: ReadEvent<'_>) {
        dispatch!(self, on_read, event);
    }

    pub fn handle_write(&self, event: WriteEvent<'_>) {
        dispatch!(self, on_write, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn missing_callback_is_a_no_op() {
        let subscriber = Subscriber::new();
        subscriber.handle_connect(ConnectEvent);
        subscriber.handle_read(ReadEvent {
            fd: 3,
            bytes_read: b"data",
        });
    }

    #[test]
    fn installing_replaces_previous() {
        let subscriber = Subscriber::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        subscriber.on_accept(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = Arc::clone(&second);
        subscriber.on_accept(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        subscriber.handle_accept(AcceptEvent { client_fd: 5 });
        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn callback_sees_event_payload() {
        let subscriber = Subscriber::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subscriber.on_read(move |event| {
            sink.lock().unwrap().extend_from_slice(event.bytes_read);
        });
        subscriber.handle_read(ReadEvent {
            fd: 1,
            bytes_read: b"Hello, world!",
        });
        assert_eq!(seen.lock().unwrap().as_slice(), b"Hello, world!");
    }

    #[test]
    fn handler_may_replace_itself() {
        let subscriber = Arc::new(Subscriber::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&subscriber);
        let counter = Arc::clone(&fired);
        subscriber.on_connect(move |_| {
            let counter = Arc::clone(&counter);
            inner.on_connect(move |_| {
                counter.fetch_add(10, Ordering::Relaxed);
            });
        });

        subscriber.handle_connect(ConnectEvent);
        subscriber.handle_connect(ConnectEvent);
        assert_eq!(fired.load(Ordering::Relaxed), 10);
    }
}
