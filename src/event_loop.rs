//! The event loop: drives the submission engine from one thread and
//! turns completions into subscriber callbacks.
//!
//! An `EventLoop` is shared behind `Arc`. Exactly one thread calls
//! [`run`](EventLoop::run); any number of threads may add requests,
//! cancel descriptors, install callbacks, or call
//! [`stop`](EventLoop::stop). Resources hold a `Weak` reference, so the
//! loop's lifetime is controlled by the application, not by the
//! resources it serves.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::config::Config;
use crate::engine::{Engine, PendingOp, PendingQueue};
use crate::error::{EngineError, Error};
use crate::event::ErrorEvent;
use crate::metrics;
use crate::pool::RequestPool;
use crate::request::{
    AcceptRequest, ConnectRequest, MultishotReadRequest, Opcode, PayloadGuard, ReadRequest,
    Request, RequestHeader, WriteRequest,
};
use crate::ring::SubmitOutcome;
use crate::subscriber::Subscriber;

/// Sink for engine-level errors (malformed completions, submit
/// failures). The default callback logs them and the loop continues.
pub(crate) struct ErrorHandler {
    callback: Mutex<Box<dyn FnMut(EngineError) + Send>>,
}

impl ErrorHandler {
    fn new() -> Self {
        ErrorHandler {
            callback: Mutex::new(Box::new(|err| error!("{err}"))),
        }
    }

    pub fn set(&self, callback: impl FnMut(EngineError) + Send + 'static) {
        *self.callback.lock().unwrap() = Box::new(callback);
    }

    pub fn handle(&self, err: EngineError) {
        (self.callback.lock().unwrap())(err);
    }
}

pub struct EventLoop {
    engine: Mutex<Engine>,
    pool: Mutex<RequestPool>,
    pending: Mutex<PendingQueue>,
    errors: ErrorHandler,
    running: AtomicBool,
    config: Config,
}

impl EventLoop {
    /// Build a loop with the given submission queue size and defaults for
    /// everything else. The queue size must be a power of two.
    pub fn new(queue_size: u32) -> Result<Arc<Self>, Error> {
        Self::with_config(Config {
            queue_size,
            pool_capacity: queue_size as usize,
            ..Config::default()
        })
    }

    /// Build a loop from a full configuration. Initializes the kernel
    /// ring and registers the provided-buffer ring; failure here is
    /// fatal for the engine.
    pub fn with_config(config: Config) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let engine = Engine::new(&config)?;
        Ok(Arc::new(EventLoop {
            engine: Mutex::new(engine),
            pool: Mutex::new(RequestPool::with_capacity(config.pool_capacity)),
            pending: Mutex::new(PendingQueue::default()),
            errors: ErrorHandler::new(),
            running: AtomicBool::new(false),
            config,
        }))
    }

    /// Add a request to be prepared, then submitted. The subscriber is
    /// notified once the request completes.
    ///
    /// Callable from any thread; never blocks beyond two O(1) mutexes.
    /// Returns [`Error::QueueFull`] when the request pool has no free
    /// slot.
    pub fn add(&self, request: Request, subscriber: &Arc<Subscriber>) -> Result<(), Error> {
        let Some(slot) = self.pool.lock().unwrap().allocate() else {
            metrics::REQUESTS_REJECTED.increment();
            return Err(Error::QueueFull);
        };

        let subscriber_ptr = Arc::as_ptr(subscriber);
        let ptr = slot.as_ptr();
        let fd = request.fd();
        let opcode = request.opcode();

        // Move the request into its slot. The slot address is the
        // kernel's user_data from here on.
        let guard = match request {
            Request::Accept {
                listening_socket_fd,
            } => {
                unsafe {
                    (*ptr).accept = AcceptRequest {
                        header: RequestHeader::new(Opcode::Accept, subscriber_ptr),
                        listening_socket_fd,
                    };
                }
                PayloadGuard::None
            }
            Request::Connect { fd, addr } => {
                let addr = Box::new(addr);
                let (sockaddr, addrlen) = addr.as_sockaddr();
                unsafe {
                    (*ptr).connect = ConnectRequest {
                        header: RequestHeader::new(Opcode::Connect, subscriber_ptr),
                        socket_fd: fd,
                        addr: sockaddr,
                        addrlen,
                    };
                }
                PayloadGuard::Connect(addr)
            }
            Request::Read { fd, capacity } => {
                let mut buf = vec![0u8; capacity].into_boxed_slice();
                unsafe {
                    (*ptr).read = ReadRequest {
                        header: RequestHeader::new(Opcode::Read, subscriber_ptr),
                        fd,
                        buf: buf.as_mut_ptr(),
                        len: buf.len().min(u32::MAX as usize) as u32,
                    };
                }
                PayloadGuard::Read(buf)
            }
            Request::ReadMultishot { fd } => {
                unsafe {
                    (*ptr).read_multishot = MultishotReadRequest {
                        header: RequestHeader::new(Opcode::ReadMultishot, subscriber_ptr),
                        fd,
                        buffer_group: self.config.buffer_group,
                    };
                }
                PayloadGuard::None
            }
            Request::Write { fd, bytes } => {
                unsafe {
                    (*ptr).write = WriteRequest {
                        header: RequestHeader::new(Opcode::Write, subscriber_ptr),
                        fd,
                        data: bytes.as_ptr(),
                        len: bytes.len().min(u32::MAX as usize) as u32,
                    };
                }
                PayloadGuard::Write(bytes)
            }
        };

        self.pending.lock().unwrap().push(PendingOp {
            slot,
            subscriber: Arc::clone(subscriber),
            guard,
            fd,
            opcode,
        });
        metrics::REQUESTS_PUSHED.increment();
        Ok(())
    }

    /// Enqueue a single kernel cancel covering every outstanding
    /// operation on the descriptor. Used by resources on destruction.
    pub fn cancel(&self, fd: RawFd) {
        self.pending.lock().unwrap().push_cancel(fd);
    }

    /// Install the handler for engine-level errors, replacing the
    /// default (which logs at error level).
    pub fn on_error(&self, callback: impl FnMut(EngineError) + Send + 'static) {
        self.errors.set(callback);
    }

    /// Drive the engine until [`stop`](EventLoop::stop) is called. Must
    /// be called from exactly one thread; callbacks run on that thread
    /// and should return promptly.
    pub fn run(&self) {
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            let mut engine = self.engine.lock().unwrap();

            let batch = self.pending.lock().unwrap().take();
            if !batch.is_empty() {
                let mut requeue = PendingQueue::default();
                engine.prepare(batch, &mut requeue);
                if !requeue.is_empty() {
                    self.pending.lock().unwrap().prepend(requeue);
                }
            }

            let outcome = engine.submit(self.config.submit_timeout);
            if outcome.should_retry() {
                continue;
            }
            match outcome {
                SubmitOutcome::Failed(errno) => {
                    self.errors.handle(EngineError::Submit(ErrorEvent {
                        error_code: errno,
                    }));
                }
                SubmitOutcome::Submitted(_) => engine.dispatch(&self.pool, &self.errors),
                // Timeout / Interrupted / NotReady were retried above.
                _ => {}
            }
        }
    }

    /// Ask the loop to exit after the current iteration. Callable from
    /// any thread, including from inside a callback.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn records_in_flight(&self) -> usize {
        self.pool.lock().unwrap().in_flight()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::FileDescriptor;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn make_pipe() -> (FileDescriptor, FileDescriptor) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe creation failed");
        (FileDescriptor::from_raw(fds[0]), FileDescriptor::from_raw(fds[1]))
    }

    fn run_in_thread(event_loop: &Arc<EventLoop>) -> thread::JoinHandle<()> {
        let driver = Arc::clone(event_loop);
        thread::spawn(move || driver.run())
    }

    /// Stop a wedged loop so a broken test fails on assertions instead
    /// of hanging.
    fn spawn_watchdog(event_loop: &Arc<EventLoop>) {
        let guard = Arc::clone(event_loop);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(10));
            guard.stop();
        });
    }

    #[test]
    fn write_then_read_round_trip_over_pipe() {
        let event_loop = EventLoop::new(64).unwrap();
        let (read_end, write_end) = make_pipe();

        let writer = Arc::new(Subscriber::new());
        let written = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&written);
        writer.on_write(move |event| {
            sink.fetch_add(event.bytes_written.len(), Ordering::Relaxed);
        });

        let reader = Arc::new(Subscriber::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let stopper = Arc::clone(&event_loop);
        reader.on_read(move |event| {
            sink.lock().unwrap().extend_from_slice(event.bytes_read);
            stopper.stop();
        });

        event_loop
            .add(
                Request::Write {
                    fd: write_end.raw(),
                    bytes: Bytes::from_static(b"ping"),
                },
                &writer,
            )
            .unwrap();
        event_loop
            .add(
                Request::Read {
                    fd: read_end.raw(),
                    capacity: 64,
                },
                &reader,
            )
            .unwrap();

        spawn_watchdog(&event_loop);
        run_in_thread(&event_loop).join().unwrap();

        assert_eq!(received.lock().unwrap().as_slice(), b"ping");
        assert_eq!(written.load(Ordering::Relaxed), 4);
        // Both single-shot records were released and the queue drained.
        assert_eq!(event_loop.pending_len(), 0);
        assert_eq!(event_loop.records_in_flight(), 0);
    }

    #[test]
    fn writes_complete_in_program_order() {
        let event_loop = EventLoop::new(64).unwrap();
        let (_read_end, write_end) = make_pipe();

        let writer = Arc::new(Subscriber::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let stopper = Arc::clone(&event_loop);
        writer.on_write(move |event| {
            let mut order = sink.lock().unwrap();
            order.push(event.bytes_written[0]);
            if order.len() == 3 {
                stopper.stop();
            }
        });

        for message in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            event_loop
                .add(
                    Request::Write {
                        fd: write_end.raw(),
                        bytes: Bytes::copy_from_slice(message),
                    },
                    &writer,
                )
                .unwrap();
        }

        spawn_watchdog(&event_loop);
        run_in_thread(&event_loop).join().unwrap();

        assert_eq!(order.lock().unwrap().as_slice(), b"abc");
    }

    #[test]
    fn zero_byte_read_surfaces_empty_event() {
        let event_loop = EventLoop::new(64).unwrap();
        let (read_end, write_end) = make_pipe();
        // Closing the write side makes the pending read complete with 0.
        drop(write_end);

        let reader = Arc::new(Subscriber::new());
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let stopper = Arc::clone(&event_loop);
        reader.on_read(move |event| {
            *sink.lock().unwrap() = Some(event.bytes_read.to_vec());
            stopper.stop();
        });

        event_loop
            .add(
                Request::Read {
                    fd: read_end.raw(),
                    capacity: 16,
                },
                &reader,
            )
            .unwrap();

        spawn_watchdog(&event_loop);
        run_in_thread(&event_loop).join().unwrap();

        assert_eq!(observed.lock().unwrap().as_deref(), Some(&[][..]));
    }

    #[test]
    fn pool_exhaustion_reports_queue_full() {
        let event_loop = EventLoop::with_config(Config {
            queue_size: 8,
            pool_capacity: 2,
            ..Config::default()
        })
        .unwrap();
        let (_read_end, write_end) = make_pipe();
        let subscriber = Arc::new(Subscriber::new());

        let request = |fd| Request::Write {
            fd,
            bytes: Bytes::from_static(b"x"),
        };
        assert!(event_loop.add(request(write_end.raw()), &subscriber).is_ok());
        assert!(event_loop.add(request(write_end.raw()), &subscriber).is_ok());
        assert!(matches!(
            event_loop.add(request(write_end.raw()), &subscriber),
            Err(Error::QueueFull)
        ));
    }
}
