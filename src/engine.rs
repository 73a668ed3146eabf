//! Submission engine: mediates all interaction with the kernel ring.
//!
//! Requests pushed from any thread wait in the pending queue; the
//! event-loop thread drains it, prepares SQEs, submits the batch, reaps
//! completions, and routes each one to its subscriber. From the moment a
//! request is prepared until its completion is dispatched, the engine
//! keeps the record's slot, the subscriber, and any owned payload alive
//! in the live-operation table.

use std::collections::{HashMap, HashSet};
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use io_uring::cqueue;
use log::{debug, trace};

use crate::buffer::BufferRing;
use crate::config::Config;
use crate::error::{EngineError, Error};
use crate::event::{AcceptEvent, ConnectEvent, ErrorEvent, ReadEvent, WriteEvent};
use crate::event_loop::ErrorHandler;
use crate::metrics;
use crate::pool::RequestPool;
use crate::request::{Opcode, PayloadGuard, RequestSlot};
use crate::ring::{Completion, Ring, SubmitOutcome};
use crate::subscriber::Subscriber;

/// Reserved `user_data` for cancel SQEs. Their completions carry no
/// request record and are consumed silently.
const CANCEL_USER_DATA: u64 = u64::MAX;

/// A request waiting to be prepared on the event-loop thread.
pub(crate) struct PendingOp {
    pub slot: NonNull<RequestSlot>,
    pub subscriber: Arc<Subscriber>,
    pub guard: PayloadGuard,
    pub fd: RawFd,
    pub opcode: Opcode,
}

// Safety: the slot pointer targets a pool allocation that outlives the
// operation; the engine never aliases it across threads.
unsafe impl Send for PendingOp {}

/// Per-opcode lists of requests awaiting preparation, plus descriptors
/// awaiting a cancel. Drained on each loop iteration before submission.
#[derive(Default)]
pub(crate) struct PendingQueue {
    accepts: Vec<PendingOp>,
    connects: Vec<PendingOp>,
    reads: Vec<PendingOp>,
    multishot_reads: Vec<PendingOp>,
    writes: Vec<PendingOp>,
    cancels: Vec<RawFd>,
}

impl PendingQueue {
    pub fn push(&mut self, op: PendingOp) {
        match op.opcode {
            Opcode::Accept => self.accepts.push(op),
            Opcode::Connect => self.connects.push(op),
            Opcode::Read => self.reads.push(op),
            Opcode::ReadMultishot => self.multishot_reads.push(op),
            Opcode::Write => self.writes.push(op),
        }
    }

    pub fn push_cancel(&mut self, fd: RawFd) {
        self.cancels.push(fd);
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.cancels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accepts.len()
            + self.connects.len()
            + self.reads.len()
            + self.multishot_reads.len()
            + self.writes.len()
    }

    pub fn take(&mut self) -> PendingQueue {
        std::mem::take(self)
    }

    /// Re-insert `earlier` ahead of anything queued since it was taken,
    /// preserving program order within each opcode list.
    pub fn prepend(&mut self, mut earlier: PendingQueue) {
        earlier.accepts.append(&mut self.accepts);
        earlier.connects.append(&mut self.connects);
        earlier.reads.append(&mut self.reads);
        earlier.multishot_reads.append(&mut self.multishot_reads);
        earlier.writes.append(&mut self.writes);
        earlier.cancels.append(&mut self.cancels);
        *self = earlier;
    }
}

/// Everything that must stay alive while a request is in flight.
struct LiveOp {
    subscriber: Arc<Subscriber>,
    _guard: PayloadGuard,
    fd: RawFd,
}

/// Event-loop-thread half of the engine. Owns the kernel ring, the
/// provided-buffer ring, and the in-flight bookkeeping; only the driver
/// thread touches it.
pub(crate) struct Engine {
    ring: Ring,
    buffers: BufferRing,
    /// In-flight operations keyed by record address (= CQE user_data).
    live: HashMap<u64, LiveOp>,
    /// Descriptors with a cancel submitted and not yet fully drained.
    cancelled: HashSet<RawFd>,
    /// Scratch batch reused across dispatch rounds.
    batch: Vec<Completion>,
}

impl Engine {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let ring = Ring::setup(config)?;
        let buffers = BufferRing::new(config.buffer_group, config.buffer_count, config.buffer_size)?;
        buffers.register(&ring.submitter())?;
        Ok(Engine {
            ring,
            buffers,
            live: HashMap::new(),
            cancelled: HashSet::new(),
            batch: Vec::new(),
        })
    }

    /// Prepare one batch of pending requests. Requests the SQ cannot take
    /// (and everything behind them in the same list, to preserve order)
    /// land in `requeue` for the next iteration.
    pub fn prepare(&mut self, mut batch: PendingQueue, requeue: &mut PendingQueue) {
        for fd in batch.cancels.drain(..) {
            match self.ring.push_cancel_fd(fd, CANCEL_USER_DATA) {
                Ok(()) => {
                    self.cancelled.insert(fd);
                    trace!("cancel submitted for fd {fd}");
                }
                Err(_) => requeue.cancels.push(fd),
            }
        }
        self.prepare_list(batch.accepts, &mut requeue.accepts);
        self.prepare_list(batch.connects, &mut requeue.connects);
        self.prepare_list(batch.reads, &mut requeue.reads);
        self.prepare_list(batch.multishot_reads, &mut requeue.multishot_reads);
        self.prepare_list(batch.writes, &mut requeue.writes);
    }

    fn prepare_list(&mut self, ops: Vec<PendingOp>, requeue: &mut Vec<PendingOp>) {
        let mut iter = ops.into_iter();
        while let Some(op) = iter.next() {
            if let Err(op) = self.prepare_op(op) {
                // SQ full: keep this op and everything behind it, in order.
                requeue.push(op);
                requeue.extend(iter);
                break;
            }
        }
    }

    fn prepare_op(&mut self, op: PendingOp) -> Result<(), PendingOp> {
        let slot = op.slot.as_ptr();
        let user_data = slot as u64;

        let prepared = match op.opcode {
            Opcode::Accept => {
                // A fresh registration supersedes any stale cancel mark
                // left from a previous owner of this descriptor number.
                self.cancelled.remove(&op.fd);
                let request = unsafe { (*slot).accept };
                self.ring.push_accept(request.listening_socket_fd, user_data)
            }
            Opcode::Connect => {
                let request = unsafe { (*slot).connect };
                // Safety: the sockaddr is owned by the op's payload guard,
                // which lives in the live table until release.
                unsafe {
                    self.ring
                        .push_connect(request.socket_fd, request.addr, request.addrlen, user_data)
                }
            }
            Opcode::Read => {
                let request = unsafe { (*slot).read };
                // Safety: the reception buffer is owned by the payload guard.
                unsafe { self.ring.push_read(request.fd, request.buf, request.len, user_data) }
            }
            Opcode::ReadMultishot => {
                self.cancelled.remove(&op.fd);
                let request = unsafe { (*slot).read_multishot };
                self.ring
                    .push_read_multishot(request.fd, request.buffer_group, user_data)
            }
            Opcode::Write => {
                let request = unsafe { (*slot).write };
                // Safety: the source bytes are owned by the payload guard.
                unsafe { self.ring.push_write(request.fd, request.data, request.len, user_data) }
            }
        };

        match prepared {
            Ok(()) => {
                self.live.insert(
                    user_data,
                    LiveOp {
                        subscriber: op.subscriber,
                        _guard: op.guard,
                        fd: op.fd,
                    },
                );
                Ok(())
            }
            Err(_) => Err(op),
        }
    }

    /// Submit prepared SQEs and wait up to `timeout` for a completion.
    pub fn submit(&self, timeout: Duration) -> SubmitOutcome {
        self.ring.submit_and_wait_timeout(timeout)
    }

    /// Reap every completion present in the ring and dispatch it.
    pub fn dispatch(&mut self, pool: &Mutex<RequestPool>, errors: &ErrorHandler) {
        let mut batch = std::mem::take(&mut self.batch);
        batch.clear();
        self.ring.drain_completions(&mut batch);
        for cqe in &batch {
            self.dispatch_one(*cqe, pool, errors);
        }
        self.batch = batch;
    }

    fn dispatch_one(&mut self, cqe: Completion, pool: &Mutex<RequestPool>, errors: &ErrorHandler) {
        metrics::CQE_PROCESSED.increment();

        if cqe.user_data == 0 {
            metrics::MALFORMED_COMPLETIONS.increment();
            errors.handle(EngineError::Dispatch("malformed completion queue entry"));
            return;
        }
        if cqe.user_data == CANCEL_USER_DATA {
            trace!("cancel completion: result {}", cqe.result);
            return;
        }

        // A completion whose record is not live belongs to a request that
        // was already released (e.g. after its descriptor was cancelled
        // and the owning resource dropped). Discard it.
        let Some(live) = self.live.get(&cqe.user_data) else {
            metrics::MALFORMED_COMPLETIONS.increment();
            errors.handle(EngineError::Dispatch("completion without a live request"));
            return;
        };
        let subscriber = Arc::clone(&live.subscriber);
        let fd = live.fd;

        let slot = cqe.user_data as *const RequestSlot;
        let header = unsafe { &(*slot).header };
        if !header.valid() {
            metrics::MALFORMED_COMPLETIONS.increment();
            errors.handle(EngineError::Dispatch("invalid request header"));
            return;
        }
        let Some(opcode) = header.opcode() else {
            metrics::MALFORMED_COMPLETIONS.increment();
            errors.handle(EngineError::Dispatch("unknown operation tag"));
            return;
        };
        debug_assert_eq!(header.subscriber_ptr(), Arc::as_ptr(&subscriber));

        if cqe.result < 0 {
            self.log_issuing_request(slot, opcode);
            subscriber.handle_error(ErrorEvent {
                error_code: -cqe.result,
            });
        } else {
            match opcode {
                Opcode::Accept => subscriber.handle_accept(AcceptEvent {
                    client_fd: cqe.result,
                }),
                Opcode::Connect => subscriber.handle_connect(ConnectEvent),
                Opcode::Read => {
                    let request = unsafe { (*slot).read };
                    let len = (cqe.result as usize).min(request.len as usize);
                    // The result holds the number of bytes read; zero
                    // means the peer closed the stream.
                    let bytes: &[u8] = if len == 0 {
                        &[]
                    } else {
                        unsafe { std::slice::from_raw_parts(request.buf, len) }
                    };
                    subscriber.handle_read(ReadEvent {
                        fd: request.fd,
                        bytes_read: bytes,
                    });
                }
                Opcode::ReadMultishot => {
                    let request = unsafe { (*slot).read_multishot };
                    if cqe.result == 0 {
                        subscriber.handle_read(ReadEvent {
                            fd: request.fd,
                            bytes_read: &[],
                        });
                    } else {
                        match self.buffers.get(cqe.flags, cqe.result as usize) {
                            Ok(bytes) => {
                                subscriber.handle_read(ReadEvent {
                                    fd: request.fd,
                                    bytes_read: &*bytes,
                                });
                                // The handler has returned; the kernel may
                                // hand this buffer out again.
                                self.buffers.release(cqe.flags);
                            }
                            Err(_) => {
                                errors.handle(EngineError::Dispatch("invalid buffer id"));
                            }
                        }
                    }
                }
                Opcode::Write => {
                    let request = unsafe { (*slot).write };
                    let bytes: &[u8] = if request.len == 0 {
                        &[]
                    } else {
                        unsafe { std::slice::from_raw_parts(request.data, request.len as usize) }
                    };
                    subscriber.handle_write(WriteEvent {
                        fd: request.fd,
                        bytes_written: bytes,
                    });
                }
            }
        }

        if !opcode.is_multishot() {
            self.release(cqe.user_data, pool);
            return;
        }

        // Multishot lifetime: the registration persists until the kernel
        // stops it. An error is terminal (not re-armed); a cleared "more"
        // flag re-arms unless the descriptor was cancelled or the stream
        // ended.
        if cqe.result < 0 {
            self.release(cqe.user_data, pool);
            self.cancelled.remove(&fd);
        } else if !cqueue::more(cqe.flags) {
            if self.cancelled.remove(&fd) {
                self.release(cqe.user_data, pool);
            } else if opcode == Opcode::ReadMultishot && cqe.result == 0 {
                self.release(cqe.user_data, pool);
            } else {
                self.rearm(cqe.user_data, opcode, pool, errors);
            }
        }
    }

    fn rearm(
        &mut self,
        user_data: u64,
        opcode: Opcode,
        pool: &Mutex<RequestPool>,
        errors: &ErrorHandler,
    ) {
        let slot = user_data as *const RequestSlot;
        let rearmed = match opcode {
            Opcode::Accept => {
                let request = unsafe { (*slot).accept };
                self.ring.push_accept(request.listening_socket_fd, user_data)
            }
            Opcode::ReadMultishot => {
                let request = unsafe { (*slot).read_multishot };
                self.ring
                    .push_read_multishot(request.fd, request.buffer_group, user_data)
            }
            _ => unreachable!("only multishot opcodes are re-armed"),
        };
        match rearmed {
            Ok(()) => {
                metrics::MULTISHOT_REARMED.increment();
                trace!("re-armed multishot registration {user_data:#x}");
            }
            Err(_) => {
                errors.handle(EngineError::Dispatch("failed to re-arm multishot request"));
                self.release(user_data, pool);
            }
        }
    }

    fn release(&mut self, user_data: u64, pool: &Mutex<RequestPool>) {
        if self.live.remove(&user_data).is_some() {
            let slot = NonNull::new(user_data as *mut RequestSlot).expect("live key is non-null");
            pool.lock().unwrap().release(slot);
            metrics::REQUESTS_RELEASED.increment();
        }
    }

    fn log_issuing_request(&self, slot: *const RequestSlot, opcode: Opcode) {
        match opcode {
            Opcode::Accept => debug!("during handling of {}", unsafe { (*slot).accept }),
            Opcode::Connect => debug!("during handling of {}", unsafe { (*slot).connect }),
            Opcode::Read => debug!("during handling of {}", unsafe { (*slot).read }),
            Opcode::ReadMultishot => {
                debug!("during handling of {}", unsafe { (*slot).read_multishot })
            }
            Opcode::Write => debug!("during handling of {}", unsafe { (*slot).write }),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_op(opcode: Opcode, slot: NonNull<RequestSlot>, fd: RawFd) -> PendingOp {
        PendingOp {
            slot,
            subscriber: Arc::new(Subscriber::new()),
            guard: PayloadGuard::None,
            fd,
            opcode,
        }
    }

    #[test]
    fn pending_queue_routes_by_opcode_and_drains() {
        let mut pool = RequestPool::with_capacity(8);
        let mut queue = PendingQueue::default();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        queue.push(dummy_op(Opcode::Write, a, 3));
        queue.push(dummy_op(Opcode::Accept, b, 4));
        queue.push_cancel(5);
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_empty());

        let taken = queue.take();
        assert!(queue.is_empty());
        assert_eq!(taken.writes.len(), 1);
        assert_eq!(taken.accepts.len(), 1);
        assert_eq!(taken.cancels, vec![5]);
    }

    #[test]
    fn prepend_preserves_program_order() {
        let mut pool = RequestPool::with_capacity(8);
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();

        let mut requeued = PendingQueue::default();
        requeued.push(dummy_op(Opcode::Write, first, 1));
        let mut pending = PendingQueue::default();
        pending.push(dummy_op(Opcode::Write, second, 1));

        pending.prepend(requeued);
        let slots: Vec<_> = pending.writes.iter().map(|op| op.slot).collect();
        assert_eq!(slots, vec![first, second]);
    }
}
