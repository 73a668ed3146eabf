//! Wrapper around IoUring providing SQE preparation and submission
//! helpers for the five request opcodes plus cancel-by-fd.
//!
//! `user_data` on every prepared entry is the stable address of the
//! issuing request record; the engine recovers and validates it when the
//! completion arrives.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::types::{CancelBuilder, Fd, SubmitArgs, Timespec};
use io_uring::{opcode, IoUring};

use crate::config::Config;
use crate::error::Error;
use crate::metrics;

/// Outcome of one submit-and-wait cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    /// SQEs were submitted and at least one completion is available.
    Submitted(usize),
    /// The wait timed out before a completion arrived.
    Timeout,
    /// The wait was interrupted by a signal.
    Interrupted,
    /// The kernel could not accept the batch right now.
    NotReady,
    /// Hard submit error (positive errno).
    Failed(i32),
}

impl SubmitOutcome {
    /// True for outcomes the loop absorbs by simply submitting again.
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            SubmitOutcome::Timeout | SubmitOutcome::Interrupted | SubmitOutcome::NotReady
        )
    }
}

/// One reaped completion entry, detached from the kernel ring.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub user_data: u64,
    pub result: i32,
    pub flags: u32,
}

pub(crate) struct Ring {
    ring: IoUring,
}

impl Ring {
    /// Create and configure the io_uring instance. Failure here is a
    /// construction-time error for the whole engine.
    pub fn setup(config: &Config) -> Result<Self, Error> {
        let ring = IoUring::builder()
            .build(config.queue_size)
            .map_err(|e| Error::RingSetup(e.to_string()))?;
        Ok(Ring { ring })
    }

    pub fn submitter(&self) -> io_uring::Submitter<'_> {
        self.ring.submitter()
    }

    /// Prepare a multishot accept on a listening descriptor.
    pub fn push_accept(&mut self, fd: RawFd, user_data: u64) -> io::Result<()> {
        let entry = opcode::AcceptMulti::new(Fd(fd)).build().user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Prepare a single-shot connect.
    ///
    /// # Safety
    /// `addr` must stay valid until the CQE arrives.
    pub unsafe fn push_connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        user_data: u64,
    ) -> io::Result<()> {
        let entry = opcode::Connect::new(Fd(fd), addr, addrlen)
            .build()
            .user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Prepare a single-shot read into an upfront buffer.
    ///
    /// # Safety
    /// The buffer at `buf`..`buf + len` must stay valid until the CQE
    /// arrives.
    pub unsafe fn push_read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        user_data: u64,
    ) -> io::Result<()> {
        let entry = opcode::Read::new(Fd(fd), buf, len).build().user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Prepare a multishot read drawing from the provided-buffer group.
    pub fn push_read_multishot(
        &mut self,
        fd: RawFd,
        buffer_group: u16,
        user_data: u64,
    ) -> io::Result<()> {
        let entry = opcode::RecvMulti::new(Fd(fd), buffer_group)
            .build()
            .user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Prepare a single-shot write.
    ///
    /// # Safety
    /// The bytes at `data`..`data + len` must stay valid until the CQE
    /// arrives.
    pub unsafe fn push_write(
        &mut self,
        fd: RawFd,
        data: *const u8,
        len: u32,
        user_data: u64,
    ) -> io::Result<()> {
        let entry = opcode::Write::new(Fd(fd), data, len)
            .build()
            .user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Prepare one cancel covering every outstanding operation on `fd`.
    pub fn push_cancel_fd(&mut self, fd: RawFd, user_data: u64) -> io::Result<()> {
        let entry = opcode::AsyncCancel2::new(CancelBuilder::fd(Fd(fd)).all())
            .build()
            .user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Submit pending SQEs and wait up to `timeout` for at least one
    /// completion.
    pub fn submit_and_wait_timeout(&self, timeout: Duration) -> SubmitOutcome {
        let result = if timeout.is_zero() {
            self.ring.submitter().submit_and_wait(1)
        } else {
            let ts = Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = SubmitArgs::new().timespec(&ts);
            self.ring.submitter().submit_with_args(1, &args)
        };

        match result {
            Ok(submitted) => SubmitOutcome::Submitted(submitted),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) => SubmitOutcome::Timeout,
                Some(libc::EINTR) => SubmitOutcome::Interrupted,
                Some(libc::EAGAIN) | Some(libc::EBUSY) => SubmitOutcome::NotReady,
                Some(errno) => SubmitOutcome::Failed(errno),
                None => SubmitOutcome::Failed(libc::EIO),
            },
        }
    }

    /// Move every completion currently in the ring into `batch`. The
    /// completion cursor advances by the number of entries consumed.
    pub fn drain_completions(&mut self, batch: &mut Vec<Completion>) {
        let cq = self.ring.completion();
        for cqe in cq {
            batch.push(Completion {
                user_data: cqe.user_data(),
                result: cqe.result(),
                flags: cqe.flags(),
            });
        }
    }

    /// Push an SQE to the submission queue.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the
    /// operation.
    unsafe fn push_sqe(&mut self, entry: io_uring::squeue::Entry) -> io::Result<()> {
        // Try to push; if the SQ is full, submit first to make room.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    metrics::SQE_SUBMIT_FAILURES.increment();
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}
