//! Kernel-registered provided-buffer ring for multishot reads.
//!
//! The kernel picks a buffer from this ring at completion time and
//! reports its id in the CQE flags. After the application's read handler
//! returns, the buffer is re-added and the ring tail advanced so the
//! kernel may hand it out again.

use std::io;
use std::ptr;
use std::sync::atomic::{self, AtomicU16};

use io_uring::cqueue;

use crate::error::Error;
use crate::metrics;

/// An io_uring buf_ring entry (matches kernel struct io_uring_buf).
#[repr(C)]
struct BufRingEntry {
    addr: u64,
    len: u32,
    bid: u16,
    resv: u16,
}

pub(crate) struct BufferRing {
    /// Pointer to the mmap'd ring (shared with kernel).
    ring_ptr: *mut u8,
    /// Size of the mmap'd ring region.
    ring_mmap_len: usize,
    /// Backing memory for all buffers.
    backing: Vec<u8>,
    /// Buffer group ID.
    bgid: u16,
    /// Number of buffers (power of 2).
    entries: u16,
    /// Size of each buffer.
    buf_size: u32,
    /// Current tail index (we write, kernel reads).
    tail: u16,
    /// Mask for ring index wrapping.
    mask: u16,
}

impl BufferRing {
    const ENTRY_SIZE: usize = std::mem::size_of::<BufRingEntry>();

    /// Allocate the ring area and backing buffers, and pre-fill the ring
    /// with every buffer. Registration with the kernel happens
    /// separately via [`register`](Self::register).
    pub fn new(bgid: u16, entries: u16, buf_size: u32) -> Result<Self, Error> {
        if entries == 0 || !entries.is_power_of_two() {
            return Err(Error::BufferRegistration(
                "the number of entries must be a power of two".into(),
            ));
        }

        let ring_mmap_len = entries as usize * Self::ENTRY_SIZE;
        let backing = vec![0u8; entries as usize * buf_size as usize];

        // mmap anonymous memory for the ring (page-aligned, shared with kernel)
        let ring_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                ring_mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if ring_ptr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let mut ring = BufferRing {
            ring_ptr: ring_ptr as *mut u8,
            ring_mmap_len,
            backing,
            bgid,
            entries,
            buf_size,
            tail: 0,
            mask: entries - 1,
        };

        for bid in 0..entries {
            ring.push_entry(bid);
        }
        ring.commit_tail();

        Ok(ring)
    }

    /// Register the ring with the kernel.
    pub fn register(&self, submitter: &io_uring::Submitter<'_>) -> Result<(), Error> {
        // Safety: ring_ptr points to mmap'd memory that outlives the
        // registration (freed only in Drop, after the ring itself).
        unsafe {
            submitter
                .register_buf_ring(self.ring_ptr as u64, self.entries, self.bgid)
                .map_err(|e| Error::BufferRegistration(e.to_string()))?;
        }
        Ok(())
    }

    pub fn bgid(&self) -> u16 {
        self.bgid
    }

    pub fn entries(&self) -> u16 {
        self.entries
    }

    /// Resolve a completion's buffer id to the buffer's first `len`
    /// bytes. Fails when the completion did not carry a buffer flag or
    /// the id is out of range.
    pub fn get(&mut self, cqe_flags: u32, len: usize) -> Result<&mut [u8], Error> {
        let bid = cqueue::buffer_select(cqe_flags).ok_or(Error::InvalidBuffer)?;
        if bid >= self.entries {
            return Err(Error::InvalidBuffer);
        }
        let len = len.min(self.buf_size as usize);
        let offset = bid as usize * self.buf_size as usize;
        Ok(&mut self.backing[offset..offset + len])
    }

    /// Re-add the buffer referenced by the completion and advance the
    /// ring tail by one so the kernel may hand it out again.
    pub fn release(&mut self, cqe_flags: u32) {
        let Some(bid) = cqueue::buffer_select(cqe_flags) else {
            return;
        };
        if bid >= self.entries {
            return;
        }
        self.push_entry(bid);
        self.commit_tail();
        metrics::BUFFERS_RECYCLED.increment();
    }

    fn push_entry(&mut self, bid: u16) {
        let ring_idx = (self.tail & self.mask) as usize;
        let entry_ptr = unsafe {
            self.ring_ptr
                .add(ring_idx * Self::ENTRY_SIZE)
                .cast::<BufRingEntry>()
        };
        let buf_offset = bid as usize * self.buf_size as usize;
        let buf_addr = unsafe { self.backing.as_ptr().add(buf_offset) };
        unsafe {
            ptr::write(
                entry_ptr,
                BufRingEntry {
                    addr: buf_addr as u64,
                    len: self.buf_size,
                    bid,
                    resv: 0,
                },
            );
        }
        self.tail = self.tail.wrapping_add(1);
    }

    fn commit_tail(&self) {
        // The tail lives at offset 14 within the ring header. The kernel
        // overlays the header with bufs[0]: struct io_uring_buf_ring {
        //   union { struct { u64 resv1; u32 resv2; u16 resv3; u16 tail; };
        //           struct io_uring_buf bufs[0]; }; };
        // io_uring_buf: { u64 addr(0); u32 len(8); u16 bid(12); u16 resv(14) }
        let tail_ptr = unsafe { self.ring_ptr.add(14).cast::<AtomicU16>() };
        unsafe {
            (*tail_ptr).store(self.tail, atomic::Ordering::Release);
        }
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        if !self.ring_ptr.is_null() {
            unsafe {
                libc::munmap(self.ring_ptr as *mut _, self.ring_mmap_len);
            }
        }
    }
}

// Safety: the ring is only touched from the event-loop thread; the
// engine mutex serializes any other access.
unsafe impl Send for BufferRing {}

#[cfg(test)]
mod tests {
    use super::*;

    // CQE flag layout is kernel ABI: bit 0 is IORING_CQE_F_BUFFER, the
    // buffer id sits above IORING_CQE_BUFFER_SHIFT (16).
    fn flags_for(bid: u16) -> u32 {
        ((bid as u32) << 16) | 1
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(BufferRing::new(1, 100, 1024).is_err());
        assert!(BufferRing::new(1, 0, 1024).is_err());
    }

    #[test]
    fn get_requires_buffer_flag() {
        let mut ring = BufferRing::new(1, 4, 64).unwrap();
        assert!(ring.get(0, 10).is_err());
    }

    #[test]
    fn get_rejects_out_of_range_id() {
        let mut ring = BufferRing::new(1, 4, 64).unwrap();
        assert!(ring.get(flags_for(4), 10).is_err());
        assert!(ring.get(flags_for(3), 10).is_ok());
    }

    #[test]
    fn get_spans_exactly_len_bytes() {
        let mut ring = BufferRing::new(1, 4, 64).unwrap();
        let span = ring.get(flags_for(2), 13).unwrap();
        assert_eq!(span.len(), 13);
        span.fill(0xAB);
        assert_eq!(ring.get(flags_for(2), 13).unwrap()[12], 0xAB);
    }

    #[test]
    fn release_cycles_through_every_id() {
        let mut ring = BufferRing::new(7, 4, 32).unwrap();
        let initial_tail = ring.tail;
        for round in 0..3 {
            for bid in 0..4u16 {
                ring.release(flags_for(bid));
            }
            assert_eq!(ring.tail, initial_tail.wrapping_add((round + 1) * 4));
        }
    }
}
