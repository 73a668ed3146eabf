//! Stable-address pool for request records.
//!
//! The kernel holds the address of every submitted record as `user_data`,
//! so records must never move between submission and release. Each slot
//! is an individual heap allocation owned by the pool; the free list
//! hands slots out in O(1) and reclaims them at completion time. The
//! hard capacity is what makes `QueueFull` observable.

use std::cell::UnsafeCell;
use std::ptr::NonNull;

use crate::request::{Opcode, RequestHeader, RequestSlot};

pub(crate) struct RequestPool {
    /// Owns every slot ever allocated. Growing this vector moves the
    /// boxes, not their pointees.
    slots: Vec<Box<UnsafeCell<RequestSlot>>>,
    free: Vec<NonNull<RequestSlot>>,
    capacity: usize,
}

// Safety: the pool only stores pointers to allocations it owns; the
// engine serializes all access behind a mutex.
unsafe impl Send for RequestPool {}

impl RequestPool {
    pub fn with_capacity(capacity: usize) -> Self {
        RequestPool {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Hand out a stable slot, or `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<NonNull<RequestSlot>> {
        if let Some(slot) = self.free.pop() {
            return Some(slot);
        }
        if self.slots.len() >= self.capacity {
            return None;
        }
        let slot = Box::new(UnsafeCell::new(RequestSlot {
            header: RequestHeader::new(Opcode::Accept, std::ptr::null()),
        }));
        let ptr = NonNull::new(slot.get()).expect("boxed slot is non-null");
        self.slots.push(slot);
        Some(ptr)
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, slot: NonNull<RequestSlot>) {
        debug_assert!(
            self.owns(slot),
            "released slot does not belong to this pool"
        );
        debug_assert!(
            !self.free.contains(&slot),
            "slot released twice"
        );
        self.free.push(slot);
    }

    /// Number of slots currently handed out.
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn owns(&self, slot: NonNull<RequestSlot>) -> bool {
        self.slots.iter().any(|s| s.get() == slot.as_ptr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_stay_stable_across_growth() {
        let mut pool = RequestPool::with_capacity(64);
        let first = pool.allocate().unwrap();
        let recorded = first.as_ptr() as usize;
        // Force the slot vector through several reallocations.
        let rest: Vec<_> = (0..63).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(first.as_ptr() as usize, recorded);
        assert_eq!(pool.in_flight(), 64);
        drop(rest);
    }

    #[test]
    fn released_slots_are_reused() {
        let mut pool = RequestPool::with_capacity(2);
        let a = pool.allocate().unwrap();
        pool.release(a);
        let b = pool.allocate().unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = RequestPool::with_capacity(2);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        pool.release(a);
        assert!(pool.allocate().is_some());
    }
}
