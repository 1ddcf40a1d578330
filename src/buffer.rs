// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-slot packet buffer pool (§3, §4.4).
//!
//! Every datagram the worker receives, from any upstream socket, is copied
//! into one of these 1536-byte slots exactly once; from there it is shared
//! by reference with every client's egress queue that needs to forward it.
//! A buffer is returned to the free list only when its last reference is
//! dropped.
//!
//! The teacher crate's equivalent (`core::discovery::multicast::pool::RxPool`)
//! is lock-free because its listener and FSM run on separate threads. A
//! worker here is single-threaded end to end (§5), so a plain `RefCell`
//! around a `Vec`-backed free list gives the same semantics without the
//! cross-thread machinery — there is never more than one mutable borrow of
//! the pool outstanding at a time because the reactor never re-enters
//! itself.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Size of one packet slot: one Ethernet-MTU datagram plus header scratch
/// space (§3).
pub const SLOT_SIZE: usize = 1536;

/// Number of slots added per lazy expansion (§4.4).
const GROW_CHUNK: usize = 256;

/// How many consecutive "free list over half of total" samples are needed
/// before a chunk is opportunistically released. Each sample is taken once
/// per `BufferPool::tick()`, which the reactor calls on its slow (1s)
/// timer, so this is tens of seconds as §4.4 asks for.
const SHRINK_SUSTAINED_SAMPLES: u32 = 30;

struct Slot {
    data: [u8; SLOT_SIZE],
    len: usize,
    refcount: u32,
}

impl Slot {
    fn new() -> Self {
        Slot {
            data: [0u8; SLOT_SIZE],
            len: 0,
            refcount: 0,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    max_slots: usize,
    high_water_mark: usize,
    expansions: u64,
    exhaustions: u64,
    low_utilization_streak: u32,
    initial_slots: usize,
}

/// Process-wide-per-worker packet buffer registry (§3 `BufferPool`).
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<RefCell<Inner>>,
}

/// Point-in-time counters for the status endpoint / tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
    pub high_water_mark: usize,
    pub expansions: u64,
    pub exhaustions: u64,
}

impl BufferPool {
    /// Allocate the initial chunk and set the growth ceiling
    /// (`buffer-pool-max-size`, §6.3).
    pub fn new(initial_slots: usize, max_slots: usize) -> Self {
        let initial_slots = initial_slots.min(max_slots).max(1);
        let slots: Vec<Slot> = (0..initial_slots).map(|_| Slot::new()).collect();
        let free: Vec<u32> = (0..initial_slots as u32).collect();
        BufferPool {
            inner: Rc::new(RefCell::new(Inner {
                slots,
                free,
                max_slots,
                high_water_mark: 0,
                expansions: 0,
                exhaustions: 0,
                low_utilization_streak: 0,
                initial_slots,
            })),
        }
    }

    /// Acquire a free slot, writing `data` into it. Returns `None` (an
    /// exhaustion signal, §4.4) if the pool is at capacity and no slot can
    /// be expanded into. Callers (ingress) must drop the incoming packet
    /// and count the exhaustion on `None`.
    pub fn acquire(&self, data: &[u8]) -> Option<PacketBuffer> {
        debug_assert!(data.len() <= SLOT_SIZE);
        let mut inner = self.inner.borrow_mut();
        if inner.free.is_empty() {
            if inner.slots.len() < inner.max_slots {
                let add = GROW_CHUNK.min(inner.max_slots - inner.slots.len());
                let start = inner.slots.len() as u32;
                for _ in 0..add {
                    inner.slots.push(Slot::new());
                }
                for id in start..start + add as u32 {
                    inner.free.push(id);
                }
                inner.expansions += 1;
                log::debug!(
                    "buffer pool expanded by {} slots ({} total)",
                    add,
                    inner.slots.len()
                );
            } else {
                inner.exhaustions += 1;
                log::warn!(
                    "buffer pool exhausted at {} slots (max {})",
                    inner.slots.len(),
                    inner.max_slots
                );
                return None;
            }
        }
        let id = inner.free.pop().expect("checked non-empty above");
        {
            let slot = &mut inner.slots[id as usize];
            slot.data[..data.len()].copy_from_slice(data);
            slot.len = data.len();
            slot.refcount = 1;
        }
        let used = inner.slots.len() - inner.free.len();
        if used > inner.high_water_mark {
            inner.high_water_mark = used;
        }
        drop(inner);
        Some(PacketBuffer {
            pool: self.inner.clone(),
            id,
        })
    }

    /// Snapshot of pool occupancy for the status endpoint and the
    /// `used + free = total` invariant test (§8).
    pub fn stats(&self) -> BufferPoolStats {
        let inner = self.inner.borrow();
        let total = inner.slots.len();
        let free = inner.free.len();
        BufferPoolStats {
            total,
            free,
            used: total - free,
            high_water_mark: inner.high_water_mark,
            expansions: inner.expansions,
            exhaustions: inner.exhaustions,
        }
    }

    /// Called on the reactor's slow (1s) timer. Tracks whether the free
    /// list has been over half of total for a sustained stretch and, if so
    /// and the pool has grown past its initial allocation, opportunistically
    /// releases one grow-chunk's worth of slots (§4.4).
    pub fn tick(&self) {
        let mut inner = self.inner.borrow_mut();
        let total = inner.slots.len();
        let free = inner.free.len();
        let underutilized = total > inner.initial_slots && free * 2 > total;
        if underutilized {
            inner.low_utilization_streak += 1;
        } else {
            inner.low_utilization_streak = 0;
        }
        if inner.low_utilization_streak >= SHRINK_SUSTAINED_SAMPLES {
            let shrink_by = GROW_CHUNK.min(total - inner.initial_slots);
            if shrink_by > 0 {
                // Only free slots that are actually on the free list and at
                // the tail can be dropped without relocating live buffers;
                // conservatively shrink by however many trailing slots are
                // both free and at the end of the vector.
                let mut removable = 0usize;
                while removable < shrink_by {
                    let candidate = (total - 1 - removable) as u32;
                    if inner.slots[candidate as usize].refcount != 0 {
                        break;
                    }
                    removable += 1;
                }
                if removable > 0 {
                    inner.slots.truncate(total - removable);
                    inner.free.retain(|&id| (id as usize) < inner.slots.len());
                    log::debug!(
                        "buffer pool shrank by {} slots ({} total)",
                        removable,
                        inner.slots.len()
                    );
                }
            }
            inner.low_utilization_streak = 0;
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats();
        f.debug_struct("BufferPool")
            .field("total", &s.total)
            .field("free", &s.free)
            .finish()
    }
}

/// A shared, reference-counted handle to one slot (§3 `PacketBuffer`).
///
/// Cloning increments the slot's reference count (the `retain()` operation
/// of §4.4); dropping the last clone returns the slot to the free list. A
/// slot with a nonzero count is never overwritten — `acquire()` only ever
/// hands out slots popped from the free list, which by construction have a
/// zero count.
pub struct PacketBuffer {
    pool: Rc<RefCell<Inner>>,
    id: u32,
}

impl PacketBuffer {
    /// The received bytes. Valid for the buffer's whole lifetime regardless
    /// of how many egress queues reference it.
    pub fn bytes(&self) -> std::cell::Ref<'_, [u8]> {
        std::cell::Ref::map(self.pool.borrow(), |inner| {
            let slot = &inner.slots[self.id as usize];
            &slot.data[..slot.len]
        })
    }

    pub fn len(&self) -> usize {
        self.pool.borrow().slots[self.id as usize].len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opaque identity used by the zero-copy completion reaper to match a
    /// kernel completion notification back to the descriptor it released
    /// (§4.5, §5 "the reaper matches by descriptor identity, not position").
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Clone for PacketBuffer {
    fn clone(&self) -> Self {
        self.pool.borrow_mut().slots[self.id as usize].refcount += 1;
        PacketBuffer {
            pool: self.pool.clone(),
            id: self.id,
        }
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        let mut inner = self.pool.borrow_mut();
        let slot = &mut inner.slots[self.id as usize];
        debug_assert!(slot.refcount > 0, "refcount underflow on buffer release");
        slot.refcount -= 1;
        if slot.refcount == 0 {
            slot.len = 0;
            inner.free.push(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_returns_to_free_list() {
        let pool = BufferPool::new(4, 4);
        assert_eq!(pool.stats().free, 4);
        let buf = pool.acquire(b"hello").expect("slot available");
        assert_eq!(pool.stats().used, 1);
        assert_eq!(&*buf.bytes(), b"hello");
        drop(buf);
        assert_eq!(pool.stats().free, 4);
    }

    #[test]
    fn fan_out_refcounts_match_client_count() {
        let pool = BufferPool::new(2, 2);
        let buf = pool.acquire(b"x").unwrap();
        let clones: Vec<_> = (0..5).map(|_| buf.clone()).collect();
        drop(buf);
        assert_eq!(pool.stats().used, 1, "slot still held by 5 clones");
        drop(clones);
        assert_eq!(pool.stats().used, 0);
        let s = pool.stats();
        assert_eq!(s.used + s.free, s.total);
    }

    #[test]
    fn exhaustion_at_max_returns_none_and_counts() {
        let pool = BufferPool::new(1, 1);
        let _held = pool.acquire(b"1").unwrap();
        assert!(pool.acquire(b"2").is_none());
        assert_eq!(pool.stats().exhaustions, 1);
    }

    #[test]
    fn expands_lazily_up_to_max() {
        let pool = BufferPool::new(1, 10_000);
        let mut held = Vec::new();
        for i in 0..300 {
            held.push(pool.acquire(&[i as u8]).expect("should expand"));
        }
        let s = pool.stats();
        assert!(s.total >= 300);
        assert_eq!(s.used + s.free, s.total);
    }

    #[test]
    fn used_plus_free_equals_total_invariant_holds_after_churn() {
        let pool = BufferPool::new(8, 64);
        for round in 0..50 {
            let mut bufs = Vec::new();
            for i in 0..(round % 8 + 1) {
                if let Some(b) = pool.acquire(&[i as u8]) {
                    bufs.push(b);
                }
            }
            let s = pool.stats();
            assert_eq!(s.used + s.free, s.total);
            drop(bufs);
        }
    }
}
