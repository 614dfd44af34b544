// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-actor mailboxes.
//!
//! A bounded Vyukov MPMC ring like [`crate::channel`], but with compact
//! slots - mailboxes are per-actor and rarely contended enough to justify a
//! cache line per slot. Delivery is FIFO per (sender, receiver) pair; there
//! is no cross-sender ordering guarantee.

use crate::cell::Cell;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

struct Slot {
    seq: AtomicU64,
    value: UnsafeCell<Option<Cell>>,
}

// Safety: `value` is only accessed by the thread that won the position CAS
// for this slot, between the sequence checks of the Vyukov protocol.
unsafe impl Sync for Slot {}

pub(crate) struct Mailbox {
    capacity: u64,
    mask: u64,
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
    /// Approximate count for the scheduler's runnable heuristic.
    count: AtomicI64,
    slots: Box<[Slot]>,
}

// === impl Mailbox ===

impl Mailbox {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                value: UnsafeCell::new(None),
            })
            .collect();
        Self {
            capacity: capacity as u64,
            mask: (capacity as u64) - 1,
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicU64::new(0)),
            count: AtomicI64::new(0),
            slots,
        }
    }

    /// Deliver a message; the mailbox owns it until received. `Err`
    /// returns the message when the ring is full.
    pub(crate) fn push(&self, message: Cell) -> Result<(), Cell> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation, reason = "masked index")]
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.cast_signed() - pos.cast_signed();

            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: the position CAS grants exclusive slot access
                    // until the sequence publish below.
                    unsafe { *slot.value.get() = Some(message) };
                    slot.seq.store(pos + 1, Ordering::Release);
                    self.count.fetch_add(1, Ordering::Release);
                    return Ok(());
                }
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return Err(message);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Take the next message; ownership transfers to the caller.
    pub(crate) fn pop(&self) -> Option<Cell> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation, reason = "masked index")]
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.cast_signed() - (pos + 1).cast_signed();

            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: the position CAS grants exclusive slot access
                    // until the sequence publish below.
                    let value = unsafe { (*slot.value.get()).take() };
                    slot.seq.store(pos + self.capacity, Ordering::Release);
                    self.count.fetch_sub(1, Ordering::Release);
                    return value;
                }
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate queue depth.
    pub(crate) fn len(&self) -> usize {
        usize::try_from(self.count.load(Ordering::Acquire).max(0)).unwrap_or(0)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_sender() {
        let mb = Mailbox::new(8);
        mb.push(Cell::int(1)).unwrap();
        mb.push(Cell::int(2)).unwrap();
        mb.push(Cell::int(3)).unwrap();
        assert_eq!(mb.pop(), Some(Cell::int(1)));
        assert_eq!(mb.pop(), Some(Cell::int(2)));
        assert_eq!(mb.pop(), Some(Cell::int(3)));
        assert_eq!(mb.pop(), None);
    }

    #[test]
    fn full_mailbox_rejects() {
        let mb = Mailbox::new(2);
        mb.push(Cell::int(1)).unwrap();
        mb.push(Cell::int(2)).unwrap();
        assert_eq!(mb.push(Cell::int(3)), Err(Cell::int(3)));
        assert_eq!(mb.len(), 2);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        use std::sync::Arc;

        let mb = Arc::new(Mailbox::new(1024));
        let mut handles = Vec::new();
        for t in 0..4i64 {
            let mb = Arc::clone(&mb);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    mb.push(Cell::int(t * 100 + i)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut got = Vec::new();
        while let Some(v) = mb.pop() {
            got.push(v.as_int().unwrap());
        }
        got.sort_unstable();
        let expected: Vec<i64> = (0..4).flat_map(|t| (0..100).map(move |i| t * 100 + i)).collect();
        assert_eq!(got, expected);
    }
}
