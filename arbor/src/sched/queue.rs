// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global overflow queue: a bounded Vyukov MPMC ring of actor ids.
//!
//! Used for cross-thread enqueues (per-worker deques are owner-push only)
//! and as the spill target when a deque's ring is full. The ring itself is
//! bounded; a mutex-guarded spill list behind it absorbs bursts larger
//! than every queue in the system combined (mass spawns before a run), so
//! an enqueued actor is never dropped and never blocks the enqueuer.

use crate::cell::ActorId;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring capacity. Power of two.
pub(crate) const GLOBAL_QUEUE_CAP: usize = 1024;

struct Slot {
    seq: AtomicU64,
    value: AtomicU64,
}

pub(crate) struct GlobalQueue {
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
    slots: Box<[Slot]>,
    /// Overflow-of-the-overflow; cold path only.
    spill: Mutex<VecDeque<ActorId>>,
}

// === impl GlobalQueue ===

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        let slots = (0..GLOBAL_QUEUE_CAP)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                value: AtomicU64::new(0),
            })
            .collect();
        Self {
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicU64::new(0)),
            slots,
            spill: Mutex::new(VecDeque::new()),
        }
    }

    /// Non-blocking push; `false` when full.
    pub(crate) fn push(&self, id: ActorId) -> bool {
        let mask = (GLOBAL_QUEUE_CAP as u64) - 1;
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation, reason = "masked index")]
            let slot = &self.slots[(pos & mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.cast_signed() - pos.cast_signed();
            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.value.store(id, Ordering::Relaxed);
                    slot.seq.store(pos + 1, Ordering::Release);
                    return true;
                }
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Push that never drops and never blocks: a full ring sends the id to
    /// the spill list.
    pub(crate) fn push_retrying(&self, id: ActorId) {
        if !self.push(id) {
            self.spill.lock().push_back(id);
        }
    }

    pub(crate) fn pop(&self) -> Option<ActorId> {
        if let Some(id) = self.pop_ring() {
            return Some(id);
        }
        self.spill.lock().pop_front()
    }

    fn pop_ring(&self) -> Option<ActorId> {
        let mask = (GLOBAL_QUEUE_CAP as u64) - 1;
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation, reason = "masked index")]
            let slot = &self.slots[(pos & mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.cast_signed() - (pos + 1).cast_signed();
            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let id = slot.value.load(Ordering::Relaxed);
                    slot.seq
                        .store(pos + GLOBAL_QUEUE_CAP as u64, Ordering::Release);
                    return Some(id);
                }
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        let head = self.enqueue_pos.load(Ordering::Relaxed);
        let tail = self.dequeue_pos.load(Ordering::Relaxed);
        usize::try_from(head.saturating_sub(tail)).unwrap_or(0) + self.spill.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
