// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A block-partitioned work-stealing deque ("BWoS").
//!
//! The deque is a ring of [`BLOCKS`] blocks of [`BLOCK_ENTRIES`] entries
//! each. The owner and thieves operate on *different* blocks, which keeps
//! sequentially-consistent operations off the owner's fast path entirely.
//!
//! Four monotonic cursors are tracked: `owner_block` and `thief_block` are
//! epochs (masked to index the ring); per block, `head`/`tail` are the
//! owner-side positions while `steal_tail`/`steal_head` are the thief-side
//! reservation and commit cursors. `steal_tail == SENTINEL` marks a block as
//! owner-active and therefore not stealable through the granted-block path.
//!
//! Items are plain `u64` identifiers. Slots are atomics, so a protocol
//! violation (two concurrent owners) is a logic error but never undefined
//! behavior. The owner-side operations ([`Deque::push`], [`Deque::pop`])
//! must only ever be invoked by one thread at a time; [`Deque::steal`] and
//! [`Deque::len`] are safe from any thread.

mod loom;

use crate::loom::hint::spin_loop;
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// Entries per block.
pub const BLOCK_ENTRIES: usize = 32;
/// Blocks in the ring. Must be a power of two.
pub const BLOCKS: usize = 8;

const BLOCK_MASK: u64 = (BLOCKS as u64) - 1;
/// `steal_tail` sentinel: "owner-active, not stealable".
const SENTINEL: u64 = BLOCK_ENTRIES as u64;

struct Block {
    /// Owner read position.
    head: CachePadded<AtomicU64>,
    /// Owner write position.
    tail: CachePadded<AtomicU64>,
    /// Thief reservation cursor (advanced by CAS).
    steal_tail: CachePadded<AtomicU64>,
    /// Thief commit counter (advanced by fetch-add).
    steal_head: CachePadded<AtomicU64>,
    entries: [AtomicU64; BLOCK_ENTRIES],
}

impl Block {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            steal_tail: CachePadded::new(AtomicU64::new(SENTINEL)),
            steal_head: CachePadded::new(AtomicU64::new(0)),
            entries: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// The block-partitioned work-stealing deque. LIFO for the owner, FIFO for
/// thieves.
pub struct Deque {
    /// Monotonic owner epoch (`& BLOCK_MASK` for the ring index).
    owner_block: CachePadded<AtomicU64>,
    /// Monotonic thief epoch (`& BLOCK_MASK` for the ring index).
    thief_block: CachePadded<AtomicU64>,
    blocks: Box<[Block]>,
}

// === impl Deque ===

impl Default for Deque {
    fn default() -> Self {
        Self::new()
    }
}

impl Deque {
    #[must_use]
    pub fn new() -> Self {
        let blocks: Box<[Block]> = (0..BLOCKS).map(|_| Block::new()).collect();
        // Owner starts at block 1, thieves at block 0. Block 0 is the initial
        // thief block (empty, nothing to steal); block 1 is where the owner
        // pushes first.
        Self {
            owner_block: CachePadded::new(AtomicU64::new(1)),
            thief_block: CachePadded::new(AtomicU64::new(0)),
            blocks,
        }
    }

    /// Reset all cursors. Only sound while no other thread accesses the
    /// deque (e.g. between scheduler runs, after workers joined).
    pub fn reset(&self) {
        for block in &self.blocks {
            block.head.store(0, Ordering::Relaxed);
            block.tail.store(0, Ordering::Relaxed);
            block.steal_tail.store(SENTINEL, Ordering::Relaxed);
            block.steal_head.store(0, Ordering::Relaxed);
        }
        self.owner_block.store(1, Ordering::Relaxed);
        self.thief_block.store(0, Ordering::Relaxed);
    }

    fn block(&self, epoch: u64) -> &Block {
        #[allow(clippy::cast_possible_truncation, reason = "masked to BLOCKS")]
        &self.blocks[(epoch & BLOCK_MASK) as usize]
    }

    /// Owner-side push. Returns `Err(item)` when every block is in use, in
    /// which case the caller overflows to its shared queue.
    pub fn push(&self, item: u64) -> Result<(), u64> {
        loop {
            let ob = self.owner_block.load(Ordering::Relaxed);
            let blk = self.block(ob);
            let t = blk.tail.load(Ordering::Relaxed);

            if t < SENTINEL {
                // Fast path: space in the current block. Plain store, then
                // release-publish via tail.
                #[allow(clippy::cast_possible_truncation, reason = "t < BLOCK_ENTRIES")]
                blk.entries[t as usize].store(item, Ordering::Relaxed);
                blk.tail.store(t + 1, Ordering::Release);
                return Ok(());
            }

            // Block full: advance to the next block.
            let next_epoch = ob + 1;
            let tb = self.thief_block.load(Ordering::Acquire);
            if next_epoch - tb >= BLOCKS as u64 {
                // Ring full.
                return Err(item);
            }

            let next = self.block(next_epoch);

            // Grant the current block to thieves: expose the remaining items
            // from the current head. head may be non-zero if a fallback
            // thief already stole from this block while it was owner-active.
            let old_tail = blk.tail.load(Ordering::Relaxed);
            let cur_head = blk.head.load(Ordering::Relaxed);
            blk.head.store(old_tail, Ordering::Relaxed);
            blk.steal_tail.store(cur_head, Ordering::Release);

            // Reclaim the next block: wait for any in-flight steals on the
            // about-to-be-overwritten block to commit.
            let st = next.steal_tail.load(Ordering::Acquire);
            if st != SENTINEL {
                // Granted before; expected commits equal the tail value it
                // had when it was granted.
                let expected = next.tail.load(Ordering::Relaxed);
                while next.steal_head.load(Ordering::Acquire) < expected {
                    spin_loop();
                }
            }

            next.head.store(0, Ordering::Relaxed);
            next.tail.store(0, Ordering::Relaxed);
            next.steal_head.store(0, Ordering::Relaxed);
            next.steal_tail.store(SENTINEL, Ordering::Relaxed);

            self.owner_block.store(next_epoch, Ordering::Relaxed);
            // Loop back to push into the fresh block.
        }
    }

    /// Owner-side pop (LIFO).
    pub fn pop(&self) -> Option<u64> {
        loop {
            let ob = self.owner_block.load(Ordering::Relaxed);
            let blk = self.block(ob);
            let t = blk.tail.load(Ordering::Relaxed);
            let h = blk.head.load(Ordering::Acquire);

            if t > h + 1 {
                // Multiple items: owner and any fallback thief touch
                // different entries.
                #[allow(clippy::cast_possible_truncation, reason = "t <= BLOCK_ENTRIES")]
                let item = blk.entries[(t - 1) as usize].load(Ordering::Relaxed);
                blk.tail.store(t - 1, Ordering::Release);
                return Some(item);
            }
            if t == h + 1 {
                // Last item: both the owner and a fallback thief want
                // entry[h]. Both race on a seq-cst CAS of head; the winner
                // takes the item. Publishing tail = h first makes the block
                // look empty to late thieves.
                blk.tail.store(h, Ordering::SeqCst);
                let won = blk
                    .head
                    .compare_exchange(h, h + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
                if won {
                    #[allow(clippy::cast_possible_truncation, reason = "h < BLOCK_ENTRIES")]
                    let item = blk.entries[h as usize].load(Ordering::Relaxed);
                    blk.head.store(0, Ordering::Release);
                    blk.tail.store(0, Ordering::Release);
                    return Some(item);
                }
                // Thief won; reset the block and fall through to retreat.
                blk.head.store(0, Ordering::Release);
                blk.tail.store(0, Ordering::Release);
            }

            // Current block empty from the owner side: retreat one epoch.
            let tb = self.thief_block.load(Ordering::Acquire);
            if ob <= tb {
                return None;
            }

            let prev_epoch = ob - 1;
            let prev = self.block(prev_epoch);

            // Takeover: atomically reclaim the previous block from thieves.
            // The exchange returns how far their reservations got.
            let steal_pos = prev.steal_tail.swap(SENTINEL, Ordering::Acquire);

            if steal_pos == SENTINEL {
                // Not granted or already reclaimed; keep retreating.
                self.owner_block.store(prev_epoch, Ordering::Relaxed);
                continue;
            }

            let prev_tail = prev.tail.load(Ordering::Relaxed);
            if steal_pos < prev_tail {
                // Items remain: thieves reserved [0..steal_pos), the owner
                // takes [steal_pos..tail). Wait for in-flight steals first.
                while prev.steal_head.load(Ordering::Acquire) < steal_pos {
                    spin_loop();
                }
                prev.head.store(steal_pos, Ordering::Relaxed);
                prev.steal_head.store(0, Ordering::Relaxed);
                self.owner_block.store(prev_epoch, Ordering::Relaxed);
                continue;
            }

            // Block fully stolen; wait for the steals to commit and keep
            // retreating.
            while prev.steal_head.load(Ordering::Acquire) < steal_pos {
                spin_loop();
            }
            prev.steal_head.store(0, Ordering::Relaxed);
            self.owner_block.store(prev_epoch, Ordering::Relaxed);

            // Advance thief_block past the fully-drained block.
            let _ = self.thief_block.compare_exchange(
                tb,
                prev_epoch + 1,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
    }

    /// Thief-side steal (FIFO). Safe from any thread.
    pub fn steal(&self) -> Option<u64> {
        let tb = self.thief_block.load(Ordering::Acquire);
        let ob = self.owner_block.load(Ordering::Relaxed);

        // Scan granted blocks from thief_block up to (but not including) the
        // owner's block.
        let mut epoch = tb;
        while epoch < ob {
            let blk = self.block(epoch);
            let st = blk.steal_tail.load(Ordering::Acquire);

            if st != SENTINEL {
                let blk_tail = blk.tail.load(Ordering::Relaxed);
                if st < blk_tail {
                    // Reserve one entry, then commit via steal_head so the
                    // owner's reclaim spin can account for us.
                    if blk
                        .steal_tail
                        .compare_exchange(st, st + 1, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        #[allow(clippy::cast_possible_truncation, reason = "st < BLOCK_ENTRIES")]
                        let item = blk.entries[st as usize].load(Ordering::Relaxed);
                        blk.steal_head.fetch_add(1, Ordering::Release);

                        if st + 1 >= blk_tail {
                            let _ = self.thief_block.compare_exchange(
                                tb,
                                epoch + 1,
                                Ordering::Release,
                                Ordering::Relaxed,
                            );
                        }

                        return Some(item);
                    }
                    // Another thief got there; scan forward rather than
                    // retrying the same block.
                }
            }
            epoch += 1;
        }

        // Fallback: steal from the owner's active block. The owner pops LIFO
        // (tail down), we steal FIFO (head up via CAS). Safe when more than
        // one item separates them; the single-item race is resolved by the
        // owner's seq-cst pop CAS.
        let oblk = self.block(ob);
        let st = oblk.steal_tail.load(Ordering::Acquire);
        if st != SENTINEL {
            // Granted in the meantime; handled by the scan above next call.
            return None;
        }

        let h = oblk.head.load(Ordering::Acquire);
        let t = oblk.tail.load(Ordering::Acquire);
        if h >= t {
            return None;
        }

        if oblk
            .head
            .compare_exchange(h, h + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            #[allow(clippy::cast_possible_truncation, reason = "h < BLOCK_ENTRIES")]
            let item = oblk.entries[h as usize].load(Ordering::Relaxed);

            // The owner may have granted this block between our sentinel
            // check and the CAS. If so it is now tracking steals through
            // steal_head, and we must commit ours or its reclaim spin-wait
            // would hang waiting for a commit that never comes.
            let st2 = oblk.steal_tail.load(Ordering::Acquire);
            if st2 != SENTINEL {
                oblk.steal_head.fetch_add(1, Ordering::Release);
            }

            return Some(item);
        }

        None
    }

    /// Approximate number of queued items. Exact only when quiescent.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut total: i64 = 0;
        let ob = self.owner_block.load(Ordering::Relaxed);
        let tb = self.thief_block.load(Ordering::Relaxed);

        let oblk = self.block(ob);
        let ot = oblk.tail.load(Ordering::Relaxed);
        let oh = oblk.head.load(Ordering::Relaxed);
        total += ot.wrapping_sub(oh).cast_signed();

        let mut epoch = tb;
        while epoch < ob {
            let blk = self.block(epoch);
            let st = blk.steal_tail.load(Ordering::Relaxed);
            let bt = blk.tail.load(Ordering::Relaxed);
            if st != SENTINEL && st < bt {
                total += (bt - st).cast_signed();
            }
            epoch += 1;
        }

        usize::try_from(total.max(0)).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let dq = Deque::new();
        for i in 1..=10 {
            dq.push(i).unwrap();
        }
        assert_eq!(dq.len(), 10);
        for i in (1..=10).rev() {
            assert_eq!(dq.pop(), Some(i));
        }
        assert_eq!(dq.pop(), None);
    }

    #[test]
    fn push_across_blocks() {
        let dq = Deque::new();
        // Fill more than one block so the owner has to grant and advance.
        let n = (BLOCK_ENTRIES * 3) as u64;
        for i in 1..=n {
            dq.push(i).unwrap();
        }
        assert_eq!(dq.len() as u64, n);
        let mut popped = 0;
        while dq.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, n);
    }

    #[test]
    fn ring_full_overflows() {
        let dq = Deque::new();
        let mut accepted = 0u64;
        loop {
            match dq.push(accepted + 1) {
                Ok(()) => accepted += 1,
                Err(v) => {
                    assert_eq!(v, accepted + 1);
                    break;
                }
            }
        }
        // All but the initial thief block are usable.
        assert!(accepted >= ((BLOCKS - 1) * BLOCK_ENTRIES) as u64);
    }

    #[test]
    fn steal_fifo_order() {
        let dq = Deque::new();
        // Two full blocks; the first granted block is stealable in FIFO
        // order once the owner moves on.
        let n = (BLOCK_ENTRIES * 2) as u64;
        for i in 1..=n {
            dq.push(i).unwrap();
        }
        // The granted (older) block holds 1..=BLOCK_ENTRIES.
        assert_eq!(dq.steal(), Some(1));
        assert_eq!(dq.steal(), Some(2));
    }

    #[test]
    fn steal_from_owner_active_block() {
        let dq = Deque::new();
        dq.push(7).unwrap();
        dq.push(8).unwrap();
        // Nothing granted yet; the fallback path steals the oldest entry.
        assert_eq!(dq.steal(), Some(7));
        assert_eq!(dq.pop(), Some(8));
        assert_eq!(dq.pop(), None);
    }

    #[test]
    fn concurrent_steal_no_dup_no_loss() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::mpsc;

        let dq = Arc::new(Deque::new());
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<u64>();

        let mut thieves = Vec::new();
        for _ in 0..3 {
            let dq = Arc::clone(&dq);
            let done = Arc::clone(&done);
            let tx = tx.clone();
            thieves.push(std::thread::spawn(move || {
                loop {
                    if let Some(v) = dq.steal() {
                        tx.send(v).unwrap();
                    } else if done.load(Ordering::Acquire) {
                        break;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            }));
        }
        drop(tx);

        const N: u64 = 10_000;
        let mut owner_got = Vec::new();
        let mut next = 1u64;
        while next <= N {
            if dq.push(next).is_ok() {
                next += 1;
            } else {
                // Ring full: drain a little like the scheduler would.
                if let Some(v) = dq.pop() {
                    owner_got.push(v);
                }
            }
            // Interleave some owner pops.
            if next % 64 == 0
                && let Some(v) = dq.pop()
            {
                owner_got.push(v);
            }
        }
        while let Some(v) = dq.pop() {
            owner_got.push(v);
        }
        done.store(true, Ordering::Release);
        for t in thieves {
            t.join().unwrap();
        }
        // Drain whatever thieves left unsent in flight.
        while let Some(v) = dq.pop() {
            owner_got.push(v);
        }

        let mut seen = HashSet::new();
        for v in owner_got {
            assert!(seen.insert(v), "duplicate item {v}");
        }
        for v in rx {
            assert!(seen.insert(v), "duplicate stolen item {v}");
        }
        assert_eq!(seen.len() as u64, N, "lost items");
    }
}
