// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Quiescent-state-based reclamation for retired actors.
//!
//! Every worker publishes the global epoch it last observed at a quiescent
//! point (the end of each quantum). A dead actor is retired into its
//! worker's ring together with the epoch at retirement, and its reference
//! is released only once every *online* worker's published epoch is
//! strictly greater - at which point no deque, runnext slot, or global
//! queue entry can still resolve to it. Parked workers go offline and do
//! not hold up grace periods. Reclaim is amortized (at most two actors per
//! call) so worst-case latency stays bounded; a full drain runs at
//! scheduler shutdown after the workers have joined.

use crate::actor::Actor;
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Per-worker retire ring capacity. Power of two.
pub(crate) const RETIRE_CAP: usize = 256;

/// Amortized reclaim budget per invocation.
const RECLAIM_BUDGET: usize = 2;

struct QsbrThread {
    /// Last observed global epoch.
    epoch: CachePadded<AtomicU64>,
    /// Cleared while the worker is parked.
    online: AtomicBool,
}

pub(crate) struct Qsbr {
    global_epoch: CachePadded<AtomicU64>,
    threads: Vec<QsbrThread>,
}

// === impl Qsbr ===

impl Qsbr {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            // Epoch 0 means "never observed".
            global_epoch: CachePadded::new(AtomicU64::new(1)),
            threads: (0..workers)
                .map(|_| QsbrThread {
                    epoch: CachePadded::new(AtomicU64::new(0)),
                    online: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    /// Worker comes online: publish the current epoch immediately so the
    /// worker does not stall grace periods it never participated in.
    pub(crate) fn online(&self, worker: usize) {
        let epoch = self.global_epoch.load(Ordering::Relaxed);
        self.threads[worker].epoch.store(epoch, Ordering::Relaxed);
        self.threads[worker].online.store(true, Ordering::Release);
    }

    pub(crate) fn offline(&self, worker: usize) {
        self.threads[worker].online.store(false, Ordering::Release);
    }

    /// Quiescent checkpoint, the hot path: one relaxed load plus one
    /// release store.
    pub(crate) fn quiescent(&self, worker: usize) {
        let epoch = self.global_epoch.load(Ordering::Relaxed);
        self.threads[worker].epoch.store(epoch, Ordering::Release);
    }

    /// Advance the global epoch (worker 0, periodically).
    pub(crate) fn advance(&self) {
        self.global_epoch.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Relaxed)
    }

    /// May entries retired at `retire_epoch` be freed? Only when every
    /// online worker has observed a strictly newer epoch.
    pub(crate) fn safe(&self, retire_epoch: u64) -> bool {
        for thread in &self.threads {
            if !thread.online.load(Ordering::Acquire) {
                continue;
            }
            if thread.epoch.load(Ordering::Acquire) <= retire_epoch {
                return false;
            }
        }
        true
    }
}

/// Per-worker ring of `(actor, retire epoch)` pairs. Single-threaded: only
/// the owning worker touches it.
pub(crate) struct RetireRing {
    entries: VecDeque<(Arc<Actor>, u64)>,
}

// === impl RetireRing ===

impl RetireRing {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(RETIRE_CAP),
        }
    }

    /// Retire a dead actor at the current epoch. A full ring force-drains
    /// its oldest entry (should not happen with amortized reclaim running
    /// every quantum).
    pub(crate) fn retire(&mut self, qsbr: &Qsbr, actor: Arc<Actor>) {
        if self.entries.len() >= RETIRE_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back((actor, qsbr.current_epoch()));
    }

    /// Drip-reclaim at most [`RECLAIM_BUDGET`] safe entries.
    pub(crate) fn reclaim_amortized(&mut self, qsbr: &Qsbr) {
        let mut freed = 0;
        while freed < RECLAIM_BUDGET {
            let Some((_, epoch)) = self.entries.front() else {
                break;
            };
            if !qsbr.safe(*epoch) {
                break;
            }
            self.entries.pop_front();
            freed += 1;
        }
    }

    /// Unconditional drain at shutdown, after workers joined.
    pub(crate) fn drain(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
