// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A Folly-style *eventcount* for race-free thread parking.
//!
//! The entire state is packed into a single 64-bit atomic:
//!
//! ```text
//! Bits [63:32] = epoch   (monotonic version counter)
//! Bits [31:0]  = waiters (threads in prepare-to-park state)
//! ```
//!
//! The protocol is a 2-phase commit:
//!
//! 1. [`EventCount::prepare_wait`] - increment the waiter count, snapshot the
//!    epoch.
//! 2. Re-check the sleep condition (work available? shutdown?).
//! 3. Either [`EventCount::commit_wait`] - park if the epoch is unchanged -
//!    or [`EventCount::cancel_wait`] to bail out.
//!
//! Producers call [`EventCount::notify_one`]/[`EventCount::notify_all`]
//! *after* making work available. Any epoch bump between prepare and commit
//! causes the commit to return immediately, so no wakeup can be lost.

mod loom;

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use crossbeam_utils::CachePadded;

/// Number of spin-hint iterations before the parker starts yielding.
const SPIN_LIMIT: u32 = 64;
/// Number of yield iterations before the parker commits to a kernel sleep.
const YIELD_LIMIT: u32 = 256;
/// Upper bound on a single kernel sleep. Workers use this to periodically
/// re-check termination conditions without a dedicated watchdog thread.
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

const EPOCH_SHIFT: u32 = 32;
const WAITER_MASK: u64 = 0xFFFF_FFFF;
const ONE_EPOCH: u64 = 1 << EPOCH_SHIFT;

#[inline]
#[expect(clippy::cast_possible_truncation, reason = "intentional bit split")]
fn epoch_of(state: u64) -> u32 {
    (state >> EPOCH_SHIFT) as u32
}

#[inline]
fn waiters_of(state: u64) -> u64 {
    state & WAITER_MASK
}

/// A (epoch, waiter-count) pair packed into one atomic word. See the module
/// docs for the protocol.
#[derive(Debug)]
pub struct EventCount {
    state: CachePadded<AtomicU64>,
}

// === impl EventCount ===

impl Default for EventCount {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCount {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Phase 1: register the calling thread as a waiter and return the
    /// observed epoch, to be passed to [`Self::commit_wait`].
    pub fn prepare_wait(&self) -> u32 {
        let prev = self.state.fetch_add(1, Ordering::AcqRel);
        epoch_of(prev)
    }

    /// Unregister as a waiter without sleeping.
    ///
    /// Sequentially consistent so the decrement cannot be reordered above the
    /// caller's preceding condition re-check.
    pub fn cancel_wait(&self) {
        self.state.fetch_sub(1, Ordering::SeqCst);
    }

    /// Phase 2: park the calling thread if the epoch still matches `epoch`.
    ///
    /// Returns immediately when a producer notified between prepare and
    /// commit. The park itself is tiered (spin, yield, bounded kernel sleep)
    /// and may also return spuriously; callers run in a loop that re-checks
    /// their condition anyway.
    pub fn commit_wait(&self, epoch: u32) {
        let cur = self.state.load(Ordering::Acquire);
        if epoch_of(cur) != epoch {
            // Producer notified between prepare and commit.
            self.state.fetch_sub(1, Ordering::Release);
            return;
        }

        self.park_tiered(epoch);

        self.state.fetch_sub(1, Ordering::Release);
    }

    /// Wake one parked thread by bumping the epoch.
    pub fn notify_one(&self) {
        let prev = self.state.fetch_add(ONE_EPOCH, Ordering::AcqRel);
        if waiters_of(prev) > 0 {
            self.wake(false);
        }
    }

    /// Wake all parked threads by bumping the epoch.
    pub fn notify_all(&self) {
        let prev = self.state.fetch_add(ONE_EPOCH, Ordering::AcqRel);
        if waiters_of(prev) > 0 {
            self.wake(true);
        }
    }

    /// Current number of threads in the prepare-to-park state.
    #[must_use]
    pub fn waiters(&self) -> u64 {
        waiters_of(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn epoch_changed(&self, epoch: u32) -> bool {
        epoch_of(self.state.load(Ordering::Acquire)) != epoch
    }

    /// 3-stage park: spin hints, scheduler yields, then a bounded kernel
    /// sleep keyed on the state word's address.
    #[cfg(not(loom))]
    fn park_tiered(&self, epoch: u32) {
        for _ in 0..SPIN_LIMIT {
            if self.epoch_changed(epoch) {
                return;
            }
            core::hint::spin_loop();
        }

        for _ in 0..YIELD_LIMIT {
            if self.epoch_changed(epoch) {
                return;
            }
            std::thread::yield_now();
        }

        let key = core::ptr::from_ref::<AtomicU64>(&self.state) as usize;
        let timeout = std::time::Instant::now() + PARK_TIMEOUT;
        // Safety: `key` is the address of a field we own; `validate` and the
        // other callbacks neither park nor call into parking_lot.
        unsafe {
            let _ = parking_lot_core::park(
                key,
                || !self.epoch_changed(epoch),
                || {},
                |_, _| {},
                parking_lot_core::DEFAULT_PARK_TOKEN,
                Some(timeout),
            );
        }
    }

    /// Under loom there is no real parker; model the sleep as a yield loop
    /// bounded by the producer's epoch bump.
    #[cfg(loom)]
    fn park_tiered(&self, epoch: u32) {
        while !self.epoch_changed(epoch) {
            crate::loom::thread::yield_now();
        }
    }

    #[cfg(not(loom))]
    fn wake(&self, all: bool) {
        let key = core::ptr::from_ref::<AtomicU64>(&self.state) as usize;
        // Safety: `key` is the address of a field we own; the unpark callback
        // does not call into parking_lot.
        unsafe {
            if all {
                parking_lot_core::unpark_all(key, parking_lot_core::DEFAULT_UNPARK_TOKEN);
            } else {
                parking_lot_core::unpark_one(key, |_| parking_lot_core::DEFAULT_UNPARK_TOKEN);
            }
        }
    }

    #[cfg(loom)]
    fn wake(&self, _all: bool) {
        // The epoch bump is the wake signal; parked loom threads observe it.
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn notify_between_prepare_and_commit_returns_immediately() {
        let ec = EventCount::new();
        let epoch = ec.prepare_wait();
        assert_eq!(ec.waiters(), 1);

        ec.notify_all();

        // Epoch changed, so this must not block.
        ec.commit_wait(epoch);
        assert_eq!(ec.waiters(), 0);
    }

    #[test]
    fn cancel_restores_waiter_count() {
        let ec = EventCount::new();
        let _epoch = ec.prepare_wait();
        ec.cancel_wait();
        assert_eq!(ec.waiters(), 0);
    }

    #[test]
    fn no_lost_wakeup() {
        let ec = Arc::new(EventCount::new());
        let flag = Arc::new(AtomicBool::new(false));

        let sleeper = {
            let ec = Arc::clone(&ec);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                loop {
                    let epoch = ec.prepare_wait();
                    if flag.load(Ordering::Acquire) {
                        ec.cancel_wait();
                        return;
                    }
                    ec.commit_wait(epoch);
                }
            })
        };

        flag.store(true, Ordering::Release);
        ec.notify_all();

        sleeper.join().unwrap();
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::sync::atomic::AtomicBool;
    use ::loom::sync::Arc;

    // The no-lost-wakeup property: a producer that sets the condition and
    // then notifies must always be observed by a consumer that prepared
    // before checking the condition.
    #[test]
    fn no_lost_wakeup() {
        ::loom::model(|| {
            let ec = Arc::new(EventCount::new());
            let flag = Arc::new(AtomicBool::new(false));

            let consumer = {
                let ec = Arc::clone(&ec);
                let flag = Arc::clone(&flag);
                ::loom::thread::spawn(move || {
                    loop {
                        let epoch = ec.prepare_wait();
                        if flag.load(Ordering::Acquire) {
                            ec.cancel_wait();
                            return;
                        }
                        ec.commit_wait(epoch);
                    }
                })
            };

            flag.store(true, Ordering::Release);
            ec.notify_all();

            consumer.join().unwrap();
        });
    }
}
