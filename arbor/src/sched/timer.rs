// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tick-based timers.
//!
//! A timer holds a target actor, a remaining tick count, and a message.
//! Worker 0 ticks the table once per outer scheduler iteration; firing goes
//! through the ordinary actor send path (including the blocked-receiver
//! wake), so timers never touch scheduler state directly. Timeouts in the
//! language are built from these - the core has no timeout primitive of its
//! own.

use super::{Runtime, TraceKind};
use crate::cell::{ActorId, Cell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

struct Timer {
    id: u64,
    target: ActorId,
    remaining: u32,
    message: Cell,
}

#[derive(Default)]
pub(crate) struct TimerTable {
    timers: Mutex<Vec<Timer>>,
    next: AtomicU64,
}

// === impl TimerTable ===

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn reset(&self) {
        self.timers.lock().clear();
    }
}

impl Runtime {
    /// Arm a timer delivering `message` to `target` after `ticks` scheduler
    /// ticks. Returns the timer id.
    pub fn timer_create(&self, target: ActorId, ticks: u32, message: Cell) -> u64 {
        let table = self.timers();
        let id = table.next.fetch_add(1, Ordering::Relaxed);
        table.timers.lock().push(Timer {
            id,
            target,
            remaining: ticks.max(1),
            message,
        });
        id
    }

    /// Cancel an armed timer. `false` if it already fired or never existed.
    pub fn timer_cancel(&self, id: u64) -> bool {
        let mut timers = self.timers().timers.lock();
        let before = timers.len();
        timers.retain(|t| t.id != id);
        timers.len() != before
    }

    #[must_use]
    pub fn timer_active(&self, id: u64) -> bool {
        self.timers().timers.lock().iter().any(|t| t.id == id)
    }

    /// Any timers still counting down?
    #[must_use]
    pub fn timer_any_pending(&self) -> bool {
        !self.timers().timers.lock().is_empty()
    }

    /// Advance every timer by one tick; fire the expired ones. Returns
    /// `true` when anything fired.
    pub(crate) fn timer_tick_all(&self) -> bool {
        let fired: Vec<(u64, ActorId, Cell)> = {
            let mut timers = self.timers().timers.lock();
            let mut fired = Vec::new();
            timers.retain_mut(|timer| {
                timer.remaining -= 1;
                if timer.remaining == 0 {
                    fired.push((timer.id, timer.target, timer.message.clone()));
                    false
                } else {
                    true
                }
            });
            fired
        };

        let any = !fired.is_empty();
        for (id, target, message) in fired {
            self.trace(
                TraceKind::TimerFire,
                target,
                u32::try_from(id).unwrap_or(0),
            );
            self.send(target, &message);
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use crate::eval::EvalCtx;
    use std::sync::Arc;

    fn setup() -> (Arc<Runtime>, ActorId) {
        let rt = Runtime::new(RuntimeConfig::default());
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = ctx.eval(&Cell::list([
            Cell::symbol("lambda"),
            Cell::list([Cell::symbol("self")]),
            Cell::nil(),
        ]));
        let id = rt.spawn(&ctx, behavior).actor_id().unwrap();
        (rt, id)
    }

    #[test]
    fn timer_fires_after_ticks() {
        let (rt, target) = setup();
        let id = rt.timer_create(target, 3, Cell::symbol(":ding"));
        assert!(rt.timer_active(id));

        assert!(!rt.timer_tick_all());
        assert!(!rt.timer_tick_all());
        assert!(rt.timer_tick_all());

        assert!(!rt.timer_active(id));
        assert!(!rt.timer_any_pending());
        assert_eq!(rt.receive(target), Some(Cell::symbol(":ding")));
    }

    #[test]
    fn cancel_prevents_firing() {
        let (rt, target) = setup();
        let id = rt.timer_create(target, 2, Cell::symbol(":never"));
        assert!(rt.timer_cancel(id));
        assert!(!rt.timer_cancel(id));
        rt.timer_tick_all();
        rt.timer_tick_all();
        assert_eq!(rt.receive(target), None);
    }
}
