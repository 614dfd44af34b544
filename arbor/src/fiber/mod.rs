// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Suspendable fibers.
//!
//! A fiber is a stackful coroutine evaluating one expression to completion.
//! It is the *only* suspension mechanism in the runtime: the evaluator
//! yields out of its fiber when a reduction budget expires, and the
//! suspension primitives (mailbox receive, channel operations, select,
//! task await) yield with a typed [`SuspendReason`] that tells the
//! scheduler what would make the fiber runnable again.
//!
//! The coroutine is created lazily on the first quantum so that spawned but
//! never-run actors cost no stack. A finished fiber is never reused; its
//! stack returns to the worker's pool.

mod stack;

pub(crate) use stack::{PooledStack, StackPool};

use crate::cell::{ActorId, Cell, ChannelId};
use crate::eval::{EvalCtx, eval_in};
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Fiber lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    Ready = 0,
    Running = 1,
    Suspended = 2,
    Finished = 3,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Suspended,
            _ => Self::Finished,
        }
    }
}

/// Why a fiber yielded, with the payload the scheduler needs to decide when
/// and how to resume it.
#[derive(Debug, Clone)]
pub enum SuspendReason {
    /// Waiting for an explicit resume.
    General,
    /// Mailbox receive found the mailbox empty.
    Mailbox,
    /// Channel receive found the channel empty.
    ChanRecv { chan: ChannelId },
    /// Channel send found the channel full; the pending value stays owned
    /// by the fiber until delivered or abandoned.
    ChanSend { chan: ChannelId, value: Cell },
    /// Waiting on several channels at once.
    Select { chans: Vec<ChannelId> },
    /// Waiting for another actor to finish.
    TaskAwait { actor: ActorId },
    /// Reduction budget expired or a polite yield; immediately runnable.
    ReductionYield,
}

/// Suspension record: the reason plus the select round-robin cursor.
#[derive(Debug)]
pub(crate) struct Suspension {
    pub reason: SuspendReason,
    pub select_round: usize,
}

type FiberCoroutine = Coroutine<Cell, (), Cell, PooledStack>;

/// The coroutine handle, made sendable so fibers can migrate between
/// workers between quanta.
struct SendCoroutine(FiberCoroutine);

// Safety: everything a fiber body holds across a suspension point is Send
// (cells, Arcs, plain integers - the evaluator state), and the scheduler
// resumes a fiber from at most one thread at a time (the coroutine sits
// behind `Fiber::core`, and an actor is never in two run queues at once).
unsafe impl Send for SendCoroutine {}

enum FiberCore {
    /// Created but never run; the coroutine (and its stack) do not exist
    /// yet.
    Unstarted {
        ctx: Box<EvalCtx>,
        body: Cell,
        env: Cell,
    },
    Started(SendCoroutine),
    Done,
}

/// State shared between the scheduler, wake-side code, and the code running
/// *inside* the coroutine. Kept in its own `Arc` so the coroutine closure
/// can hold it without creating a cycle through the owning actor.
pub(crate) struct FiberShared {
    state: AtomicU8,
    suspension: Mutex<Suspension>,
    /// `(expr, env)` parked by the evaluator on a reduction yield.
    saved: Mutex<Option<(Cell, Cell)>>,
    result: Mutex<Option<Cell>>,
    /// Address of the live `Yielder` while the body runs; 0 otherwise.
    yielder: AtomicUsize,
}

/// Outcome of granting a fiber one quantum.
pub(crate) enum FiberRun {
    Finished(Cell),
    Yielded,
}

/// Exclusive claim on a fiber's coroutine for one quantum. Holding it
/// keeps every other worker out (double-enqueue race), so the resume value
/// can be prepared without risk of feeding it to nobody.
pub(crate) struct FiberClaim<'fiber> {
    core: parking_lot::MutexGuard<'fiber, FiberCore>,
}

/// A suspendable coroutine owning (lazily) a native stack.
pub struct Fiber {
    shared: Arc<FiberShared>,
    core: Mutex<FiberCore>,
}

// === impl Fiber ===

impl Fiber {
    /// A fiber that will evaluate `body` in `env` using `ctx`. The stack
    /// and coroutine are created lazily on the first quantum; granting
    /// quanta is the scheduler's job.
    #[must_use]
    pub fn new(ctx: EvalCtx, body: Cell, env: Cell) -> Self {
        Self {
            shared: Arc::new(FiberShared {
                state: AtomicU8::new(FiberState::Ready as u8),
                suspension: Mutex::new(Suspension {
                    reason: SuspendReason::General,
                    select_round: 0,
                }),
                saved: Mutex::new(None),
                result: Mutex::new(None),
                yielder: AtomicUsize::new(0),
            }),
            core: Mutex::new(FiberCore::Unstarted {
                ctx: Box::new(ctx),
                body,
                env,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    /// Final result, once finished.
    #[must_use]
    pub fn result(&self) -> Option<Cell> {
        self.shared.result.lock().clone()
    }

    pub(crate) fn suspension(&self) -> &Mutex<Suspension> {
        &self.shared.suspension
    }

    /// Snapshot of the current suspend reason.
    pub(crate) fn reason(&self) -> SuspendReason {
        self.shared.suspension.lock().reason.clone()
    }

    pub(crate) fn set_reason(&self, reason: SuspendReason) {
        self.shared.suspension.lock().reason = reason;
    }

    /// Park the evaluator's `(expr, env)` ahead of a reduction yield.
    pub(crate) fn save_continuation(&self, expr: Cell, env: Cell) {
        *self.shared.saved.lock() = Some((expr, env));
    }

    pub(crate) fn take_continuation(&self) -> Option<(Cell, Cell)> {
        self.shared.saved.lock().take()
    }

    /// Yield out of the fiber from code running inside it. Records the
    /// reason, switches back to the scheduler, and returns the value the
    /// scheduler resumes us with.
    ///
    /// # Panics
    ///
    /// Panics if called from outside the fiber's own body.
    pub(crate) fn suspend(&self, reason: SuspendReason) -> Cell {
        self.set_reason(reason);
        let raw = self.shared.yielder.load(Ordering::Acquire);
        assert_ne!(raw, 0, "suspend called outside a running fiber");
        let yielder = raw as *const Yielder<Cell, ()>;
        // Safety: a non-zero slot means we are executing inside the
        // coroutine that owns this yielder; the yielder lives on the
        // coroutine's own stack for the whole execution of its body.
        unsafe { (*yielder).suspend(()) }
    }

    /// Try to claim the fiber for one quantum. `None` means another worker
    /// is currently inside the coroutine and this caller should drop its
    /// queue entry.
    pub(crate) fn claim(&self) -> Option<FiberClaim<'_>> {
        self.core.try_lock().map(|core| FiberClaim { core })
    }

    /// Grant the claimed fiber one quantum: create the coroutine on first
    /// use, then start or resume it with `resume` as the resume value.
    pub(crate) fn run(
        &self,
        claim: &mut FiberClaim<'_>,
        pool: &Arc<StackPool>,
        resume: Cell,
    ) -> io::Result<FiberRun> {
        let core = &mut *claim.core;

        if matches!(core, FiberCore::Unstarted { .. }) {
            let stack = pool.take()?;
            let FiberCore::Unstarted { ctx, body, env } =
                std::mem::replace(core, FiberCore::Done)
            else {
                unreachable!()
            };
            let shared = Arc::clone(&self.shared);
            let coroutine = Coroutine::with_stack(stack, move |yielder, _first: Cell| {
                shared.yielder.store(
                    std::ptr::from_ref::<Yielder<Cell, ()>>(yielder) as usize,
                    Ordering::Release,
                );
                let mut ctx = *ctx;
                ctx.refill_reductions();
                let result = eval_in(&mut ctx, &env, &body);
                shared.yielder.store(0, Ordering::Release);
                result
            });
            *core = FiberCore::Started(SendCoroutine(coroutine));
        }

        let outcome = match core {
            FiberCore::Started(co) => {
                self.set_state(FiberState::Running);
                co.0.resume(resume)
            }
            FiberCore::Done => {
                return Ok(FiberRun::Finished(
                    self.result().unwrap_or_else(Cell::nil),
                ));
            }
            FiberCore::Unstarted { .. } => unreachable!("replaced above"),
        };

        match outcome {
            CoroutineResult::Yield(()) => {
                self.set_state(FiberState::Suspended);
                Ok(FiberRun::Yielded)
            }
            CoroutineResult::Return(value) => {
                *self.shared.result.lock() = Some(value.clone());
                self.set_state(FiberState::Finished);
                // Tear the coroutine down; its stack returns to the pool.
                *core = FiberCore::Done;
                Ok(FiberRun::Finished(value))
            }
        }
    }
}
