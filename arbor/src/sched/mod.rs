// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing scheduler.
//!
//! Each worker runs the same loop: LIFO slot (bounded to three consecutive
//! uses to stay cache-warm without starving the deque), own deque, global
//! overflow queue, then a steal-half pass against a random victim. When
//! nothing turns up the worker idles through a spin/yield stage into the
//! eventcount's two-phase park, re-checking every work source and the
//! termination condition between prepare and commit - the epoch bump of any
//! intervening notify makes the commit return immediately, so no wakeup is
//! ever lost.
//!
//! A runnable actor gets one reduction quantum. On finish the actor is
//! retired through QSBR; on a blocking suspension the wake side (sender,
//! channel peer, timer, signal, awaited actor) owns the re-enqueue via the
//! wait-flag CAS; on a reduction yield the actor re-enqueues locally.
//!
//! Worker 0 is the caller's thread: it additionally ticks timers, drains
//! the signal bridge, advances the QSBR epoch, and detects termination
//! (no alive actors, nothing running, all queues empty).

pub(crate) mod qsbr;
pub(crate) mod queue;
pub mod signal;
mod timer;
pub mod trace;

pub use trace::{TraceEvent, TraceKind};

use crate::actor::registry::{ActorRegistry, EtsRegistry, NameRegistry, SupervisorRegistry};
use crate::actor::Actor;
use crate::cell::{ActorId, Cell};
use crate::channel::{ChannelRegistry, Direction};
use crate::config::{MAX_SCHEDULERS, RuntimeConfig};
use crate::fiber::{FiberRun, FiberState, StackPool, SuspendReason};
use crate::macros::MacroRegistry;
use crossbeam_utils::CachePadded;
use eventcount::EventCount;
use parking_lot::Mutex;
use qsbr::{Qsbr, RetireRing};
use queue::GlobalQueue;
use signal::SignalBridge;
use std::cell::{Cell as TlsCell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use timer::TimerTable;
use trace::TraceRing;

/// Maximum consecutive runnext grants before the deque gets a turn.
const RUNNEXT_LIMIT: u8 = 3;
/// Per-steal batch cap when transferring half a victim's queue.
const STEAL_BATCH_MAX: usize = 16;
/// Idle iterations of pure spinning before yielding.
const IDLE_SPIN_LIMIT: u32 = 64;
/// Idle iterations before attempting to park.
const IDLE_YIELD_LIMIT: u32 = 128;
/// QSBR epoch advance period, in worker-0 iterations.
const EPOCH_ADVANCE_PERIOD: u32 = 100;

/// Cache-padded per-worker statistics counters.
#[derive(Default)]
pub struct WorkerStats {
    pub reductions: AtomicU64,
    pub context_switches: AtomicU64,
    pub steals: AtomicU64,
    pub actors_run: AtomicU64,
}

/// Cross-thread-visible worker state.
pub(crate) struct WorkerShared {
    deque: bwos::Deque,
    /// Single-slot LIFO handoff ("runnext"); 0 = empty. Owner-only on the
    /// pop side, so wake paths must notify *all* parked workers.
    runnext: AtomicU64,
    parked: AtomicBool,
    stack_pool: Arc<StackPool>,
    trace: Mutex<TraceRing>,
    stats: CachePadded<WorkerStats>,
}

impl WorkerShared {
    fn new(stack_size: usize) -> Arc<Self> {
        Arc::new(Self {
            deque: bwos::Deque::new(),
            runnext: AtomicU64::new(0),
            parked: AtomicBool::new(false),
            stack_pool: StackPool::new(stack_size),
            trace: Mutex::new(TraceRing::new()),
            stats: CachePadded::new(WorkerStats::default()),
        })
    }
}

/// Global scheduler state.
pub(crate) struct SchedShared {
    workers: Vec<Arc<WorkerShared>>,
    active: AtomicUsize,
    global: GlobalQueue,
    ec: EventCount,
    searching: AtomicU32,
    running: AtomicI64,
    stop: AtomicBool,
    qsbr: Qsbr,
    trace_enabled: AtomicBool,
    /// One scheduler run at a time.
    run_lock: Mutex<()>,
}

/// The process-wide runtime: every registry plus the scheduler.
pub struct Runtime {
    config: RuntimeConfig,
    actors: ActorRegistry,
    supervisors: SupervisorRegistry,
    names: NameRegistry,
    ets: EtsRegistry,
    channels: ChannelRegistry,
    macros: MacroRegistry,
    timers: TimerTable,
    signals: SignalBridge,
    pub(crate) sched: SchedShared,
}

static_assertions::assert_impl_all!(Runtime: Send, Sync);

thread_local! {
    static CURRENT_WORKER: TlsCell<usize> = const { TlsCell::new(usize::MAX) };
    static CURRENT_ACTOR: RefCell<Option<Arc<Actor>>> = const { RefCell::new(None) };
}

/// Worker index of the calling thread, when it is a scheduler worker.
#[must_use]
pub fn current_worker_id() -> Option<usize> {
    let id = CURRENT_WORKER.with(TlsCell::get);
    (id != usize::MAX).then_some(id)
}

fn set_current_worker(worker: Option<usize>) {
    CURRENT_WORKER.with(|slot| slot.set(worker.unwrap_or(usize::MAX)));
}

/// The actor whose quantum is currently executing on this thread.
#[must_use]
pub fn current_actor() -> Option<Arc<Actor>> {
    CURRENT_ACTOR.with(|slot| slot.borrow().clone())
}

fn set_current_actor(actor: Option<Arc<Actor>>) {
    CURRENT_ACTOR.with(|slot| *slot.borrow_mut() = actor);
}

/// Worker-thread-local loop state. Never leaves its thread.
struct Core {
    index: usize,
    rng: fastrand::Rng,
    runnext_consecutive: u8,
    retire: RetireRing,
}

/// Outcome of one granted quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Finished or already dead; not re-enqueued.
    Dead,
    /// Suspension condition unmet (or the fiber is busy on another
    /// worker); the wake side owns the re-enqueue.
    Blocked,
    /// Ran a quantum; re-enqueue on the current worker.
    Ran,
}

// === impl Runtime ===

impl Runtime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let workers = (0..MAX_SCHEDULERS)
            .map(|_| WorkerShared::new(config.stack_size))
            .collect();
        let active = config.effective_workers();
        let trace_enabled = config.trace;
        Arc::new(Self {
            actors: ActorRegistry::new(),
            supervisors: SupervisorRegistry::new(),
            names: NameRegistry::new(),
            ets: EtsRegistry::new(),
            channels: ChannelRegistry::new(),
            macros: MacroRegistry::new(),
            timers: TimerTable::new(),
            signals: SignalBridge::new(),
            sched: SchedShared {
                workers,
                active: AtomicUsize::new(active),
                global: GlobalQueue::new(),
                ec: EventCount::new(),
                searching: AtomicU32::new(0),
                running: AtomicI64::new(0),
                stop: AtomicBool::new(false),
                qsbr: Qsbr::new(MAX_SCHEDULERS),
                trace_enabled: AtomicBool::new(trace_enabled),
                run_lock: Mutex::new(()),
            },
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn actors(&self) -> &ActorRegistry {
        &self.actors
    }

    #[must_use]
    pub fn supervisors(&self) -> &SupervisorRegistry {
        &self.supervisors
    }

    #[must_use]
    pub fn names(&self) -> &NameRegistry {
        &self.names
    }

    #[must_use]
    pub fn ets(&self) -> &EtsRegistry {
        &self.ets
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    #[must_use]
    pub fn macros(&self) -> &MacroRegistry {
        &self.macros
    }

    pub(crate) fn timers(&self) -> &TimerTable {
        &self.timers
    }

    pub(crate) fn signals(&self) -> &SignalBridge {
        &self.signals
    }

    /// Number of active scheduler workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.sched.active.load(Ordering::Relaxed).max(1)
    }

    /// Adjust the worker count. Takes effect on the next run.
    pub fn set_worker_count(&self, workers: usize) {
        self.sched
            .active
            .store(workers.clamp(1, MAX_SCHEDULERS), Ordering::Relaxed);
    }

    pub fn set_trace_enabled(&self, enabled: bool) {
        self.sched.trace_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn trace_enabled(&self) -> bool {
        self.sched.trace_enabled.load(Ordering::Relaxed)
    }

    /// Per-worker statistics.
    #[must_use]
    pub fn worker_stats(&self, worker: usize) -> Option<&WorkerStats> {
        self.sched.workers.get(worker).map(|w| &*w.stats)
    }

    /// Number of workers currently committed to an eventcount sleep.
    #[must_use]
    pub fn parked_workers(&self) -> usize {
        self.sched.workers[..self.worker_count()]
            .iter()
            .filter(|w| w.parked.load(Ordering::Acquire))
            .count()
    }

    /// Record a trace event on the calling worker's ring (worker 0 for
    /// non-scheduler threads). One predicted branch when disabled.
    pub(crate) fn trace(&self, kind: TraceKind, actor: ActorId, detail: u32) {
        if !self.sched.trace_enabled.load(Ordering::Relaxed) {
            return;
        }
        let index = current_worker_id().unwrap_or(0);
        let worker = &self.sched.workers[index];
        if let Some(mut ring) = worker.trace.try_lock() {
            ring.record(
                kind,
                u16::try_from(index).unwrap_or(0),
                u32::try_from(actor).unwrap_or(u32::MAX),
                detail,
            );
        }
    }

    /// Merge all per-worker rings into one timestamp-ordered trace. Only
    /// meaningful while workers are parked or joined.
    #[must_use]
    pub fn trace_merge(&self, filter: Option<TraceKind>) -> Vec<TraceEvent> {
        let snapshots = self
            .sched
            .workers
            .iter()
            .map(|w| w.trace.lock().snapshot())
            .collect();
        trace::merge(snapshots, filter)
    }

    pub fn trace_clear(&self) {
        for worker in &self.sched.workers {
            worker.trace.lock().clear();
        }
    }

    /// Enqueue a runnable actor on `worker`'s LIFO slot, spilling the
    /// previous occupant to the deque (owner) or the global queue (anyone
    /// else), then wake every parked worker - runnext entries are
    /// owner-only, so a single wake could miss the one worker able to run
    /// it.
    pub fn enqueue(&self, worker: usize, id: ActorId) {
        let worker = worker % self.worker_count();
        let shared = &self.sched.workers[worker];
        let prev = shared.runnext.swap(id, Ordering::AcqRel);
        if prev != 0 {
            if current_worker_id() == Some(worker) {
                if let Err(spilled) = shared.deque.push(prev) {
                    self.sched.global.push_retrying(spilled);
                }
            } else {
                self.sched.global.push_retrying(prev);
            }
        }
        self.notify_workers();
    }

    /// Wake all parked workers after publishing new work.
    pub(crate) fn notify_workers(&self) {
        self.sched.ec.notify_all();
    }

    /// Ask a concurrent [`Self::run_all`] to stop: every worker observes
    /// the flag, drains its claim, and joins.
    pub fn shutdown(&self) {
        self.sched.stop.store(true, Ordering::Release);
        self.sched.ec.notify_all();
    }

    /// Steal-half from a random victim: the first stolen actor is returned
    /// to run immediately, up to half the victim's remaining queue (batch
    /// capped) is transferred into the thief's deque.
    pub fn try_steal(&self, thief: usize, rng: &mut fastrand::Rng) -> Option<ActorId> {
        let count = self.worker_count();
        if count <= 1 {
            return None;
        }
        let start = rng.usize(0..count);
        for offset in 0..count {
            let victim = (start + offset) % count;
            if victim == thief {
                continue;
            }
            let victim_shared = &self.sched.workers[victim];
            let Some(first) = victim_shared.deque.steal() else {
                continue;
            };

            let thief_shared = &self.sched.workers[thief];
            thief_shared.stats.steals.fetch_add(1, Ordering::Relaxed);
            self.trace(TraceKind::Steal, first, u32::try_from(victim).unwrap_or(0));

            let batch = (victim_shared.deque.len() / 2).min(STEAL_BATCH_MAX);
            for _ in 0..batch {
                let Some(extra) = victim_shared.deque.steal() else {
                    break;
                };
                if let Err(spilled) = thief_shared.deque.push(extra) {
                    self.sched.global.push_retrying(spilled);
                }
            }

            return Some(first);
        }
        None
    }

    /// Are all queues (runnext slots, deques, global) empty?
    fn all_idle(&self) -> bool {
        for worker in &self.sched.workers[..self.worker_count()] {
            if worker.runnext.load(Ordering::Relaxed) != 0 {
                return false;
            }
            if !worker.deque.is_empty() {
                return false;
            }
        }
        self.sched.global.is_empty()
    }

    /// Reset every registry and queue. Only sound between runs.
    pub fn reset(&self) {
        self.actors.reset();
        self.supervisors.reset();
        self.names.reset();
        self.ets.reset();
        self.channels.reset();
        self.macros.reset();
        self.timers.reset();
        self.signals.reset();
        for worker in &self.sched.workers {
            worker.runnext.store(0, Ordering::Relaxed);
            worker.deque.reset();
        }
        while self.sched.global.pop().is_some() {}
    }

    /// Drive all actors to completion (or until `max_ticks` quanta on
    /// worker 0). Spawns workers 1..N, runs worker 0 on the calling
    /// thread, and joins everything before returning the tick count.
    pub fn run_all(self: &Arc<Self>, max_ticks: u64) -> u64 {
        let _guard = self.sched.run_lock.lock();

        self.sched.stop.store(false, Ordering::Release);
        self.sched.searching.store(0, Ordering::Relaxed);
        self.sched.running.store(0, Ordering::Relaxed);

        set_current_worker(Some(0));

        // Distribute alive actors round-robin by affinity. Sorted so a
        // deterministic run replays the same activation order.
        let mut ids = self.actors.ids();
        ids.sort_unstable();
        let count = self.worker_count();
        for id in ids {
            if let Some(actor) = self.actors.get(id)
                && actor.is_alive()
            {
                self.enqueue(actor.home_worker() % count, id);
            }
        }

        let ticks = std::thread::scope(|scope| {
            let mut joins = Vec::new();
            for index in 1..count {
                let rt = Arc::clone(self);
                joins.push(
                    std::thread::Builder::new()
                        .name(format!("arbor-worker-{index}"))
                        .spawn_scoped(scope, move || worker_main(&rt, index))
                        .expect("failed to spawn scheduler worker"),
                );
            }

            let ticks = scheduler_zero_loop(self, max_ticks);

            self.sched.stop.store(true, Ordering::Release);
            self.sched.ec.notify_all();
            for join in joins {
                let _ = join.join();
            }
            ticks
        });

        set_current_worker(None);

        // Drain all queues so no stale ids survive into the next run, and
        // reset the deque epochs.
        for worker in &self.sched.workers {
            worker.runnext.store(0, Ordering::Relaxed);
            worker.deque.reset();
        }
        while self.sched.global.pop().is_some() {}

        ticks
    }
}

/// Can a suspended actor be resumed right now?
fn actor_runnable(rt: &Runtime, actor: &Actor) -> bool {
    let fiber = actor.fiber();
    if fiber.state() != FiberState::Suspended {
        return true;
    }
    match fiber.reason() {
        SuspendReason::Mailbox => !actor.mailbox.is_empty(),
        SuspendReason::ChanRecv { chan } => rt
            .channels()
            .get(chan)
            .is_none_or(|c| !c.is_empty() || c.is_closed()),
        SuspendReason::ChanSend { chan, .. } => rt
            .channels()
            .get(chan)
            .is_none_or(|c| c.len() < c.capacity()),
        SuspendReason::Select { chans } => {
            let mut gone = 0;
            for id in &chans {
                match rt.channels().get(*id) {
                    Some(c) => {
                        if !c.is_empty() || c.is_closed() {
                            return true;
                        }
                    }
                    None => gone += 1,
                }
            }
            // Every channel vanished: resume to report select-all-closed.
            gone == chans.len()
        }
        SuspendReason::TaskAwait { actor } => {
            rt.actors().get(actor).is_none_or(|target| !target.is_alive())
        }
        SuspendReason::General => false,
        SuspendReason::ReductionYield => true,
    }
}

/// Build the resume value for a suspended actor whose condition is met,
/// draining the mailbox / channel / select source as appropriate.
fn prepare_resume(rt: &Runtime, actor: &Actor) -> Cell {
    let fiber = actor.fiber();
    match fiber.reason() {
        SuspendReason::Mailbox => rt.receive(actor.id()).unwrap_or_else(Cell::nil),
        SuspendReason::ChanRecv { chan } => match rt.channels().get(chan) {
            Some(channel) => match channel.try_recv() {
                Some(value) => {
                    rt.trace(TraceKind::ChanRecv, actor.id(), u32::try_from(chan).unwrap_or(0));
                    rt.wake_channel_waiter(&channel, Direction::Send);
                    value
                }
                None if channel.is_closed() => Cell::error("chan-recv-closed", Cell::nil()),
                None => Cell::nil(),
            },
            None => Cell::error("chan-recv-invalid", Cell::nil()),
        },
        SuspendReason::ChanSend { chan, value } => {
            if let Some(channel) = rt.channels().get(chan) {
                // Best-effort delivery of the pending value; a racing
                // filler simply costs this sender another round.
                let _ = channel.try_send(value);
                rt.trace(TraceKind::ChanSend, actor.id(), u32::try_from(chan).unwrap_or(0));
                rt.wake_channel_waiter(&channel, Direction::Recv);
            }
            Cell::nil()
        }
        SuspendReason::Select { chans } => {
            let total = chans.len();
            let start = {
                let mut suspension = fiber.suspension().lock();
                let cursor = suspension.select_round;
                suspension.select_round = suspension.select_round.wrapping_add(1);
                if total == 0 { 0 } else { cursor % total }
            };
            let mut closed_or_gone = 0;
            for offset in 0..total {
                let chan_id = chans[(start + offset) % total];
                let Some(channel) = rt.channels().get(chan_id) else {
                    closed_or_gone += 1;
                    continue;
                };
                if channel.is_closed() && channel.is_empty() {
                    closed_or_gone += 1;
                    continue;
                }
                if let Some(value) = channel.try_recv() {
                    rt.trace(
                        TraceKind::ChanRecv,
                        actor.id(),
                        u32::try_from(chan_id).unwrap_or(0),
                    );
                    rt.wake_channel_waiter(&channel, Direction::Send);
                    return Cell::cons(Cell::channel(chan_id), value);
                }
            }
            if closed_or_gone == total {
                Cell::error("select-all-closed", Cell::nil())
            } else {
                Cell::nil()
            }
        }
        SuspendReason::TaskAwait { actor: target } => rt
            .actors()
            .get(target)
            .and_then(|t| t.result())
            .unwrap_or_else(Cell::nil),
        SuspendReason::General | SuspendReason::ReductionYield => Cell::nil(),
    }
}

fn reason_discriminant(reason: &SuspendReason) -> u32 {
    match reason {
        SuspendReason::General => 0,
        SuspendReason::Mailbox => 1,
        SuspendReason::ChanRecv { .. } => 2,
        SuspendReason::ChanSend { .. } => 3,
        SuspendReason::Select { .. } => 4,
        SuspendReason::TaskAwait { .. } => 5,
        SuspendReason::ReductionYield => 6,
    }
}

/// Run one actor for one reduction quantum.
fn run_one_quantum(rt: &Arc<Runtime>, core: &mut Core, actor: &Arc<Actor>) -> Outcome {
    // Externally killed (exit signal from another thread): never resume.
    if !actor.is_alive() {
        return Outcome::Dead;
    }

    // Claim the coroutine before preparing anything: a doubly-enqueued
    // actor being run elsewhere must not have a message drained on its
    // behalf here.
    let Some(mut claim) = actor.fiber().claim() else {
        return Outcome::Blocked;
    };

    let fiber = actor.fiber();
    let suspended = fiber.state() == FiberState::Suspended;
    if suspended && !actor_runnable(rt, actor) {
        return Outcome::Blocked;
    }

    set_current_actor(Some(Arc::clone(actor)));

    let resume_value = if suspended {
        actor.wait_flag.store(0, Ordering::Relaxed);
        let reason = fiber.reason();
        // Sweep our select registrations before resuming; losers keep
        // stale entries that the channels clear on next touch.
        if let SuspendReason::Select { chans } = &reason {
            for chan_id in chans {
                if let Some(channel) = rt.channels().get(*chan_id) {
                    channel.clear_waiter(Direction::Recv, actor.id());
                }
            }
        }
        let value = prepare_resume(rt, actor);
        rt.trace(TraceKind::Resume, actor.id(), reason_discriminant(&reason));
        // Clear stale suspend metadata now that the resume value is built.
        fiber.set_reason(SuspendReason::General);
        value
    } else {
        rt.trace(TraceKind::Resume, actor.id(), 0);
        Cell::nil()
    };

    let worker = &rt.sched.workers[core.index];
    let run = fiber.run(&mut claim, &worker.stack_pool, resume_value);
    drop(claim);
    set_current_actor(None);

    worker.stats.actors_run.fetch_add(1, Ordering::Relaxed);
    worker.stats.reductions.fetch_add(
        u64::try_from(rt.config().reductions.max(0)).unwrap_or(0),
        Ordering::Relaxed,
    );

    match run {
        Err(err) => {
            tracing::error!(actor = actor.id(), %err, "fiber stack allocation failed");
            rt.finish(actor, Cell::error("fiber-stack-failed", Cell::nil()));
            core.retire.retire(&rt.sched.qsbr, Arc::clone(actor));
            Outcome::Dead
        }
        Ok(FiberRun::Finished(result)) => {
            rt.finish(actor, result);
            core.retire.retire(&rt.sched.qsbr, Arc::clone(actor));
            Outcome::Dead
        }
        Ok(FiberRun::Yielded) => {
            worker.stats.context_switches.fetch_add(1, Ordering::Relaxed);
            if matches!(fiber.reason(), SuspendReason::ReductionYield) {
                rt.trace(TraceKind::Yield, actor.id(), 0);
            }
            Outcome::Ran
        }
    }
}

/// Poll every work source of `worker`, runnext included.
fn poll_all(rt: &Runtime, core: &mut Core) -> Option<ActorId> {
    let worker = &rt.sched.workers[core.index];
    let id = worker.runnext.swap(0, Ordering::AcqRel);
    if id != 0 {
        return Some(id);
    }
    if let Some(id) = worker.deque.pop() {
        return Some(id);
    }
    if let Some(id) = rt.sched.global.pop() {
        return Some(id);
    }
    rt.try_steal(core.index, &mut core.rng)
}

/// One pass of the pop order: LIFO slot (bounded) → deque → global →
/// steal.
fn next_task(rt: &Runtime, core: &mut Core) -> Option<ActorId> {
    let worker = &rt.sched.workers[core.index];

    if core.runnext_consecutive < RUNNEXT_LIMIT {
        let id = worker.runnext.swap(0, Ordering::AcqRel);
        if id != 0 {
            core.runnext_consecutive += 1;
            return Some(id);
        }
    } else {
        core.runnext_consecutive = 0;
    }

    if let Some(id) = worker.deque.pop() {
        core.runnext_consecutive = 0;
        return Some(id);
    }
    if let Some(id) = rt.sched.global.pop() {
        return Some(id);
    }
    rt.try_steal(core.index, &mut core.rng)
}

fn seeded_rng(rt: &Runtime, index: usize) -> fastrand::Rng {
    match rt.config().seed {
        Some(seed) => fastrand::Rng::with_seed(seed.wrapping_add(index as u64)),
        None => fastrand::Rng::with_seed(
            0x9e37_79b9_7f4a_7c15_u64.wrapping_mul(index as u64 + 1) ^ trace::timestamp(),
        ),
    }
}

/// Run one actor and handle its outcome; shared by worker 0 and the worker
/// threads. Returns `true` when a quantum was actually granted.
fn dispatch(rt: &Arc<Runtime>, core: &mut Core, id: ActorId) -> bool {
    rt.sched.running.fetch_add(1, Ordering::Relaxed);
    let outcome = match rt.actors().get(id) {
        Some(actor) => run_one_quantum(rt, core, &actor),
        None => Outcome::Dead,
    };
    if outcome == Outcome::Ran {
        // Re-enqueue before the running-count decrement so no observer
        // sees the actor in a gap state (not running, not queued).
        rt.enqueue(core.index, id);
    }
    rt.sched.running.fetch_sub(1, Ordering::Release);

    rt.sched.qsbr.quiescent(core.index);
    core.retire.reclaim_amortized(&rt.sched.qsbr);

    outcome != Outcome::Blocked
}

/// Main loop for workers 1..N.
fn worker_main(rt: &Arc<Runtime>, index: usize) {
    set_current_worker(Some(index));
    rt.sched.qsbr.online(index);

    let mut core = Core {
        index,
        rng: seeded_rng(rt, index),
        runnext_consecutive: 0,
        retire: RetireRing::new(),
    };
    let worker = Arc::clone(&rt.sched.workers[index]);
    let mut idle_spins: u32 = 0;
    let mut was_searching = false;

    while !rt.sched.stop.load(Ordering::Acquire) {
        if let Some(id) = next_task(rt, &mut core) {
            idle_spins = 0;
            // Become a searcher (capped at half the workers) so the
            // last-searcher rescan invariant holds.
            if !was_searching
                && rt.sched.searching.load(Ordering::Relaxed)
                    < u32::try_from(rt.worker_count() / 2).unwrap_or(0)
            {
                rt.sched.searching.fetch_add(1, Ordering::Relaxed);
                was_searching = true;
            }
            dispatch(rt, &mut core, id);
            continue;
        }

        idle_spins += 1;
        if idle_spins < IDLE_SPIN_LIMIT {
            std::hint::spin_loop();
            continue;
        }
        if idle_spins < IDLE_YIELD_LIMIT {
            std::thread::yield_now();
            continue;
        }

        // Leaving the searching state: the last searcher re-scans every
        // source once more before anyone commits to sleep.
        if was_searching {
            let prev = rt.sched.searching.fetch_sub(1, Ordering::AcqRel);
            was_searching = false;
            if prev == 1
                && let Some(id) = poll_all(rt, &mut core)
            {
                idle_spins = 0;
                rt.enqueue(core.index, id);
                continue;
            }
        }

        // Eventcount two-phase park.
        let epoch = rt.sched.ec.prepare_wait();

        if rt.sched.stop.load(Ordering::Acquire) || rt.actors().alive_count() <= 0 {
            rt.sched.ec.cancel_wait();
            break;
        }

        // Final check of every source (runnext included!) between prepare
        // and commit; any notify in between invalidates the epoch.
        if let Some(id) = poll_all(rt, &mut core) {
            rt.sched.ec.cancel_wait();
            idle_spins = 0;
            core.runnext_consecutive = 0;
            rt.enqueue(core.index, id);
            continue;
        }

        rt.sched.qsbr.offline(index);
        worker.parked.store(true, Ordering::Release);
        rt.sched.ec.commit_wait(epoch);
        worker.parked.store(false, Ordering::Release);
        rt.sched.qsbr.online(index);
        idle_spins = 0;
    }

    if was_searching {
        rt.sched.searching.fetch_sub(1, Ordering::Relaxed);
    }

    core.retire.drain();
    rt.sched.qsbr.offline(index);
    set_current_worker(None);
}

/// Worker 0: the caller's thread. Also ticks timers, drains signals,
/// advances the QSBR epoch, and detects termination.
fn scheduler_zero_loop(rt: &Arc<Runtime>, max_ticks: u64) -> u64 {
    rt.sched.qsbr.online(0);
    let mut core = Core {
        index: 0,
        rng: seeded_rng(rt, 0),
        runnext_consecutive: 0,
        retire: RetireRing::new(),
    };

    let mut ticks: u64 = 0;
    let mut idle_spins: u32 = 0;
    let mut epoch_counter: u32 = 0;
    let mut blocked_rounds: u32 = 0;

    while ticks < max_ticks && !rt.sched.stop.load(Ordering::Acquire) {
        if let Some(id) = next_task(rt, &mut core) {
            idle_spins = 0;
            blocked_rounds = 0;
            if dispatch(rt, &mut core, id) {
                ticks += 1;
            }
        } else {
            idle_spins += 1;
            let no_running = rt.sched.running.load(Ordering::Acquire) <= 0;
            let alive = rt.actors().alive_count();

            // Termination: everything finished, nothing queued, nothing
            // mid-quantum.
            if idle_spins > 10 && no_running && alive <= 0 && rt.all_idle() {
                rt.notify_workers();
                break;
            }

            if idle_spins > 32 {
                // All remaining actors permanently blocked (deadlock, or
                // external input that will never come inside this run) and
                // no timers pending: stop rather than park forever. Counted
                // in park rounds because each one re-verifies the
                // conditions after a full bounded sleep.
                if no_running && rt.all_idle() && !rt.timer_any_pending() {
                    blocked_rounds += 1;
                    if blocked_rounds > 3 {
                        tracing::debug!(alive, "all remaining actors blocked; stopping run");
                        break;
                    }
                } else {
                    blocked_rounds = 0;
                }

                let epoch = rt.sched.ec.prepare_wait();
                if let Some(id) = poll_all(rt, &mut core) {
                    rt.sched.ec.cancel_wait();
                    idle_spins = 0;
                    core.runnext_consecutive = 0;
                    rt.enqueue(core.index, id);
                } else if rt.actors().alive_count() <= 0 {
                    rt.sched.ec.cancel_wait();
                    break;
                } else {
                    // Bounded park; timers still need periodic ticking.
                    rt.sched.qsbr.offline(0);
                    rt.sched.ec.commit_wait(epoch);
                    rt.sched.qsbr.online(0);
                    idle_spins = 0;
                }
            } else {
                std::hint::spin_loop();
            }
        }

        rt.sched.qsbr.quiescent(0);
        core.retire.reclaim_amortized(&rt.sched.qsbr);

        epoch_counter += 1;
        if epoch_counter >= EPOCH_ADVANCE_PERIOD {
            rt.sched.qsbr.advance();
            epoch_counter = 0;
        }

        rt.timer_tick_all();
        rt.signal_drain();
    }

    core.retire.drain();
    rt.sched.qsbr.offline(0);
    ticks
}
