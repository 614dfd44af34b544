// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Actors: a fiber paired with a mailbox plus lifecycle metadata.
//!
//! Spawning builds a body that applies the behavior to a handle referring
//! to the actor itself, so behaviors can self-identify. Links are
//! symmetric, monitors are one-way. On death the notify routine delivers
//! `(:monitor-down id reason)` messages to watchers and, depending on the
//! peer's `trap_exit`, either `(:exit-from id reason)` messages or an exit
//! signal to linked peers. Whether the reason is normal (nil or `:normal`)
//! or an error governs link kills and supervisor restarts.
//!
//! Finishing races cleanly against concurrent exit signals through a CAS
//! on the alive flag: the winner stores the result and runs the
//! notification, the loser is a no-op.

mod mailbox;
pub mod registry;
pub mod supervisor;

pub(crate) use mailbox::Mailbox;

use crate::cell::{ActorId, Caps, Cell};
use crate::eval::EvalCtx;
use crate::fiber::{Fiber, SuspendReason};
use crate::sched::{self, Runtime, TraceKind};
use crate::env;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Cap on bidirectional link peers per actor.
pub const MAX_LINKS: usize = 32;
/// Cap on monitor watchers per actor.
pub const MAX_MONITORS: usize = 32;

/// Message tag for monitor notifications: `(:monitor-down id reason)`.
pub const MONITOR_DOWN: &str = ":monitor-down";
/// Message tag for trapped exits: `(:exit-from id reason)`.
pub const EXIT_FROM: &str = ":exit-from";
/// Normal exit reason.
pub const NORMAL: &str = ":normal";
/// Reason used when a supervisor stops siblings.
pub const SHUTDOWN: &str = ":shutdown";

/// A fiber with a mailbox, links, monitors, and a wait flag driving the
/// wake protocol.
pub struct Actor {
    id: ActorId,
    fiber: Fiber,
    pub(crate) mailbox: Mailbox,
    alive: AtomicBool,
    result: Mutex<Option<Cell>>,
    links: Mutex<Vec<ActorId>>,
    monitors: Mutex<Vec<ActorId>>,
    trap_exit: AtomicBool,
    /// Per-actor key/value store.
    dict: Mutex<Vec<(Cell, Cell)>>,
    /// Scheduler affinity hint.
    home_worker: AtomicUsize,
    /// 0 = runnable, 1 = blocked. The wake side transfers run ownership by
    /// CASing 1 → 0.
    pub(crate) wait_flag: AtomicU32,
    /// Actors blocked awaiting this actor's result.
    awaiters: Mutex<Vec<ActorId>>,
    /// Monotonic per-actor trace sequence.
    trace_seq: AtomicU32,
    /// Origin actor of the causal chain (0 = none).
    trace_origin: AtomicU32,
}

static_assertions::assert_impl_all!(Actor: Send, Sync);

// === impl Actor ===

impl Actor {
    #[must_use]
    pub fn id(&self) -> ActorId {
        self.id
    }

    #[must_use]
    pub fn fiber(&self) -> &Fiber {
        &self.fiber
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Final result once the actor has died.
    #[must_use]
    pub fn result(&self) -> Option<Cell> {
        self.result.lock().clone()
    }

    #[must_use]
    pub fn traps_exit(&self) -> bool {
        self.trap_exit.load(Ordering::Acquire)
    }

    pub fn set_trap_exit(&self, trap: bool) {
        self.trap_exit.store(trap, Ordering::Release);
    }

    #[must_use]
    pub fn mailbox_len(&self) -> usize {
        self.mailbox.len()
    }

    #[must_use]
    pub fn home_worker(&self) -> usize {
        self.home_worker.load(Ordering::Relaxed)
    }

    /// Next value of the per-actor trace sequence.
    pub(crate) fn next_trace_seq(&self) -> u32 {
        self.trace_seq.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn trace_origin(&self) -> u32 {
        self.trace_origin.load(Ordering::Relaxed)
    }

    pub fn set_trace_origin(&self, origin: u32) {
        self.trace_origin.store(origin, Ordering::Relaxed);
    }

    fn add_link(&self, peer: ActorId) -> bool {
        let mut links = self.links.lock();
        if links.contains(&peer) {
            return true;
        }
        if links.len() >= MAX_LINKS {
            return false;
        }
        links.push(peer);
        true
    }

    fn remove_link(&self, peer: ActorId) {
        self.links.lock().retain(|&id| id != peer);
    }

    #[must_use]
    pub fn links(&self) -> Vec<ActorId> {
        self.links.lock().clone()
    }

    fn add_monitor(&self, watcher: ActorId) -> bool {
        let mut monitors = self.monitors.lock();
        if monitors.len() >= MAX_MONITORS {
            return false;
        }
        monitors.push(watcher);
        true
    }

    #[must_use]
    pub fn monitors(&self) -> Vec<ActorId> {
        self.monitors.lock().clone()
    }

    pub(crate) fn add_awaiter(&self, awaiter: ActorId) {
        self.awaiters.lock().push(awaiter);
    }

    fn take_awaiters(&self) -> Vec<ActorId> {
        std::mem::take(&mut *self.awaiters.lock())
    }

    /// Bind a key in the process dictionary, returning the previous value.
    pub fn dict_put(&self, key: Cell, value: Cell) -> Option<Cell> {
        let mut dict = self.dict.lock();
        for entry in dict.iter_mut() {
            if entry.0 == key {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        dict.push((key, value));
        None
    }

    #[must_use]
    pub fn dict_get(&self, key: &Cell) -> Option<Cell> {
        self.dict
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

/// Is this exit reason a normal exit (nil or `:normal`)?
#[must_use]
pub fn is_normal_reason(reason: &Cell) -> bool {
    reason.is_nil() || reason.as_symbol() == Some(NORMAL)
}

// === actor operations on the runtime ===

impl Runtime {
    /// Spawn an actor whose fiber applies `behavior` to the actor's own
    /// handle. Registers the actor, bumps the alive counter, and enqueues
    /// it on the spawning worker (or by id when spawned from outside the
    /// scheduler).
    pub fn spawn(&self, ctx: &EvalCtx, behavior: Cell) -> Cell {
        let id = self.actors().allocate_id();
        let self_cell = Cell::actor(id);

        // The body applies the behavior to the self handle through a local
        // named environment.
        let spawn_env = env::bind_named(
            &env::bind_named(&Cell::nil(), "__actor_self", self_cell.clone()),
            "__actor_fn",
            behavior,
        );
        let body = Cell::list([Cell::symbol("__actor_fn"), Cell::symbol("__actor_self")]);

        let home = sched::current_worker_id().unwrap_or_else(|| {
            #[allow(clippy::cast_possible_truncation, reason = "worker count is tiny")]
            let w = (id as usize) % self.worker_count();
            w
        });

        let parent = sched::current_actor().map_or(0, |a| a.id());
        let actor = Arc::new(Actor {
            id,
            fiber: Fiber::new(ctx.fork(), body, spawn_env),
            mailbox: Mailbox::new(self.config().mailbox_capacity),
            alive: AtomicBool::new(true),
            result: Mutex::new(None),
            links: Mutex::new(Vec::new()),
            monitors: Mutex::new(Vec::new()),
            trap_exit: AtomicBool::new(false),
            dict: Mutex::new(Vec::new()),
            home_worker: AtomicUsize::new(home),
            wait_flag: AtomicU32::new(0),
            awaiters: Mutex::new(Vec::new()),
            trace_seq: AtomicU32::new(0),
            trace_origin: AtomicU32::new(u32::try_from(parent).unwrap_or(0)),
        });

        self.actors().insert(Arc::clone(&actor));
        self.trace(TraceKind::Spawn, id, u32::try_from(parent).unwrap_or(0));

        // Inside a scheduler run, hand the actor straight to the current
        // worker; otherwise `run_all` distributes it.
        if sched::current_worker_id().is_some() {
            self.enqueue(home, id);
        }

        self_cell
    }

    /// Deliver `message` to `target`'s mailbox, waking it if it is blocked
    /// on an empty mailbox. Returns `false` when the target is unknown,
    /// the message lacks the `SEND` capability, or the mailbox is full.
    pub fn send(&self, target: ActorId, message: &Cell) -> bool {
        if !message.can(Caps::SEND) {
            return false;
        }
        let Some(actor) = self.actors().get(target) else {
            return false;
        };
        if actor.mailbox.push(message.clone()).is_err() {
            tracing::warn!(actor = target, "mailbox full, message dropped");
            return false;
        }
        // Detail carries the sender's causal sequence number.
        let seq = sched::current_actor().map_or(0, |sender| sender.next_trace_seq());
        self.trace(TraceKind::Send, target, seq);
        self.wake_if_blocked_on(&actor, |reason| matches!(reason, SuspendReason::Mailbox));
        true
    }

    /// Take the next mailbox message of `target`; ownership transfers to
    /// the caller.
    pub fn receive(&self, target: ActorId) -> Option<Cell> {
        let actor = self.actors().get(target)?;
        let message = actor.mailbox.pop();
        if message.is_some() {
            self.trace(TraceKind::Recv, target, 0);
        }
        message
    }

    /// Wake `actor` if its wait flag is set and its suspend reason
    /// satisfies `matches`. The CAS transfers re-enqueue ownership to the
    /// caller, so a woken actor is enqueued exactly once.
    pub(crate) fn wake_if_blocked_on(
        &self,
        actor: &Arc<Actor>,
        matches: impl Fn(&SuspendReason) -> bool,
    ) {
        if actor.wait_flag.load(Ordering::Acquire) != 1 {
            return;
        }
        if !matches(&actor.fiber.reason()) {
            return;
        }
        if actor
            .wait_flag
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.trace(TraceKind::Wake, actor.id(), 0);
            let worker =
                sched::current_worker_id().unwrap_or(actor.home_worker() % self.worker_count());
            self.enqueue(worker, actor.id());
        }
    }

    /// Symmetric link between two actors.
    pub fn link(&self, a: ActorId, b: ActorId) {
        let (Some(actor_a), Some(actor_b)) = (self.actors().get(a), self.actors().get(b)) else {
            return;
        };
        actor_a.add_link(b);
        actor_b.add_link(a);
        self.trace(TraceKind::Link, a, u32::try_from(b).unwrap_or(0));
    }

    pub fn unlink(&self, a: ActorId, b: ActorId) {
        if let Some(actor_a) = self.actors().get(a) {
            actor_a.remove_link(b);
        }
        if let Some(actor_b) = self.actors().get(b) {
            actor_b.remove_link(a);
        }
    }

    /// One-way monitor: `watcher` is told about `target`'s death.
    pub fn add_monitor(&self, target: ActorId, watcher: ActorId) {
        if let Some(actor) = self.actors().get(target) {
            actor.add_monitor(watcher);
            self.trace(TraceKind::Monitor, target, u32::try_from(watcher).unwrap_or(0));
        }
    }

    /// Send an exit signal. Trapping targets get an `(:exit-from sender
    /// reason)` message; everyone else is killed with `reason` as their
    /// result.
    pub fn exit_signal(&self, target: ActorId, sender: Option<ActorId>, reason: Cell) {
        let Some(actor) = self.actors().get(target) else {
            return;
        };
        if !actor.is_alive() {
            return;
        }
        self.trace(
            TraceKind::ExitSignal,
            target,
            u32::try_from(sender.unwrap_or(0)).unwrap_or(0),
        );

        if actor.traps_exit() {
            let message = Cell::list([
                Cell::symbol(EXIT_FROM),
                Cell::int(sender.unwrap_or(0).cast_signed()),
                reason,
            ]);
            self.send(target, &message);
            return;
        }

        self.kill(&actor, reason);
    }

    /// Kill without the trap check (used for exit signals and supervisor
    /// shutdowns). The alive CAS keeps this race-free against a concurrent
    /// normal finish.
    pub(crate) fn kill(&self, actor: &Arc<Actor>, reason: Cell) {
        if actor
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *actor.result.lock() = Some(reason.clone());
        self.actors().alive_dec();
        self.trace(
            TraceKind::Die,
            actor.id(),
            u32::from(reason.is_error()),
        );
        self.notify_exit(actor, &reason);
    }

    /// Silent kill used when a supervisor stops siblings: no link/monitor
    /// notification and no recursive supervisor handling, just registry
    /// cleanup.
    pub(crate) fn kill_without_supervision(&self, actor: &Arc<Actor>, reason: Cell) {
        if actor
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *actor.result.lock() = Some(reason);
        self.actors().alive_dec();
        self.trace(TraceKind::Die, actor.id(), 0);
        self.names().unregister_actor(actor.id());
        self.ets().destroy_by_owner(actor.id());
    }

    /// Normal completion path, called by the scheduler when an actor's
    /// fiber returns. Returns `false` if a concurrent exit signal got
    /// there first.
    pub fn finish(&self, actor: &Arc<Actor>, result: Cell) -> bool {
        if actor
            .alive
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *actor.result.lock() = Some(result.clone());
        self.actors().alive_dec();
        self.trace(
            TraceKind::Die,
            actor.id(),
            u32::from(result.is_error()),
        );
        self.notify_exit(actor, &result);
        true
    }

    /// Death notification: supervisor handling, monitor messages, link
    /// propagation, awaiter wakeups, registry cleanup.
    pub fn notify_exit(&self, exiting: &Arc<Actor>, reason: &Cell) {
        let is_error = reason.is_error();
        let id = exiting.id();

        if let Some(supervisor) = self.find_supervisor_for_child(id) {
            self.supervisor_handle_exit(&supervisor, id, reason);
        }

        let exit_reason = if is_error {
            reason.clone()
        } else {
            Cell::symbol(NORMAL)
        };

        for watcher in exiting.monitors() {
            if let Some(w) = self.actors().get(watcher)
                && w.is_alive()
            {
                let message = Cell::list([
                    Cell::symbol(MONITOR_DOWN),
                    Cell::int(id.cast_signed()),
                    exit_reason.clone(),
                ]);
                self.send(watcher, &message);
            }
        }

        for peer in exiting.links() {
            let Some(linked) = self.actors().get(peer) else {
                continue;
            };
            if !linked.is_alive() {
                continue;
            }
            if is_error {
                // Error exit propagates as an exit signal (which is a
                // message for trapping peers).
                self.exit_signal(peer, Some(id), reason.clone());
            } else if linked.traps_exit() {
                let message = Cell::list([
                    Cell::symbol(EXIT_FROM),
                    Cell::int(id.cast_signed()),
                    Cell::symbol(NORMAL),
                ]);
                self.send(peer, &message);
            }
        }

        // Awaiters become runnable; their resume path reads the result.
        for awaiter in exiting.take_awaiters() {
            if let Some(actor) = self.actors().get(awaiter) {
                self.wake_if_blocked_on(&actor, |reason| {
                    matches!(reason, SuspendReason::TaskAwait { actor } if *actor == id)
                });
            }
        }

        self.names().unregister_actor(id);
        self.ets().destroy_by_owner(id);
        self.notify_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;

    fn runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig::default())
    }

    fn behavior_done(ctx: &mut EvalCtx) -> Cell {
        // (lambda (self) "done")
        ctx.eval(&Cell::list([
            Cell::symbol("lambda"),
            Cell::list([Cell::symbol("self")]),
            Cell::string("done"),
        ]))
    }

    #[test]
    fn spawn_registers_and_counts() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = behavior_done(&mut ctx);
        let handle = rt.spawn(&ctx, behavior);
        let id = handle.actor_id().unwrap();
        let actor = rt.actors().get(id).unwrap();
        assert!(actor.is_alive());
        assert_eq!(rt.actors().alive_count(), 1);
    }

    #[test]
    fn send_receive_fifo() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = behavior_done(&mut ctx);
        let id = rt.spawn(&ctx, behavior).actor_id().unwrap();
        assert!(rt.send(id, &Cell::int(1)));
        assert!(rt.send(id, &Cell::int(2)));
        assert_eq!(rt.receive(id), Some(Cell::int(1)));
        assert_eq!(rt.receive(id), Some(Cell::int(2)));
        assert_eq!(rt.receive(id), None);
    }

    #[test]
    fn send_requires_capability() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = behavior_done(&mut ctx);
        let id = rt.spawn(&ctx, behavior).actor_id().unwrap();
        let msg = Cell::int(1);
        msg.deny(Caps::SEND);
        assert!(!rt.send(id, &msg));
    }

    #[test]
    fn links_are_symmetric() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior_a = behavior_done(&mut ctx);
        let a = rt.spawn(&ctx, behavior_a).actor_id().unwrap();
        let behavior_b = behavior_done(&mut ctx);
        let b = rt.spawn(&ctx, behavior_b).actor_id().unwrap();
        rt.link(a, b);
        assert!(rt.actors().get(a).unwrap().links().contains(&b));
        assert!(rt.actors().get(b).unwrap().links().contains(&a));
        rt.unlink(a, b);
        assert!(rt.actors().get(a).unwrap().links().is_empty());
        assert!(rt.actors().get(b).unwrap().links().is_empty());
    }

    #[test]
    fn error_exit_kills_linked_peer() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior_a = behavior_done(&mut ctx);
        let a = rt.spawn(&ctx, behavior_a).actor_id().unwrap();
        let behavior_b = behavior_done(&mut ctx);
        let b = rt.spawn(&ctx, behavior_b).actor_id().unwrap();
        rt.link(a, b);
        let boom = Cell::error("boom", Cell::nil());
        let actor_a = rt.actors().get(a).unwrap();
        rt.kill(&actor_a, boom);
        assert!(!rt.actors().get(b).unwrap().is_alive());
    }

    #[test]
    fn trapping_peer_gets_message_instead() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior_a = behavior_done(&mut ctx);
        let a = rt.spawn(&ctx, behavior_a).actor_id().unwrap();
        let behavior_b = behavior_done(&mut ctx);
        let b = rt.spawn(&ctx, behavior_b).actor_id().unwrap();
        rt.link(a, b);
        rt.actors().get(b).unwrap().set_trap_exit(true);

        let boom = Cell::error("boom", Cell::symbol(":boom"));
        let actor_a = rt.actors().get(a).unwrap();
        rt.kill(&actor_a, boom.clone());

        let actor_b = rt.actors().get(b).unwrap();
        assert!(actor_b.is_alive());
        let msg = rt.receive(b).unwrap();
        let items: Vec<Cell> = msg.iter_list().collect();
        assert_eq!(items[0], Cell::symbol(EXIT_FROM));
        assert_eq!(items[1], Cell::int(a.cast_signed()));
        assert_eq!(items[2], boom);
    }

    #[test]
    fn monitor_gets_normal_down() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior_target = behavior_done(&mut ctx);
        let target = rt.spawn(&ctx, behavior_target).actor_id().unwrap();
        let behavior_watcher = behavior_done(&mut ctx);
        let watcher = rt.spawn(&ctx, behavior_watcher).actor_id().unwrap();
        rt.add_monitor(target, watcher);

        let actor = rt.actors().get(target).unwrap();
        rt.finish(&actor, Cell::string("done"));

        let msg = rt.receive(watcher).unwrap();
        let items: Vec<Cell> = msg.iter_list().collect();
        assert_eq!(items[0], Cell::symbol(MONITOR_DOWN));
        assert_eq!(items[1], Cell::int(target.cast_signed()));
        assert_eq!(items[2], Cell::symbol(NORMAL));
    }

    #[test]
    fn finish_races_cleanly_with_exit_signal() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = behavior_done(&mut ctx);
        let id = rt.spawn(&ctx, behavior).actor_id().unwrap();
        let actor = rt.actors().get(id).unwrap();
        rt.exit_signal(id, None, Cell::symbol(":killed"));
        // The signal won; normal completion is a no-op.
        assert!(!rt.finish(&actor, Cell::string("late")));
        assert_eq!(actor.result(), Some(Cell::symbol(":killed")));
        assert_eq!(rt.actors().alive_count(), 0);
    }

    #[test]
    fn process_dictionary() {
        let rt = runtime();
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = behavior_done(&mut ctx);
        let id = rt.spawn(&ctx, behavior).actor_id().unwrap();
        let actor = rt.actors().get(id).unwrap();
        assert_eq!(actor.dict_put(Cell::symbol(":k"), Cell::int(1)), None);
        assert_eq!(
            actor.dict_put(Cell::symbol(":k"), Cell::int(2)),
            Some(Cell::int(1))
        );
        assert_eq!(actor.dict_get(&Cell::symbol(":k")), Some(Cell::int(2)));
        assert_eq!(actor.dict_get(&Cell::symbol(":absent")), None);
    }
}
