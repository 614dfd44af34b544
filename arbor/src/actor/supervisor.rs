// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Supervisors: a fixed child set with a restart strategy.
//!
//! Each child spec pairs a behavior thunk with a restart policy
//! (`Permanent` restarts on any exit, `Transient` only on error exits,
//! `Temporary` never). The strategy decides the blast radius: one-for-one
//! restarts the failed child, one-for-all stops and restarts every child,
//! rest-for-one stops and restarts the failed child and everything after
//! it. Restarts are counted against a cap; exceeding it stops the
//! supervisor and its remaining children.

use super::SHUTDOWN;
use crate::cell::{ActorId, Cell};
use crate::eval::EvalCtx;
use crate::sched::Runtime;
use parking_lot::Mutex;
use std::sync::Arc;

/// Restart strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    OneForOne,
    OneForAll,
    RestForOne,
}

/// Per-child restart policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Always restart on exit.
    Permanent,
    /// Restart only on error exit.
    Transient,
    /// Never restart.
    Temporary,
}

#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub behavior: Cell,
    pub restart: RestartPolicy,
}

struct Child {
    spec: ChildSpec,
    /// Current actor id, 0 before the first spawn.
    current: ActorId,
}

struct SupInner {
    children: Vec<Child>,
    restart_count: u32,
    active: bool,
}

/// A supervisor instance. All mutation goes through the inner lock;
/// restart handling runs on whichever worker observed the child exit.
pub struct Supervisor {
    id: u64,
    strategy: Strategy,
    max_restarts: u32,
    /// Context used to respawn children.
    ctx: Mutex<EvalCtx>,
    inner: Mutex<SupInner>,
}

// === impl Supervisor ===

impl Supervisor {
    pub(crate) fn new(id: u64, strategy: Strategy, max_restarts: u32, ctx: EvalCtx) -> Self {
        Self {
            id,
            strategy,
            max_restarts,
            ctx: Mutex::new(ctx),
            inner: Mutex::new(SupInner {
                children: Vec::new(),
                restart_count: 0,
                active: true,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.inner.lock().restart_count
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Current child actor ids, in spec order.
    #[must_use]
    pub fn child_ids(&self) -> Vec<ActorId> {
        self.inner.lock().children.iter().map(|c| c.current).collect()
    }

    #[must_use]
    pub fn owns_child(&self, id: ActorId) -> bool {
        id != 0 && self.inner.lock().children.iter().any(|c| c.current == id)
    }
}

// === supervisor operations on the runtime ===

impl Runtime {
    /// Create a supervisor with the given strategy and child specs, and
    /// spawn every child.
    pub fn supervisor_create(
        &self,
        ctx: &EvalCtx,
        strategy: Strategy,
        specs: Vec<ChildSpec>,
    ) -> Arc<Supervisor> {
        let supervisor = Arc::new(Supervisor::new(
            self.supervisors().allocate_id(),
            strategy,
            self.config().max_restarts,
            ctx.fork(),
        ));
        {
            let mut inner = supervisor.inner.lock();
            for spec in specs {
                inner.children.push(Child { spec, current: 0 });
            }
        }
        self.supervisors().insert(Arc::clone(&supervisor));
        let child_count = { supervisor.inner.lock().children.len() };
        for index in 0..child_count {
            self.supervisor_spawn_child(&supervisor, index);
        }
        supervisor
    }

    /// (Re)spawn the child at `index`, replacing its current actor id.
    pub fn supervisor_spawn_child(&self, supervisor: &Arc<Supervisor>, index: usize) -> ActorId {
        let behavior = {
            let inner = supervisor.inner.lock();
            let Some(child) = inner.children.get(index) else {
                return 0;
            };
            child.spec.behavior.clone()
        };
        let ctx = supervisor.ctx.lock().clone();
        let handle = self.spawn(&ctx, behavior);
        let id = handle.actor_id().unwrap_or(0);
        if let Some(child) = supervisor.inner.lock().children.get_mut(index) {
            child.current = id;
        }
        id
    }

    /// Apply the restart strategy after a child exit. Called from the
    /// death notification path with the exit reason.
    pub fn supervisor_handle_exit(
        &self,
        supervisor: &Arc<Supervisor>,
        dead_child: ActorId,
        reason: &Cell,
    ) {
        let is_error = reason.is_error();

        let (dead_index, should_restart) = {
            let inner = supervisor.inner.lock();
            if !inner.active {
                return;
            }
            let Some(index) = inner.children.iter().position(|c| c.current == dead_child) else {
                return;
            };
            let restart = match inner.children[index].spec.restart {
                RestartPolicy::Permanent => true,
                RestartPolicy::Transient => is_error,
                RestartPolicy::Temporary => false,
            };
            (index, restart)
        };

        if !should_restart {
            return;
        }

        // Restart cap: beyond it the supervisor gives up - stop the
        // remaining children and deactivate.
        {
            let mut inner = supervisor.inner.lock();
            if inner.restart_count >= supervisor.max_restarts {
                inner.active = false;
                let survivors: Vec<ActorId> =
                    inner.children.iter().map(|c| c.current).collect();
                drop(inner);
                tracing::warn!(
                    supervisor = supervisor.id(),
                    "restart cap exceeded, stopping supervisor"
                );
                for id in survivors {
                    self.stop_child(id);
                }
                self.supervisors().remove(supervisor.id());
                return;
            }
            inner.restart_count += 1;
        }

        match supervisor.strategy {
            Strategy::OneForOne => {
                self.supervisor_spawn_child(supervisor, dead_index);
            }
            Strategy::OneForAll => {
                let others: Vec<ActorId> = {
                    let inner = supervisor.inner.lock();
                    inner
                        .children
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != dead_index)
                        .map(|(_, c)| c.current)
                        .collect()
                };
                for id in others {
                    self.stop_child(id);
                }
                let count = supervisor.inner.lock().children.len();
                for index in 0..count {
                    self.supervisor_spawn_child(supervisor, index);
                }
            }
            Strategy::RestForOne => {
                let rest: Vec<ActorId> = {
                    let inner = supervisor.inner.lock();
                    inner.children[dead_index + 1..]
                        .iter()
                        .map(|c| c.current)
                        .collect()
                };
                for id in rest {
                    self.stop_child(id);
                }
                let count = supervisor.inner.lock().children.len();
                for index in dead_index..count {
                    self.supervisor_spawn_child(supervisor, index);
                }
            }
        }
    }

    /// Stop a sibling without triggering the supervisor's own exit
    /// handling (the direct-kill path skips trap checks, like a shutdown
    /// signal).
    fn stop_child(&self, id: ActorId) {
        if id == 0 {
            return;
        }
        let Some(actor) = self.actors().get(id) else {
            return;
        };
        if !actor.is_alive() {
            return;
        }
        // Deactivate supervision bookkeeping for this id first so the
        // shutdown does not recurse into handle_exit.
        self.kill_without_supervision(&actor, Cell::symbol(SHUTDOWN));
    }

    /// Look up the supervisor owning `child`, if any.
    #[must_use]
    pub fn find_supervisor_for_child(&self, child: ActorId) -> Option<Arc<Supervisor>> {
        self.supervisors().find(|sup| sup.owns_child(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;

    fn setup() -> (Arc<Runtime>, EvalCtx) {
        let rt = Runtime::new(RuntimeConfig::default());
        let ctx = EvalCtx::new(Arc::clone(&rt));
        (rt, ctx)
    }

    fn noop_behavior(ctx: &mut EvalCtx) -> Cell {
        ctx.eval(&Cell::list([
            Cell::symbol("lambda"),
            Cell::list([Cell::symbol("self")]),
            Cell::string("ok"),
        ]))
    }

    fn permanent(behavior: Cell) -> ChildSpec {
        ChildSpec {
            behavior,
            restart: RestartPolicy::Permanent,
        }
    }

    #[test]
    fn create_spawns_all_children() {
        let (rt, mut ctx) = setup();
        let b = noop_behavior(&mut ctx);
        let sup = rt.supervisor_create(
            &ctx,
            Strategy::OneForOne,
            vec![permanent(b.clone()), permanent(b.clone()), permanent(b)],
        );
        let ids = sup.child_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|&id| id != 0));
        assert_eq!(rt.actors().alive_count(), 3);
    }

    #[test]
    fn one_for_one_restarts_only_failed_child() {
        let (rt, mut ctx) = setup();
        let b = noop_behavior(&mut ctx);
        let sup = rt.supervisor_create(
            &ctx,
            Strategy::OneForOne,
            vec![permanent(b.clone()), permanent(b.clone()), permanent(b)],
        );
        let before = sup.child_ids();

        let failed = rt.actors().get(before[1]).unwrap();
        rt.kill(&failed, Cell::error("crash", Cell::nil()));

        let after = sup.child_ids();
        assert_eq!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert_eq!(after[2], before[2]);
        assert_eq!(sup.restart_count(), 1);
    }

    #[test]
    fn rest_for_one_restarts_suffix() {
        let (rt, mut ctx) = setup();
        let b = noop_behavior(&mut ctx);
        let sup = rt.supervisor_create(
            &ctx,
            Strategy::RestForOne,
            vec![permanent(b.clone()), permanent(b.clone()), permanent(b)],
        );
        let before = sup.child_ids();

        let failed = rt.actors().get(before[1]).unwrap();
        rt.kill(&failed, Cell::error("crash", Cell::nil()));

        let after = sup.child_ids();
        // Child 1 untouched; children 2 and 3 replaced.
        assert_eq!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert_ne!(after[2], before[2]);
        // The old third child was stopped.
        assert!(!rt.actors().get(before[2]).unwrap().is_alive());
    }

    #[test]
    fn one_for_all_replaces_everyone() {
        let (rt, mut ctx) = setup();
        let b = noop_behavior(&mut ctx);
        let sup = rt.supervisor_create(
            &ctx,
            Strategy::OneForAll,
            vec![permanent(b.clone()), permanent(b)],
        );
        let before = sup.child_ids();
        let failed = rt.actors().get(before[0]).unwrap();
        rt.kill(&failed, Cell::error("crash", Cell::nil()));

        let after = sup.child_ids();
        assert_ne!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert!(!rt.actors().get(before[1]).unwrap().is_alive());
    }

    #[test]
    fn temporary_children_never_restart() {
        let (rt, mut ctx) = setup();
        let b = noop_behavior(&mut ctx);
        let sup = rt.supervisor_create(
            &ctx,
            Strategy::OneForOne,
            vec![ChildSpec {
                behavior: b,
                restart: RestartPolicy::Temporary,
            }],
        );
        let before = sup.child_ids();
        let failed = rt.actors().get(before[0]).unwrap();
        rt.kill(&failed, Cell::error("crash", Cell::nil()));
        assert_eq!(sup.child_ids(), before);
        assert_eq!(sup.restart_count(), 0);
    }

    #[test]
    fn restart_cap_stops_supervisor() {
        let (rt, mut ctx) = setup();
        let b = noop_behavior(&mut ctx);
        let sup = rt.supervisor_create(&ctx, Strategy::OneForOne, vec![permanent(b)]);

        for _ in 0..=rt.config().max_restarts {
            let id = sup.child_ids()[0];
            let child = rt.actors().get(id).unwrap();
            rt.kill(&child, Cell::error("crash", Cell::nil()));
        }

        assert!(!sup.is_active());
        // All remaining children were stopped and the supervisor is gone
        // from the registry.
        assert!(rt.find_supervisor_for_child(sup.child_ids()[0]).is_none());
    }
}
