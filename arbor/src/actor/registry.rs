// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide registries: actors by id, supervisors, named processes,
//! and ETS tables.
//!
//! All tables are sharded concurrent maps with explicit reset hooks; ids
//! are allocated from monotonic counters starting at 1 (0 is reserved to
//! mean "none" throughout the scheduler).

use super::Actor;
use super::supervisor::Supervisor;
use crate::cell::{ActorId, Cell};
use crate::error::RegistryError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Cap on named-process registrations.
pub const MAX_NAMES: usize = 256;
/// Cap on entries per ETS table.
pub const MAX_ETS_ENTRIES: usize = 256;

/// Actors by id, plus the global alive counter the scheduler's termination
/// check reads.
pub struct ActorRegistry {
    map: DashMap<ActorId, Arc<Actor>>,
    next: AtomicU64,
    alive: AtomicI64,
}

// === impl ActorRegistry ===

impl ActorRegistry {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
            next: AtomicU64::new(1),
            alive: AtomicI64::new(0),
        }
    }

    pub(crate) fn allocate_id(&self) -> ActorId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, actor: Arc<Actor>) {
        self.alive.fetch_add(1, Ordering::AcqRel);
        self.map.insert(actor.id(), actor);
    }

    #[must_use]
    pub fn get(&self, id: ActorId) -> Option<Arc<Actor>> {
        self.map.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: ActorId) {
        self.map.remove(&id);
    }

    /// All registered ids, unordered.
    #[must_use]
    pub fn ids(&self) -> Vec<ActorId> {
        self.map.iter().map(|entry| *entry.key()).collect()
    }

    #[must_use]
    pub fn alive_count(&self) -> i64 {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn alive_dec(&self) {
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop every actor and reset the id allocator. Only sound between
    /// scheduler runs.
    pub(crate) fn reset(&self) {
        self.map.clear();
        self.next.store(1, Ordering::Relaxed);
        self.alive.store(0, Ordering::Relaxed);
    }
}

/// Supervisors by id.
pub struct SupervisorRegistry {
    map: DashMap<u64, Arc<Supervisor>>,
    next: AtomicU64,
}

// === impl SupervisorRegistry ===

impl SupervisorRegistry {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, supervisor: Arc<Supervisor>) {
        self.map.insert(supervisor.id(), supervisor);
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Supervisor>> {
        self.map.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: u64) {
        self.map.remove(&id);
    }

    pub(crate) fn find(
        &self,
        predicate: impl Fn(&Arc<Supervisor>) -> bool,
    ) -> Option<Arc<Supervisor>> {
        self.map
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn reset(&self) {
        self.map.clear();
        self.next.store(1, Ordering::Relaxed);
    }
}

/// The named-process registry: name → actor id.
pub struct NameRegistry {
    map: DashMap<String, ActorId>,
}

// === impl NameRegistry ===

impl NameRegistry {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Register `name` → `id`. The id must name a live actor, each name
    /// maps to one actor, and each actor holds at most one name.
    pub fn register(
        &self,
        name: &str,
        id: ActorId,
        actors: &ActorRegistry,
    ) -> Result<(), RegistryError> {
        let Some(actor) = actors.get(id) else {
            return Err(RegistryError::NotFound);
        };
        if !actor.is_alive() {
            return Err(RegistryError::Dead);
        }
        if self.map.len() >= MAX_NAMES {
            return Err(RegistryError::Full);
        }
        if self.map.iter().any(|entry| *entry.value() == id) {
            return Err(RegistryError::DuplicateActor);
        }
        if self.map.contains_key(name) {
            return Err(RegistryError::DuplicateName);
        }
        self.map.insert(name.to_owned(), id);
        Ok(())
    }

    /// `None` when the name is unbound.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<ActorId> {
        self.map.get(name).map(|entry| *entry.value())
    }

    pub fn unregister_name(&self, name: &str) -> Result<(), RegistryError> {
        self.map
            .remove(name)
            .map(|_| ())
            .ok_or(RegistryError::NotFound)
    }

    /// Silent if the actor holds no name.
    pub fn unregister_actor(&self, id: ActorId) {
        self.map.retain(|_, &mut bound| bound != id);
    }

    /// All registered names as a list of symbols.
    #[must_use]
    pub fn list(&self) -> Cell {
        Cell::list(
            self.map
                .iter()
                .map(|entry| Cell::symbol(entry.key()))
                .collect::<Vec<_>>(),
        )
    }

    pub(crate) fn reset(&self) {
        self.map.clear();
    }
}

/// One named ETS table: owned by an actor, destroyed with it.
pub struct EtsTable {
    owner: ActorId,
    entries: Mutex<Vec<(Cell, Cell)>>,
}

impl EtsTable {
    #[must_use]
    pub fn owner(&self) -> ActorId {
        self.owner
    }
}

/// Erlang Term Storage: named, process-wide key→value tables.
pub struct EtsRegistry {
    tables: DashMap<String, EtsTable>,
}

// === impl EtsRegistry ===

impl EtsRegistry {
    pub(crate) fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    /// Create a table owned by `owner` (0 when created outside an actor).
    pub fn create(&self, name: &str, owner: ActorId) -> Result<(), RegistryError> {
        if self.tables.contains_key(name) {
            return Err(RegistryError::DuplicateName);
        }
        self.tables.insert(
            name.to_owned(),
            EtsTable {
                owner,
                entries: Mutex::new(Vec::new()),
            },
        );
        Ok(())
    }

    pub fn insert(&self, name: &str, key: Cell, value: Cell) -> Result<(), RegistryError> {
        let table = self.tables.get(name).ok_or(RegistryError::NotFound)?;
        let mut entries = table.entries.lock();
        for entry in entries.iter_mut() {
            if entry.0 == key {
                entry.1 = value;
                return Ok(());
            }
        }
        if entries.len() >= MAX_ETS_ENTRIES {
            return Err(RegistryError::Full);
        }
        entries.push((key, value));
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str, key: &Cell) -> Option<Cell> {
        let table = self.tables.get(name)?;
        let entries = table.entries.lock();
        entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn delete_key(&self, name: &str, key: &Cell) -> Result<(), RegistryError> {
        let table = self.tables.get(name).ok_or(RegistryError::NotFound)?;
        let mut entries = table.entries.lock();
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        if entries.len() == before {
            return Err(RegistryError::NotFound);
        }
        Ok(())
    }

    pub fn delete_table(&self, name: &str) -> Result<(), RegistryError> {
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or(RegistryError::NotFound)
    }

    /// Entry count, or `None` for an unknown table.
    #[must_use]
    pub fn size(&self, name: &str) -> Option<usize> {
        self.tables.get(name).map(|t| t.entries.lock().len())
    }

    /// All entries as a list of `(key value)` pairs.
    #[must_use]
    pub fn all(&self, name: &str) -> Option<Cell> {
        let table = self.tables.get(name)?;
        let entries = table.entries.lock();
        Some(Cell::list(
            entries
                .iter()
                .map(|(k, v)| Cell::list([k.clone(), v.clone()]))
                .collect::<Vec<_>>(),
        ))
    }

    /// Drop every table owned by a dying actor.
    pub fn destroy_by_owner(&self, owner: ActorId) {
        self.tables.retain(|_, table| table.owner != owner);
    }

    pub(crate) fn reset(&self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::EvalCtx;
    use crate::sched::Runtime;
    use crate::RuntimeConfig;

    fn setup() -> (Arc<Runtime>, EvalCtx) {
        let rt = Runtime::new(RuntimeConfig::default());
        let ctx = EvalCtx::new(Arc::clone(&rt));
        (rt, ctx)
    }

    fn spawn_one(rt: &Arc<Runtime>, ctx: &mut EvalCtx) -> ActorId {
        let behavior = ctx.eval(&Cell::list([
            Cell::symbol("lambda"),
            Cell::list([Cell::symbol("self")]),
            Cell::nil(),
        ]));
        rt.spawn(ctx, behavior).actor_id().unwrap()
    }

    #[test]
    fn name_registry_round_trip() {
        let (rt, mut ctx) = setup();
        let id = spawn_one(&rt, &mut ctx);
        rt.names().register("worker", id, rt.actors()).unwrap();
        assert_eq!(rt.names().lookup("worker"), Some(id));
        assert_eq!(rt.names().list().list_len(), 1);
        rt.names().unregister_name("worker").unwrap();
        assert_eq!(rt.names().lookup("worker"), None);
    }

    #[test]
    fn duplicate_names_and_actors_rejected() {
        let (rt, mut ctx) = setup();
        let a = spawn_one(&rt, &mut ctx);
        let b = spawn_one(&rt, &mut ctx);
        rt.names().register("a", a, rt.actors()).unwrap();
        assert_eq!(
            rt.names().register("a", b, rt.actors()),
            Err(RegistryError::DuplicateName)
        );
        assert_eq!(
            rt.names().register("alias", a, rt.actors()),
            Err(RegistryError::DuplicateActor)
        );
    }

    #[test]
    fn dead_actors_cannot_register() {
        let (rt, mut ctx) = setup();
        let id = spawn_one(&rt, &mut ctx);
        let actor = rt.actors().get(id).unwrap();
        rt.finish(&actor, Cell::nil());
        assert_eq!(
            rt.names().register("dead", id, rt.actors()),
            Err(RegistryError::Dead)
        );
    }

    #[test]
    fn ets_tables_die_with_owner() {
        let (rt, mut ctx) = setup();
        let id = spawn_one(&rt, &mut ctx);
        rt.ets().create("cache", id).unwrap();
        rt.ets()
            .insert("cache", Cell::symbol(":k"), Cell::int(1))
            .unwrap();
        assert_eq!(
            rt.ets().lookup("cache", &Cell::symbol(":k")),
            Some(Cell::int(1))
        );
        assert_eq!(rt.ets().size("cache"), Some(1));

        let actor = rt.actors().get(id).unwrap();
        rt.finish(&actor, Cell::nil());
        assert_eq!(rt.ets().size("cache"), None);
    }

    #[test]
    fn ets_insert_overwrites_and_deletes() {
        let (rt, _ctx) = setup();
        rt.ets().create("t", 0).unwrap();
        rt.ets().insert("t", Cell::int(1), Cell::int(10)).unwrap();
        rt.ets().insert("t", Cell::int(1), Cell::int(20)).unwrap();
        assert_eq!(rt.ets().lookup("t", &Cell::int(1)), Some(Cell::int(20)));
        assert_eq!(rt.ets().size("t"), Some(1));
        rt.ets().delete_key("t", &Cell::int(1)).unwrap();
        assert_eq!(
            rt.ets().delete_key("t", &Cell::int(1)),
            Err(RegistryError::NotFound)
        );
        rt.ets().delete_table("t").unwrap();
        assert_eq!(rt.ets().size("t"), None);
    }

    #[test]
    fn death_unregisters_name() {
        let (rt, mut ctx) = setup();
        let id = spawn_one(&rt, &mut ctx);
        rt.names().register("tmp", id, rt.actors()).unwrap();
        let actor = rt.actors().get(id).unwrap();
        rt.finish(&actor, Cell::nil());
        assert_eq!(rt.names().lookup("tmp"), None);
    }
}
