// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hash-map cells.
//!
//! Storage is `hashbrown`'s Swiss-table layout: a control-byte array
//! (empty / deleted / 7-bit hash metadata) with a mirrored group tail so
//! group probes never wrap, and a parallel slot array. Keys compare by the
//! structural [`Cell`] equality, so a missing key is always distinguishable
//! from a key bound to nil.

use super::Cell;
use hashbrown::HashMap;

/// The mutable table behind a map cell.
#[derive(Debug, Default)]
pub struct CellMap {
    entries: HashMap<Cell, Cell>,
}

// === impl CellMap ===

impl CellMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Bind `key` to `value`, returning the previous binding if any.
    pub fn put(&mut self, key: Cell, value: Cell) -> Option<Cell> {
        self.entries.insert(key, value)
    }

    /// `None` means the key is absent - distinct from a key bound to nil.
    #[must_use]
    pub fn get(&self, key: &Cell) -> Option<Cell> {
        self.entries.get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &Cell) -> bool {
        self.entries.contains_key(key)
    }

    pub fn delete(&mut self, key: &Cell) -> Option<Cell> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All keys, as a list cell.
    #[must_use]
    pub fn keys(&self) -> Cell {
        Cell::list(self.entries.keys().cloned().collect::<Vec<_>>())
    }

    /// All values, as a list cell.
    #[must_use]
    pub fn values(&self) -> Cell {
        Cell::list(self.entries.values().cloned().collect::<Vec<_>>())
    }

    /// All entries, as a list of `(key . value)` pairs.
    #[must_use]
    pub fn entries(&self) -> Cell {
        Cell::list(
            self.entries
                .iter()
                .map(|(k, v)| Cell::cons(k.clone(), v.clone()))
                .collect::<Vec<_>>(),
        )
    }

    /// Merge `other` into a copy of `self`; bindings in `other` win.
    #[must_use]
    pub fn merge(&self, other: &CellMap) -> CellMap {
        let mut merged = HashMap::with_capacity(self.entries.len() + other.entries.len());
        for (k, v) in &self.entries {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.entries {
            merged.insert(k.clone(), v.clone());
        }
        CellMap { entries: merged }
    }
}

// === map operations on Cell handles ===

impl Cell {
    /// Insert into a map cell. Returns the map itself, or an error cell if
    /// `self` is not a map.
    pub fn map_put(&self, key: Cell, value: Cell) -> Cell {
        match self.kind() {
            super::CellKind::Map(m) => {
                m.lock().put(key, value);
                self.clone()
            }
            _ => Cell::error("not-a-map", self.clone()),
        }
    }

    /// Look up a key in a map cell. `None` for a missing key (distinct from
    /// a nil binding) or when `self` is not a map.
    #[must_use]
    pub fn map_get(&self, key: &Cell) -> Option<Cell> {
        match self.kind() {
            super::CellKind::Map(m) => m.lock().get(key),
            _ => None,
        }
    }

    /// Remove a key from a map cell, returning the removed value.
    pub fn map_delete(&self, key: &Cell) -> Option<Cell> {
        match self.kind() {
            super::CellKind::Map(m) => m.lock().delete(key),
            _ => None,
        }
    }

    #[must_use]
    pub fn map_len(&self) -> usize {
        match self.kind() {
            super::CellKind::Map(m) => m.lock().len(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn map_keys(&self) -> Cell {
        match self.kind() {
            super::CellKind::Map(m) => m.lock().keys(),
            _ => Cell::nil(),
        }
    }

    #[must_use]
    pub fn map_values(&self) -> Cell {
        match self.kind() {
            super::CellKind::Map(m) => m.lock().values(),
            _ => Cell::nil(),
        }
    }

    #[must_use]
    pub fn map_entries(&self) -> Cell {
        match self.kind() {
            super::CellKind::Map(m) => m.lock().entries(),
            _ => Cell::nil(),
        }
    }

    /// Merge two map cells into a fresh one; bindings in `other` win.
    pub fn map_merge(&self, other: &Cell) -> Cell {
        match (self.kind(), other.kind()) {
            (super::CellKind::Map(a), super::CellKind::Map(b)) => {
                // Merging a map with itself must not take its lock twice.
                let merged = if self.ptr_eq(other) {
                    let guard = a.lock();
                    guard.merge(&CellMap::new())
                } else {
                    a.lock().merge(&b.lock())
                };
                Cell::from_kind(super::CellKind::Map(parking_lot::Mutex::new(merged)))
            }
            _ => Cell::error("not-a-map", self.clone()),
        }
    }
}
