// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Environments.
//!
//! Two shapes share the cell representation:
//!
//! - *Named*: an alist of `(symbol . value)` pairs; entries nearer the head
//!   shadow later ones.
//! - *Indexed*: a list of values terminated by the sentinel symbol
//!   [`INDEXED_SENTINEL`]; lookup is by De Bruijn index from the head.
//!
//! The evaluator classifies an environment by scanning for the sentinel;
//! lambda bodies always run in indexed environments.

use crate::cell::Cell;

/// Marker symbol terminating an indexed environment.
pub const INDEXED_SENTINEL: &str = ":__indexed__";

/// An empty indexed environment: `(:__indexed__)`.
#[must_use]
pub fn indexed_empty() -> Cell {
    Cell::cons(Cell::symbol(INDEXED_SENTINEL), Cell::nil())
}

/// Classify an environment. Empty environments count as indexed; a list
/// containing the sentinel is indexed; a head binding whose car is a plain
/// (non-keyword) symbol marks a named environment.
#[must_use]
pub fn is_indexed(env: &Cell) -> bool {
    if env.is_nil() {
        return true;
    }
    if !env.is_pair() {
        return false;
    }

    let mut cursor = env.clone();
    loop {
        let pair = cursor.as_pair().map(|(h, t)| (h.clone(), t.clone()));
        let Some((head, tail)) = pair else { break };
        if head.as_symbol() == Some(INDEXED_SENTINEL) {
            return true;
        }
        cursor = tail;
    }

    // No sentinel: a named environment starts with a (symbol . value) pair.
    if let Some((binding, _)) = env.as_pair()
        && let Some((var, _)) = binding.as_pair()
        && let Some(name) = var.as_symbol()
        && !name.starts_with(':')
    {
        return false;
    }
    true
}

/// De Bruijn lookup in an indexed environment, skipping the sentinel.
#[must_use]
pub fn lookup_index(env: &Cell, index: usize) -> Option<Cell> {
    let mut cursor = env.clone();
    let mut remaining = index;
    loop {
        let pair = cursor.as_pair().map(|(h, t)| (h.clone(), t.clone()));
        let (head, tail) = pair?;
        if head.as_symbol() == Some(INDEXED_SENTINEL) {
            cursor = tail;
            continue;
        }
        if remaining == 0 {
            return Some(head);
        }
        remaining -= 1;
        cursor = tail;
    }
}

/// Walk a named environment for the innermost binding of `name`.
#[must_use]
pub fn lookup_named(env: &Cell, name: &str) -> Option<Cell> {
    let mut cursor = env.clone();
    loop {
        let pair = cursor.as_pair().map(|(h, t)| (h.clone(), t.clone()));
        let (binding, tail) = pair?;
        if let Some((var, value)) = binding.as_pair()
            && var.as_symbol() == Some(name)
        {
            return Some(value.clone());
        }
        cursor = tail;
    }
}

/// Prepend a binding to a named environment.
#[must_use]
pub fn bind_named(env: &Cell, name: &str, value: Cell) -> Cell {
    Cell::cons(Cell::cons(Cell::symbol(name), value), env.clone())
}

/// Extend an environment with argument values (prepended in order, so the
/// first argument lands at index 0). Extending nil creates a fresh indexed
/// environment by appending the sentinel.
#[must_use]
pub fn extend(env: &Cell, args: &Cell) -> Cell {
    match args.as_pair() {
        None => {
            if env.is_nil() {
                indexed_empty()
            } else {
                env.clone()
            }
        }
        Some((first, rest)) => {
            let extended_rest = extend(env, rest);
            Cell::cons(first.clone(), extended_rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_is_indexed() {
        assert!(is_indexed(&Cell::nil()));
        assert!(is_indexed(&indexed_empty()));
    }

    #[test]
    fn named_env_is_not_indexed() {
        let env = bind_named(&Cell::nil(), "x", Cell::int(1));
        assert!(!is_indexed(&env));
    }

    #[test]
    fn extend_builds_indexed_env() {
        let args = Cell::list([Cell::int(10), Cell::int(20)]);
        let env = extend(&Cell::nil(), &args);
        assert!(is_indexed(&env));
        assert_eq!(lookup_index(&env, 0), Some(Cell::int(10)));
        assert_eq!(lookup_index(&env, 1), Some(Cell::int(20)));
        assert_eq!(lookup_index(&env, 2), None);
    }

    #[test]
    fn extend_stacks_scopes() {
        let outer = extend(&Cell::nil(), &Cell::list([Cell::int(1)]));
        let inner = extend(&outer, &Cell::list([Cell::int(2)]));
        assert_eq!(lookup_index(&inner, 0), Some(Cell::int(2)));
        assert_eq!(lookup_index(&inner, 1), Some(Cell::int(1)));
    }

    #[test]
    fn named_lookup_shadows() {
        let env = bind_named(&Cell::nil(), "x", Cell::int(1));
        let env = bind_named(&env, "x", Cell::int(2));
        assert_eq!(lookup_named(&env, "x"), Some(Cell::int(2)));
        assert_eq!(lookup_named(&env, "y"), None);
    }

    #[test]
    fn sentinel_skipped_by_index_lookup() {
        // Sentinel at the head (mid-chain after nested extensions).
        let env = Cell::list([
            Cell::symbol(INDEXED_SENTINEL),
            Cell::int(5),
            Cell::int(6),
        ]);
        assert_eq!(lookup_index(&env, 0), Some(Cell::int(5)));
        assert_eq!(lookup_index(&env, 1), Some(Cell::int(6)));
    }
}
