// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The macro registry.
//!
//! Macros are templates: a parameter list and an unevaluated body. The
//! evaluator runs expansion as a pre-pass - a pair whose head names a
//! registered macro is rewritten by substituting the (unevaluated) call
//! arguments for the parameters, and evaluation loops on the result, so
//! expansion is recursive.

use crate::cell::Cell;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub params: Cell,
    pub body: Cell,
}

/// Process-wide macro table. Redefinition replaces the previous entry.
#[derive(Debug, Default)]
pub struct MacroRegistry {
    table: RwLock<HashMap<String, MacroDef>>,
    gensym: AtomicU64,
}

// === impl MacroRegistry ===

impl MacroRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: &str, params: Cell, body: Cell) {
        self.table
            .write()
            .insert(name.to_owned(), MacroDef { params, body });
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<MacroDef> {
        self.table.read().get(name).cloned()
    }

    /// Is `expr` a call whose head names a registered macro?
    #[must_use]
    pub fn is_macro_call(&self, expr: &Cell) -> bool {
        expr.car()
            .and_then(|head| head.as_symbol())
            .is_some_and(|name| self.table.read().contains_key(name))
    }

    /// A fresh symbol for hygiene-sensitive templates.
    #[must_use]
    pub fn gensym(&self, prefix: &str) -> Cell {
        let n = self.gensym.fetch_add(1, Ordering::Relaxed);
        Cell::symbol(&format!("{prefix}__g{n}"))
    }

    /// Expand one macro call. Returns an error cell on arity mismatch.
    #[must_use]
    pub fn expand(&self, expr: &Cell) -> Cell {
        let Some(head) = expr.car() else {
            return expr.clone();
        };
        let Some(name) = head.as_symbol() else {
            return expr.clone();
        };
        let Some(def) = self.lookup(name) else {
            return expr.clone();
        };

        let args = expr.cdr().cloned().unwrap_or_else(Cell::nil);
        let bindings = match build_bindings(&def.params, &args) {
            Ok(bindings) => bindings,
            Err(err) => return err,
        };
        substitute(&def.body, &bindings)
    }

    pub fn reset(&self) {
        self.table.write().clear();
    }
}

/// Pair up parameters with unevaluated arguments.
fn build_bindings(params: &Cell, args: &Cell) -> Result<Vec<(String, Cell)>, Cell> {
    let mut bindings = Vec::new();
    let mut p = params.clone();
    let mut a = args.clone();
    loop {
        let p_pair = p.as_pair().map(|(h, t)| (h.clone(), t.clone()));
        match p_pair {
            None => break,
            Some((param, p_rest)) => {
                let Some(name) = param.as_symbol() else {
                    return Err(Cell::error("invalid-macro-params", param.clone()));
                };
                let a_pair = a.as_pair().map(|(h, t)| (h.clone(), t.clone()));
                let Some((arg, a_rest)) = a_pair else {
                    return Err(Cell::error("macro-arg-count-mismatch", Cell::nil()));
                };
                bindings.push((name.to_owned(), arg));
                p = p_rest;
                a = a_rest;
            }
        }
    }
    if a.is_pair() {
        return Err(Cell::error("macro-arg-count-mismatch", Cell::nil()));
    }
    Ok(bindings)
}

/// Walk the template, replacing bound parameter symbols with their
/// (unevaluated) arguments.
fn substitute(template: &Cell, bindings: &[(String, Cell)]) -> Cell {
    if let Some(name) = template.as_symbol() {
        for (param, arg) in bindings {
            if param == name {
                return arg.clone();
            }
        }
        return template.clone();
    }
    if let Some((car, cdr)) = template.as_pair() {
        return Cell::cons(substitute(car, bindings), substitute(cdr, bindings));
    }
    template.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Cell {
        Cell::symbol(s)
    }

    #[test]
    fn expand_substitutes_unevaluated_args() {
        let reg = MacroRegistry::new();
        // (defmacro twice (x) (+ x x))
        reg.define(
            "twice",
            Cell::list([sym("x")]),
            Cell::list([sym("+"), sym("x"), sym("x")]),
        );
        let call = Cell::list([sym("twice"), Cell::list([sym("f"), Cell::int(1)])]);
        let expanded = reg.expand(&call);
        let expected = Cell::list([
            sym("+"),
            Cell::list([sym("f"), Cell::int(1)]),
            Cell::list([sym("f"), Cell::int(1)]),
        ]);
        assert_eq!(expanded, expected);
    }

    #[test]
    fn arity_mismatch_is_an_error_cell() {
        let reg = MacroRegistry::new();
        reg.define("m", Cell::list([sym("a"), sym("b")]), sym("a"));
        let call = Cell::list([sym("m"), Cell::int(1)]);
        let expanded = reg.expand(&call);
        assert_eq!(expanded.error_kind(), Some("macro-arg-count-mismatch"));
    }

    #[test]
    fn redefinition_replaces() {
        let reg = MacroRegistry::new();
        reg.define("m", Cell::list([sym("x")]), sym("x"));
        reg.define("m", Cell::list([sym("x")]), Cell::int(9));
        let call = Cell::list([sym("m"), Cell::int(1)]);
        assert_eq!(reg.expand(&call), Cell::int(9));
    }

    #[test]
    fn gensyms_are_unique() {
        let reg = MacroRegistry::new();
        assert_ne!(reg.gensym("tmp"), reg.gensym("tmp"));
    }
}
