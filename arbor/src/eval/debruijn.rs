// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Conversion of named lambda bodies to De Bruijn form.
//!
//! Bound occurrences become index cells (the innermost binder's first
//! parameter is index 0); free symbols stay symbols and resolve through the
//! context at call time. Bare numeric literals are wrapped in `quote` so
//! they can never alias an index. Nested lambdas are rewritten to the
//! already-converted marker form so the evaluator does not convert twice,
//! and `match` clauses extend the scope with their pattern variables.

use crate::cell::Cell;
use crate::pattern;

/// Marker head for a lambda whose body is already in De Bruijn form:
/// `(:__converted__ (params...) body)`.
pub(crate) const CONVERTED_MARKER: &str = ":__converted__";

/// Stack of binder scopes, innermost last.
pub(crate) struct NameContext {
    scopes: Vec<Vec<String>>,
}

impl NameContext {
    pub(crate) fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    pub(crate) fn with_scope(names: Vec<String>) -> Self {
        Self {
            scopes: vec![names],
        }
    }

    fn push(&mut self, names: Vec<String>) {
        self.scopes.push(names);
    }

    fn pop(&mut self) {
        self.scopes.pop();
    }

    /// Resolve to a De Bruijn index: position within the innermost scope
    /// that binds the name, offset by the sizes of the scopes inside it.
    fn resolve(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for scope in self.scopes.iter().rev() {
            if let Some(pos) = scope.iter().position(|n| n == name) {
                return Some(offset + pos);
            }
            offset += scope.len();
        }
        None
    }
}

/// Parameter names of a `(lambda (p...) body)` form's parameter list.
pub(crate) fn param_names(params: &Cell) -> Vec<String> {
    params
        .iter_list()
        .filter_map(|p| p.as_symbol().map(str::to_owned))
        .collect()
}

/// Convert `expr` under the binders in `ctx`.
pub(crate) fn convert(expr: &Cell, ctx: &mut NameContext) -> Cell {
    // Bound symbols become indices; free symbols stay for global lookup.
    if let Some(name) = expr.as_symbol() {
        if name.starts_with(':') {
            return expr.clone();
        }
        if let Some(index) = ctx.resolve(name) {
            #[expect(clippy::cast_precision_loss, reason = "indices are tiny")]
            return Cell::number(index as f64);
        }
        return expr.clone();
    }

    // Bare numeric literals would alias indices in an indexed environment;
    // quote them.
    if expr.is_number() || expr.is_int() {
        return Cell::list([Cell::symbol("quote"), expr.clone()]);
    }

    let Some((head, rest)) = expr.as_pair().map(|(h, t)| (h.clone(), t.clone())) else {
        return expr.clone();
    };

    if let Some(op) = head.as_symbol() {
        match op {
            // Quoted data is untouched; macro templates likewise.
            "quote" | "defmacro" => return expr.clone(),
            // Already converted (nested lambda from an outer pass).
            CONVERTED_MARKER => return expr.clone(),
            "quasiquote" => {
                let arg = rest.car().cloned().unwrap_or_else(Cell::nil);
                return Cell::list([head, convert_quasi(&arg, ctx)]);
            }
            "lambda" => {
                let params = rest.car().cloned().unwrap_or_else(Cell::nil);
                let body = rest.list_nth(1).unwrap_or_else(Cell::nil);
                ctx.push(param_names(&params));
                let converted = convert(&body, ctx);
                ctx.pop();
                return Cell::list([Cell::symbol(CONVERTED_MARKER), params, converted]);
            }
            "define" => {
                let name = rest.car().cloned().unwrap_or_else(Cell::nil);
                let value = rest.list_nth(1).unwrap_or_else(Cell::nil);
                return Cell::list([head, name, convert(&value, ctx)]);
            }
            "match" => {
                let scrutinee = rest.car().cloned().unwrap_or_else(Cell::nil);
                let mut out = vec![head, convert(&scrutinee, ctx)];
                let mut clause_cursor = rest.cdr().cloned().unwrap_or_else(Cell::nil);
                loop {
                    let pair = clause_cursor.as_pair().map(|(h, t)| (h.clone(), t.clone()));
                    let Some((clause, tail)) = pair else { break };
                    out.push(convert_clause(&clause, ctx));
                    clause_cursor = tail;
                }
                return Cell::list(out);
            }
            _ => {}
        }
    }

    // Application (or plain data pair): convert both sides.
    let converted_head = convert(&head, ctx);
    let converted_rest = convert(&rest, ctx);
    Cell::cons(converted_head, converted_rest)
}

/// A match clause is `(pattern body)` or `(pattern | guard body)`; the
/// pattern is untouched, the guard and body see the pattern variables.
fn convert_clause(clause: &Cell, ctx: &mut NameContext) -> Cell {
    let items: Vec<Cell> = clause.iter_list().collect();
    if items.is_empty() {
        return clause.clone();
    }
    let pattern = items[0].clone();
    let mut vars = Vec::new();
    pattern::collect_vars(&pattern, &mut vars);
    ctx.push(vars);
    let converted = if items.len() == 4 && items[1].as_symbol() == Some("|") {
        Cell::list([
            pattern,
            items[1].clone(),
            convert(&items[2], ctx),
            convert(&items[3], ctx),
        ])
    } else if items.len() >= 2 {
        Cell::list([pattern, convert(&items[1], ctx)])
    } else {
        clause.clone()
    };
    ctx.pop();
    converted
}

/// Inside a quasiquote template only `(unquote e)` sub-forms are live code.
fn convert_quasi(template: &Cell, ctx: &mut NameContext) -> Cell {
    if let Some((head, rest)) = template.as_pair().map(|(h, t)| (h.clone(), t.clone())) {
        if head.as_symbol() == Some("unquote") {
            let arg = rest.car().cloned().unwrap_or_else(Cell::nil);
            return Cell::list([head, convert(&arg, ctx)]);
        }
        return Cell::cons(convert_quasi(&head, ctx), convert_quasi(&rest, ctx));
    }
    template.clone()
}
