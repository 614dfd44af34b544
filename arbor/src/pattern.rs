// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pattern matching.
//!
//! Patterns: wildcard `_`, literals (numbers, booleans, keywords, nil,
//! strings), variables (non-keyword symbols, bound on success), pair
//! patterns (head and tail), and structure patterns - `(:Tag p...)` for
//! leaves, `(:Tag :Variant p...)` for nodes.
//!
//! A clause is `(pattern body)` or `(pattern | guard body)`; the guard runs
//! in the extended environment after a successful structural match and a
//! non-true guard rejects the clause. Exhaustiveness is checked statically:
//! clauses after a guardless catch-all are flagged unreachable through the
//! diagnostics channel, and a match that falls off the end yields a
//! `no-match` error. Diagnostics never abort execution.

use crate::cell::Cell;
use crate::eval::{EvalCtx, eval_in};
use crate::env;

/// Collect pattern variables in binding order (depth-first,
/// left-to-right). The De Bruijn converter and the runtime binder must
/// agree on this order.
pub(crate) fn collect_vars(pattern: &Cell, out: &mut Vec<String>) {
    if let Some(name) = pattern.as_symbol() {
        if name != "_" && !name.starts_with(':') {
            out.push(name.to_owned());
        }
        return;
    }
    if let Some((car, cdr)) = pattern.as_pair() {
        collect_vars(car, out);
        collect_vars(cdr, out);
    }
}

/// A guardless catch-all (wildcard or bare variable) makes a clause list
/// complete.
fn is_catch_all(pattern: &Cell) -> bool {
    pattern
        .as_symbol()
        .is_some_and(|name| !name.starts_with(':'))
}

struct Clause {
    pattern: Cell,
    guard: Option<Cell>,
    body: Cell,
}

fn parse_clause(clause: &Cell) -> Option<Clause> {
    let items: Vec<Cell> = clause.iter_list().collect();
    match items.len() {
        2 => Some(Clause {
            pattern: items[0].clone(),
            guard: None,
            body: items[1].clone(),
        }),
        4 if items[1].as_symbol() == Some("|") => Some(Clause {
            pattern: items[0].clone(),
            guard: Some(items[2].clone()),
            body: items[3].clone(),
        }),
        _ => None,
    }
}

/// Match `scrutinee` against the clause list, evaluating the first
/// matching clause's body in the extended environment.
pub fn eval_match(ctx: &mut EvalCtx, env: &Cell, scrutinee: &Cell, clauses: &Cell) -> Cell {
    // Static reachability scan: anything after a guardless catch-all can
    // never match.
    let mut complete_at = None;
    for (index, clause) in clauses.iter_list().enumerate() {
        if let Some(parsed) = parse_clause(&clause) {
            if let Some(at) = complete_at {
                tracing::warn!(
                    clause = index,
                    catch_all = at,
                    "unreachable match clause after catch-all"
                );
                continue;
            }
            if parsed.guard.is_none() && is_catch_all(&parsed.pattern) {
                complete_at = Some(index);
            }
        }
    }

    for clause in clauses.iter_list() {
        let Some(parsed) = parse_clause(&clause) else {
            tracing::warn!(clause = %clause, "malformed match clause");
            continue;
        };

        let mut bindings = Vec::new();
        if !match_pattern(&parsed.pattern, scrutinee, &mut bindings) {
            continue;
        }

        let extended = extend_with_bindings(env, &bindings);

        if let Some(guard) = &parsed.guard {
            let verdict = eval_in(ctx, &extended, guard);
            if !verdict.is_truthy() {
                continue;
            }
        }

        return eval_in(ctx, &extended, &parsed.body);
    }

    Cell::error("no-match", scrutinee.clone())
}

/// Bind pattern variables. Indexed environments get the values pushed
/// positionally (the converter numbered the variables in the same order);
/// named environments get `(symbol . value)` entries.
fn extend_with_bindings(env: &Cell, bindings: &[(String, Cell)]) -> Cell {
    if env::is_indexed(env) && !env.is_nil() {
        let values = Cell::list(bindings.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>());
        env::extend(env, &values)
    } else {
        let mut extended = env.clone();
        // Reverse so the first-collected variable is the innermost entry.
        for (name, value) in bindings.iter().rev() {
            extended = env::bind_named(&extended, name, value.clone());
        }
        extended
    }
}

fn match_pattern(pattern: &Cell, value: &Cell, bindings: &mut Vec<(String, Cell)>) -> bool {
    // Symbols: wildcard, keyword literal, or binding variable.
    if let Some(name) = pattern.as_symbol() {
        if name == "_" {
            return true;
        }
        if name.starts_with(':') {
            return pattern == value;
        }
        bindings.push((name.to_owned(), value.clone()));
        return true;
    }

    // Pair patterns; a keyword head matching a structure value selects a
    // structure pattern. Against plain pairs a keyword head is an ordinary
    // literal, so message shapes like `(:exit-from id reason)` destructure.
    if let Some((head, _)) = pattern.as_pair() {
        if head.is_keyword() && value.is_struct() {
            return match_struct(pattern, value, bindings);
        }
        let Some((value_car, value_cdr)) = value.as_pair() else {
            return false;
        };
        let (pat_car, pat_cdr) = pattern.as_pair().expect("checked pair");
        return match_pattern(pat_car, value_car, bindings)
            && match_pattern(pat_cdr, value_cdr, bindings);
    }

    // Remaining patterns are literals.
    pattern == value
}

fn match_struct(pattern: &Cell, value: &Cell, bindings: &mut Vec<(String, Cell)>) -> bool {
    let Some(data) = value.as_struct() else {
        return false;
    };
    let items: Vec<Cell> = pattern.iter_list().collect();
    if items.is_empty() || items[0] != data.type_tag {
        return false;
    }

    let field_patterns = match &data.variant {
        // Node structures: `(:Tag :Variant p...)`.
        Some(variant) => {
            if items.len() < 2 || &items[1] != variant {
                return false;
            }
            &items[2..]
        }
        // Leaf structures: `(:Tag p...)`.
        None => &items[1..],
    };

    let field_values: Vec<Cell> = data
        .fields
        .iter_list()
        .filter_map(|binding| binding.cdr().cloned())
        .collect();
    if field_patterns.len() != field_values.len() {
        return false;
    }
    field_patterns
        .iter()
        .zip(field_values.iter())
        .all(|(p, v)| match_pattern(p, v, bindings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::StructKind;
    use crate::sched::Runtime;
    use crate::RuntimeConfig;

    fn sym(s: &str) -> Cell {
        Cell::symbol(s)
    }

    fn ctx() -> EvalCtx {
        EvalCtx::new(Runtime::new(RuntimeConfig::default()))
    }

    fn clause(pattern: Cell, body: Cell) -> Cell {
        Cell::list([pattern, body])
    }

    #[test]
    fn literal_and_wildcard() {
        let mut ctx = ctx();
        let clauses = Cell::list([
            clause(Cell::int(1), Cell::string("one")),
            clause(sym("_"), Cell::string("other")),
        ]);
        let env = Cell::nil();
        assert_eq!(
            eval_match(&mut ctx, &env, &Cell::int(1), &clauses),
            Cell::string("one")
        );
        assert_eq!(
            eval_match(&mut ctx, &env, &Cell::int(9), &clauses),
            Cell::string("other")
        );
    }

    #[test]
    fn variable_binds_in_body() {
        let mut ctx = ctx();
        // (match 5 (x (+ x 1)))  at top level: named binding.
        let env = ctx.global_env().clone();
        let clauses = Cell::list([clause(
            sym("x"),
            Cell::list([sym("+"), sym("x"), Cell::int(1)]),
        )]);
        assert_eq!(
            eval_match(&mut ctx, &env, &Cell::int(5), &clauses),
            Cell::int(6)
        );
    }

    #[test]
    fn pair_pattern_destructures() {
        let mut ctx = ctx();
        let env = Cell::nil();
        // (match '(1 2) ((a b) b))
        let pattern = Cell::list([sym("a"), sym("b")]);
        let clauses = Cell::list([clause(pattern, sym("b"))]);
        let value = Cell::list([Cell::int(1), Cell::int(2)]);
        // nil env is "indexed" per classification, but empty; the binder
        // falls back to named entries.
        assert_eq!(eval_match(&mut ctx, &env, &value, &clauses), Cell::int(2));
    }

    #[test]
    fn guard_rejects_clause() {
        let mut ctx = ctx();
        let env = ctx.global_env().clone();
        // (match 3 (x | (= x 0) "zero") (x "nonzero"))
        let clauses = Cell::list([
            Cell::list([
                sym("x"),
                sym("|"),
                Cell::list([sym("="), sym("x"), Cell::int(0)]),
                Cell::string("zero"),
            ]),
            clause(sym("x"), Cell::string("nonzero")),
        ]);
        assert_eq!(
            eval_match(&mut ctx, &env, &Cell::int(3), &clauses),
            Cell::string("nonzero")
        );
        assert_eq!(
            eval_match(&mut ctx, &env, &Cell::int(0), &clauses),
            Cell::string("zero")
        );
    }

    #[test]
    fn no_match_is_an_error() {
        let mut ctx = ctx();
        let env = Cell::nil();
        let clauses = Cell::list([clause(Cell::int(1), Cell::string("one"))]);
        let result = eval_match(&mut ctx, &env, &Cell::int(2), &clauses);
        assert_eq!(result.error_kind(), Some("no-match"));
    }

    #[test]
    fn leaf_struct_pattern() {
        let mut ctx = ctx();
        let env = Cell::nil();
        let point = Cell::structure(
            StructKind::Leaf,
            sym(":Point"),
            None,
            Cell::list([
                Cell::cons(sym(":x"), Cell::int(3)),
                Cell::cons(sym(":y"), Cell::int(4)),
            ]),
        );
        // (match p ((:Point x y) y))
        let pattern = Cell::list([sym(":Point"), sym("x"), sym("y")]);
        let clauses = Cell::list([clause(pattern, sym("y"))]);
        assert_eq!(eval_match(&mut ctx, &env, &point, &clauses), Cell::int(4));
    }

    #[test]
    fn node_struct_pattern_requires_variant() {
        let mut ctx = ctx();
        let env = Cell::nil();
        let cons_node = Cell::structure(
            StructKind::Node,
            sym(":List"),
            Some(sym(":Cons")),
            Cell::list([Cell::cons(sym(":head"), Cell::int(1))]),
        );
        let match_cons = Cell::list([sym(":List"), sym(":Cons"), sym("h")]);
        let match_nil = Cell::list([sym(":List"), sym(":Nil")]);
        let clauses = Cell::list([
            clause(match_nil, Cell::string("nil")),
            clause(match_cons, sym("h")),
        ]);
        assert_eq!(
            eval_match(&mut ctx, &env, &cons_node, &clauses),
            Cell::int(1)
        );
    }

    #[test]
    fn collect_vars_order_is_dfs() {
        let pattern = Cell::list([
            sym("a"),
            Cell::list([sym(":Tag"), sym("b")]),
            sym("_"),
            sym("c"),
        ]);
        let mut vars = Vec::new();
        collect_vars(&pattern, &mut vars);
        assert_eq!(vars, vec!["a".to_owned(), "b".into(), "c".into()]);
    }
}
