// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Expression-building helpers shared by the integration tests. The parser
//! is an external collaborator, so tests assemble ASTs directly.
#![allow(dead_code)]

use arbor::Cell;

pub fn sym(name: &str) -> Cell {
    Cell::symbol(name)
}

pub fn list(items: Vec<Cell>) -> Cell {
    Cell::list(items)
}

pub fn call(name: &str, args: Vec<Cell>) -> Cell {
    let mut form = vec![sym(name)];
    form.extend(args);
    Cell::list(form)
}

/// `(lambda (params...) body)`
pub fn lambda(params: &[&str], body: Cell) -> Cell {
    list(vec![
        sym("lambda"),
        list(params.iter().map(|p| sym(p)).collect()),
        body,
    ])
}

/// `(define name (lambda (params...) body))`
pub fn define_fn(name: &str, params: &[&str], body: Cell) -> Cell {
    list(vec![sym("define"), sym(name), lambda(params, body)])
}

/// `(if cond then else)`
pub fn if_(cond: Cell, then: Cell, else_: Cell) -> Cell {
    list(vec![sym("if"), cond, then, else_])
}

/// Sequence two expressions: evaluates `first`, discards it, then `second`
/// - desugared as `((lambda (_seq) second) first)`.
pub fn seq(first: Cell, second: Cell) -> Cell {
    list(vec![lambda(&["_seq"], second), first])
}

/// Fold a sequence of expressions left-to-right, returning the last value.
pub fn begin(mut exprs: Vec<Cell>) -> Cell {
    let last = exprs.pop().expect("begin needs at least one expression");
    exprs.into_iter().rev().fold(last, |acc, e| seq(e, acc))
}
