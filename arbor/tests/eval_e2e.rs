// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end evaluator behavior, driven through the public API.

mod common;

use arbor::{Cell, EvalCtx, Runtime, RuntimeConfig};
use common::*;

fn ctx() -> EvalCtx {
    EvalCtx::new(Runtime::new(RuntimeConfig::default()))
}

#[test]
fn quote_returns_operand_unevaluated() {
    let mut ctx = ctx();
    for expr in [
        Cell::int(1),
        sym("free-variable"),
        call("+", vec![Cell::int(1), Cell::int(2)]),
        Cell::list([Cell::int(1), Cell::int(2), Cell::int(3)]),
    ] {
        let quoted = list(vec![sym("quote"), expr.clone()]);
        assert_eq!(ctx.eval(&quoted), expr);
    }
}

#[test]
fn if_true_does_not_evaluate_the_other_branch() {
    let mut ctx = ctx();
    // Detect evaluation of the untaken branch by its side effect on a box.
    ctx.define("effects", Cell::boxed(Cell::int(0)));
    let bump = call("box-set!", vec![sym("effects"), Cell::int(1)]);
    let form = if_(Cell::bool(true), Cell::string("a"), bump);
    assert_eq!(ctx.eval(&form), Cell::string("a"));
    let effects = ctx.eval(&call("unbox", vec![sym("effects")]));
    assert_eq!(effects, Cell::int(0), "untaken branch was evaluated");
}

#[test]
fn two_arg_lambda_application() {
    let mut ctx = ctx();
    let form = list(vec![
        lambda(&["x", "y"], call("+", vec![sym("x"), sym("y")])),
        Cell::int(3),
        Cell::int(4),
    ]);
    assert_eq!(ctx.eval(&form), Cell::int(7));
}

#[test]
fn undefined_free_variable() {
    let mut ctx = ctx();
    assert_eq!(
        ctx.eval(&sym("no-such-binding")).error_kind(),
        Some("undefined-variable")
    );
}

#[test]
fn factorial_by_self_reference() {
    // Scenario: (define fact (lambda (n) (if (= n 0) 1 (* n (fact (- n 1))))))
    // then (fact 5) => 120 through the two-phase define.
    let mut ctx = ctx();
    let body = if_(
        call("=", vec![sym("n"), Cell::int(0)]),
        Cell::int(1),
        call(
            "*",
            vec![
                sym("n"),
                call("fact", vec![call("-", vec![sym("n"), Cell::int(1)])]),
            ],
        ),
    );
    ctx.eval(&define_fn("fact", &["n"], body));
    assert_eq!(ctx.eval(&call("fact", vec![Cell::int(5)])), Cell::int(120));
}

#[test]
fn million_tail_calls_no_stack_exhaustion() {
    let mut ctx = ctx();
    let body = if_(
        call("=", vec![sym("n"), Cell::int(0)]),
        Cell::string("done"),
        call("down", vec![call("-", vec![sym("n"), Cell::int(1)])]),
    );
    ctx.eval(&define_fn("down", &["n"], body));
    let n = if cfg!(debug_assertions) { 200_000 } else { 1_000_000 };
    assert_eq!(
        ctx.eval(&call("down", vec![Cell::int(n)])),
        Cell::string("done")
    );
}

#[test]
fn match_with_guard_and_structure() {
    let mut ctx = ctx();
    // (match 10 (x | (< x 5) :small) (x :big))
    let form = list(vec![
        sym("match"),
        Cell::int(10),
        list(vec![
            sym("x"),
            sym("|"),
            call("<", vec![sym("x"), Cell::int(5)]),
            sym(":small"),
        ]),
        list(vec![sym("x"), sym(":big")]),
    ]);
    assert_eq!(ctx.eval(&form), sym(":big"));
}

#[test]
fn match_inside_lambda_uses_indexed_bindings() {
    let mut ctx = ctx();
    // (define classify (lambda (v) (match v ((a b) (+ a b)) (_ 0))))
    let body = list(vec![
        sym("match"),
        sym("v"),
        list(vec![
            list(vec![sym("a"), sym("b")]),
            call("+", vec![sym("a"), sym("b")]),
        ]),
        list(vec![sym("_"), Cell::int(0)]),
    ]);
    ctx.eval(&define_fn("classify", &["v"], body));

    let two = list(vec![
        sym("classify"),
        list(vec![sym("quote"), Cell::list([Cell::int(4), Cell::int(5)])]),
    ]);
    assert_eq!(ctx.eval(&two), Cell::int(9));
    assert_eq!(
        ctx.eval(&call("classify", vec![Cell::int(1)])),
        Cell::int(0)
    );
}

#[test]
fn no_match_error_reaches_caller() {
    let mut ctx = ctx();
    let form = list(vec![
        sym("match"),
        Cell::int(3),
        list(vec![Cell::int(1), sym(":one")]),
    ]);
    assert_eq!(ctx.eval(&form).error_kind(), Some("no-match"));
}

#[test]
fn macros_expand_before_evaluation() {
    let mut ctx = ctx();
    // (defmacro swap-args (f a b) (f b a))
    ctx.eval(&list(vec![
        sym("defmacro"),
        sym("swap-args"),
        list(vec![sym("f"), sym("a"), sym("b")]),
        list(vec![sym("f"), sym("b"), sym("a")]),
    ]));
    let form = call("swap-args", vec![sym("-"), Cell::int(1), Cell::int(10)]);
    assert_eq!(ctx.eval(&form), Cell::int(9));
}

#[test]
fn closures_survive_their_defining_scope() {
    let mut ctx = ctx();
    // (define make-adder (lambda (n) (lambda (m) (+ n m))))
    ctx.eval(&define_fn(
        "make-adder",
        &["n"],
        lambda(&["m"], call("+", vec![sym("n"), sym("m")])),
    ));
    ctx.eval(&list(vec![
        sym("define"),
        sym("add3"),
        call("make-adder", vec![Cell::int(3)]),
    ]));
    assert_eq!(ctx.eval(&call("add3", vec![Cell::int(39)])), Cell::int(42));
}

#[test]
fn begin_sequences_left_to_right() {
    let mut ctx = ctx();
    ctx.define("acc", Cell::boxed(Cell::nil()));
    let form = begin(vec![
        call("box-set!", vec![sym("acc"), Cell::int(1)]),
        call("box-set!", vec![sym("acc"), Cell::int(2)]),
        call("unbox", vec![sym("acc")]),
    ]);
    assert_eq!(ctx.eval(&form), Cell::int(2));
}
