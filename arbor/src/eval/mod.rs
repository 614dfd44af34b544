// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The tree-walking evaluator.
//!
//! [`eval_in`] never unwinds: failures are error cells that simply become
//! the result. The dispatch loop holds `expr` and `env` in locals and
//! rebinds them for every tail position - conditionals, lambda bodies, and
//! macro expansions all loop instead of recursing, so unbounded tail
//! recursion runs in constant native stack.
//!
//! Every loop iteration spends one reduction. When the budget is exhausted
//! inside a fiber, the evaluator parks `(expr, env)` in the fiber's saved
//! continuation and yields; the scheduler grants a fresh quantum on resume
//! and the loop is rebuilt from the saved pair.

pub(crate) mod debruijn;

use crate::cell::{Cell, CellKind};
use crate::fiber::SuspendReason;
use crate::pattern;
use crate::sched::{self, Runtime};
use crate::{env, prims};
use std::sync::Arc;

/// Evaluation context: the global (named) environment, the primitive table,
/// the type registry, and the reduction budget. Each actor's fiber owns a
/// fork of the spawning context, so definitions made inside an actor stay
/// local to it.
#[derive(Clone)]
pub struct EvalCtx {
    runtime: Arc<Runtime>,
    global: Cell,
    prims: Cell,
    types: Cell,
    pub(crate) reductions_left: i32,
}

// === impl EvalCtx ===

impl EvalCtx {
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let mut ctx = Self {
            runtime,
            global: Cell::nil(),
            prims: Cell::nil(),
            types: Cell::nil(),
            reductions_left: 0,
        };
        ctx.reductions_left = ctx.quantum();
        ctx.prims = prims::install();
        ctx
    }

    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Evaluate `expr` in the global environment.
    pub fn eval(&mut self, expr: &Cell) -> Cell {
        let global = self.global.clone();
        eval_in(self, &global, expr)
    }

    /// Bind `name` in the global environment, shadowing earlier bindings.
    pub fn define(&mut self, name: &str, value: Cell) {
        self.global = env::bind_named(&self.global, name, value);
    }

    /// Global lookup: user definitions first, then the primitive table.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Cell> {
        env::lookup_named(&self.global, name).or_else(|| env::lookup_named(&self.prims, name))
    }

    #[must_use]
    pub fn global_env(&self) -> &Cell {
        &self.global
    }

    /// Register a type schema, replacing any previous entry for the tag.
    pub fn register_type(&mut self, tag: &Cell, schema: Cell) {
        if self.lookup_type(tag).is_some() {
            let mut rebuilt = Cell::nil();
            for binding in self.types.iter_list() {
                if let Some((existing, _)) = binding.as_pair()
                    && existing == tag
                {
                    continue;
                }
                rebuilt = Cell::cons(binding.clone(), rebuilt);
            }
            self.types = rebuilt;
        }
        self.types = Cell::cons(Cell::cons(tag.clone(), schema), self.types.clone());
    }

    #[must_use]
    pub fn lookup_type(&self, tag: &Cell) -> Option<Cell> {
        for binding in self.types.iter_list() {
            if let Some((existing, schema)) = binding.as_pair()
                && existing == tag
            {
                return Some(schema.clone());
            }
        }
        None
    }

    #[must_use]
    pub fn has_type(&self, tag: &Cell) -> bool {
        self.lookup_type(tag).is_some()
    }

    /// Snapshot for a spawned actor: same globals, fresh budget.
    #[must_use]
    pub(crate) fn fork(&self) -> Self {
        let mut forked = self.clone();
        forked.reductions_left = forked.quantum();
        forked
    }

    pub(crate) fn quantum(&self) -> i32 {
        self.runtime.config().reductions
    }

    pub(crate) fn refill_reductions(&mut self) {
        self.reductions_left = self.quantum();
    }
}

/// Evaluate `expr` in `env`. Returns a value or an error cell.
pub fn eval_in(ctx: &mut EvalCtx, env: &Cell, expr: &Cell) -> Cell {
    let mut env = env.clone();
    let mut expr = expr.clone();

    loop {
        // Reduction accounting. An exhausted budget inside a fiber parks
        // the continuation and yields the quantum; outside a fiber the
        // budget is advisory and simply refills.
        ctx.reductions_left -= 1;
        if ctx.reductions_left <= 0 {
            match sched::current_actor() {
                Some(actor) => {
                    actor.fiber().save_continuation(expr.clone(), env.clone());
                    let _ = actor.fiber().suspend(SuspendReason::ReductionYield);
                    ctx.refill_reductions();
                    if let Some((saved_expr, saved_env)) = actor.fiber().take_continuation() {
                        expr = saved_expr;
                        env = saved_env;
                    }
                }
                None => ctx.refill_reductions(),
            }
        }

        // Macro expansion pre-pass; expansion loops, so macros expand
        // recursively.
        if expr.is_pair() && ctx.runtime.macros().is_macro_call(&expr) {
            let expanded = ctx.runtime.macros().expand(&expr);
            if expanded.is_error() {
                return expanded;
            }
            expr = expanded;
            continue;
        }

        match expr.kind() {
            // Numbers are De Bruijn indices in indexed environments,
            // literals otherwise. Negative or fractional numbers fall
            // through as literals.
            CellKind::Number(_) | CellKind::Int(_) => {
                if env::is_indexed(&env)
                    && let Some(index) = expr.as_index()
                    && let Some(value) = env::lookup_index(&env, index)
                {
                    if value.is_consumed() {
                        return Cell::error("linear-consumed", value);
                    }
                    return value;
                }
                return expr;
            }

            CellKind::Bool(_) | CellKind::Nil | CellKind::Str(_) => return expr,

            CellKind::Symbol(_) => {
                let name = expr.as_symbol().expect("checked symbol").to_owned();
                // Keywords self-evaluate.
                if name.starts_with(':') {
                    return expr;
                }
                if !env::is_indexed(&env)
                    && let Some(value) = env::lookup_named(&env, &name)
                {
                    if value.is_consumed() {
                        return Cell::error("linear-consumed", value);
                    }
                    return value;
                }
                return match ctx.lookup(&name) {
                    Some(value) => {
                        if value.is_consumed() {
                            return Cell::error("linear-consumed", value);
                        }
                        value
                    }
                    None => Cell::error("undefined-variable", Cell::symbol(&name)),
                };
            }

            CellKind::Pair(..) => {
                let (head, rest) = {
                    let (h, t) = expr.as_pair().expect("checked pair");
                    (h.clone(), t.clone())
                };

                if let Some(op) = head.as_symbol() {
                    match op {
                        "quote" => {
                            return rest.car().cloned().unwrap_or_else(Cell::nil);
                        }
                        "quasiquote" => {
                            let arg = rest.car().cloned().unwrap_or_else(Cell::nil);
                            return eval_quasiquote(ctx, &env, &arg);
                        }
                        "defmacro" => {
                            // (defmacro name (params...) template)
                            let name = rest.car().cloned().unwrap_or_else(Cell::nil);
                            let Some(name_str) = name.as_symbol() else {
                                return Cell::error("macro-name-not-symbol", name.clone());
                            };
                            let params = rest.list_nth(1).unwrap_or_else(Cell::nil);
                            let body = rest.list_nth(2).unwrap_or_else(Cell::nil);
                            ctx.runtime.macros().define(name_str, params, body);
                            return name;
                        }
                        "define" => {
                            let name = rest.car().cloned().unwrap_or_else(Cell::nil);
                            let Some(name_str) = name.as_symbol() else {
                                return Cell::error("define-name-not-symbol", name);
                            };
                            let name_str = name_str.to_owned();
                            let value_expr = rest.list_nth(1).unwrap_or_else(Cell::nil);

                            // Two-phase bind: pre-bind lambda names to nil
                            // so the body can self-reference through the
                            // binding instead of capturing itself.
                            let is_lambda_form = value_expr
                                .car()
                                .and_then(|h| h.as_symbol())
                                .is_some_and(|s| s == "lambda" || s == debruijn::CONVERTED_MARKER);
                            if is_lambda_form {
                                ctx.define(&name_str, Cell::nil());
                            }

                            let value = eval_in(ctx, &env, &value_expr);
                            ctx.define(&name_str, value.clone());
                            return value;
                        }
                        "lambda" => {
                            // (lambda (params...) body): convert the body
                            // to De Bruijn form and capture the enclosing
                            // indexed environment (empty at top level).
                            let params = rest.car().cloned().unwrap_or_else(Cell::nil);
                            let body = rest.list_nth(1).unwrap_or_else(Cell::nil);
                            let names = debruijn::param_names(&params);
                            let arity = names.len();
                            let mut name_ctx = debruijn::NameContext::with_scope(names);
                            let converted = debruijn::convert(&body, &mut name_ctx);
                            let closure_env = if env::is_indexed(&env) {
                                env.clone()
                            } else {
                                Cell::nil()
                            };
                            return Cell::lambda(closure_env, converted, arity, None);
                        }
                        debruijn::CONVERTED_MARKER => {
                            // (:__converted__ (params...) body): body is
                            // already in De Bruijn form.
                            let params = rest.car().cloned().unwrap_or_else(Cell::nil);
                            let body = rest.list_nth(1).unwrap_or_else(Cell::nil);
                            let arity = params.list_len();
                            let closure_env = if env::is_indexed(&env) {
                                env.clone()
                            } else {
                                Cell::nil()
                            };
                            return Cell::lambda(closure_env, body, arity, None);
                        }
                        "if" => {
                            // (if cond then else): the chosen branch is a
                            // tail position.
                            let cond_expr = rest.car().cloned().unwrap_or_else(Cell::nil);
                            let then_expr = rest.list_nth(1).unwrap_or_else(Cell::nil);
                            let else_expr = rest.list_nth(2).unwrap_or_else(Cell::nil);
                            let cond = eval_in(ctx, &env, &cond_expr);
                            expr = if cond.is_truthy() { then_expr } else { else_expr };
                            continue;
                        }
                        "match" => {
                            // (match scrutinee clause...): evaluated
                            // discriminant, unevaluated patterns.
                            let scrutinee_expr = rest.car().cloned().unwrap_or_else(Cell::nil);
                            let clauses = rest.cdr().cloned().unwrap_or_else(Cell::nil);
                            let scrutinee = eval_in(ctx, &env, &scrutinee_expr);
                            if scrutinee.is_error() {
                                return scrutinee;
                            }
                            return pattern::eval_match(ctx, &env, &scrutinee, &clauses);
                        }
                        _ => {}
                    }
                }

                // Application: evaluate the head, then the arguments
                // left-to-right.
                let func = eval_in(ctx, &env, &head);
                let args = eval_list(ctx, &env, &rest);

                match func.kind() {
                    CellKind::Builtin(builtin) => {
                        return (builtin.func)(ctx, &args);
                    }
                    CellKind::Lambda(_) => {
                        let lambda = func.as_lambda().expect("checked lambda").clone();
                        let arg_count = args.list_len();
                        if arg_count != lambda.arity {
                            #[expect(clippy::cast_precision_loss, reason = "arities are tiny")]
                            let data = Cell::list([
                                Cell::number(lambda.arity as f64),
                                Cell::number(arg_count as f64),
                            ]);
                            return Cell::error("arity-mismatch", data);
                        }
                        // Tail call: extend the captured environment and
                        // loop into the body.
                        env = env::extend(&lambda.env, &args);
                        expr = lambda.body;
                        continue;
                    }
                    _ => {
                        if func.is_error() {
                            return func;
                        }
                        return Cell::error("not-a-function", func);
                    }
                }
            }

            // Runtime values (lambdas, handles, boxes, ...) evaluate to
            // themselves when they appear as expressions.
            _ => return expr,
        }
    }
}

/// Evaluate the elements of an argument list into a fresh list. Errors do
/// not short-circuit; they flow into the list and the callee decides.
fn eval_list(ctx: &mut EvalCtx, env: &Cell, expr: &Cell) -> Cell {
    if expr.is_nil() {
        return Cell::nil();
    }
    let Some((first, rest)) = expr.as_pair().map(|(h, t)| (h.clone(), t.clone())) else {
        return eval_in(ctx, env, expr);
    };
    let first_eval = eval_in(ctx, env, &first);
    let rest_eval = eval_list(ctx, env, &rest);
    Cell::cons(first_eval, rest_eval)
}

/// Quasiquote: copy the template, inverting the quote on `(unquote e)`
/// sub-forms.
fn eval_quasiquote(ctx: &mut EvalCtx, env: &Cell, template: &Cell) -> Cell {
    if let Some((head, rest)) = template.as_pair().map(|(h, t)| (h.clone(), t.clone())) {
        if head.as_symbol() == Some("unquote") {
            let Some(arg) = rest.car().cloned() else {
                return Cell::error("quasiquote-error", Cell::symbol("unquote-requires-argument"));
            };
            return eval_in(ctx, env, &arg);
        }
        let new_head = eval_quasiquote(ctx, env, &head);
        let new_rest = eval_quasiquote(ctx, env, &rest);
        return Cell::cons(new_head, new_rest);
    }
    template.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;

    fn ctx() -> EvalCtx {
        EvalCtx::new(Runtime::new(RuntimeConfig::default()))
    }

    fn sym(s: &str) -> Cell {
        Cell::symbol(s)
    }

    #[test]
    fn literals_self_evaluate() {
        let mut ctx = ctx();
        assert_eq!(ctx.eval(&Cell::int(42)), Cell::int(42));
        assert_eq!(ctx.eval(&Cell::bool(true)), Cell::bool(true));
        assert_eq!(ctx.eval(&Cell::string("s")), Cell::string("s"));
        assert_eq!(ctx.eval(&Cell::nil()), Cell::nil());
        assert_eq!(ctx.eval(&sym(":kw")), sym(":kw"));
    }

    #[test]
    fn quote_returns_unevaluated() {
        let mut ctx = ctx();
        let inner = Cell::list([sym("+"), Cell::int(1), Cell::int(2)]);
        let quoted = Cell::list([sym("quote"), inner.clone()]);
        assert_eq!(ctx.eval(&quoted), inner);
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let mut ctx = ctx();
        let result = ctx.eval(&sym("nonesuch"));
        assert_eq!(result.error_kind(), Some("undefined-variable"));
    }

    #[test]
    fn lambda_application() {
        let mut ctx = ctx();
        // ((lambda (x y) (+ x y)) 3 4) => 7
        let lam = Cell::list([
            sym("lambda"),
            Cell::list([sym("x"), sym("y")]),
            Cell::list([sym("+"), sym("x"), sym("y")]),
        ]);
        let call = Cell::list([lam, Cell::int(3), Cell::int(4)]);
        assert_eq!(ctx.eval(&call), Cell::int(7));
    }

    #[test]
    fn arity_mismatch() {
        let mut ctx = ctx();
        let lam = Cell::list([sym("lambda"), Cell::list([sym("x")]), sym("x")]);
        let call = Cell::list([lam, Cell::int(1), Cell::int(2)]);
        assert_eq!(ctx.eval(&call).error_kind(), Some("arity-mismatch"));
    }

    #[test]
    fn not_a_function() {
        let mut ctx = ctx();
        let call = Cell::list([Cell::string("nope")]);
        assert_eq!(ctx.eval(&call).error_kind(), Some("not-a-function"));
    }

    #[test]
    fn if_takes_then_branch_lazily() {
        let mut ctx = ctx();
        // The untaken branch would error if evaluated; it must not be.
        let form = Cell::list([
            sym("if"),
            Cell::bool(true),
            Cell::int(1),
            Cell::list([sym("undefined-fn")]),
        ]);
        assert_eq!(ctx.eval(&form), Cell::int(1));
    }

    #[test]
    fn define_then_use() {
        let mut ctx = ctx();
        ctx.eval(&Cell::list([sym("define"), sym("x"), Cell::int(5)]));
        assert_eq!(ctx.eval(&sym("x")), Cell::int(5));
    }

    #[test]
    fn define_lambda_self_reference() {
        let mut ctx = ctx();
        // (define fact (lambda (n) (if (= n 0) 1 (* n (fact (- n 1))))))
        let body = Cell::list([
            sym("if"),
            Cell::list([sym("="), sym("n"), Cell::int(0)]),
            Cell::int(1),
            Cell::list([
                sym("*"),
                sym("n"),
                Cell::list([sym("fact"), Cell::list([sym("-"), sym("n"), Cell::int(1)])]),
            ]),
        ]);
        let define = Cell::list([
            sym("define"),
            sym("fact"),
            Cell::list([sym("lambda"), Cell::list([sym("n")]), body]),
        ]);
        ctx.eval(&define);
        let call = Cell::list([sym("fact"), Cell::int(5)]);
        assert_eq!(ctx.eval(&call), Cell::int(120));
    }

    #[test]
    fn tail_calls_run_in_constant_stack() {
        let mut ctx = ctx();
        // (define loop (lambda (n) (if (= n 0) "done" (loop (- n 1)))))
        let body = Cell::list([
            sym("if"),
            Cell::list([sym("="), sym("n"), Cell::int(0)]),
            Cell::string("done"),
            Cell::list([sym("loop"), Cell::list([sym("-"), sym("n"), Cell::int(1)])]),
        ]);
        let define = Cell::list([
            sym("define"),
            sym("loop"),
            Cell::list([sym("lambda"), Cell::list([sym("n")]), body]),
        ]);
        ctx.eval(&define);
        let n = if cfg!(debug_assertions) { 200_000 } else { 1_000_000 };
        let result = ctx.eval(&Cell::list([sym("loop"), Cell::int(n)]));
        assert_eq!(result, Cell::string("done"));
    }

    #[test]
    fn quasiquote_unquote() {
        let mut ctx = ctx();
        ctx.eval(&Cell::list([sym("define"), sym("x"), Cell::int(9)]));
        // (quasiquote (a (unquote x))) => (a 9)
        let form = Cell::list([
            sym("quasiquote"),
            Cell::list([sym("a"), Cell::list([sym("unquote"), sym("x")])]),
        ]);
        assert_eq!(ctx.eval(&form), Cell::list([sym("a"), Cell::int(9)]));
    }

    #[test]
    fn macro_expansion_pre_pass() {
        let mut ctx = ctx();
        // (defmacro when (c b) (if c b nil-ish)) - use a quote for the else.
        let defmacro = Cell::list([
            sym("defmacro"),
            sym("unless"),
            Cell::list([sym("c"), sym("b")]),
            Cell::list([sym("if"), sym("c"), Cell::nil(), sym("b")]),
        ]);
        ctx.eval(&defmacro);
        let call = Cell::list([sym("unless"), Cell::bool(false), Cell::int(3)]);
        assert_eq!(ctx.eval(&call), Cell::int(3));
    }

    #[test]
    fn closures_capture_environment() {
        let mut ctx = ctx();
        // ((lambda (x) ((lambda (y) (+ x y)) 10)) 1) => 11
        let inner = Cell::list([
            sym("lambda"),
            Cell::list([sym("y")]),
            Cell::list([sym("+"), sym("x"), sym("y")]),
        ]);
        let outer = Cell::list([
            sym("lambda"),
            Cell::list([sym("x")]),
            Cell::list([inner, Cell::int(10)]),
        ]);
        let call = Cell::list([outer, Cell::int(1)]);
        assert_eq!(ctx.eval(&call), Cell::int(11));
    }

    #[test]
    fn type_registry_roundtrip() {
        let mut ctx = ctx();
        let tag = sym(":Point");
        let schema = Cell::list([sym(":x"), sym(":y")]);
        ctx.register_type(&tag, schema.clone());
        assert_eq!(ctx.lookup_type(&tag), Some(schema));
        // Replacement, not shadowing.
        ctx.register_type(&tag, Cell::nil());
        assert_eq!(ctx.lookup_type(&tag), Some(Cell::nil()));
        assert!(!ctx.has_type(&sym(":Other")));
    }
}
