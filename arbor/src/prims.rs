// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The bootstrap primitive table.
//!
//! The full primitive catalogue lives outside the core; what is installed
//! here is the slice the runtime itself needs exposed - arithmetic and list
//! basics for writing behaviors, plus the concurrency primitives (spawn,
//! send, receive, channels, select, await) that are the only suspension
//! points the evaluator has.
//!
//! Every primitive returns a value or an error cell; none of them unwind.
//! The blocking primitives all follow the same shape: try, register as the
//! waiter, set the wait flag, re-check (so a wake that raced the
//! registration is never lost), suspend, and re-check on resume.

use crate::cell::{ActorId, Cell, CellKind, ChannelId};
use crate::channel::{Direction, TrySend};
use crate::env;
use crate::eval::EvalCtx;
use crate::fiber::SuspendReason;
use crate::sched;

/// Build the primitive environment (a named alist of builtins).
#[must_use]
pub fn install() -> Cell {
    let mut table = Cell::nil();
    for (name, func) in PRIMITIVES {
        table = env::bind_named(&table, name, Cell::builtin(name, *func));
    }
    table
}

type Prim = (&'static str, crate::cell::BuiltinFn);

static PRIMITIVES: &[Prim] = &[
    ("+", prim_add),
    ("-", prim_sub),
    ("*", prim_mul),
    ("/", prim_div),
    ("=", prim_eq),
    ("<", prim_lt),
    (">", prim_gt),
    ("<=", prim_le),
    (">=", prim_ge),
    ("not", prim_not),
    ("cons", prim_cons),
    ("car", prim_car),
    ("cdr", prim_cdr),
    ("list", prim_list),
    ("nil?", prim_is_nil),
    ("pair?", prim_is_pair),
    ("box", prim_box),
    ("unbox", prim_unbox),
    ("box-set!", prim_box_set),
    ("error", prim_error),
    ("error?", prim_is_error),
    ("error-kind", prim_error_kind),
    ("error-data", prim_error_data),
    ("map-new", prim_map_new),
    ("map-put", prim_map_put),
    ("map-get", prim_map_get),
    ("spawn", prim_spawn),
    ("self", prim_self),
    ("send", prim_send),
    ("recv", prim_recv),
    ("yield", prim_yield),
    ("link", prim_link),
    ("unlink", prim_unlink),
    ("monitor", prim_monitor),
    ("trap-exit", prim_trap_exit),
    ("exit", prim_exit),
    ("await", prim_await),
    ("chan", prim_chan),
    ("chan-send", prim_chan_send),
    ("chan-recv", prim_chan_recv),
    ("chan-try-send", prim_chan_try_send),
    ("chan-try-recv", prim_chan_try_recv),
    ("chan-close", prim_chan_close),
    ("select", prim_select),
    ("register", prim_register),
    ("whereis", prim_whereis),
    ("unregister", prim_unregister),
    ("dict-put", prim_dict_put),
    ("dict-get", prim_dict_get),
    ("ets-new", prim_ets_new),
    ("ets-insert", prim_ets_insert),
    ("ets-lookup", prim_ets_lookup),
    ("ets-delete", prim_ets_delete),
    ("timer", prim_timer),
    ("timer-cancel", prim_timer_cancel),
];

fn arg(args: &Cell, index: usize) -> Cell {
    args.list_nth(index).unwrap_or_else(Cell::nil)
}

/// Propagate the first error among the arguments, if any.
fn first_error(args: &Cell) -> Option<Cell> {
    args.iter_list().find(Cell::is_error)
}

// === numbers ===

enum Num {
    Int(i64),
    Float(f64),
}

fn numeric(value: &Cell) -> Result<Num, Cell> {
    match value.kind() {
        CellKind::Int(n) => Ok(Num::Int(*n)),
        CellKind::Number(n) => Ok(Num::Float(*n)),
        _ => Err(Cell::error("not-a-number", value.clone())),
    }
}

fn fold_numeric(
    args: &Cell,
    int_op: impl Fn(i64, i64) -> i64,
    float_op: impl Fn(f64, f64) -> f64,
) -> Cell {
    if let Some(err) = first_error(args) {
        return err;
    }
    let mut iter = args.iter_list();
    let Some(first) = iter.next() else {
        return Cell::error("arity-mismatch", Cell::nil());
    };
    let mut acc = match numeric(&first) {
        Ok(n) => n,
        Err(e) => return e,
    };
    for item in iter {
        let next = match numeric(&item) {
            Ok(n) => n,
            Err(e) => return e,
        };
        acc = match (acc, next) {
            (Num::Int(a), Num::Int(b)) => Num::Int(int_op(a, b)),
            #[expect(clippy::cast_precision_loss, reason = "language-level widening")]
            (Num::Int(a), Num::Float(b)) => Num::Float(float_op(a as f64, b)),
            #[expect(clippy::cast_precision_loss, reason = "language-level widening")]
            (Num::Float(a), Num::Int(b)) => Num::Float(float_op(a, b as f64)),
            (Num::Float(a), Num::Float(b)) => Num::Float(float_op(a, b)),
        };
    }
    match acc {
        Num::Int(n) => Cell::int(n),
        Num::Float(n) => Cell::number(n),
    }
}

fn prim_add(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    fold_numeric(args, i64::wrapping_add, |a, b| a + b)
}

fn prim_sub(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    fold_numeric(args, i64::wrapping_sub, |a, b| a - b)
}

fn prim_mul(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    fold_numeric(args, i64::wrapping_mul, |a, b| a * b)
}

fn prim_div(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    if let Some(err) = first_error(args) {
        return err;
    }
    let a = arg(args, 0);
    let b = arg(args, 1);
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Cell::error("not-a-number", if a.as_f64().is_none() { a } else { b });
    };
    if y == 0.0 {
        return Cell::error("div-by-zero", a);
    }
    // Integer division stays integral when it divides evenly.
    if let (Some(ai), Some(bi)) = (a.as_int(), b.as_int())
        && ai % bi == 0
    {
        return Cell::int(ai / bi);
    }
    Cell::number(x / y)
}

fn prim_eq(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    if let Some(err) = first_error(args) {
        return err;
    }
    let a = arg(args, 0);
    let b = arg(args, 1);
    // Numeric comparison crosses the int/float divide; everything else is
    // structural.
    let equal = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    };
    Cell::bool(equal)
}

fn compare(args: &Cell, op: impl Fn(f64, f64) -> bool) -> Cell {
    if let Some(err) = first_error(args) {
        return err;
    }
    let a = arg(args, 0);
    let b = arg(args, 1);
    let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
        return Cell::error("not-a-number", if a.as_f64().is_none() { a } else { b });
    };
    Cell::bool(op(x, y))
}

fn prim_lt(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    compare(args, |a, b| a < b)
}

fn prim_gt(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    compare(args, |a, b| a > b)
}

fn prim_le(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    compare(args, |a, b| a <= b)
}

fn prim_ge(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    compare(args, |a, b| a >= b)
}

fn prim_not(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    Cell::bool(!arg(args, 0).is_truthy())
}

// === lists ===

fn prim_cons(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    Cell::cons(arg(args, 0), arg(args, 1))
}

fn prim_car(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let pair = arg(args, 0);
    match pair.car() {
        Some(car) => car.clone(),
        None => Cell::error("not-a-pair", pair),
    }
}

fn prim_cdr(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let pair = arg(args, 0);
    match pair.cdr() {
        Some(cdr) => cdr.clone(),
        None => Cell::error("not-a-pair", pair),
    }
}

fn prim_list(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    args.clone()
}

fn prim_is_nil(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    Cell::bool(arg(args, 0).is_nil())
}

fn prim_is_pair(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    Cell::bool(arg(args, 0).is_pair())
}

// === boxes ===

fn prim_box(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    Cell::boxed(arg(args, 0))
}

fn prim_unbox(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let boxed = arg(args, 0);
    match boxed.box_get() {
        Some(value) => value,
        None => Cell::error("not-a-box", boxed),
    }
}

fn prim_box_set(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let boxed = arg(args, 0);
    match boxed.box_set(arg(args, 1)) {
        Ok(previous) => previous,
        Err(err) => err,
    }
}

// === errors ===

fn prim_error(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let kind = arg(args, 0);
    let data = arg(args, 1);
    let name = kind
        .as_symbol()
        .map(|s| s.trim_start_matches(':').to_owned())
        .or_else(|| kind.as_str().map(str::to_owned))
        .unwrap_or_else(|| "error".to_owned());
    Cell::error(&name, data)
}

fn prim_is_error(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    Cell::bool(arg(args, 0).is_error())
}

fn prim_error_kind(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    match arg(args, 0).error_kind() {
        Some(kind) => Cell::symbol(&format!(":{kind}")),
        None => Cell::nil(),
    }
}

fn prim_error_data(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    match arg(args, 0).as_error() {
        Some(data) => data.data.clone(),
        None => Cell::nil(),
    }
}

// === maps ===

fn prim_map_new(_ctx: &mut EvalCtx, _args: &Cell) -> Cell {
    Cell::map()
}

fn prim_map_put(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    arg(args, 0).map_put(arg(args, 1), arg(args, 2))
}

fn prim_map_get(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    arg(args, 0)
        .map_get(&arg(args, 1))
        .unwrap_or_else(Cell::nil)
}

// === actors ===

fn current_actor_or_error() -> Result<std::sync::Arc<crate::actor::Actor>, Cell> {
    sched::current_actor().ok_or_else(|| Cell::error("not-in-actor", Cell::nil()))
}

fn actor_id_of(value: &Cell) -> Option<ActorId> {
    value
        .actor_id()
        .or_else(|| value.as_int().and_then(|n| u64::try_from(n).ok()))
}

fn prim_spawn(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let behavior = arg(args, 0);
    if !behavior.is_lambda() && !behavior.is_builtin() {
        return Cell::error("not-a-function", behavior);
    }
    let rt = ctx.runtime().clone();
    rt.spawn(ctx, behavior)
}

fn prim_self(_ctx: &mut EvalCtx, _args: &Cell) -> Cell {
    match sched::current_actor() {
        Some(actor) => Cell::actor(actor.id()),
        None => Cell::error("not-in-actor", Cell::nil()),
    }
}

fn prim_send(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let target = arg(args, 0);
    let message = arg(args, 1);
    let Some(id) = actor_id_of(&target) else {
        return Cell::error("not-an-actor", target);
    };
    ctx.runtime().send(id, &message);
    message
}

fn prim_recv(ctx: &mut EvalCtx, _args: &Cell) -> Cell {
    let me = match current_actor_or_error() {
        Ok(actor) => actor,
        Err(err) => return err,
    };
    loop {
        if let Some(message) = me.mailbox.pop() {
            ctx.runtime()
                .trace(crate::sched::TraceKind::Recv, me.id(), 0);
            return message;
        }
        // Publish the reason before the wait flag: a sender that observes
        // the flag must also observe why we are blocked, or it would skip
        // the wake.
        me.fiber().set_reason(SuspendReason::Mailbox);
        me.wait_flag
            .store(1, std::sync::atomic::Ordering::Release);
        // Close the race with a sender that missed the flag.
        if let Some(message) = me.mailbox.pop() {
            me.wait_flag
                .store(0, std::sync::atomic::Ordering::Release);
            return message;
        }
        let resumed = me.fiber().suspend(SuspendReason::Mailbox);
        ctx.refill_reductions();
        if !resumed.is_nil() {
            return resumed;
        }
    }
}

fn prim_yield(ctx: &mut EvalCtx, _args: &Cell) -> Cell {
    if let Ok(me) = current_actor_or_error() {
        let _ = me.fiber().suspend(SuspendReason::ReductionYield);
        ctx.refill_reductions();
    }
    Cell::nil()
}

fn prim_link(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let (a, b) = match (actor_id_of(&arg(args, 0)), actor_id_of(&arg(args, 1))) {
        (Some(a), Some(b)) => (a, b),
        (Some(other), None) => match current_actor_or_error() {
            Ok(me) => (me.id(), other),
            Err(err) => return err,
        },
        _ => return Cell::error("not-an-actor", arg(args, 0)),
    };
    ctx.runtime().link(a, b);
    Cell::bool(true)
}

fn prim_unlink(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let (a, b) = match (actor_id_of(&arg(args, 0)), actor_id_of(&arg(args, 1))) {
        (Some(a), Some(b)) => (a, b),
        (Some(other), None) => match current_actor_or_error() {
            Ok(me) => (me.id(), other),
            Err(err) => return err,
        },
        _ => return Cell::error("not-an-actor", arg(args, 0)),
    };
    ctx.runtime().unlink(a, b);
    Cell::bool(true)
}

fn prim_monitor(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let target = arg(args, 0);
    let Some(target_id) = actor_id_of(&target) else {
        return Cell::error("not-an-actor", target);
    };
    let me = match current_actor_or_error() {
        Ok(actor) => actor,
        Err(err) => return err,
    };
    ctx.runtime().add_monitor(target_id, me.id());
    Cell::bool(true)
}

fn prim_trap_exit(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let me = match current_actor_or_error() {
        Ok(actor) => actor,
        Err(err) => return err,
    };
    let trap = arg(args, 0).is_truthy();
    me.set_trap_exit(trap);
    Cell::bool(trap)
}

fn prim_exit(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let target = arg(args, 0);
    let reason = arg(args, 1);
    let Some(target_id) = actor_id_of(&target) else {
        return Cell::error("not-an-actor", target);
    };
    let sender = sched::current_actor().map(|a| a.id());
    ctx.runtime().exit_signal(target_id, sender, reason);
    Cell::bool(true)
}

fn prim_await(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let target = arg(args, 0);
    let Some(target_id) = actor_id_of(&target) else {
        return Cell::error("not-an-actor", target);
    };
    let me = match current_actor_or_error() {
        Ok(actor) => actor,
        Err(err) => return err,
    };
    loop {
        let Some(target_actor) = ctx.runtime().actors().get(target_id) else {
            return Cell::nil();
        };
        if !target_actor.is_alive() {
            return target_actor.result().unwrap_or_else(Cell::nil);
        }
        target_actor.add_awaiter(me.id());
        me.fiber()
            .set_reason(SuspendReason::TaskAwait { actor: target_id });
        me.wait_flag
            .store(1, std::sync::atomic::Ordering::Release);
        // The target may have died between the liveness check and the
        // registration; re-check before sleeping.
        if !target_actor.is_alive() {
            me.wait_flag
                .store(0, std::sync::atomic::Ordering::Release);
            return target_actor.result().unwrap_or_else(Cell::nil);
        }
        let resumed = me.fiber().suspend(SuspendReason::TaskAwait { actor: target_id });
        ctx.refill_reductions();
        if !resumed.is_nil() {
            return resumed;
        }
    }
}

// === channels ===

fn channel_id_of(value: &Cell) -> Option<ChannelId> {
    value
        .channel_id()
        .or_else(|| value.as_int().and_then(|n| u64::try_from(n).ok()))
}

fn prim_chan(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let capacity = arg(args, 0).as_index().unwrap_or(0);
    ctx.runtime().channel_create(capacity)
}

fn prim_chan_send(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let chan = arg(args, 0);
    let value = arg(args, 1);
    let Some(chan_id) = channel_id_of(&chan) else {
        return Cell::error("not-a-channel", chan);
    };
    loop {
        match ctx.runtime().channel_try_send(chan_id, value.clone()) {
            TrySend::Sent => return value,
            TrySend::Closed(_) => return Cell::error("chan-send-closed", chan),
            TrySend::Full(pending) => {
                let me = match current_actor_or_error() {
                    Ok(actor) => actor,
                    Err(err) => return err,
                };
                let Some(channel) = ctx.runtime().channels().get(chan_id) else {
                    return Cell::error("chan-send-closed", chan);
                };
                if !channel.register_waiter(Direction::Send, me.id()) {
                    // Someone else holds the waiter slot: busy re-check on
                    // the next scheduling pass.
                    let _ = me.fiber().suspend(SuspendReason::ReductionYield);
                    ctx.refill_reductions();
                    continue;
                }
                me.fiber().set_reason(SuspendReason::ChanSend {
                    chan: chan_id,
                    value: pending.clone(),
                });
                me.wait_flag
                    .store(1, std::sync::atomic::Ordering::Release);
                // A receive that raced our registration would have missed
                // the wake; re-check before sleeping.
                if channel.len() < channel.capacity() || channel.is_closed() {
                    channel.clear_waiter(Direction::Send, me.id());
                    me.wait_flag
                        .store(0, std::sync::atomic::Ordering::Release);
                    continue;
                }
                let _ = me.fiber().suspend(SuspendReason::ChanSend {
                    chan: chan_id,
                    value: pending,
                });
                ctx.refill_reductions();
                // The scheduler delivered the pending value while
                // preparing the resume.
                return value;
            }
        }
    }
}

fn prim_chan_recv(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let chan = arg(args, 0);
    let Some(chan_id) = channel_id_of(&chan) else {
        return Cell::error("not-a-channel", chan);
    };
    loop {
        if let Some(value) = ctx.runtime().channel_try_recv(chan_id) {
            return value;
        }
        let Some(channel) = ctx.runtime().channels().get(chan_id) else {
            return Cell::error("chan-recv-invalid", chan);
        };
        if channel.is_closed() {
            // Drain-before-closed already happened in try_recv above.
            return Cell::error("chan-recv-closed", chan);
        }
        let me = match current_actor_or_error() {
            Ok(actor) => actor,
            Err(err) => return err,
        };
        if !channel.register_waiter(Direction::Recv, me.id()) {
            let _ = me.fiber().suspend(SuspendReason::ReductionYield);
            ctx.refill_reductions();
            continue;
        }
        me.fiber()
            .set_reason(SuspendReason::ChanRecv { chan: chan_id });
        me.wait_flag
            .store(1, std::sync::atomic::Ordering::Release);
        if !channel.is_empty() || channel.is_closed() {
            channel.clear_waiter(Direction::Recv, me.id());
            me.wait_flag
                .store(0, std::sync::atomic::Ordering::Release);
            continue;
        }
        let resumed = me.fiber().suspend(SuspendReason::ChanRecv { chan: chan_id });
        ctx.refill_reductions();
        if resumed.is_error() || !resumed.is_nil() {
            return resumed;
        }
    }
}

fn prim_chan_try_send(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let chan = arg(args, 0);
    let Some(chan_id) = channel_id_of(&chan) else {
        return Cell::error("not-a-channel", chan);
    };
    match ctx.runtime().channel_try_send(chan_id, arg(args, 1)) {
        TrySend::Sent => Cell::bool(true),
        TrySend::Full(_) => Cell::bool(false),
        TrySend::Closed(_) => Cell::error("chan-send-closed", chan),
    }
}

fn prim_chan_try_recv(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let chan = arg(args, 0);
    let Some(chan_id) = channel_id_of(&chan) else {
        return Cell::error("not-a-channel", chan);
    };
    match ctx.runtime().channel_try_recv(chan_id) {
        Some(value) => value,
        None => {
            let closed = ctx
                .runtime()
                .channels()
                .get(chan_id)
                .is_none_or(|c| c.is_closed());
            if closed {
                Cell::error("chan-recv-closed", chan)
            } else {
                Cell::nil()
            }
        }
    }
}

fn prim_chan_close(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let chan = arg(args, 0);
    let Some(chan_id) = channel_id_of(&chan) else {
        return Cell::error("not-a-channel", chan);
    };
    ctx.runtime().channel_close(chan_id);
    Cell::bool(true)
}

fn prim_select(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let mut ids = Vec::new();
    for chan in args.iter_list() {
        match channel_id_of(&chan) {
            Some(id) => ids.push(id),
            None => return Cell::error("not-a-channel", chan),
        }
    }
    if ids.is_empty() {
        return Cell::error("select-all-closed", Cell::nil());
    }

    loop {
        let mut closed_or_gone = 0;
        for &chan_id in &ids {
            let Some(channel) = ctx.runtime().channels().get(chan_id) else {
                closed_or_gone += 1;
                continue;
            };
            if channel.is_closed() && channel.is_empty() {
                closed_or_gone += 1;
                continue;
            }
            if let Some(value) = ctx.runtime().channel_try_recv(chan_id) {
                return Cell::cons(Cell::channel(chan_id), value);
            }
        }
        if closed_or_gone == ids.len() {
            return Cell::error("select-all-closed", Cell::nil());
        }

        let me = match current_actor_or_error() {
            Ok(actor) => actor,
            Err(err) => return err,
        };

        // Register on every channel's receive slot; losing a slot to
        // another waiter is fine as long as we hold at least one.
        let mut registered_any = false;
        for &chan_id in &ids {
            if let Some(channel) = ctx.runtime().channels().get(chan_id)
                && channel.register_waiter(Direction::Recv, me.id())
            {
                registered_any = true;
            }
        }
        if !registered_any {
            let _ = me.fiber().suspend(SuspendReason::ReductionYield);
            ctx.refill_reductions();
            continue;
        }

        me.fiber()
            .set_reason(SuspendReason::Select { chans: ids.clone() });
        me.wait_flag
            .store(1, std::sync::atomic::Ordering::Release);
        // Re-check for deliveries that raced the registrations.
        let ready = ids.iter().any(|&chan_id| {
            ctx.runtime()
                .channels()
                .get(chan_id)
                .is_some_and(|c| !c.is_empty() || c.is_closed())
        });
        if ready {
            for &chan_id in &ids {
                if let Some(channel) = ctx.runtime().channels().get(chan_id) {
                    channel.clear_waiter(Direction::Recv, me.id());
                }
            }
            me.wait_flag
                .store(0, std::sync::atomic::Ordering::Release);
            continue;
        }

        let resumed = me.fiber().suspend(SuspendReason::Select { chans: ids.clone() });
        ctx.refill_reductions();
        if resumed.is_error() || resumed.is_pair() {
            return resumed;
        }
        // nil: spurious resume, scan again.
    }
}

// === registry, dictionary, ETS, timers ===

fn name_of(value: &Cell) -> Option<String> {
    value
        .as_symbol()
        .map(|s| s.trim_start_matches(':').to_owned())
        .or_else(|| value.as_str().map(str::to_owned))
}

fn prim_register(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    let Some(id) = actor_id_of(&arg(args, 1)) else {
        return Cell::error("not-an-actor", arg(args, 1));
    };
    match ctx.runtime().names().register(&name, id, ctx.runtime().actors()) {
        Ok(()) => Cell::bool(true),
        Err(err) => Cell::error("register-failed", Cell::string(&err.to_string())),
    }
}

fn prim_whereis(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    match ctx.runtime().names().lookup(&name) {
        Some(id) => Cell::actor(id),
        None => Cell::nil(),
    }
}

fn prim_unregister(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    Cell::bool(ctx.runtime().names().unregister_name(&name).is_ok())
}

fn prim_dict_put(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let me = match current_actor_or_error() {
        Ok(actor) => actor,
        Err(err) => return err,
    };
    me.dict_put(arg(args, 0), arg(args, 1))
        .unwrap_or_else(Cell::nil)
}

fn prim_dict_get(_ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let me = match current_actor_or_error() {
        Ok(actor) => actor,
        Err(err) => return err,
    };
    me.dict_get(&arg(args, 0)).unwrap_or_else(Cell::nil)
}

fn prim_ets_new(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    let owner = sched::current_actor().map_or(0, |a| a.id());
    match ctx.runtime().ets().create(&name, owner) {
        Ok(()) => Cell::bool(true),
        Err(err) => Cell::error("ets-failed", Cell::string(&err.to_string())),
    }
}

fn prim_ets_insert(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    match ctx.runtime().ets().insert(&name, arg(args, 1), arg(args, 2)) {
        Ok(()) => Cell::bool(true),
        Err(err) => Cell::error("ets-failed", Cell::string(&err.to_string())),
    }
}

fn prim_ets_lookup(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    ctx.runtime()
        .ets()
        .lookup(&name, &arg(args, 1))
        .unwrap_or_else(Cell::nil)
}

fn prim_ets_delete(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(name) = name_of(&arg(args, 0)) else {
        return Cell::error("not-a-name", arg(args, 0));
    };
    // Two-argument form deletes a key, one-argument form the whole table.
    let outcome = if args.list_len() >= 2 {
        ctx.runtime().ets().delete_key(&name, &arg(args, 1))
    } else {
        ctx.runtime().ets().delete_table(&name)
    };
    Cell::bool(outcome.is_ok())
}

fn prim_timer(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(target) = actor_id_of(&arg(args, 0)) else {
        return Cell::error("not-an-actor", arg(args, 0));
    };
    let ticks = u32::try_from(arg(args, 1).as_index().unwrap_or(1)).unwrap_or(1);
    let id = ctx.runtime().timer_create(target, ticks, arg(args, 2));
    Cell::int(id.cast_signed())
}

fn prim_timer_cancel(ctx: &mut EvalCtx, args: &Cell) -> Cell {
    let Some(id) = arg(args, 0).as_int().and_then(|n| u64::try_from(n).ok()) else {
        return Cell::bool(false);
    };
    Cell::bool(ctx.runtime().timer_cancel(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Runtime;
    use crate::RuntimeConfig;

    fn ctx() -> EvalCtx {
        EvalCtx::new(Runtime::new(RuntimeConfig::default()))
    }

    fn call(ctx: &mut EvalCtx, name: &str, args: Vec<Cell>) -> Cell {
        let mut form = vec![Cell::symbol(name)];
        form.extend(args);
        ctx.eval(&Cell::list(form))
    }

    #[test]
    fn arithmetic() {
        let mut ctx = ctx();
        assert_eq!(
            call(&mut ctx, "+", vec![Cell::int(1), Cell::int(2), Cell::int(3)]),
            Cell::int(6)
        );
        assert_eq!(
            call(&mut ctx, "-", vec![Cell::int(10), Cell::int(4)]),
            Cell::int(6)
        );
        assert_eq!(
            call(&mut ctx, "*", vec![Cell::int(6), Cell::int(7)]),
            Cell::int(42)
        );
        assert_eq!(
            call(&mut ctx, "/", vec![Cell::int(10), Cell::int(2)]),
            Cell::int(5)
        );
        assert_eq!(
            call(&mut ctx, "/", vec![Cell::int(1), Cell::int(2)]),
            Cell::number(0.5)
        );
    }

    #[test]
    fn div_by_zero() {
        let mut ctx = ctx();
        let result = call(&mut ctx, "/", vec![Cell::int(1), Cell::int(0)]);
        assert_eq!(result.error_kind(), Some("div-by-zero"));
    }

    #[test]
    fn errors_propagate_through_arithmetic() {
        let mut ctx = ctx();
        // (+ 1 (/ 1 0)) => the division error flows out.
        let inner = Cell::list([Cell::symbol("/"), Cell::int(1), Cell::int(0)]);
        let form = Cell::list([Cell::symbol("+"), Cell::int(1), inner]);
        assert_eq!(ctx.eval(&form).error_kind(), Some("div-by-zero"));
    }

    #[test]
    fn comparisons_cross_numeric_variants() {
        let mut ctx = ctx();
        assert_eq!(
            call(&mut ctx, "=", vec![Cell::int(3), Cell::number(3.0)]),
            Cell::bool(true)
        );
        assert_eq!(
            call(&mut ctx, "<", vec![Cell::int(1), Cell::int(2)]),
            Cell::bool(true)
        );
    }

    #[test]
    fn list_primitives() {
        let mut ctx = ctx();
        let pair = call(&mut ctx, "cons", vec![Cell::int(1), Cell::nil()]);
        assert_eq!(call(&mut ctx, "car", vec![pair.clone()]), Cell::int(1));
        assert_eq!(call(&mut ctx, "cdr", vec![pair]), Cell::nil());
        assert_eq!(
            call(&mut ctx, "car", vec![Cell::int(1)]).error_kind(),
            Some("not-a-pair")
        );
    }

    #[test]
    fn boxes_work_through_prims() {
        let mut ctx = ctx();
        let b = call(&mut ctx, "box", vec![Cell::int(1)]);
        assert_eq!(call(&mut ctx, "unbox", vec![b.clone()]), Cell::int(1));
        assert_eq!(
            call(&mut ctx, "box-set!", vec![b.clone(), Cell::int(2)]),
            Cell::int(1)
        );
        assert_eq!(call(&mut ctx, "unbox", vec![b]), Cell::int(2));
    }

    #[test]
    fn error_introspection_consumes() {
        let mut ctx = ctx();
        let err = call(
            &mut ctx,
            "error",
            vec![Cell::symbol(":boom"), Cell::int(42)],
        );
        assert!(err.is_error());
        assert_eq!(
            call(&mut ctx, "error?", vec![err.clone()]),
            Cell::bool(true)
        );
        assert_eq!(
            call(&mut ctx, "error-kind", vec![err.clone()]),
            Cell::symbol(":boom")
        );
        assert_eq!(call(&mut ctx, "error-data", vec![err]), Cell::int(42));
    }

    #[test]
    fn blocking_prims_outside_actor_error() {
        let mut ctx = ctx();
        assert_eq!(
            call(&mut ctx, "recv", vec![]).error_kind(),
            Some("not-in-actor")
        );
        assert_eq!(
            call(&mut ctx, "self", vec![]).error_kind(),
            Some("not-in-actor")
        );
    }

    #[test]
    fn channel_try_ops() {
        let mut ctx = ctx();
        let ch = call(&mut ctx, "chan", vec![Cell::int(2)]);
        assert_eq!(
            call(&mut ctx, "chan-try-send", vec![ch.clone(), Cell::int(1)]),
            Cell::bool(true)
        );
        assert_eq!(
            call(&mut ctx, "chan-try-recv", vec![ch.clone()]),
            Cell::int(1)
        );
        assert_eq!(call(&mut ctx, "chan-try-recv", vec![ch.clone()]), Cell::nil());
        call(&mut ctx, "chan-close", vec![ch.clone()]);
        assert_eq!(
            call(&mut ctx, "chan-try-recv", vec![ch]).error_kind(),
            Some("chan-recv-closed")
        );
    }

    #[test]
    fn capacity_bound_is_visible() {
        let mut ctx = ctx();
        let ch = call(&mut ctx, "chan", vec![Cell::int(4)]);
        for i in 0..4 {
            assert_eq!(
                call(&mut ctx, "chan-try-send", vec![ch.clone(), Cell::int(i)]),
                Cell::bool(true)
            );
        }
        assert_eq!(
            call(&mut ctx, "chan-try-send", vec![ch, Cell::int(99)]),
            Cell::bool(false)
        );
    }
}
