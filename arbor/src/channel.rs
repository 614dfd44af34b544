// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded MPMC channels.
//!
//! The buffer is a Vyukov-style ring: every slot carries a generation
//! counter, producers CAS the enqueue position forward and publish the slot
//! with a release store of its sequence, consumers mirror that on the
//! dequeue side. Each slot sits on its own cache line.
//!
//! Closing is one-way and published with release ordering. A channel
//! records *at most one* blocked waiter per direction (an actor id);
//! additional contenders recover by re-checking on their next scheduling
//! pass, and stale registrations are swept when the channel is next
//! touched.

use crate::cell::{ActorId, Cell, ChannelId};
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Default capacity when a client asks for zero.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// No waiter registered.
pub(crate) const NO_WAITER: i64 = -1;

/// Which waiter slot an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Recv,
    Send,
}

struct Slot {
    seq: AtomicU64,
    value: UnsafeCell<Option<Cell>>,
}

// Safety: `value` is only touched by the thread that won the corresponding
// position CAS, between its sequence checks; the Vyukov protocol makes that
// access exclusive.
unsafe impl Sync for Slot {}

/// Outcome of a non-blocking send.
#[derive(Debug)]
pub enum TrySend {
    Sent,
    /// Channel full; the value comes back to the caller.
    Full(Cell),
    /// Channel closed; the value comes back to the caller.
    Closed(Cell),
}

/// A bounded MPMC queue of cells with a one-way closed flag.
pub struct Channel {
    id: ChannelId,
    capacity: usize,
    mask: u64,
    closed: AtomicBool,
    enqueue_pos: CachePadded<AtomicU64>,
    dequeue_pos: CachePadded<AtomicU64>,
    /// Approximate count for suspend heuristics only.
    count: AtomicI64,
    /// Actor id blocked on receive, or −1.
    recv_waiter: AtomicI64,
    /// Actor id blocked on send, or −1.
    send_waiter: AtomicI64,
    slots: Box<[CachePadded<Slot>]>,
}

static_assertions::assert_impl_all!(Channel: Send, Sync);

// === impl Channel ===

impl Channel {
    /// Capacity is rounded up to a power of two; slot sequences start at
    /// their index.
    #[must_use]
    pub fn new(id: ChannelId, capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            capacity.next_power_of_two()
        };
        let slots = (0..capacity)
            .map(|i| {
                CachePadded::new(Slot {
                    seq: AtomicU64::new(i as u64),
                    value: UnsafeCell::new(None),
                })
            })
            .collect();
        Self {
            id,
            capacity,
            mask: (capacity as u64) - 1,
            closed: AtomicBool::new(false),
            enqueue_pos: CachePadded::new(AtomicU64::new(0)),
            dequeue_pos: CachePadded::new(AtomicU64::new(0)),
            count: AtomicI64::new(0),
            recv_waiter: AtomicI64::new(NO_WAITER),
            send_waiter: AtomicI64::new(NO_WAITER),
            slots,
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.count.load(Ordering::Acquire).max(0)).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// One-way close, visible to all observers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Non-blocking send. The channel owns the value until it is received.
    pub fn try_send(&self, value: Cell) -> TrySend {
        if self.is_closed() {
            return TrySend::Closed(value);
        }

        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation, reason = "masked index")]
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.cast_signed() - pos.cast_signed();

            if diff == 0 {
                if self
                    .enqueue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: winning the position CAS grants exclusive
                    // access to this slot until the sequence is published.
                    unsafe { *slot.value.get() = Some(value) };
                    slot.seq.store(pos + 1, Ordering::Release);
                    self.count.fetch_add(1, Ordering::Release);
                    return TrySend::Sent;
                }
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return TrySend::Full(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking receive; ownership of the value transfers to the
    /// caller. `None` means empty - the caller distinguishes closed-empty
    /// via [`Self::is_closed`], draining buffered values first.
    pub fn try_recv(&self) -> Option<Cell> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            #[allow(clippy::cast_possible_truncation, reason = "masked index")]
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.cast_signed() - (pos + 1).cast_signed();

            if diff == 0 {
                if self
                    .dequeue_pos
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: winning the position CAS grants exclusive
                    // access to this slot until the sequence is published.
                    let value = unsafe { (*slot.value.get()).take() };
                    slot.seq
                        .store(pos + self.capacity as u64, Ordering::Release);
                    self.count.fetch_sub(1, Ordering::Release);
                    return value;
                }
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to register `actor` as the direction's single blocked waiter.
    /// Fails when another actor already holds the slot.
    pub(crate) fn register_waiter(&self, direction: Direction, actor: ActorId) -> bool {
        let slot = self.waiter_slot(direction);
        slot.compare_exchange(
            NO_WAITER,
            actor.cast_signed(),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    }

    /// Atomically take the registered waiter, if any.
    pub(crate) fn take_waiter(&self, direction: Direction) -> Option<ActorId> {
        let slot = self.waiter_slot(direction);
        let current = slot.load(Ordering::Acquire);
        if current == NO_WAITER {
            return None;
        }
        if slot
            .compare_exchange(current, NO_WAITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Some(current.cast_unsigned());
        }
        None
    }

    /// Drop a stale registration left by `actor` (select resume sweep).
    pub(crate) fn clear_waiter(&self, direction: Direction, actor: ActorId) {
        let slot = self.waiter_slot(direction);
        let _ = slot.compare_exchange(
            actor.cast_signed(),
            NO_WAITER,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn waiter_slot(&self, direction: Direction) -> &AtomicI64 {
        match direction {
            Direction::Recv => &self.recv_waiter,
            Direction::Send => &self.send_waiter,
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Release whatever is still buffered.
        while self.try_recv().is_some() {}
    }
}

/// Channels by id.
pub struct ChannelRegistry {
    map: dashmap::DashMap<ChannelId, std::sync::Arc<Channel>>,
    next: AtomicU64,
}

// === impl ChannelRegistry ===

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self {
            map: dashmap::DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_id(&self) -> ChannelId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, channel: std::sync::Arc<Channel>) {
        self.map.insert(channel.id(), channel);
    }

    #[must_use]
    pub fn get(&self, id: ChannelId) -> Option<std::sync::Arc<Channel>> {
        self.map.get(&id).map(|entry| std::sync::Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: ChannelId) {
        self.map.remove(&id);
    }

    pub(crate) fn reset(&self) {
        self.map.clear();
        self.next.store(1, Ordering::Relaxed);
    }
}

// === channel operations on the runtime ===

use crate::fiber::SuspendReason;
use crate::sched::{Runtime, TraceKind};

impl Runtime {
    /// Create a channel, returning its handle cell.
    pub fn channel_create(&self, capacity: usize) -> Cell {
        let id = self.channels().allocate_id();
        self.channels()
            .insert(std::sync::Arc::new(Channel::new(id, capacity)));
        Cell::channel(id)
    }

    /// Close a channel and wake both waiter slots so blocked parties can
    /// observe the closed state.
    pub fn channel_close(&self, id: ChannelId) {
        if let Some(channel) = self.channels().get(id) {
            channel.close();
            self.trace(TraceKind::ChanClose, 0, u32::try_from(id).unwrap_or(0));
            self.wake_channel_waiter(&channel, Direction::Recv);
            self.wake_channel_waiter(&channel, Direction::Send);
            self.notify_workers();
        }
    }

    /// Drop a channel from the registry. Buffered values are released with
    /// the last handle.
    pub fn channel_destroy(&self, id: ChannelId) {
        self.channels().remove(id);
    }

    /// Non-blocking send through the registry, waking a blocked receiver
    /// on success.
    pub fn channel_try_send(&self, id: ChannelId, value: Cell) -> TrySend {
        let Some(channel) = self.channels().get(id) else {
            return TrySend::Closed(value);
        };
        let outcome = channel.try_send(value);
        if matches!(outcome, TrySend::Sent) {
            self.trace(TraceKind::ChanSend, 0, u32::try_from(id).unwrap_or(0));
            self.wake_channel_waiter(&channel, Direction::Recv);
        }
        outcome
    }

    /// Non-blocking receive through the registry, waking a blocked sender
    /// on success.
    pub fn channel_try_recv(&self, id: ChannelId) -> Option<Cell> {
        let channel = self.channels().get(id)?;
        let value = channel.try_recv();
        if value.is_some() {
            self.trace(TraceKind::ChanRecv, 0, u32::try_from(id).unwrap_or(0));
            self.wake_channel_waiter(&channel, Direction::Send);
        }
        value
    }

    /// Take the direction's registered waiter, if any, and make it
    /// runnable. Dead or mismatched registrations are swept.
    pub(crate) fn wake_channel_waiter(&self, channel: &Channel, direction: Direction) {
        let Some(waiter) = channel.take_waiter(direction) else {
            return;
        };
        let Some(actor) = self.actors().get(waiter) else {
            return;
        };
        let chan_id = channel.id();
        self.wake_if_blocked_on(&actor, |reason| match direction {
            Direction::Recv => matches!(
                reason,
                SuspendReason::ChanRecv { chan } if *chan == chan_id
            ) || matches!(
                reason,
                SuspendReason::Select { chans } if chans.contains(&chan_id)
            ),
            Direction::Send => matches!(
                reason,
                SuspendReason::ChanSend { chan, .. } if *chan == chan_id
            ),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let ch = Channel::new(1, 5);
        assert_eq!(ch.capacity(), 8);
        let ch = Channel::new(2, 0);
        assert_eq!(ch.capacity(), DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn fifo_order() {
        let ch = Channel::new(1, 4);
        for i in 0..4 {
            assert!(matches!(ch.try_send(Cell::int(i)), TrySend::Sent));
        }
        for i in 0..4 {
            assert_eq!(ch.try_recv(), Some(Cell::int(i)));
        }
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn full_rejects_with_value_back() {
        let ch = Channel::new(1, 2);
        assert!(matches!(ch.try_send(Cell::int(1)), TrySend::Sent));
        assert!(matches!(ch.try_send(Cell::int(2)), TrySend::Sent));
        match ch.try_send(Cell::int(3)) {
            TrySend::Full(v) => assert_eq!(v, Cell::int(3)),
            other => panic!("expected Full, got {other:?}"),
        }
    }

    #[test]
    fn closed_channel_drains_then_reports_closed() {
        let ch = Channel::new(1, 4);
        ch.try_send(Cell::int(1));
        ch.close();
        match ch.try_send(Cell::int(2)) {
            TrySend::Closed(v) => assert_eq!(v, Cell::int(2)),
            other => panic!("expected Closed, got {other:?}"),
        }
        // Buffered values drain before the closed state matters.
        assert_eq!(ch.try_recv(), Some(Cell::int(1)));
        assert_eq!(ch.try_recv(), None);
        assert!(ch.is_closed());
    }

    #[test]
    fn single_waiter_slot_per_direction() {
        let ch = Channel::new(1, 2);
        assert!(ch.register_waiter(Direction::Recv, 10));
        assert!(!ch.register_waiter(Direction::Recv, 11));
        // The send side is independent.
        assert!(ch.register_waiter(Direction::Send, 11));
        assert_eq!(ch.take_waiter(Direction::Recv), Some(10));
        assert_eq!(ch.take_waiter(Direction::Recv), None);
        ch.clear_waiter(Direction::Send, 11);
        assert_eq!(ch.take_waiter(Direction::Send), None);
    }

    #[test]
    fn mpmc_under_contention() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicI64;

        let ch = Arc::new(Channel::new(1, 16));
        let sum = Arc::new(AtomicI64::new(0));
        let mut handles = Vec::new();

        for t in 0..4i64 {
            let ch = Arc::clone(&ch);
            handles.push(std::thread::spawn(move || {
                for i in 0..250i64 {
                    let v = t * 1000 + i;
                    loop {
                        match ch.try_send(Cell::int(v)) {
                            TrySend::Sent => break,
                            TrySend::Full(_) => std::thread::yield_now(),
                            TrySend::Closed(_) => unreachable!(),
                        }
                    }
                }
            }));
        }
        for _ in 0..2 {
            let ch = Arc::clone(&ch);
            let sum = Arc::clone(&sum);
            handles.push(std::thread::spawn(move || {
                let mut received = 0;
                while received < 500 {
                    if let Some(v) = ch.try_recv() {
                        sum.fetch_add(v.as_int().unwrap(), Ordering::Relaxed);
                        received += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let expected: i64 = (0..4i64)
            .map(|t| (0..250i64).map(|i| t * 1000 + i).sum::<i64>())
            .sum();
        assert_eq!(sum.load(Ordering::Relaxed), expected);
    }
}
