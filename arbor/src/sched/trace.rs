// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The trace ring: per-worker, fixed-size event logs.
//!
//! Records are timestamped with a serialized cycle counter (`rdtscp` on
//! x86-64, `isb; cntvct_el0` on aarch64, monotonic nanoseconds elsewhere)
//! and written to a power-of-two ring with a monotonic cursor. Recording is
//! gated on a single global flag; when disabled the check is one predicted
//! branch. The k-way merge is only meaningful once the workers are parked
//! or joined.

/// Events per ring. Power of two.
pub const TRACE_BUF_CAP: usize = 4096;

/// Scheduler-level event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceKind {
    /// Actor spawned - detail: parent actor id (0 if none).
    Spawn,
    /// Message sent - detail: 0.
    Send,
    /// Message received - detail: 0.
    Recv,
    /// Actor exited - detail: 0 = normal, 1 = error.
    Die,
    /// Work stolen - detail: victim worker id.
    Steal,
    /// Reduction yield - detail: 0.
    Yield,
    /// Blocked actor woken - detail: 0.
    Wake,
    /// Actor resumed - detail: suspend-reason discriminant.
    Resume,
    /// Link created - detail: peer actor id.
    Link,
    /// Monitor added - detail: watcher actor id.
    Monitor,
    /// Exit signal - detail: sender actor id (0 if none).
    ExitSignal,
    /// Timer fired - detail: timer id.
    TimerFire,
    /// Channel send - detail: channel id.
    ChanSend,
    /// Channel receive - detail: channel id.
    ChanRecv,
    /// Channel closed - detail: channel id.
    ChanClose,
}

/// One fixed-size trace record.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    pub timestamp: u64,
    pub worker: u16,
    pub actor: u32,
    pub kind: TraceKind,
    pub detail: u32,
}

/// Serialized timestamp read.
#[must_use]
pub fn timestamp() -> u64 {
    raw_timestamp()
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        fn raw_timestamp() -> u64 {
            let mut aux = 0u32;
            // Safety: rdtscp is unprivileged on every x86-64 we target.
            unsafe { core::arch::x86_64::__rdtscp(&raw mut aux) }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        fn raw_timestamp() -> u64 {
            let ts: u64;
            // Safety: reading the virtual counter is unprivileged; the isb
            // serializes the read against preceding instructions.
            unsafe {
                core::arch::asm!("isb", "mrs {ts}, cntvct_el0", ts = out(reg) ts);
            }
            ts
        }
    } else {
        fn raw_timestamp() -> u64 {
            use std::sync::OnceLock;
            use std::time::Instant;
            static EPOCH: OnceLock<Instant> = OnceLock::new();
            let epoch = EPOCH.get_or_init(Instant::now);
            u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
        }
    }
}

/// A per-worker event ring with a monotonic cursor.
pub(crate) struct TraceRing {
    buf: Vec<TraceEvent>,
    pos: u64,
}

// === impl TraceRing ===

impl TraceRing {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(TRACE_BUF_CAP),
            pos: 0,
        }
    }

    pub(crate) fn record(&mut self, kind: TraceKind, worker: u16, actor: u32, detail: u32) {
        let event = TraceEvent {
            timestamp: timestamp(),
            worker,
            actor,
            kind,
            detail,
        };
        #[allow(clippy::cast_possible_truncation, reason = "masked index")]
        let index = (self.pos & (TRACE_BUF_CAP as u64 - 1)) as usize;
        if index < self.buf.len() {
            self.buf[index] = event;
        } else {
            self.buf.push(event);
        }
        self.pos += 1;
    }

    /// Events in record order, oldest first (handles wrap-around).
    pub(crate) fn snapshot(&self) -> Vec<TraceEvent> {
        if self.pos <= TRACE_BUF_CAP as u64 {
            return self.buf.clone();
        }
        #[allow(clippy::cast_possible_truncation, reason = "masked index")]
        let start = (self.pos & (TRACE_BUF_CAP as u64 - 1)) as usize;
        let mut out = Vec::with_capacity(TRACE_BUF_CAP);
        out.extend_from_slice(&self.buf[start..]);
        out.extend_from_slice(&self.buf[..start]);
        out
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

/// K-way merge of per-worker snapshots into one timestamp-ordered trace,
/// optionally filtered by kind.
#[must_use]
pub(crate) fn merge(rings: Vec<Vec<TraceEvent>>, filter: Option<TraceKind>) -> Vec<TraceEvent> {
    let mut cursors: Vec<usize> = vec![0; rings.len()];
    let total: usize = rings.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);

    loop {
        let mut best: Option<usize> = None;
        let mut best_ts = u64::MAX;
        for (ring_index, ring) in rings.iter().enumerate() {
            let mut cursor = cursors[ring_index];
            // Skip filtered-out events in place.
            while cursor < ring.len()
                && filter.is_some_and(|kind| ring[cursor].kind != kind)
            {
                cursor += 1;
            }
            cursors[ring_index] = cursor;
            if cursor < ring.len() && ring[cursor].timestamp < best_ts {
                best_ts = ring[cursor].timestamp;
                best = Some(ring_index);
            }
        }
        let Some(ring_index) = best else { break };
        out.push(rings[ring_index][cursors[ring_index]]);
        cursors[ring_index] += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic_enough() {
        let a = timestamp();
        let b = timestamp();
        assert!(b >= a);
    }

    #[test]
    fn ring_records_and_snapshots() {
        let mut ring = TraceRing::new();
        ring.record(TraceKind::Spawn, 0, 1, 0);
        ring.record(TraceKind::Send, 0, 1, 0);
        let events = ring.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, TraceKind::Spawn);
        assert_eq!(events[1].kind, TraceKind::Send);
    }

    #[test]
    fn ring_wraps_keeping_newest() {
        let mut ring = TraceRing::new();
        for i in 0..(TRACE_BUF_CAP + 10) {
            ring.record(TraceKind::Yield, 0, u32::try_from(i).unwrap(), 0);
        }
        let events = ring.snapshot();
        assert_eq!(events.len(), TRACE_BUF_CAP);
        assert_eq!(events[0].actor, 10);
        assert_eq!(
            events.last().unwrap().actor,
            u32::try_from(TRACE_BUF_CAP + 9).unwrap()
        );
    }

    #[test]
    fn merge_orders_by_timestamp() {
        let mk = |ts: u64, actor: u32| TraceEvent {
            timestamp: ts,
            worker: 0,
            actor,
            kind: TraceKind::Send,
            detail: 0,
        };
        let merged = merge(vec![vec![mk(1, 1), mk(5, 2)], vec![mk(3, 3)]], None);
        let actors: Vec<u32> = merged.iter().map(|e| e.actor).collect();
        assert_eq!(actors, vec![1, 3, 2]);
    }

    #[test]
    fn merge_filters_by_kind() {
        let mk = |kind: TraceKind, ts: u64| TraceEvent {
            timestamp: ts,
            worker: 0,
            actor: 0,
            kind,
            detail: 0,
        };
        let merged = merge(
            vec![vec![mk(TraceKind::Spawn, 1), mk(TraceKind::Die, 2)]],
            Some(TraceKind::Die),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, TraceKind::Die);
    }
}
