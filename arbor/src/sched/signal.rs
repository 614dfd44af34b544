// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The POSIX signal bridge.
//!
//! Classic self-pipe: the handler is async-signal-safe and only writes the
//! signal number to the write end of a non-blocking pipe. Worker 0 drains
//! the read end while idle and forwards `(:signal <name>)` to whichever
//! actor registered for the signal, through the ordinary send-and-wake
//! path.

#![cfg(unix)]

use super::Runtime;
use crate::cell::{ActorId, Cell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

/// Write end of the self-pipe; read by the handler, so it lives in a
/// process-wide atomic rather than in any structure.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe handler: a single byte write, nothing else.
extern "C" fn on_signal(signum: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [u8::try_from(signum).unwrap_or(0)];
        // Safety: write(2) is async-signal-safe per POSIX; the fd outlives
        // every registered handler.
        unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }
}

struct Registration {
    signum: i32,
    actor: ActorId,
    prev: libc::sigaction,
}

pub(crate) struct SignalBridge {
    read_fd: AtomicI32,
    registrations: Mutex<Vec<Registration>>,
}

// === impl SignalBridge ===

impl SignalBridge {
    pub(crate) fn new() -> Self {
        Self {
            read_fd: AtomicI32::new(-1),
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Create the pipe on first use.
    fn ensure_pipe(&self) -> bool {
        if self.read_fd.load(Ordering::Acquire) >= 0 {
            return true;
        }
        let mut fds = [0i32; 2];
        // Safety: fds points at two writable ints.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return false;
        }
        for fd in fds {
            // Safety: fcntl on fds we just created.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        SIGNAL_PIPE_WR.store(fds[1], Ordering::Release);
        self.read_fd.store(fds[0], Ordering::Release);
        true
    }

    /// Route `signum` to `actor`. Re-registration updates the target.
    pub(crate) fn register(&self, signum: i32, actor: ActorId) -> bool {
        if !self.ensure_pipe() {
            return false;
        }

        let mut registrations = self.registrations.lock();
        if let Some(existing) = registrations.iter_mut().find(|r| r.signum == signum) {
            existing.actor = actor;
            return true;
        }

        // Safety: sigaction with a zeroed struct we then fill in; the
        // handler only does an async-signal-safe write.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&raw mut action.sa_mask);

            let mut prev: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signum, &raw const action, &raw mut prev) != 0 {
                return false;
            }
            registrations.push(Registration {
                signum,
                actor,
                prev,
            });
        }
        true
    }

    /// Restore the previous handlers and forget all registrations.
    pub(crate) fn reset(&self) {
        let mut registrations = self.registrations.lock();
        for registration in registrations.drain(..) {
            // Safety: restoring the sigaction captured at registration.
            unsafe {
                libc::sigaction(registration.signum, &raw const registration.prev, std::ptr::null_mut());
            }
        }
    }

    fn target_for(&self, signum: i32) -> Option<ActorId> {
        self.registrations
            .lock()
            .iter()
            .find(|r| r.signum == signum)
            .map(|r| r.actor)
    }
}

/// Symbolic names for the common signals.
fn signal_name(signum: i32) -> Cell {
    let name = match signum {
        libc::SIGHUP => ":SIGHUP",
        libc::SIGINT => ":SIGINT",
        libc::SIGTERM => ":SIGTERM",
        libc::SIGUSR1 => ":SIGUSR1",
        libc::SIGUSR2 => ":SIGUSR2",
        libc::SIGALRM => ":SIGALRM",
        libc::SIGCHLD => ":SIGCHLD",
        _ => return Cell::int(i64::from(signum)),
    };
    Cell::symbol(name)
}

impl Runtime {
    /// Register `actor` for `signum`.
    pub fn signal_register(&self, signum: i32, actor: ActorId) -> bool {
        self.signals().register(signum, actor)
    }

    /// Drain pending signals and forward them as `(:signal <name>)`
    /// messages. Called by worker 0 while idle. Returns `true` when
    /// anything was delivered.
    pub(crate) fn signal_drain(&self) -> bool {
        let fd = self.signals().read_fd.load(Ordering::Acquire);
        if fd < 0 {
            return false;
        }

        let mut any = false;
        let mut buf = [0u8; 64];
        loop {
            // Safety: reading into a local buffer from our own
            // non-blocking pipe.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            #[expect(clippy::cast_sign_loss, reason = "n > 0 checked above")]
            for &byte in &buf[..n as usize] {
                let signum = i32::from(byte);
                if let Some(target) = self.signals().target_for(signum) {
                    let message = Cell::list([Cell::symbol(":signal"), signal_name(signum)]);
                    self.send(target, &message);
                    any = true;
                }
            }
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeConfig;
    use crate::eval::EvalCtx;
    use std::sync::Arc;

    #[test]
    fn raised_signal_becomes_a_message() {
        let rt = Runtime::new(RuntimeConfig::default());
        let mut ctx = EvalCtx::new(Arc::clone(&rt));
        let behavior = ctx.eval(&Cell::list([
            Cell::symbol("lambda"),
            Cell::list([Cell::symbol("self")]),
            Cell::nil(),
        ]));
        let target = rt.spawn(&ctx, behavior).actor_id().unwrap();

        assert!(rt.signal_register(libc::SIGUSR1, target));
        // Safety: raising a signal we just installed a handler for.
        unsafe { libc::raise(libc::SIGUSR1) };

        // The handler write is synchronous with raise on the same thread.
        assert!(rt.signal_drain());
        let msg = rt.receive(target).unwrap();
        assert_eq!(
            msg,
            Cell::list([Cell::symbol(":signal"), Cell::symbol(":SIGUSR1")])
        );

        rt.signals().reset();
    }
}
