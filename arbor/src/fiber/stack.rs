// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pooled fiber stacks.
//!
//! Each stack is an anonymous mapping with the lowest page protected as a
//! guard (stack overflow traps instead of corrupting a neighbour) and every
//! usable page pre-faulted. Stacks return to their worker's pool when the
//! fiber that used them is torn down, amortizing allocation across fiber
//! lifetimes.

use corosensei::stack::{Stack, StackPointer};
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, OnceLock, Weak};

/// Maximum pooled stacks per worker.
pub(crate) const STACK_POOL_MAX: usize = 64;

fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // Safety: sysconf with a valid name has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(raw).unwrap_or(4096)
    })
}

/// An owned guard-paged stack mapping.
struct RawStack {
    /// Mapping base (the guard page).
    base: *mut libc::c_void,
    /// Total mapping length, guard included.
    total: usize,
    /// Lowest usable address.
    bottom: usize,
    /// One past the highest usable address.
    top: usize,
}

// Safety: the mapping is exclusively owned; the raw pointer is only used
// for the final munmap.
unsafe impl Send for RawStack {}

/// Minimum usable stack size.
const MIN_STACK_SIZE: usize = 4096;

impl RawStack {
    fn alloc(usable: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = usable.max(MIN_STACK_SIZE).div_ceil(page) * page;
        let total = usable + page;

        // Safety: anonymous private mapping, no address hint.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the lowest address; the stack grows down into it.
        // Safety: `base` is the start of our own fresh mapping.
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            // Safety: unmapping the mapping we just created.
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        let bottom = base as usize + page;

        // Pre-fault the usable region so first use never takes page faults
        // mid-quantum.
        for offset in (0..usable).step_by(page) {
            // Safety: in-bounds write within our RW mapping.
            unsafe { std::ptr::write_volatile((bottom + offset) as *mut u8, 0) };
        }

        Ok(Self {
            base,
            total,
            bottom,
            top: bottom + usable,
        })
    }
}

impl Drop for RawStack {
    fn drop(&mut self) {
        // Safety: `base`/`total` describe a mapping we own exclusively.
        unsafe { libc::munmap(self.base, self.total) };
    }
}

/// Per-worker stack pool.
pub(crate) struct StackPool {
    usable: usize,
    free: Mutex<Vec<RawStack>>,
}

impl StackPool {
    pub(crate) fn new(usable: usize) -> Arc<Self> {
        Arc::new(Self {
            usable,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Pop a pooled stack or map a fresh one.
    pub(crate) fn take(self: &Arc<Self>) -> io::Result<PooledStack> {
        let raw = match self.free.lock().pop() {
            Some(raw) => raw,
            None => RawStack::alloc(self.usable)?,
        };
        Ok(PooledStack {
            raw: Some(raw),
            pool: Arc::downgrade(self),
        })
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

/// A stack checked out of a [`StackPool`]; returns to the pool on drop.
pub(crate) struct PooledStack {
    raw: Option<RawStack>,
    pool: Weak<StackPool>,
}

impl Drop for PooledStack {
    fn drop(&mut self) {
        let Some(raw) = self.raw.take() else { return };
        if let Some(pool) = self.pool.upgrade() {
            let mut free = pool.free.lock();
            if free.len() < STACK_POOL_MAX {
                free.push(raw);
                return;
            }
        }
        // Pool gone or full: munmap via RawStack's drop.
    }
}

impl PooledStack {
    fn raw(&self) -> &RawStack {
        self.raw.as_ref().expect("stack taken only in drop")
    }
}

// Safety: `base` is the top (highest address) of a mapping that stays valid
// and exclusively owned for the lifetime of this value; `limit` is the
// lowest address of the mapping, guard page included, per the trait's
// contract. Both are page-aligned, which satisfies the 16-byte alignment
// the platform ABIs require.
unsafe impl Stack for PooledStack {
    fn base(&self) -> StackPointer {
        StackPointer::new(self.raw().top).expect("stack top is never null")
    }

    fn limit(&self) -> StackPointer {
        StackPointer::new(self.raw().base as usize).expect("stack base is never null")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_return_round_trips() {
        let pool = StackPool::new(64 * 1024);
        let stack = pool.take().unwrap();
        let top = stack.base().get();
        let bottom = stack.limit().get();
        assert!(top > bottom);
        assert_eq!((top - bottom) % page_size(), 0);
        drop(stack);
        assert_eq!(pool.pooled(), 1);

        // The pooled mapping is reused.
        let again = pool.take().unwrap();
        assert_eq!(again.base().get(), top);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn dead_pool_unmaps_instead_of_pooling() {
        let pool = StackPool::new(16 * 1024);
        let stack = pool.take().unwrap();
        drop(pool);
        drop(stack);
    }

    #[test]
    fn usable_region_is_writable_above_the_guard() {
        let pool = StackPool::new(16 * 1024);
        let stack = pool.take().unwrap();
        // The guard page sits at `limit`; the usable region starts one
        // page above it.
        let lowest_usable = stack.limit().get() + page_size();
        let top = stack.base().get();
        // Safety: addresses are within the RW region of the mapping.
        unsafe {
            std::ptr::write_volatile(lowest_usable as *mut u8, 0xAA);
            std::ptr::write_volatile((top - 1) as *mut u8, 0xBB);
        }
    }
}
