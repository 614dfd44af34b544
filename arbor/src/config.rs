// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::ConfigError;

/// Hard cap on scheduler workers.
pub const MAX_SCHEDULERS: usize = 16;

/// Reductions granted per quantum. One evaluator dispatch step costs one
/// reduction.
pub const DEFAULT_REDUCTIONS: i32 = 4000;

/// Default fiber stack size (usable region, excluding the guard page).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default per-actor mailbox capacity. Must be a power of two.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Default supervisor restart cap.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Runtime construction parameters.
///
/// With `deterministic` set (or a `seed` given), the runtime forces a single
/// worker and seeds the steal RNG so that two runs of the same program
/// replay the same scheduled order of actor activations.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of scheduler workers, clamped to `1..=MAX_SCHEDULERS`.
    pub workers: usize,
    /// Reduction quantum granted per scheduling slice.
    pub reductions: i32,
    /// Seed for the steal-victim RNG.
    pub seed: Option<u64>,
    /// Force single-worker deterministic scheduling.
    pub deterministic: bool,
    /// Usable fiber stack size in bytes (rounded up to whole pages).
    pub stack_size: usize,
    /// Mailbox capacity per actor (rounded up to a power of two).
    pub mailbox_capacity: usize,
    /// Supervisor restart cap.
    pub max_restarts: u32,
    /// Start with trace recording enabled.
    pub trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            reductions: DEFAULT_REDUCTIONS,
            seed: None,
            deterministic: false,
            stack_size: DEFAULT_STACK_SIZE,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            max_restarts: DEFAULT_MAX_RESTARTS,
            trace: false,
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the environment: `ARBOR_SCHEDULERS`,
    /// `ARBOR_REDUCTIONS`, `ARBOR_SEED`, `ARBOR_DETERMINISTIC`,
    /// `ARBOR_STACK_SIZE`, `ARBOR_TRACE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = read_env("ARBOR_SCHEDULERS")? {
            config.workers = v;
        }
        if let Some(v) = read_env("ARBOR_REDUCTIONS")? {
            config.reductions = v;
        }
        if let Ok(raw) = std::env::var("ARBOR_SEED") {
            let seed = raw
                .parse::<u64>()
                .unwrap_or_else(|_| u64::from(hash_seed(&raw)));
            config.seed = Some(seed);
        }
        if let Some(v) = read_env::<u8>("ARBOR_DETERMINISTIC")? {
            config.deterministic = v != 0;
        }
        if let Some(v) = read_env("ARBOR_STACK_SIZE")? {
            config.stack_size = v;
        }
        if let Some(v) = read_env::<u8>("ARBOR_TRACE")? {
            config.trace = v != 0;
        }

        Ok(config)
    }

    pub(crate) fn effective_workers(&self) -> usize {
        let n = if self.deterministic { 1 } else { self.workers };
        n.clamp(1, MAX_SCHEDULERS)
    }
}

fn read_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Derive a stable RNG seed from a string (FNV-1a).
#[must_use]
pub fn hash_seed(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.bytes() {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.effective_workers(), 1);
        assert_eq!(config.reductions, DEFAULT_REDUCTIONS);
    }

    #[test]
    fn deterministic_forces_single_worker() {
        let config = RuntimeConfig {
            workers: 8,
            deterministic: true,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.effective_workers(), 1);
    }

    #[test]
    fn seed_hash_is_stable() {
        assert_eq!(hash_seed("arbor"), hash_seed("arbor"));
        assert_ne!(hash_seed("arbor"), hash_seed("robra"));
    }
}
