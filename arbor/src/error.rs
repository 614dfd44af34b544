// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Embedder-facing errors.
//!
//! Failures *inside* the language flow as error cells and never unwind (see
//! [`crate::cell::Cell::error`]); the enums here cover the host-level
//! surface: registries and configuration.

use thiserror::Error;

/// Errors returned by the named-process and ETS registries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("registry is full")]
    Full,
    #[error("name is already registered")]
    DuplicateName,
    #[error("actor is already registered under another name")]
    DuplicateActor,
    #[error("actor is not alive")]
    Dead,
    #[error("no such entry")]
    NotFound,
}

/// Errors produced while reading [`RuntimeConfig`](crate::RuntimeConfig)
/// from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}
