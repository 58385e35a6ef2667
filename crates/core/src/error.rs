// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds the arbiter core defines and surfaces.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by arbiter operations.
///
/// Transient syscall conditions (interrupted or would-block waits) are
/// retried internally and never reach this type. A child's non-zero exit
/// is an event, not an error.
#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("watcher `{0}` already exists")]
    AlreadyExists(String),

    #[error("unknown watcher or socket `{0}`")]
    NotFound(String),

    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    #[error("initialization failed: {0}")]
    Init(String),

    #[error("no configuration file to reload from")]
    MissingConfigFile,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
