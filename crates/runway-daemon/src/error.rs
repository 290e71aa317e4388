// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runway-daemon.

use thiserror::Error;

/// Daemon errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runner (phase execution) failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Run, workspace or persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] runway_core::CoreError),

    /// A subscriber with this name is already registered.
    #[error("Subscription name already taken: {0}")]
    SubscriptionExists(String),

    /// A notification could not be relayed to other nodes.
    #[error("Notification transport error: {0}")]
    Transport(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The wrapped core error, if any.
    pub fn as_core(&self) -> Option<&runway_core::CoreError> {
        match self {
            Self::Core(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the error means stored state is inconsistent and retrying
    /// cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Core(runway_core::CoreError::ConsistencyViolation { .. })
        )
    }
}

/// Result type using daemon Error.
pub type Result<T> = std::result::Result<T, Error>;
