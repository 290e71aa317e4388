// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for runway-daemon.

use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// LISTEN/NOTIFY channel shared by every node
    pub events_channel: String,
    /// Whether this node competes for the scheduler lock
    pub scheduler_enabled: bool,
    /// Whether this node executes queued phases
    pub agent_enabled: bool,
    /// Maximum phases executed concurrently by the agent
    pub agent_concurrency: usize,
    /// Path of the IaC engine binary
    pub engine_bin: PathBuf,
    /// Working directory root for phase execution
    pub data_dir: PathBuf,
    /// How often the scheduler reconciles its queues with storage
    pub reseed_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNWAY_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("RUNWAY_DATABASE_URL"))?;

        let events_channel =
            std::env::var("RUNWAY_EVENTS_CHANNEL").unwrap_or_else(|_| "events".to_string());

        let scheduler_enabled = flag("RUNWAY_SCHEDULER_ENABLED", true);
        let agent_enabled = flag("RUNWAY_AGENT_ENABLED", true);

        let agent_concurrency: usize = std::env::var("RUNWAY_AGENT_CONCURRENCY")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::InvalidValue("RUNWAY_AGENT_CONCURRENCY"))?;

        let engine_bin = PathBuf::from(
            std::env::var("RUNWAY_ENGINE_BIN").unwrap_or_else(|_| "terraform".to_string()),
        );

        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let reseed_secs: u64 = std::env::var("RUNWAY_RESEED_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RUNWAY_RESEED_INTERVAL_SECS"))?;

        Ok(Self {
            database_url,
            events_channel,
            scheduler_enabled,
            agent_enabled,
            agent_concurrency,
            engine_bin,
            data_dir,
            reseed_interval: Duration::from_secs(reseed_secs),
        })
    }
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
