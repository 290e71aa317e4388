// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runway Daemon - Terraform run orchestration node
//!
//! A single node process responsible for:
//! - Event bus (Postgres LISTEN/NOTIFY relayed to in-process subscribers)
//! - Scheduler (one active node cluster-wide, per-workspace run queues)
//! - Agent (claims queued plan/apply phases and runs the engine binary)

use std::sync::Arc;
use tracing::{info, warn};

use runway_core::PostgresPersistence;
use runway_daemon::config::Config;
use runway_daemon::pubsub::PgNotifyTransport;
use runway_daemon::runner::{ProcessRunner, ProcessRunnerConfig, Runner};
use runway_daemon::runtime::DaemonRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runway_daemon=info,runway_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        channel = %config.events_channel,
        scheduler = config.scheduler_enabled,
        agent = config.agent_enabled,
        data_dir = %config.data_dir.display(),
        "Starting Runway Daemon"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    runway_core::migrations::run_postgres(&pool).await?;

    info!("Database schema verified");

    let runner = Arc::new(ProcessRunner::new(ProcessRunnerConfig {
        engine_bin: config.engine_bin.clone(),
    }));
    info!(runner_type = runner.runner_type(), engine = %config.engine_bin.display(), "Runner initialized");

    let runtime = DaemonRuntime::builder()
        .persistence(Arc::new(PostgresPersistence::new(pool.clone())))
        .transport(Arc::new(PgNotifyTransport::new(pool)))
        .runner(runner)
        .events_channel(&config.events_channel)
        .scheduler_enabled(config.scheduler_enabled)
        .agent_enabled(config.agent_enabled)
        .agent_concurrency(config.agent_concurrency)
        .data_dir(&config.data_dir)
        .reseed_interval(config.reseed_interval)
        .build()?
        .start()
        .await?;

    info!("Runway Daemon ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Runway Daemon shut down");

    Ok(())
}
