// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runway-daemon.
//!
//! This module provides [`DaemonRuntime`], which wires the event broker,
//! services, scheduler and agent together and runs them as background tasks
//! of an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runway_core::PostgresPersistence;
//! use runway_daemon::pubsub::PgNotifyTransport;
//! use runway_daemon::runner::{ProcessRunner, ProcessRunnerConfig};
//! use runway_daemon::runtime::DaemonRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = DaemonRuntime::builder()
//!         .persistence(Arc::new(PostgresPersistence::new(pool.clone())))
//!         .transport(Arc::new(PgNotifyTransport::new(pool)))
//!         .runner(Arc::new(ProcessRunner::new(ProcessRunnerConfig::default())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use runway_core::Persistence;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::{Agent, AgentConfig};
use crate::pubsub::{Broker, DEFAULT_CHANNEL, NotifyTransport};
use crate::runner::Runner;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::services::Services;

/// Builder for creating a [`DaemonRuntime`].
pub struct DaemonRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    transport: Option<Arc<dyn NotifyTransport>>,
    runner: Option<Arc<dyn Runner>>,
    events_channel: String,
    scheduler_enabled: bool,
    agent_enabled: bool,
    agent_id: Option<String>,
    agent_concurrency: usize,
    data_dir: PathBuf,
    reseed_interval: Duration,
}

impl Default for DaemonRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            transport: None,
            runner: None,
            events_channel: DEFAULT_CHANNEL.to_string(),
            scheduler_enabled: true,
            agent_enabled: true,
            agent_id: None,
            agent_concurrency: 5,
            data_dir: PathBuf::from(".data"),
            reseed_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl DaemonRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the notification transport shared with other nodes (required).
    pub fn transport(mut self, transport: Arc<dyn NotifyTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the phase runner (required when the agent is enabled).
    pub fn runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the notification channel name.
    ///
    /// Default: `events`
    pub fn events_channel(mut self, channel: impl Into<String>) -> Self {
        self.events_channel = channel.into();
        self
    }

    /// Enable or disable competing for the scheduler lock.
    ///
    /// Default: enabled
    pub fn scheduler_enabled(mut self, enabled: bool) -> Self {
        self.scheduler_enabled = enabled;
        self
    }

    /// Enable or disable phase execution on this node.
    ///
    /// Default: enabled
    pub fn agent_enabled(mut self, enabled: bool) -> Self {
        self.agent_enabled = enabled;
        self
    }

    /// Set the agent identifier recorded on claimed phases.
    ///
    /// Default: `agent-<random>`
    pub fn agent_id(mut self, id: impl Into<String>) -> Self {
        self.agent_id = Some(id.into());
        self
    }

    /// Set how many phases the agent executes at once.
    ///
    /// Default: 5
    pub fn agent_concurrency(mut self, concurrency: usize) -> Self {
        self.agent_concurrency = concurrency;
        self
    }

    /// Set the root of the per-run working directories.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set how often the scheduler reconciles its queues with storage.
    ///
    /// Default: 5 minutes
    pub fn reseed_interval(mut self, interval: Duration) -> Self {
        self.reseed_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<DaemonRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("transport is required"))?;
        let runner = match (self.agent_enabled, self.runner) {
            (true, None) => anyhow::bail!("runner is required when the agent is enabled"),
            (_, runner) => runner,
        };
        if self.agent_concurrency == 0 {
            anyhow::bail!("agent_concurrency must be at least 1");
        }

        let mut agent = AgentConfig {
            concurrency: self.agent_concurrency,
            data_dir: self.data_dir,
            ..Default::default()
        };
        if let Some(id) = self.agent_id {
            agent.agent_id = id;
        }

        Ok(DaemonRuntimeConfig {
            persistence,
            transport,
            runner: if self.agent_enabled { runner } else { None },
            events_channel: self.events_channel,
            scheduler: self.scheduler_enabled.then(|| SchedulerConfig {
                reseed_interval: self.reseed_interval,
                ..Default::default()
            }),
            agent,
        })
    }
}

/// Configuration for a [`DaemonRuntime`].
pub struct DaemonRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    transport: Arc<dyn NotifyTransport>,
    runner: Option<Arc<dyn Runner>>,
    events_channel: String,
    scheduler: Option<SchedulerConfig>,
    agent: AgentConfig,
}

impl DaemonRuntimeConfig {
    /// Start the runtime, spawning the event listener, scheduler and agent
    /// tasks.
    pub async fn start(self) -> Result<DaemonRuntime> {
        let broker = Arc::new(Broker::new(self.transport, self.events_channel));
        let services = Services::new(self.persistence.clone(), broker.clone());
        services.register_getters(&broker);

        let listener_shutdown = CancellationToken::new();
        let listener_handle = {
            let broker = broker.clone();
            let cancel = listener_shutdown.clone();
            tokio::spawn(async move { broker.run_listener(cancel).await })
        };

        let scheduler = self.scheduler.map(|config| {
            let scheduler = Arc::new(Scheduler::new(
                self.persistence.clone(),
                Arc::new(services.clone()),
                broker.clone(),
                config,
            ));
            let task = scheduler.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = task.run().await {
                    error!(error = %e, "Scheduler exited");
                }
            });
            (scheduler, handle)
        });
        if scheduler.is_none() {
            debug!("Scheduler disabled on this node");
        }

        let agent = self.runner.map(|runner| {
            let agent = Arc::new(Agent::new(
                services.clone(),
                broker.clone(),
                runner,
                self.agent,
            ));
            let task = agent.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = task.run().await {
                    error!(error = %e, "Agent exited");
                }
            });
            (agent, handle)
        });
        if agent.is_none() {
            debug!("Agent disabled on this node");
        }

        info!(
            channel = %broker.channel(),
            pid = %broker.pid(),
            scheduler = scheduler.is_some(),
            agent = agent.is_some(),
            "DaemonRuntime started"
        );

        Ok(DaemonRuntime {
            broker,
            services,
            listener_handle,
            listener_shutdown,
            scheduler,
            agent,
        })
    }
}

/// A running runway node that can be embedded in an application.
///
/// The runtime manages:
/// - the event listener relaying notifications from other nodes
/// - the scheduler, competing for the cluster-wide scheduler lock (optional)
/// - the agent executing queued phases (optional)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct DaemonRuntime {
    broker: Arc<Broker>,
    services: Services,
    listener_handle: JoinHandle<()>,
    listener_shutdown: CancellationToken,
    scheduler: Option<(Arc<Scheduler>, JoinHandle<()>)>,
    agent: Option<(Arc<Agent>, JoinHandle<()>)>,
}

impl DaemonRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> DaemonRuntimeBuilder {
        DaemonRuntimeBuilder::new()
    }

    /// The event broker.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// The application services.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The scheduler, if enabled on this node.
    pub fn scheduler(&self) -> Option<&Arc<Scheduler>> {
        self.scheduler.as_ref().map(|(s, _)| s)
    }

    /// The agent, if enabled on this node.
    pub fn agent(&self) -> Option<&Arc<Agent>> {
        self.agent.as_ref().map(|(a, _)| a)
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the agent first so interrupted phases can still report their
    /// outcome, then the scheduler, then the event listener.
    pub async fn shutdown(self) -> Result<()> {
        info!("DaemonRuntime shutting down...");

        if let Some((agent, handle)) = self.agent {
            agent.shutdown_handle().cancel();
            if let Err(e) = handle.await {
                error!("Agent task panicked: {}", e);
            }
        }

        if let Some((scheduler, handle)) = self.scheduler {
            scheduler.shutdown_handle().cancel();
            if let Err(e) = handle.await {
                error!("Scheduler task panicked: {}", e);
            }
        }

        self.listener_shutdown.cancel();
        if let Err(e) = self.listener_handle.await {
            error!("Event listener task panicked: {}", e);
            return Err(anyhow::anyhow!("event listener task panicked: {}", e));
        }

        info!("DaemonRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        let scheduler_running = self
            .scheduler
            .as_ref()
            .is_none_or(|(_, h)| !h.is_finished());
        let agent_running = self.agent.as_ref().is_none_or(|(_, h)| !h.is_finished());

        !self.listener_handle.is_finished() && scheduler_running && agent_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryTransport;
    use crate::runner::MockRunner;
    use runway_core::MemoryPersistence;

    #[test]
    fn test_builder_default_values() {
        let builder = DaemonRuntimeBuilder::default();
        assert!(builder.persistence.is_none());
        assert!(builder.transport.is_none());
        assert!(builder.runner.is_none());
        assert_eq!(builder.events_channel, "events");
        assert!(builder.scheduler_enabled);
        assert!(builder.agent_enabled);
        assert_eq!(builder.agent_concurrency, 5);
        assert_eq!(builder.data_dir, PathBuf::from(".data"));
        assert_eq!(builder.reseed_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_builder_new_equals_default() {
        let a = DaemonRuntimeBuilder::new();
        let b = DaemonRuntimeBuilder::default();
        assert_eq!(a.events_channel, b.events_channel);
        assert_eq!(a.agent_concurrency, b.agent_concurrency);
        assert_eq!(a.reseed_interval, b.reseed_interval);
    }

    #[test]
    fn test_builder_chaining() {
        let builder = DaemonRuntime::builder()
            .events_channel("runway")
            .scheduler_enabled(false)
            .agent_id("agent-test")
            .agent_concurrency(2)
            .data_dir("/tmp/runway")
            .reseed_interval(Duration::from_secs(10));

        assert_eq!(builder.events_channel, "runway");
        assert!(!builder.scheduler_enabled);
        assert_eq!(builder.agent_id.as_deref(), Some("agent-test"));
        assert_eq!(builder.agent_concurrency, 2);
        assert_eq!(builder.data_dir, PathBuf::from("/tmp/runway"));
        assert_eq!(builder.reseed_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_builder_build_fails_without_persistence() {
        let result = DaemonRuntime::builder()
            .transport(Arc::new(MemoryTransport::new()))
            .runner(Arc::new(MockRunner::new()))
            .build();
        let err = result.err().expect("build should fail");
        assert!(err.to_string().contains("persistence is required"));
    }

    #[test]
    fn test_builder_build_fails_without_runner() {
        let result = DaemonRuntime::builder()
            .persistence(Arc::new(MemoryPersistence::new()))
            .transport(Arc::new(MemoryTransport::new()))
            .build();
        let err = result.err().expect("build should fail");
        assert!(err.to_string().contains("runner is required"));

        let config = DaemonRuntime::builder()
            .persistence(Arc::new(MemoryPersistence::new()))
            .transport(Arc::new(MemoryTransport::new()))
            .agent_enabled(false)
            .build()
            .unwrap();
        assert!(config.runner.is_none());
        assert!(config.scheduler.is_some());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = DaemonRuntime::builder()
            .persistence(Arc::new(MemoryPersistence::new()))
            .transport(Arc::new(MemoryTransport::new()))
            .runner(Arc::new(MockRunner::new()))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert!(runtime.scheduler().is_some());
        assert!(runtime.agent().is_some());
        runtime.shutdown().await.unwrap();
    }
}
