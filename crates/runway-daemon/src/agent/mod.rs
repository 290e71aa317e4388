// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase execution agent.
//!
//! The agent follows run events and executes queued phases:
//!
//! 1. a run reaches `plan_queued` or `apply_queued`
//! 2. the agent claims the phase; when several agents race, one claim wins
//! 3. the phase runs on its own task, streaming output into log chunks
//! 4. the log stream is closed and the phase finished, exactly once
//!
//! Cancel and force-cancel events are relayed to the phase's runner.

pub mod writer;

pub use writer::PhaseWriter;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use runway_core::persistence::RunListFilter;
use runway_core::{CoreError, Event, EventPayload, EventType, PhaseFinishOptions, Run, RunStatus};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::Result;
use crate::pubsub::Broker;
use crate::runner::{CancelHandle, JobSpec, Runner, RunnerError};
use crate::services::Services;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identifier recorded on claimed phases
    pub agent_id: String,
    /// Maximum phases executed concurrently
    pub concurrency: usize,
    /// Root of the per-run working directories
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: format!("agent-{}", uuid::Uuid::new_v4().simple()),
            concurrency: 5,
            data_dir: PathBuf::from(".data"),
        }
    }
}

type InFlight = Arc<Mutex<HashMap<String, CancelHandle>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<String, CancelHandle>> {
    in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Executes queued phases on this node.
pub struct Agent {
    services: Services,
    broker: Arc<Broker>,
    runner: Arc<dyn Runner>,
    config: AgentConfig,
    slots: Arc<Semaphore>,
    in_flight: InFlight,
    shutdown: CancellationToken,
}

impl Agent {
    /// Create an agent.
    pub fn new(
        services: Services,
        broker: Arc<Broker>,
        runner: Arc<dyn Runner>,
        config: AgentConfig,
    ) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            services,
            broker,
            runner,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// This agent's identifier.
    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of phases currently executing.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Follow run events and execute phases until shut down.
    ///
    /// Phases still running at shutdown are interrupted and finished as
    /// errored.
    pub async fn run(&self) -> Result<()> {
        info!(
            agent_id = %self.config.agent_id,
            concurrency = self.config.concurrency,
            runner = self.runner.runner_type(),
            "Agent started"
        );
        let mut tasks = JoinSet::new();
        let mut backoff = ExponentialBackoff::default();

        while !self.shutdown.is_cancelled() {
            match self.follow_events(&mut tasks).await {
                Ok(()) => backoff.reset(),
                Err(e) => error!(error = %e, "Agent event loop failed"),
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            let delay = backoff.next_delay();
            warn!(delay_ms = delay.as_millis() as u64, "Agent resubscribing");
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        for handle in lock(&self.in_flight).values() {
            handle.cancel(false);
        }
        while tasks.join_next().await.is_some() {}

        info!(agent_id = %self.config.agent_id, "Agent stopped");
        Ok(())
    }

    async fn follow_events(&self, tasks: &mut JoinSet<()>) -> Result<()> {
        let cancel = self.shutdown.child_token();
        let _unsubscribe = cancel.clone().drop_guard();
        let name = self.config.agent_id.clone();
        let mut events: mpsc::UnboundedReceiver<Event> =
            self.broker.subscribe(&name, cancel.clone())?.relay();

        // A phase skipped for lack of capacity is picked up again by a rescan
        // once a slot frees up.
        let mut skipped = self.claim_queued(tasks).await?;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Phase task panicked: {}", e);
                    }
                    if skipped {
                        skipped = self.claim_queued(tasks).await?;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    skipped |= self.handle_event(&event, tasks).await;
                }
            }
        }
    }

    /// Claim every queued phase in storage. Returns whether any was skipped
    /// for lack of capacity.
    async fn claim_queued(&self, tasks: &mut JoinSet<()>) -> Result<bool> {
        let queued = self
            .services
            .runs
            .list(&RunListFilter {
                statuses: Some(vec![RunStatus::PlanQueued, RunStatus::ApplyQueued]),
                ..Default::default()
            })
            .await?;
        let mut skipped = false;
        for run in queued {
            skipped |= !self.claim(&run, tasks).await;
        }
        Ok(skipped)
    }

    /// Returns `true` when a queued phase was skipped for lack of capacity.
    async fn handle_event(&self, event: &Event, tasks: &mut JoinSet<()>) -> bool {
        if event.event_type != EventType::RunStatusUpdate {
            return false;
        }
        let EventPayload::Run(run) = &event.payload else {
            return false;
        };
        match run.status() {
            RunStatus::PlanQueued | RunStatus::ApplyQueued => !self.claim(run, tasks).await,
            RunStatus::Canceled => {
                self.signal(&run.id, false);
                false
            }
            RunStatus::ForceCanceled => {
                self.signal(&run.id, true);
                false
            }
            _ => false,
        }
    }

    /// Relay a cancel to the phase executing `run_id`, if it runs here.
    fn signal(&self, run_id: &str, force: bool) {
        if let Some(handle) = lock(&self.in_flight).get(run_id) {
            info!(run_id = %run_id, force, "Cancelling phase");
            handle.cancel(force);
        }
    }

    /// Try to claim and start the queued phase of `run`.
    ///
    /// Returns `false` only when the agent had no free slot.
    async fn claim(&self, run: &Run, tasks: &mut JoinSet<()>) -> bool {
        let Some(kind) = run.status().queued_phase() else {
            return true;
        };
        if lock(&self.in_flight).contains_key(&run.id) {
            return true;
        }
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            debug!(run_id = %run.id, phase = %kind, "No free slot; phase left queued");
            return false;
        };

        let claimed = match self
            .services
            .runs
            .start_phase(&run.id, kind, &self.config.agent_id)
            .await
        {
            Ok(run) => run,
            Err(CoreError::PhaseAlreadyClaimed { .. }) => {
                debug!(run_id = %run.id, phase = %kind, "Phase claimed by another agent");
                return true;
            }
            Err(e @ CoreError::InvalidTransition { .. }) => {
                debug!(run_id = %run.id, error = %e, "Phase no longer queued");
                return true;
            }
            Err(e) => {
                warn!(run_id = %run.id, phase = %kind, error = %e, "Failed to claim phase");
                return true;
            }
        };

        info!(run_id = %claimed.id, phase = %kind, agent_id = %self.config.agent_id, "Claimed phase");
        let handle = CancelHandle::new();
        lock(&self.in_flight).insert(claimed.id.clone(), handle.clone());

        let job = PhaseJob {
            services: self.services.clone(),
            runner: self.runner.clone(),
            in_flight: self.in_flight.clone(),
            spec: JobSpec {
                working_dir: self.config.data_dir.join("runs").join(&claimed.id),
                run_id: claimed.id,
                phase: kind,
                workspace_id: claimed.workspace_id,
                configuration_version_id: claimed.configuration_version_id,
                is_destroy: claimed.is_destroy,
            },
            cancel: handle,
        };
        tasks.spawn(job.run(permit));
        true
    }
}

/// A claimed phase, executed on its own task.
struct PhaseJob {
    services: Services,
    runner: Arc<dyn Runner>,
    in_flight: InFlight,
    spec: JobSpec,
    cancel: CancelHandle,
}

impl PhaseJob {
    async fn run(self, _permit: OwnedSemaphorePermit) {
        let spec = &self.spec;
        let mut writer = PhaseWriter::new(self.services.logs.clone(), &spec.run_id, spec.phase);
        let result = self.runner.execute(spec, &mut writer, &self.cancel).await;

        if let Err(e) = writer.close().await {
            warn!(run_id = %spec.run_id, phase = %spec.phase, error = %e, "Failed to close phase log");
        }

        let opts = match result {
            Ok(outcome) if !self.cancel.is_canceled() => PhaseFinishOptions {
                errored: false,
                report: outcome.report,
            },
            Ok(_) | Err(RunnerError::Cancelled) => {
                info!(run_id = %spec.run_id, phase = %spec.phase, forced = self.cancel.is_forced(), "Phase canceled");
                PhaseFinishOptions {
                    errored: true,
                    report: None,
                }
            }
            Err(e) => {
                warn!(run_id = %spec.run_id, phase = %spec.phase, error = %e, "Phase failed");
                PhaseFinishOptions {
                    errored: true,
                    report: None,
                }
            }
        };

        // Finishing a plan may queue this run's apply phase.
        lock(&self.in_flight).remove(&spec.run_id);

        match self
            .services
            .runs
            .finish_phase(&spec.run_id, spec.phase, opts)
            .await
        {
            Ok(run) => {
                info!(run_id = %run.id, phase = %spec.phase, status = %run.status(), "Finished phase")
            }
            Err(e) => {
                error!(run_id = %spec.run_id, phase = %spec.phase, error = %e, "Failed to finish phase")
            }
        }
    }
}
