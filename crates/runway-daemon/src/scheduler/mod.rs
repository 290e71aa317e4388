// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run scheduler.
//!
//! Exactly one scheduler is active per cluster: every node competes for a
//! fixed advisory lock and the winner runs until it stops or fails, while
//! the others block as standbys. The active scheduler keeps one
//! [`WorkspaceQueue`] per workspace, grouped by organization, and feeds them
//! every organization, workspace and run event from the broker.
//!
//! On start, and then periodically, it rebuilds queue state from storage so
//! that events missed during a notification outage are reconciled.

pub mod queue;

pub use queue::WorkspaceQueue;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use runway_core::persistence::RunListFilter;
use runway_core::{
    CoreError, Event, EventPayload, EventType, LockHolder, Persistence, Run, RunStatus, Workspace,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::Result;
use crate::pubsub::Broker;
use crate::services::QueueServices;

/// Advisory lock ID held by the active scheduler.
pub const SCHEDULER_LOCK_ID: i64 = 5577006791947779410;

/// Broker subscriber name used by the scheduler.
pub const SUBSCRIBER_NAME: &str = "scheduler";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often queues are reconciled with storage
    pub reseed_interval: Duration,
    /// First delay before restarting after a failure
    pub restart_backoff_base: Duration,
    /// Longest delay between restarts
    pub restart_backoff_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reseed_interval: Duration::from_secs(300),
            restart_backoff_base: Duration::from_millis(500),
            restart_backoff_max: Duration::from_secs(30),
        }
    }
}

/// organization -> workspace ID -> queue
type Queues = HashMap<String, HashMap<String, WorkspaceQueue>>;

/// Statuses of runs that still need the scheduler's attention.
const INCOMPLETE: [RunStatus; 6] = [
    RunStatus::Pending,
    RunStatus::PlanQueued,
    RunStatus::Planning,
    RunStatus::Planned,
    RunStatus::ApplyQueued,
    RunStatus::Applying,
];

/// Cluster-wide run scheduler.
pub struct Scheduler {
    persistence: Arc<dyn Persistence>,
    services: Arc<dyn QueueServices>,
    broker: Arc<Broker>,
    config: SchedulerConfig,
    queues: Mutex<Queues>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        services: Arc<dyn QueueServices>,
        broker: Arc<Broker>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            services,
            broker,
            config,
            queues: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current run and pending runs of a workspace queue, if one exists.
    pub async fn queue_state(&self, workspace_id: &str) -> Option<(Option<String>, Vec<String>)> {
        let queues = self.queues.lock().await;
        queues
            .values()
            .find_map(|bucket| bucket.get(workspace_id))
            .map(|q| (q.current().map(str::to_string), q.pending()))
    }

    /// Names of the organizations the scheduler tracks.
    pub async fn organizations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Compete for the scheduler lock and schedule runs while holding it.
    ///
    /// Restarts with backoff after failures. Returns an error only when
    /// stored state is inconsistent, in which case the scheduler refuses to
    /// run.
    pub async fn run(&self) -> Result<()> {
        info!(lock_id = SCHEDULER_LOCK_ID, "Scheduler started");
        let mut backoff = ExponentialBackoff::new(
            self.config.restart_backoff_base,
            self.config.restart_backoff_max,
        );

        loop {
            let acquired = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                r = self.persistence.acquire_exclusive(SCHEDULER_LOCK_ID) => r,
            };

            let result = match acquired {
                Ok(lock) => {
                    info!("Acquired scheduler lock; this node is the active scheduler");
                    let result = self.run_locked().await;
                    if let Err(e) = lock.release().await {
                        warn!(error = %e, "Failed to release scheduler lock");
                    }
                    result
                }
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(()) if self.shutdown.is_cancelled() => break,
                Ok(()) => {
                    backoff.reset();
                    warn!("Scheduler subscription ended; restarting");
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Scheduler refusing to run");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Scheduler failed; restarting"),
            }

            let delay = backoff.next_delay();
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// One scheduling session: subscribe, seed, then follow events.
    async fn run_locked(&self) -> Result<()> {
        let cancel = self.shutdown.child_token();
        let _unsubscribe = cancel.clone().drop_guard();
        let mut events = self.broker.subscribe(SUBSCRIBER_NAME, cancel.clone())?.relay();

        self.seed().await?;

        let mut reseed = tokio::time::interval(self.config.reseed_interval);
        // The first tick completes immediately; seeding just happened.
        reseed.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                event = events.recv() => {
                    let Some(event) = event else {
                        return Ok(());
                    };
                    if let Err(e) = self.dispatch(&event).await {
                        warn!(error = %e, event = %event.event_type, id = %event.payload.id(), "Failed to handle event");
                    }
                }
                _ = reseed.tick() => {
                    debug!("Reconciling queues with storage");
                    if let Err(e) = self.seed().await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(error = %e, "Failed to reconcile queues");
                    }
                }
            }
        }
    }

    /// Route an event to the queue it concerns.
    async fn dispatch(&self, event: &Event) -> Result<()> {
        let mut queues = self.queues.lock().await;
        match (&event.event_type, &event.payload) {
            (EventType::OrganizationCreated, EventPayload::Organization(org)) => {
                queues.entry(org.name.clone()).or_default();
            }
            (EventType::OrganizationDeleted, EventPayload::Deleted(r)) => {
                if queues.remove(&r.id).is_some() {
                    debug!(organization = %r.id, "Removed organization queues");
                }
            }
            (EventType::WorkspaceDeleted, EventPayload::Deleted(r)) => {
                for bucket in queues.values_mut() {
                    if bucket.remove(&r.id).is_some() {
                        debug!(workspace_id = %r.id, "Removed workspace queue");
                    }
                }
            }
            (_, EventPayload::Workspace(ws)) => {
                let queue = queues
                    .entry(ws.organization.clone())
                    .or_default()
                    .entry(ws.id.clone())
                    .or_insert_with(|| WorkspaceQueue::new(ws.clone(), self.services.clone()));
                queue.handle_event(event).await?;
            }
            (_, EventPayload::Run(run)) => {
                let bucket = queues.entry(run.organization.clone()).or_default();
                if !bucket.contains_key(&run.workspace_id) {
                    match self.services.get_workspace(&run.workspace_id).await {
                        Ok(ws) => {
                            bucket.insert(
                                ws.id.clone(),
                                WorkspaceQueue::new(ws, self.services.clone()),
                            );
                        }
                        Err(e) if e.is_not_found() => {
                            debug!(run_id = %run.id, workspace_id = %run.workspace_id, "Workspace gone; ignoring run event");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                if let Some(queue) = bucket.get_mut(&run.workspace_id) {
                    queue.handle_event(event).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Rebuild queue state from storage.
    ///
    /// Runs already past pending are fed as-is, so their plans are not
    /// enqueued a second time.
    async fn seed(&self) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let organizations = self.persistence.list_organizations().await?;

        let known: HashSet<String> = organizations.iter().map(|o| o.name.clone()).collect();
        queues.retain(|name, _| known.contains(name));

        for org in organizations {
            let workspaces = self.persistence.list_workspaces(&org.name).await?;
            let bucket = queues.entry(org.name.clone()).or_default();

            let ids: HashSet<String> = workspaces.iter().map(|w| w.id.clone()).collect();
            bucket.retain(|id, _| ids.contains(id));

            for ws in workspaces {
                let runs = self
                    .persistence
                    .list_runs(&RunListFilter {
                        workspace_id: Some(ws.id.clone()),
                        statuses: Some(INCOMPLETE.to_vec()),
                        ..Default::default()
                    })
                    .await?;

                let active: Vec<&Run> = runs
                    .iter()
                    .filter(|r| !r.speculative && r.status() != RunStatus::Pending)
                    .collect();
                if active.len() > 1 {
                    return Err(CoreError::ConsistencyViolation {
                        details: format!(
                            "workspace {} has {} active runs: {}",
                            ws.id,
                            active.len(),
                            active
                                .iter()
                                .map(|r| r.id.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                    }
                    .into());
                }

                self.release_stale_lock(&ws, active.first().copied()).await;

                let queue = bucket
                    .entry(ws.id.clone())
                    .or_insert_with(|| WorkspaceQueue::new(ws.clone(), self.services.clone()));
                if let Err(e) = seed_queue(queue, &ws, &runs, self.services.as_ref()).await {
                    warn!(error = %e, workspace_id = %ws.id, "Failed to seed workspace queue");
                }
            }
        }

        debug!(organizations = queues.len(), "Queues seeded");
        Ok(())
    }

    /// Unlock a workspace still held by a run that is no longer active.
    async fn release_stale_lock(&self, ws: &Workspace, active: Option<&Run>) {
        let Some(LockHolder::Run(holder)) = ws.lock_state().holder() else {
            return;
        };
        if active.is_some_and(|r| r.id == *holder) {
            return;
        }
        match self.services.get_run(holder).await {
            Ok(run) if run.done() => {}
            Err(e) if e.is_not_found() => {}
            // Still being admitted, or storage unavailable.
            _ => return,
        }
        info!(workspace_id = %ws.id, run_id = %holder, "Releasing lock held by finished run");
        if let Err(e) = self
            .services
            .unlock_workspace(&ws.id, &LockHolder::run(holder.clone()), false)
            .await
        {
            warn!(error = %e, workspace_id = %ws.id, "Failed to release stale lock");
        }
    }
}

/// Feed a workspace queue its stored state.
async fn seed_queue(
    queue: &mut WorkspaceQueue,
    ws: &Workspace,
    runs: &[Run],
    services: &dyn QueueServices,
) -> runway_core::Result<()> {
    queue
        .handle_event(&Event::local(
            EventType::WorkspaceUpdated,
            EventPayload::Workspace(ws.clone()),
        ))
        .await?;

    // Runs the queue already tracks may have finished without us hearing.
    for id in queue.tracked() {
        match services.get_run(&id).await {
            Ok(run) => queue.handle_event(&Event::run_status(&run)).await?,
            Err(e) if e.is_not_found() => queue.forget(&id).await?,
            Err(e) => return Err(e),
        }
    }

    // Active run first so it becomes current, then pending runs oldest first.
    let (active, rest): (Vec<&Run>, Vec<&Run>) = runs
        .iter()
        .partition(|r| !r.speculative && r.status() != RunStatus::Pending);
    for run in active.into_iter().chain(rest) {
        queue.handle_event(&Event::run_status(run)).await?;
    }

    // The unlock that would have admitted the current run may have been missed.
    queue.retry_current().await
}
