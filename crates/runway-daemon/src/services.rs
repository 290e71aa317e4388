// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application services.
//!
//! Each service mutates storage through [`Persistence`] and publishes the
//! resulting event on the [`Broker`]. Services also act as the broker's
//! getters, reloading payloads for notifications from other nodes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use runway_core::logs::reassemble;
use runway_core::persistence::RunListFilter;
use runway_core::run::PhaseFinishOptions;
use runway_core::{
    Chunk, CoreError, Event, EventPayload, EventType, LockHolder, NewRun, NewWorkspace,
    Organization, PersistedChunk, Persistence, PhaseKind, Run, Workspace,
};
use tracing::{debug, info};

use crate::pubsub::{Broker, Getter};

type CoreResult<T> = runway_core::Result<T>;

// ============================================================================
// Organizations
// ============================================================================

/// Organization management.
#[derive(Clone)]
pub struct OrganizationService {
    persistence: Arc<dyn Persistence>,
    broker: Arc<Broker>,
}

impl OrganizationService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, broker: Arc<Broker>) -> Self {
        Self {
            persistence,
            broker,
        }
    }

    /// Create an organization.
    pub async fn create(&self, name: &str) -> CoreResult<Organization> {
        let org = Organization::new(name)?;
        self.persistence.create_organization(&org).await?;
        info!(organization = %org.name, "Created organization");
        self.broker
            .publish(Event::new(
                EventType::OrganizationCreated,
                EventPayload::Organization(org.clone()),
            ))
            .await;
        Ok(org)
    }

    /// Fetch an organization.
    pub async fn get(&self, name: &str) -> CoreResult<Organization> {
        self.persistence
            .get_organization(name)
            .await?
            .ok_or_else(|| CoreError::OrganizationNotFound {
                name: name.to_string(),
            })
    }

    /// List all organizations.
    pub async fn list(&self) -> CoreResult<Vec<Organization>> {
        self.persistence.list_organizations().await
    }

    /// Delete an organization with everything in it.
    pub async fn delete(&self, name: &str) -> CoreResult<()> {
        self.persistence.delete_organization(name).await?;
        info!(organization = %name, "Deleted organization");
        self.broker
            .publish(Event::deleted(EventType::OrganizationDeleted, name))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Getter for OrganizationService {
    async fn get_by_id(&self, id: &str) -> CoreResult<EventPayload> {
        self.get(id).await.map(EventPayload::Organization)
    }
}

// ============================================================================
// Workspaces
// ============================================================================

/// Workspace management and locking.
#[derive(Clone)]
pub struct WorkspaceService {
    persistence: Arc<dyn Persistence>,
    broker: Arc<Broker>,
}

impl WorkspaceService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, broker: Arc<Broker>) -> Self {
        Self {
            persistence,
            broker,
        }
    }

    /// Create a workspace in an existing organization.
    pub async fn create(&self, opts: NewWorkspace) -> CoreResult<Workspace> {
        if opts.name.is_empty() {
            return Err(CoreError::ValidationError {
                field: "name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self
            .persistence
            .get_organization(&opts.organization)
            .await?
            .is_none()
        {
            return Err(CoreError::OrganizationNotFound {
                name: opts.organization,
            });
        }
        let ws = Workspace::new(opts);
        self.persistence.create_workspace(&ws).await?;
        info!(workspace_id = %ws.id, organization = %ws.organization, name = %ws.name, "Created workspace");
        self.broker
            .publish(Event::workspace(EventType::WorkspaceCreated, &ws))
            .await;
        Ok(ws)
    }

    /// Fetch a workspace.
    pub async fn get(&self, workspace_id: &str) -> CoreResult<Workspace> {
        self.persistence
            .get_workspace(workspace_id)
            .await?
            .ok_or_else(|| CoreError::WorkspaceNotFound {
                workspace_id: workspace_id.to_string(),
            })
    }

    /// List the workspaces of an organization.
    pub async fn list(&self, organization: &str) -> CoreResult<Vec<Workspace>> {
        self.persistence.list_workspaces(organization).await
    }

    /// Lock a workspace for `holder`.
    pub async fn lock(&self, workspace_id: &str, holder: LockHolder) -> CoreResult<Workspace> {
        let ws = self
            .persistence
            .update_workspace(
                workspace_id,
                Box::new(move |ws: &mut Workspace| ws.lock(holder)),
            )
            .await?;
        debug!(workspace_id = %ws.id, lock = ?ws.lock_state(), "Workspace locked");
        self.broker
            .publish(Event::workspace(EventType::WorkspaceLocked, &ws))
            .await;
        Ok(ws)
    }

    /// Unlock a workspace on behalf of `requester`, or unconditionally with
    /// `force`.
    ///
    /// Returns `None` when the workspace no longer exists.
    pub async fn unlock(
        &self,
        workspace_id: &str,
        requester: &LockHolder,
        force: bool,
    ) -> CoreResult<Option<Workspace>> {
        let requester = requester.clone();
        let result = self
            .persistence
            .update_workspace(
                workspace_id,
                Box::new(move |ws: &mut Workspace| ws.unlock(&requester, force)),
            )
            .await;
        let ws = match result {
            Ok(ws) => ws,
            Err(CoreError::WorkspaceNotFound { .. }) => {
                debug!(workspace_id = %workspace_id, "Workspace gone; nothing to unlock");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        debug!(workspace_id = %ws.id, force, "Workspace unlocked");
        self.broker
            .publish(Event::workspace(EventType::WorkspaceUnlocked, &ws))
            .await;
        Ok(Some(ws))
    }

    /// Record the run most recently admitted to the workspace.
    pub async fn set_current_run(&self, workspace_id: &str, run_id: &str) -> CoreResult<Workspace> {
        let run_id = run_id.to_string();
        let ws = self
            .persistence
            .update_workspace(
                workspace_id,
                Box::new(move |ws: &mut Workspace| {
                    ws.current_run_id = Some(run_id);
                    Ok(())
                }),
            )
            .await?;
        self.broker
            .publish(Event::workspace(EventType::WorkspaceUpdated, &ws))
            .await;
        Ok(ws)
    }

    /// Change the default auto-apply setting.
    pub async fn set_auto_apply(&self, workspace_id: &str, auto_apply: bool) -> CoreResult<Workspace> {
        let ws = self
            .persistence
            .update_workspace(
                workspace_id,
                Box::new(move |ws: &mut Workspace| {
                    ws.auto_apply = auto_apply;
                    Ok(())
                }),
            )
            .await?;
        self.broker
            .publish(Event::workspace(EventType::WorkspaceUpdated, &ws))
            .await;
        Ok(ws)
    }

    /// Delete a workspace and its runs.
    pub async fn delete(&self, workspace_id: &str) -> CoreResult<()> {
        self.persistence.delete_workspace(workspace_id).await?;
        info!(workspace_id = %workspace_id, "Deleted workspace");
        self.broker
            .publish(Event::deleted(EventType::WorkspaceDeleted, workspace_id))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Getter for WorkspaceService {
    async fn get_by_id(&self, id: &str) -> CoreResult<EventPayload> {
        self.get(id).await.map(EventPayload::Workspace)
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Options for creating a run through [`RunService::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateRunOptions {
    /// Target workspace.
    pub workspace_id: String,
    /// Configuration version to execute.
    pub configuration_version_id: String,
    /// Plan-only run.
    pub speculative: bool,
    /// Override the workspace's auto-apply default.
    pub auto_apply: Option<bool>,
    /// Destroy run.
    pub is_destroy: bool,
    /// Free-form message.
    pub message: Option<String>,
}

/// Run lifecycle operations.
#[derive(Clone)]
pub struct RunService {
    persistence: Arc<dyn Persistence>,
    broker: Arc<Broker>,
}

impl RunService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, broker: Arc<Broker>) -> Self {
        Self {
            persistence,
            broker,
        }
    }

    /// Create a pending run against an existing workspace.
    pub async fn create(&self, opts: CreateRunOptions) -> CoreResult<Run> {
        let ws = self
            .persistence
            .get_workspace(&opts.workspace_id)
            .await?
            .ok_or_else(|| CoreError::WorkspaceNotFound {
                workspace_id: opts.workspace_id.clone(),
            })?;
        let run = Run::new(NewRun {
            organization: ws.organization.clone(),
            workspace_id: ws.id.clone(),
            configuration_version_id: opts.configuration_version_id,
            speculative: opts.speculative,
            auto_apply: opts.auto_apply.unwrap_or(ws.auto_apply),
            is_destroy: opts.is_destroy,
            message: opts.message,
        });
        self.persistence.create_run(&run).await?;
        info!(run_id = %run.id, workspace_id = %run.workspace_id, speculative = run.speculative, "Created run");
        self.broker
            .publish(Event::new(
                EventType::RunCreated,
                EventPayload::Run(Box::new(run.clone())),
            ))
            .await;
        Ok(run)
    }

    /// Fetch a run.
    pub async fn get(&self, run_id: &str) -> CoreResult<Run> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// List runs matching `filter`, oldest first.
    pub async fn list(&self, filter: &RunListFilter) -> CoreResult<Vec<Run>> {
        self.persistence.list_runs(filter).await
    }

    async fn transition(
        &self,
        run_id: &str,
        update: runway_core::persistence::RunUpdate,
    ) -> CoreResult<Run> {
        let run = self.persistence.update_run(run_id, update).await?;
        debug!(run_id = %run.id, status = %run.status(), "Run status updated");
        self.broker.publish(Event::run_status(&run)).await;
        Ok(run)
    }

    /// Queue the plan phase of a pending run.
    pub async fn enqueue_plan(&self, run_id: &str) -> CoreResult<Run> {
        self.transition(run_id, Box::new(|run: &mut Run| run.enqueue_plan()))
            .await
    }

    /// Queue the apply phase of a planned run (user confirmation).
    pub async fn apply(&self, run_id: &str) -> CoreResult<Run> {
        self.transition(run_id, Box::new(|run: &mut Run| run.enqueue_apply()))
            .await
    }

    /// Claim a queued phase for `agent_id`.
    pub async fn start_phase(&self, run_id: &str, kind: PhaseKind, agent_id: &str) -> CoreResult<Run> {
        let agent_id = agent_id.to_string();
        self.transition(
            run_id,
            Box::new(move |run: &mut Run| run.start(kind, &agent_id)),
        )
        .await
    }

    /// Record the outcome of a phase.
    pub async fn finish_phase(
        &self,
        run_id: &str,
        kind: PhaseKind,
        opts: PhaseFinishOptions,
    ) -> CoreResult<Run> {
        self.transition(run_id, Box::new(move |run: &mut Run| run.finish(kind, opts)))
            .await
    }

    /// Cancel a run.
    ///
    /// The flag is `true` when a phase was executing and its agent must be
    /// interrupted.
    pub async fn cancel(&self, run_id: &str) -> CoreResult<(Run, bool)> {
        let signal = Arc::new(AtomicBool::new(false));
        let flag = signal.clone();
        let run = self
            .transition(
                run_id,
                Box::new(move |run: &mut Run| {
                    flag.store(run.cancel()?, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await?;
        let signal = signal.load(Ordering::SeqCst);
        info!(run_id = %run.id, signal, "Canceled run");
        Ok((run, signal))
    }

    /// Force cancel a canceled run once its cool-off has elapsed.
    pub async fn force_cancel(&self, run_id: &str) -> CoreResult<Run> {
        let run = self
            .transition(run_id, Box::new(|run: &mut Run| run.force_cancel()))
            .await?;
        info!(run_id = %run.id, "Force canceled run");
        Ok(run)
    }

    /// Discard a pending or planned run.
    pub async fn discard(&self, run_id: &str) -> CoreResult<Run> {
        self.transition(run_id, Box::new(|run: &mut Run| run.discard()))
            .await
    }

    /// Delete a finished run.
    pub async fn delete(&self, run_id: &str) -> CoreResult<()> {
        let run = self.get(run_id).await?;
        if !run.done() {
            return Err(CoreError::InvalidTransition {
                status: run.status().to_string(),
                run_id: run.id,
                action: "delete",
            });
        }
        self.persistence.delete_run(run_id).await?;
        info!(run_id = %run_id, "Deleted run");
        self.broker
            .publish(Event::deleted(EventType::RunDeleted, run_id))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Getter for RunService {
    async fn get_by_id(&self, id: &str) -> CoreResult<EventPayload> {
        self.get(id).await.map(|run| EventPayload::Run(Box::new(run)))
    }
}

// ============================================================================
// Logs
// ============================================================================

/// Phase log storage.
#[derive(Clone)]
pub struct LogService {
    persistence: Arc<dyn Persistence>,
    broker: Arc<Broker>,
}

impl LogService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, broker: Arc<Broker>) -> Self {
        Self {
            persistence,
            broker,
        }
    }

    /// Store a chunk of phase output.
    pub async fn put_chunk(&self, chunk: Chunk) -> CoreResult<PersistedChunk> {
        let persisted = self.persistence.put_chunk(&chunk).await?;
        self.broker
            .publish(Event::new(
                EventType::LogChunk,
                EventPayload::Chunk(persisted.clone()),
            ))
            .await;
        Ok(persisted)
    }

    /// Fetch a chunk by ID.
    pub async fn get_chunk(&self, chunk_id: i64) -> CoreResult<PersistedChunk> {
        self.persistence
            .get_chunk(chunk_id)
            .await?
            .ok_or(CoreError::ChunkNotFound { chunk_id })
    }

    /// The full output of a phase written so far, markers stripped.
    pub async fn get_logs(&self, run_id: &str, kind: PhaseKind) -> CoreResult<Vec<u8>> {
        let chunks = self.persistence.list_chunks(run_id, kind).await?;
        Ok(reassemble(chunks.iter().map(|c| &c.chunk)))
    }
}

#[async_trait]
impl Getter for LogService {
    async fn get_by_id(&self, id: &str) -> CoreResult<EventPayload> {
        let chunk_id: i64 = id.parse().map_err(|_| CoreError::ValidationError {
            field: "chunk_id".to_string(),
            message: format!("not a chunk ID: {id}"),
        })?;
        self.get_chunk(chunk_id).await.map(EventPayload::Chunk)
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// All services sharing one persistence backend and broker.
#[derive(Clone)]
pub struct Services {
    /// Organizations.
    pub organizations: OrganizationService,
    /// Workspaces.
    pub workspaces: WorkspaceService,
    /// Runs.
    pub runs: RunService,
    /// Logs.
    pub logs: LogService,
}

impl Services {
    /// Build every service on top of `persistence` and `broker`.
    pub fn new(persistence: Arc<dyn Persistence>, broker: Arc<Broker>) -> Self {
        Self {
            organizations: OrganizationService::new(persistence.clone(), broker.clone()),
            workspaces: WorkspaceService::new(persistence.clone(), broker.clone()),
            runs: RunService::new(persistence.clone(), broker.clone()),
            logs: LogService::new(persistence, broker),
        }
    }

    /// Register every service as the broker's getter for its relation.
    pub fn register_getters(&self, broker: &Broker) {
        broker.register("organization", Arc::new(self.organizations.clone()));
        broker.register("workspace", Arc::new(self.workspaces.clone()));
        broker.register("run", Arc::new(self.runs.clone()));
        broker.register("chunk", Arc::new(self.logs.clone()));
    }
}

/// Operations a workspace queue needs to admit runs.
#[async_trait]
pub trait QueueServices: Send + Sync {
    /// Fetch a run.
    async fn get_run(&self, run_id: &str) -> CoreResult<Run>;

    /// Fetch a workspace.
    async fn get_workspace(&self, workspace_id: &str) -> CoreResult<Workspace>;

    /// Queue a pending run's plan.
    async fn enqueue_plan(&self, run_id: &str) -> CoreResult<Run>;

    /// Lock a workspace.
    async fn lock_workspace(&self, workspace_id: &str, holder: LockHolder) -> CoreResult<Workspace>;

    /// Unlock a workspace. `None` when it no longer exists.
    async fn unlock_workspace(
        &self,
        workspace_id: &str,
        requester: &LockHolder,
        force: bool,
    ) -> CoreResult<Option<Workspace>>;

    /// Record the workspace's current run.
    async fn set_current_run(&self, workspace_id: &str, run_id: &str) -> CoreResult<Workspace>;
}

#[async_trait]
impl QueueServices for Services {
    async fn get_run(&self, run_id: &str) -> CoreResult<Run> {
        self.runs.get(run_id).await
    }

    async fn get_workspace(&self, workspace_id: &str) -> CoreResult<Workspace> {
        self.workspaces.get(workspace_id).await
    }

    async fn enqueue_plan(&self, run_id: &str) -> CoreResult<Run> {
        self.runs.enqueue_plan(run_id).await
    }

    async fn lock_workspace(&self, workspace_id: &str, holder: LockHolder) -> CoreResult<Workspace> {
        self.workspaces.lock(workspace_id, holder).await
    }

    async fn unlock_workspace(
        &self,
        workspace_id: &str,
        requester: &LockHolder,
        force: bool,
    ) -> CoreResult<Option<Workspace>> {
        self.workspaces.unlock(workspace_id, requester, force).await
    }

    async fn set_current_run(&self, workspace_id: &str, run_id: &str) -> CoreResult<Workspace> {
        self.workspaces.set_current_run(workspace_id, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{DEFAULT_CHANNEL, MemoryTransport};
    use runway_core::{MemoryPersistence, RunStatus};
    use tokio_util::sync::CancellationToken;

    async fn setup() -> (Services, Workspace) {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let broker = Arc::new(Broker::new(Arc::new(MemoryTransport::new()), DEFAULT_CHANNEL));
        let services = Services::new(persistence, broker);
        services.organizations.create("acme").await.unwrap();
        let ws = services
            .workspaces
            .create(NewWorkspace {
                name: "dev".to_string(),
                organization: "acme".to_string(),
                auto_apply: true,
            })
            .await
            .unwrap();
        (services, ws)
    }

    #[tokio::test]
    async fn test_create_run_inherits_auto_apply() {
        let (services, ws) = setup().await;
        let inherited = services
            .runs
            .create(CreateRunOptions {
                workspace_id: ws.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(inherited.auto_apply);
        assert_eq!(inherited.organization, "acme");

        let overridden = services
            .runs
            .create(CreateRunOptions {
                workspace_id: ws.id.clone(),
                auto_apply: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!overridden.auto_apply);
    }

    #[tokio::test]
    async fn test_create_run_unknown_workspace() {
        let (services, _) = setup().await;
        let err = services
            .runs
            .create(CreateRunOptions {
                workspace_id: "ws-missing".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let (services, ws) = setup().await;
        let broker = services.runs.broker.clone();
        let mut sub = broker.subscribe("observer", CancellationToken::new()).unwrap();

        let run = services
            .runs
            .create(CreateRunOptions {
                workspace_id: ws.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        services.runs.enqueue_plan(&run.id).await.unwrap();

        let created = sub.recv().await.unwrap();
        assert_eq!(created.event_type, EventType::RunCreated);
        let queued = sub.recv().await.unwrap();
        assert_eq!(queued.event_type, EventType::RunStatusUpdate);
        match queued.payload {
            EventPayload::Run(run) => assert_eq!(run.status(), RunStatus::PlanQueued),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_reports_signal_for_running_phase() {
        let (services, ws) = setup().await;
        let create = || CreateRunOptions {
            workspace_id: ws.id.clone(),
            ..Default::default()
        };

        let idle = services.runs.create(create()).await.unwrap();
        let (_, signal) = services.runs.cancel(&idle.id).await.unwrap();
        assert!(!signal);

        let busy = services.runs.create(create()).await.unwrap();
        services.runs.enqueue_plan(&busy.id).await.unwrap();
        services
            .runs
            .start_phase(&busy.id, PhaseKind::Plan, "agent-1")
            .await
            .unwrap();
        let (run, signal) = services.runs.cancel(&busy.id).await.unwrap();
        assert!(signal);
        assert_eq!(run.status(), RunStatus::Canceled);
        assert!(run.force_cancel_available_at().is_some());
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_run() {
        let (services, ws) = setup().await;
        let run = services
            .runs
            .create(CreateRunOptions {
                workspace_id: ws.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = services.runs.delete(&run.id).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        match err {
            CoreError::InvalidTransition {
                status,
                run_id,
                action,
            } => {
                assert_eq!(status, "pending");
                assert_eq!(run_id, run.id);
                assert_eq!(action, "delete");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        services.runs.discard(&run.id).await.unwrap();
        services.runs.delete(&run.id).await.unwrap();
        assert!(services.runs.get(&run.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unlock_deleted_workspace_is_not_an_error() {
        let (services, ws) = setup().await;
        let holder = LockHolder::run("run-1");
        services.workspaces.lock(&ws.id, holder.clone()).await.unwrap();
        services.workspaces.delete(&ws.id).await.unwrap();

        let unlocked = services
            .workspaces
            .unlock(&ws.id, &holder, false)
            .await
            .unwrap();
        assert!(unlocked.is_none());
    }

    #[tokio::test]
    async fn test_log_reassembly() {
        let (services, ws) = setup().await;
        let run = services
            .runs
            .create(CreateRunOptions {
                workspace_id: ws.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        let chunk = |offset: i64, data: &[u8]| Chunk {
            run_id: run.id.clone(),
            phase: PhaseKind::Plan,
            offset,
            data: data.to_vec(),
        };
        services.logs.put_chunk(chunk(0, b"\x02Plan:")).await.unwrap();
        services.logs.put_chunk(chunk(6, b" ok\x03")).await.unwrap();

        let logs = services.logs.get_logs(&run.id, PhaseKind::Plan).await.unwrap();
        assert_eq!(logs, b"Plan: ok");
    }
}
