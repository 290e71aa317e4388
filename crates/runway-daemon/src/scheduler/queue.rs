// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-workspace run queue.
//!
//! A [`WorkspaceQueue`] admits the runs of one workspace one at a time, in the
//! order it first observes them:
//!
//! - the *current* run holds (or is waiting for) the workspace lock
//! - *pending* runs wait behind it, oldest first
//! - speculative runs bypass the queue and never take the lock
//!
//! The queue only reacts to events, and handling the same event twice or
//! out of order leaves it unchanged.

use std::collections::VecDeque;
use std::sync::Arc;

use runway_core::{CoreError, Event, EventPayload, EventType, LockHolder, Run, RunStatus, Workspace};
use tracing::{debug, info};

use crate::services::QueueServices;

type CoreResult<T> = runway_core::Result<T>;

/// Admission queue for a single workspace.
pub struct WorkspaceQueue {
    workspace: Workspace,
    current: Option<String>,
    pending: VecDeque<String>,
    services: Arc<dyn QueueServices>,
}

impl WorkspaceQueue {
    /// Create an empty queue for `workspace`.
    pub fn new(workspace: Workspace, services: Arc<dyn QueueServices>) -> Self {
        Self {
            workspace,
            current: None,
            pending: VecDeque::new(),
            services,
        }
    }

    /// Latest known state of the workspace.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The admitted run, if any.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Runs waiting behind the current one, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Every run the queue tracks, current first.
    pub fn tracked(&self) -> Vec<String> {
        self.current
            .iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    /// React to a workspace or run event.
    pub async fn handle_event(&mut self, event: &Event) -> CoreResult<()> {
        match &event.payload {
            EventPayload::Workspace(ws) if ws.id == self.workspace.id => {
                self.workspace = ws.clone();
                if event.event_type == EventType::WorkspaceUnlocked {
                    self.retry_current().await?;
                }
                Ok(())
            }
            EventPayload::Run(run) if run.workspace_id == self.workspace.id => {
                self.handle_run(run).await
            }
            _ => Ok(()),
        }
    }

    /// Retry admission of the current run; a no-op once it is past pending.
    ///
    /// Covers an unlock whose event never reached this queue.
    pub async fn retry_current(&mut self) -> CoreResult<()> {
        if let Some(current) = self.current.clone() {
            self.schedule_run(&current).await?;
        }
        Ok(())
    }

    /// Drop a run that no longer exists.
    pub async fn forget(&mut self, run_id: &str) -> CoreResult<()> {
        if self.current.as_deref() == Some(run_id) {
            self.release(run_id).await?;
            return self.advance().await;
        }
        self.pending.retain(|id| id != run_id);
        Ok(())
    }

    async fn handle_run(&mut self, run: &Run) -> CoreResult<()> {
        if run.speculative {
            if run.status() == RunStatus::Pending {
                return self.enqueue_speculative(run).await;
            }
            return Ok(());
        }

        match self.current.clone() {
            Some(current) if current == run.id => {
                if run.done() {
                    info!(run_id = %run.id, status = %run.status(), workspace_id = %self.workspace.id, "Current run finished");
                    self.release(&run.id).await?;
                    self.advance().await?;
                }
                Ok(())
            }
            None => {
                if run.done() {
                    return Ok(());
                }
                self.current = Some(run.id.clone());
                self.schedule_run(&run.id).await
            }
            Some(_) => {
                match self.pending.iter().position(|id| *id == run.id) {
                    Some(pos) if run.done() => {
                        self.pending.remove(pos);
                        debug!(run_id = %run.id, "Removed finished run from queue");
                    }
                    Some(_) => {}
                    None if !run.done() => {
                        self.pending.push_back(run.id.clone());
                        debug!(run_id = %run.id, position = self.pending.len(), "Run queued behind current run");
                    }
                    None => {}
                }
                Ok(())
            }
        }
    }

    async fn enqueue_speculative(&self, run: &Run) -> CoreResult<()> {
        match self.services.enqueue_plan(&run.id).await {
            Ok(_) => {
                debug!(run_id = %run.id, "Enqueued speculative plan");
                Ok(())
            }
            // Stale redelivery: the plan was already enqueued.
            Err(CoreError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Promote the oldest pending run, or go idle.
    async fn advance(&mut self) -> CoreResult<()> {
        match self.pending.pop_front() {
            Some(next) => {
                self.current = Some(next.clone());
                self.schedule_run(&next).await
            }
            None => {
                self.current = None;
                Ok(())
            }
        }
    }

    /// Release the lock held by a finished run.
    async fn release(&mut self, run_id: &str) -> CoreResult<()> {
        let holder = LockHolder::run(run_id);
        match self
            .services
            .unlock_workspace(&self.workspace.id, &holder, false)
            .await
        {
            Ok(Some(ws)) => self.workspace = ws,
            Ok(None) => {}
            Err(e) if e.is_precondition() => {
                debug!(run_id = %run_id, error = %e, "Workspace not held by finished run");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Try to admit `run_id`: lock the workspace and enqueue its plan.
    ///
    /// Yields without error when the run is past pending or the workspace
    /// is held by someone else; a later unlock event retries.
    async fn schedule_run(&mut self, run_id: &str) -> CoreResult<()> {
        let run = self.services.get_run(run_id).await?;
        if run.status() != RunStatus::Pending {
            return Ok(());
        }
        if self.workspace.lock_state().is_user_locked() {
            debug!(run_id = %run_id, workspace_id = %self.workspace.id, "Workspace locked by user; run waits");
            return Ok(());
        }

        match self
            .services
            .lock_workspace(&self.workspace.id, LockHolder::run(run_id))
            .await
        {
            Ok(ws) => self.workspace = ws,
            Err(CoreError::WorkspaceAlreadyLocked { holder, .. }) => {
                debug!(run_id = %run_id, holder = %holder, "Workspace already locked; run waits");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.services.enqueue_plan(run_id).await?;
        info!(run_id = %run_id, workspace_id = %self.workspace.id, "Scheduled run");

        if self.workspace.current_run_id.as_deref() != Some(run_id) {
            self.workspace = self
                .services
                .set_current_run(&self.workspace.id, run_id)
                .await?;
        }
        Ok(())
    }
}
