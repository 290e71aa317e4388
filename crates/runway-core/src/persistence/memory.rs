// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Keeps everything in process memory behind a single mutex. Used by tests and
//! by single-node development setups; exclusive locks are only exclusive
//! within the process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{ExclusiveLock, Persistence, RunListFilter, RunUpdate, WorkspaceUpdate};
use crate::error::CoreError;
use crate::logs::{Chunk, PersistedChunk};
use crate::organization::Organization;
use crate::run::{PhaseKind, Run};
use crate::workspace::Workspace;

#[derive(Default)]
struct State {
    organizations: Vec<Organization>,
    workspaces: Vec<Workspace>,
    runs: Vec<Run>,
    chunks: Vec<PersistedChunk>,
    next_chunk_id: i64,
}

/// In-memory persistence implementation.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<State>>,
    locks: Arc<std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl ExclusiveLock for MemoryLock {
    async fn release(self: Box<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}

fn remove_runs(state: &mut State, keep: impl Fn(&Run) -> bool) {
    let removed: Vec<String> = state
        .runs
        .iter()
        .filter(|r| !keep(r))
        .map(|r| r.id.clone())
        .collect();
    state.runs.retain(|r| keep(r));
    state
        .chunks
        .retain(|c| !removed.iter().any(|id| *id == c.chunk.run_id));
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn create_organization(&self, org: &Organization) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.organizations.iter().any(|o| o.name == org.name) {
            return Err(CoreError::AlreadyExists {
                resource: "organization",
                id: org.name.clone(),
            });
        }
        state.organizations.push(org.clone());
        Ok(())
    }

    async fn get_organization(&self, name: &str) -> Result<Option<Organization>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.organizations.iter().find(|o| o.name == name).cloned())
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, CoreError> {
        Ok(self.state.lock().await.organizations.clone())
    }

    async fn delete_organization(&self, name: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let before = state.organizations.len();
        state.organizations.retain(|o| o.name != name);
        if state.organizations.len() == before {
            return Err(CoreError::OrganizationNotFound {
                name: name.to_string(),
            });
        }
        state.workspaces.retain(|w| w.organization != name);
        remove_runs(&mut state, |r| r.organization != name);
        Ok(())
    }

    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state
            .organizations
            .iter()
            .any(|o| o.name == workspace.organization)
        {
            return Err(CoreError::OrganizationNotFound {
                name: workspace.organization.clone(),
            });
        }
        if state.workspaces.iter().any(|w| {
            w.id == workspace.id
                || (w.organization == workspace.organization && w.name == workspace.name)
        }) {
            return Err(CoreError::AlreadyExists {
                resource: "workspace",
                id: workspace.id.clone(),
            });
        }
        state.workspaces.push(workspace.clone());
        Ok(())
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.workspaces.iter().find(|w| w.id == workspace_id).cloned())
    }

    async fn list_workspaces(&self, organization: &str) -> Result<Vec<Workspace>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .workspaces
            .iter()
            .filter(|w| w.organization == organization)
            .cloned()
            .collect())
    }

    async fn update_workspace(
        &self,
        workspace_id: &str,
        update: WorkspaceUpdate,
    ) -> Result<Workspace, CoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .workspaces
            .iter_mut()
            .find(|w| w.id == workspace_id)
            .ok_or_else(|| CoreError::WorkspaceNotFound {
                workspace_id: workspace_id.to_string(),
            })?;
        let mut workspace = stored.clone();
        update(&mut workspace)?;
        *stored = workspace.clone();
        Ok(workspace)
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        let before = state.workspaces.len();
        state.workspaces.retain(|w| w.id != workspace_id);
        if state.workspaces.len() == before {
            return Err(CoreError::WorkspaceNotFound {
                workspace_id: workspace_id.to_string(),
            });
        }
        remove_runs(&mut state, |r| r.workspace_id != workspace_id);
        Ok(())
    }

    async fn create_run(&self, run: &Run) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.workspaces.iter().any(|w| w.id == run.workspace_id) {
            return Err(CoreError::WorkspaceNotFound {
                workspace_id: run.workspace_id.clone(),
            });
        }
        if state.runs.iter().any(|r| r.id == run.id) {
            return Err(CoreError::AlreadyExists {
                resource: "run",
                id: run.id.clone(),
            });
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunListFilter) -> Result<Vec<Run>, CoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, CoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let mut run = stored.clone();
        update(&mut run)?;
        *stored = run.clone();
        Ok(run)
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.runs.iter().any(|r| r.id == run_id) {
            return Err(CoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        remove_runs(&mut state, |r| r.id != run_id);
        Ok(())
    }

    async fn put_chunk(&self, chunk: &Chunk) -> Result<PersistedChunk, CoreError> {
        let mut state = self.state.lock().await;
        if !state.runs.iter().any(|r| r.id == chunk.run_id) {
            return Err(CoreError::RunNotFound {
                run_id: chunk.run_id.clone(),
            });
        }
        if state.chunks.iter().any(|c| {
            c.chunk.run_id == chunk.run_id
                && c.chunk.phase == chunk.phase
                && c.chunk.offset == chunk.offset
        }) {
            return Err(CoreError::AlreadyExists {
                resource: "chunk",
                id: format!("{}/{}/{}", chunk.run_id, chunk.phase, chunk.offset),
            });
        }
        state.next_chunk_id += 1;
        let persisted = PersistedChunk {
            id: state.next_chunk_id,
            chunk: chunk.clone(),
        };
        state.chunks.push(persisted.clone());
        Ok(persisted)
    }

    async fn get_chunk(&self, chunk_id: i64) -> Result<Option<PersistedChunk>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.chunks.iter().find(|c| c.id == chunk_id).cloned())
    }

    async fn list_chunks(
        &self,
        run_id: &str,
        phase: PhaseKind,
    ) -> Result<Vec<PersistedChunk>, CoreError> {
        let state = self.state.lock().await;
        let mut chunks: Vec<PersistedChunk> = state
            .chunks
            .iter()
            .filter(|c| c.chunk.run_id == run_id && c.chunk.phase == phase)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk.offset);
        Ok(chunks)
    }

    async fn acquire_exclusive(&self, lock_id: i64) -> Result<Box<dyn ExclusiveLock>, CoreError> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| CoreError::ConsistencyViolation {
                    details: "exclusive lock table poisoned".to_string(),
                })?;
            locks.entry(lock_id).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        Ok(Box::new(MemoryLock { _guard: guard }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{NewRun, RunStatus};
    use crate::workspace::{LockHolder, NewWorkspace};
    use std::time::Duration;

    async fn seeded() -> (MemoryPersistence, Workspace) {
        let db = MemoryPersistence::new();
        db.create_organization(&Organization::new("acme").unwrap())
            .await
            .unwrap();
        let ws = Workspace::new(NewWorkspace {
            name: "dev".to_string(),
            organization: "acme".to_string(),
            auto_apply: false,
        });
        db.create_workspace(&ws).await.unwrap();
        (db, ws)
    }

    fn run_for(ws: &Workspace, speculative: bool) -> Run {
        Run::new(NewRun {
            organization: ws.organization.clone(),
            workspace_id: ws.id.clone(),
            configuration_version_id: "cv-1".to_string(),
            speculative,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_failed_update_leaves_run_unchanged() {
        let (db, ws) = seeded().await;
        let run = run_for(&ws, false);
        db.create_run(&run).await.unwrap();

        let err = db
            .update_run(&run.id, Box::new(|run: &mut Run| run.discard().and_then(|_| run.discard())))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");

        let stored = db.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RunStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_keeps_creation_order() {
        let (db, ws) = seeded().await;
        let first = run_for(&ws, false);
        let speculative = run_for(&ws, true);
        let second = run_for(&ws, false);
        for run in [&first, &speculative, &second] {
            db.create_run(run).await.unwrap();
        }

        let runs = db
            .list_runs(&RunListFilter {
                workspace_id: Some(ws.id.clone()),
                speculative: Some(false),
                statuses: Some(vec![RunStatus::Pending]),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);
    }

    #[tokio::test]
    async fn test_update_workspace_lock() {
        let (db, ws) = seeded().await;
        let updated = db
            .update_workspace(&ws.id, Box::new(|ws: &mut Workspace| ws.lock(LockHolder::user("bob"))))
            .await
            .unwrap();
        assert!(updated.locked());

        let err = db
            .update_workspace(&ws.id, Box::new(|ws: &mut Workspace| ws.lock(LockHolder::run("run-1"))))
            .await
            .unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn test_delete_workspace_removes_runs_and_chunks() {
        let (db, ws) = seeded().await;
        let run = run_for(&ws, false);
        db.create_run(&run).await.unwrap();
        db.put_chunk(&Chunk {
            run_id: run.id.clone(),
            phase: PhaseKind::Plan,
            offset: 0,
            data: b"\x02hi".to_vec(),
        })
        .await
        .unwrap();

        db.delete_workspace(&ws.id).await.unwrap();
        assert!(db.get_run(&run.id).await.unwrap().is_none());
        assert!(db.list_chunks(&run.id, PhaseKind::Plan).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_chunk_offset_rejected() {
        let (db, ws) = seeded().await;
        let run = run_for(&ws, false);
        db.create_run(&run).await.unwrap();
        let chunk = Chunk {
            run_id: run.id.clone(),
            phase: PhaseKind::Plan,
            offset: 0,
            data: b"\x02a".to_vec(),
        };
        let stored = db.put_chunk(&chunk).await.unwrap();
        assert_eq!(db.get_chunk(stored.id).await.unwrap(), Some(stored));
        assert!(matches!(
            db.put_chunk(&chunk).await,
            Err(CoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_exclusive_lock_blocks_second_holder() {
        let db = MemoryPersistence::new();
        let held = db.acquire_exclusive(42).await.unwrap();

        let contender = {
            let db = db.clone();
            tokio::spawn(async move { db.acquire_exclusive(42).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        held.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("second holder should acquire after release")
            .unwrap()
            .unwrap();
    }
}
