// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for runway-core.
//!
//! This module defines the persistence abstraction and backend implementations.
//! Mutations of runs and workspaces go through closure-based updates
//! ([`Persistence::update_run`], [`Persistence::update_workspace`]) that load
//! the current row, apply the closure and write the result back atomically,
//! so state machine rules are always checked against the stored state.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::logs::{Chunk, PersistedChunk};
use crate::organization::Organization;
use crate::run::{PhaseKind, Run, RunStatus};
use crate::workspace::Workspace;

/// Closure applied to a run inside [`Persistence::update_run`].
pub type RunUpdate = Box<dyn FnOnce(&mut Run) -> Result<(), CoreError> + Send>;

/// Closure applied to a workspace inside [`Persistence::update_workspace`].
pub type WorkspaceUpdate = Box<dyn FnOnce(&mut Workspace) -> Result<(), CoreError> + Send>;

/// Filter for listing runs. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RunListFilter {
    /// Only runs in this organization.
    pub organization: Option<String>,
    /// Only runs targeting this workspace.
    pub workspace_id: Option<String>,
    /// Only runs in one of these statuses.
    pub statuses: Option<Vec<RunStatus>>,
    /// Only speculative (`true`) or non-speculative (`false`) runs.
    pub speculative: Option<bool>,
}

impl RunListFilter {
    /// Whether `run` passes the filter.
    pub fn matches(&self, run: &Run) -> bool {
        self.organization
            .as_ref()
            .is_none_or(|org| *org == run.organization)
            && self
                .workspace_id
                .as_ref()
                .is_none_or(|ws| *ws == run.workspace_id)
            && self
                .statuses
                .as_ref()
                .is_none_or(|statuses| statuses.contains(&run.status()))
            && self.speculative.is_none_or(|s| s == run.speculative)
    }
}

/// A held cluster-wide exclusive lock.
///
/// Dropping the guard without calling [`release`](Self::release) still
/// releases the lock, but without reporting errors.
#[async_trait]
pub trait ExclusiveLock: Send {
    /// Release the lock.
    async fn release(self: Box<Self>) -> Result<(), CoreError>;
}

/// Storage for organizations, workspaces, runs and log chunks.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Organizations
    // ========================================================================

    /// Insert a new organization.
    async fn create_organization(&self, org: &Organization) -> Result<(), CoreError>;

    /// Fetch an organization by name.
    async fn get_organization(&self, name: &str) -> Result<Option<Organization>, CoreError>;

    /// List all organizations, oldest first.
    async fn list_organizations(&self) -> Result<Vec<Organization>, CoreError>;

    /// Delete an organization together with its workspaces and runs.
    async fn delete_organization(&self, name: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Workspaces
    // ========================================================================

    /// Insert a new workspace.
    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), CoreError>;

    /// Fetch a workspace by ID.
    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, CoreError>;

    /// List the workspaces of an organization, oldest first.
    async fn list_workspaces(&self, organization: &str) -> Result<Vec<Workspace>, CoreError>;

    /// Atomically load, modify and store a workspace.
    ///
    /// Nothing is written when the closure fails.
    async fn update_workspace(
        &self,
        workspace_id: &str,
        update: WorkspaceUpdate,
    ) -> Result<Workspace, CoreError>;

    /// Delete a workspace together with its runs.
    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Runs
    // ========================================================================

    /// Insert a new run.
    async fn create_run(&self, run: &Run) -> Result<(), CoreError>;

    /// Fetch a run by ID.
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, CoreError>;

    /// List runs matching `filter` in creation order.
    async fn list_runs(&self, filter: &RunListFilter) -> Result<Vec<Run>, CoreError>;

    /// Atomically load, modify and store a run.
    ///
    /// Nothing is written when the closure fails.
    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, CoreError>;

    /// Delete a run and its log chunks.
    async fn delete_run(&self, run_id: &str) -> Result<(), CoreError>;

    // ========================================================================
    // Log chunks
    // ========================================================================

    /// Store a chunk. Fails if a chunk already exists at the same offset.
    async fn put_chunk(&self, chunk: &Chunk) -> Result<PersistedChunk, CoreError>;

    /// Fetch a chunk by its storage ID.
    async fn get_chunk(&self, chunk_id: i64) -> Result<Option<PersistedChunk>, CoreError>;

    /// List the chunks of a phase in offset order.
    async fn list_chunks(
        &self,
        run_id: &str,
        phase: PhaseKind,
    ) -> Result<Vec<PersistedChunk>, CoreError>;

    // ========================================================================
    // Cluster coordination
    // ========================================================================

    /// Block until the exclusive lock `lock_id` is held by this caller.
    async fn acquire_exclusive(&self, lock_id: i64) -> Result<Box<dyn ExclusiveLock>, CoreError>;
}
