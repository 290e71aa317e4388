// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence backend.
//!
//! Runs keep their status history and phases in JSONB columns; everything the
//! scheduler filters on (status, workspace, speculative) is a plain column.
//! Closure updates run inside a transaction that holds a row lock
//! (`SELECT ... FOR UPDATE`) so concurrent claims on the same run serialize.

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};

use super::{ExclusiveLock, Persistence, RunListFilter, RunUpdate, WorkspaceUpdate};
use crate::error::CoreError;
use crate::logs::{Chunk, PersistedChunk};
use crate::organization::Organization;
use crate::run::{Phase, PhaseKind, Run, RunStatus, StatusTimestamp};
use crate::workspace::{LockHolder, LockState, Workspace};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map unique violations to [`CoreError::AlreadyExists`].
fn map_insert_error(err: sqlx::Error, resource: &'static str, id: String) -> CoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            CoreError::AlreadyExists { resource, id }
        }
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            CoreError::ValidationError {
                field: resource.to_string(),
                message: format!("parent of {} '{}' does not exist", resource, id),
            }
        }
        _ => err.into(),
    }
}

// ============================================================================
// Record Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRecord {
    name: String,
    created_at: DateTime<Utc>,
}

impl From<OrganizationRecord> for Organization {
    fn from(r: OrganizationRecord) -> Self {
        Organization {
            name: r.name,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRecord {
    workspace_id: String,
    name: String,
    organization_name: String,
    auto_apply: bool,
    lock_kind: Option<String>,
    lock_holder: Option<String>,
    current_run_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<WorkspaceRecord> for Workspace {
    type Error = CoreError;

    fn try_from(r: WorkspaceRecord) -> Result<Self, CoreError> {
        let lock = match (r.lock_kind, r.lock_holder) {
            (Some(kind), Some(holder)) => LockState::Locked(LockHolder::from_parts(&kind, &holder)?),
            _ => LockState::Unlocked,
        };
        Ok(Workspace {
            id: r.workspace_id,
            name: r.name,
            organization: r.organization_name,
            auto_apply: r.auto_apply,
            created_at: r.created_at,
            current_run_id: r.current_run_id,
            lock,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRecord {
    run_id: String,
    organization_name: String,
    workspace_id: String,
    configuration_version_id: String,
    status: String,
    status_timestamps: Json<Vec<StatusTimestamp<RunStatus>>>,
    plan: Json<Phase>,
    apply: Json<Phase>,
    speculative: bool,
    auto_apply: bool,
    is_destroy: bool,
    message: Option<String>,
    force_cancel_available_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRecord> for Run {
    type Error = CoreError;

    fn try_from(r: RunRecord) -> Result<Self, CoreError> {
        Ok(Run {
            id: r.run_id,
            created_at: r.created_at,
            organization: r.organization_name,
            workspace_id: r.workspace_id,
            configuration_version_id: r.configuration_version_id,
            speculative: r.speculative,
            auto_apply: r.auto_apply,
            is_destroy: r.is_destroy,
            message: r.message,
            status: r.status.parse()?,
            status_timestamps: r.status_timestamps.0,
            plan: r.plan.0,
            apply: r.apply.0,
            force_cancel_available_at: r.force_cancel_available_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChunkRecord {
    chunk_id: i64,
    run_id: String,
    phase: String,
    chunk_offset: i64,
    data: Vec<u8>,
}

impl TryFrom<ChunkRecord> for PersistedChunk {
    type Error = CoreError;

    fn try_from(r: ChunkRecord) -> Result<Self, CoreError> {
        Ok(PersistedChunk {
            id: r.chunk_id,
            chunk: Chunk {
                run_id: r.run_id,
                phase: r.phase.parse()?,
                offset: r.chunk_offset,
                data: r.data,
            },
        })
    }
}

const WORKSPACE_COLUMNS: &str = "workspace_id, name, organization_name, auto_apply, lock_kind, \
     lock_holder, current_run_id, created_at";

const RUN_COLUMNS: &str = "run_id, organization_name, workspace_id, configuration_version_id, \
     status, status_timestamps, plan, apply, speculative, auto_apply, is_destroy, message, \
     force_cancel_available_at, created_at";

// ============================================================================
// Organization Operations
// ============================================================================

/// Insert an organization.
pub async fn create_organization(pool: &PgPool, org: &Organization) -> Result<(), CoreError> {
    sqlx::query("INSERT INTO organizations (name, created_at) VALUES ($1, $2)")
        .bind(&org.name)
        .bind(org.created_at)
        .execute(pool)
        .await
        .map_err(|e| map_insert_error(e, "organization", org.name.clone()))?;
    Ok(())
}

/// Fetch an organization by name.
pub async fn get_organization(pool: &PgPool, name: &str) -> Result<Option<Organization>, CoreError> {
    let record: Option<OrganizationRecord> =
        sqlx::query_as("SELECT name, created_at FROM organizations WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(record.map(Organization::from))
}

/// List all organizations.
pub async fn list_organizations(pool: &PgPool) -> Result<Vec<Organization>, CoreError> {
    let records: Vec<OrganizationRecord> =
        sqlx::query_as("SELECT name, created_at FROM organizations ORDER BY created_at, name")
            .fetch_all(pool)
            .await?;
    Ok(records.into_iter().map(Organization::from).collect())
}

/// Delete an organization. Workspaces, runs and chunks cascade.
pub async fn delete_organization(pool: &PgPool, name: &str) -> Result<(), CoreError> {
    let result = sqlx::query("DELETE FROM organizations WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::OrganizationNotFound {
            name: name.to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Workspace Operations
// ============================================================================

/// Insert a workspace.
pub async fn create_workspace(pool: &PgPool, ws: &Workspace) -> Result<(), CoreError> {
    let holder = ws.lock_state().holder();
    sqlx::query(
        r#"
        INSERT INTO workspaces
            (workspace_id, name, organization_name, auto_apply, lock_kind, lock_holder,
             current_run_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&ws.id)
    .bind(&ws.name)
    .bind(&ws.organization)
    .bind(ws.auto_apply)
    .bind(holder.map(|h| h.kind()))
    .bind(holder.map(|h| h.id().to_string()))
    .bind(&ws.current_run_id)
    .bind(ws.created_at)
    .execute(pool)
    .await
    .map_err(|e| map_insert_error(e, "workspace", ws.id.clone()))?;
    Ok(())
}

/// Fetch a workspace by ID.
pub async fn get_workspace(pool: &PgPool, workspace_id: &str) -> Result<Option<Workspace>, CoreError> {
    let record: Option<WorkspaceRecord> = sqlx::query_as(&format!(
        "SELECT {} FROM workspaces WHERE workspace_id = $1",
        WORKSPACE_COLUMNS
    ))
    .bind(workspace_id)
    .fetch_optional(pool)
    .await?;
    record.map(Workspace::try_from).transpose()
}

/// List the workspaces of an organization.
pub async fn list_workspaces(pool: &PgPool, organization: &str) -> Result<Vec<Workspace>, CoreError> {
    let records: Vec<WorkspaceRecord> = sqlx::query_as(&format!(
        "SELECT {} FROM workspaces WHERE organization_name = $1 ORDER BY created_at, workspace_id",
        WORKSPACE_COLUMNS
    ))
    .bind(organization)
    .fetch_all(pool)
    .await?;
    records.into_iter().map(Workspace::try_from).collect()
}

/// Load a workspace under a row lock, apply `update`, and store the result.
pub async fn update_workspace(
    pool: &PgPool,
    workspace_id: &str,
    update: WorkspaceUpdate,
) -> Result<Workspace, CoreError> {
    let mut tx = pool.begin().await?;

    let record: Option<WorkspaceRecord> = sqlx::query_as(&format!(
        "SELECT {} FROM workspaces WHERE workspace_id = $1 FOR UPDATE",
        WORKSPACE_COLUMNS
    ))
    .bind(workspace_id)
    .fetch_optional(&mut *tx)
    .await?;

    let mut ws = record
        .ok_or_else(|| CoreError::WorkspaceNotFound {
            workspace_id: workspace_id.to_string(),
        })
        .and_then(Workspace::try_from)?;

    update(&mut ws)?;

    let holder = ws.lock_state().holder();
    sqlx::query(
        r#"
        UPDATE workspaces
        SET name = $2, auto_apply = $3, lock_kind = $4, lock_holder = $5, current_run_id = $6
        WHERE workspace_id = $1
        "#,
    )
    .bind(&ws.id)
    .bind(&ws.name)
    .bind(ws.auto_apply)
    .bind(holder.map(|h| h.kind()))
    .bind(holder.map(|h| h.id().to_string()))
    .bind(&ws.current_run_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(ws)
}

/// Delete a workspace. Runs and chunks cascade.
pub async fn delete_workspace(pool: &PgPool, workspace_id: &str) -> Result<(), CoreError> {
    let result = sqlx::query("DELETE FROM workspaces WHERE workspace_id = $1")
        .bind(workspace_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::WorkspaceNotFound {
            workspace_id: workspace_id.to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Run Operations
// ============================================================================

/// Insert a run.
pub async fn create_run(pool: &PgPool, run: &Run) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO runs
            (run_id, organization_name, workspace_id, configuration_version_id, status,
             status_timestamps, plan, apply, speculative, auto_apply, is_destroy, message,
             force_cancel_available_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        "#,
    )
    .bind(&run.id)
    .bind(&run.organization)
    .bind(&run.workspace_id)
    .bind(&run.configuration_version_id)
    .bind(run.status.as_str())
    .bind(Json(&run.status_timestamps))
    .bind(Json(&run.plan))
    .bind(Json(&run.apply))
    .bind(run.speculative)
    .bind(run.auto_apply)
    .bind(run.is_destroy)
    .bind(&run.message)
    .bind(run.force_cancel_available_at)
    .bind(run.created_at)
    .execute(pool)
    .await
    .map_err(|e| map_insert_error(e, "run", run.id.clone()))?;
    Ok(())
}

/// Fetch a run by ID.
pub async fn get_run(pool: &PgPool, run_id: &str) -> Result<Option<Run>, CoreError> {
    let record: Option<RunRecord> = sqlx::query_as(&format!(
        "SELECT {} FROM runs WHERE run_id = $1",
        RUN_COLUMNS
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    record.map(Run::try_from).transpose()
}

/// List runs matching `filter`, oldest first.
pub async fn list_runs(pool: &PgPool, filter: &RunListFilter) -> Result<Vec<Run>, CoreError> {
    let statuses: Option<Vec<String>> = filter
        .statuses
        .as_ref()
        .map(|s| s.iter().map(|status| status.as_str().to_string()).collect());

    let records: Vec<RunRecord> = sqlx::query_as(&format!(
        r#"
        SELECT {} FROM runs
        WHERE ($1::TEXT IS NULL OR organization_name = $1)
          AND ($2::TEXT IS NULL OR workspace_id = $2)
          AND ($3::TEXT[] IS NULL OR status = ANY($3))
          AND ($4::BOOLEAN IS NULL OR speculative = $4)
        ORDER BY seq ASC
        "#,
        RUN_COLUMNS
    ))
    .bind(filter.organization.as_deref())
    .bind(filter.workspace_id.as_deref())
    .bind(statuses)
    .bind(filter.speculative)
    .fetch_all(pool)
    .await?;

    records.into_iter().map(Run::try_from).collect()
}

/// Load a run under a row lock, apply `update`, and store the result.
pub async fn update_run(pool: &PgPool, run_id: &str, update: RunUpdate) -> Result<Run, CoreError> {
    let mut tx = pool.begin().await?;

    let record: Option<RunRecord> = sqlx::query_as(&format!(
        "SELECT {} FROM runs WHERE run_id = $1 FOR UPDATE",
        RUN_COLUMNS
    ))
    .bind(run_id)
    .fetch_optional(&mut *tx)
    .await?;

    let mut run = record
        .ok_or_else(|| CoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
        .and_then(Run::try_from)?;

    update(&mut run)?;

    sqlx::query(
        r#"
        UPDATE runs
        SET status = $2, status_timestamps = $3, plan = $4, apply = $5,
            force_cancel_available_at = $6, auto_apply = $7, message = $8
        WHERE run_id = $1
        "#,
    )
    .bind(&run.id)
    .bind(run.status.as_str())
    .bind(Json(&run.status_timestamps))
    .bind(Json(&run.plan))
    .bind(Json(&run.apply))
    .bind(run.force_cancel_available_at)
    .bind(run.auto_apply)
    .bind(&run.message)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(run)
}

/// Delete a run. Chunks cascade.
pub async fn delete_run(pool: &PgPool, run_id: &str) -> Result<(), CoreError> {
    let result = sqlx::query("DELETE FROM runs WHERE run_id = $1")
        .bind(run_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::RunNotFound {
            run_id: run_id.to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Chunk Operations
// ============================================================================

/// Insert a log chunk, returning it with its assigned ID.
pub async fn put_chunk(pool: &PgPool, chunk: &Chunk) -> Result<PersistedChunk, CoreError> {
    let (chunk_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO chunks (run_id, phase, chunk_offset, data)
        VALUES ($1, $2, $3, $4)
        RETURNING chunk_id
        "#,
    )
    .bind(&chunk.run_id)
    .bind(chunk.phase.as_str())
    .bind(chunk.offset)
    .bind(&chunk.data)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        map_insert_error(
            e,
            "chunk",
            format!("{}/{}/{}", chunk.run_id, chunk.phase, chunk.offset),
        )
    })?;

    Ok(PersistedChunk {
        id: chunk_id,
        chunk: chunk.clone(),
    })
}

/// Fetch a chunk by ID.
pub async fn get_chunk(pool: &PgPool, chunk_id: i64) -> Result<Option<PersistedChunk>, CoreError> {
    let record: Option<ChunkRecord> = sqlx::query_as(
        "SELECT chunk_id, run_id, phase, chunk_offset, data FROM chunks WHERE chunk_id = $1",
    )
    .bind(chunk_id)
    .fetch_optional(pool)
    .await?;
    record.map(PersistedChunk::try_from).transpose()
}

/// List the chunks of a phase in offset order.
pub async fn list_chunks(
    pool: &PgPool,
    run_id: &str,
    phase: PhaseKind,
) -> Result<Vec<PersistedChunk>, CoreError> {
    let records: Vec<ChunkRecord> = sqlx::query_as(
        r#"
        SELECT chunk_id, run_id, phase, chunk_offset, data
        FROM chunks
        WHERE run_id = $1 AND phase = $2
        ORDER BY chunk_offset ASC
        "#,
    )
    .bind(run_id)
    .bind(phase.as_str())
    .fetch_all(pool)
    .await?;
    records.into_iter().map(PersistedChunk::try_from).collect()
}

// ============================================================================
// Advisory Lock
// ============================================================================

/// Session-level advisory lock pinned to one pooled connection.
///
/// The lock belongs to the database session, so the connection must never be
/// returned to the pool while the lock is held. If the guard is dropped
/// without [`ExclusiveLock::release`], the connection is detached and closed,
/// which ends the session and frees the lock.
struct PgAdvisoryLock {
    conn: Option<PoolConnection<Postgres>>,
    lock_id: i64,
}

#[async_trait::async_trait]
impl ExclusiveLock for PgAdvisoryLock {
    async fn release(mut self: Box<Self>) -> Result<(), CoreError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.lock_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

impl Drop for PgAdvisoryLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Block until the advisory lock `lock_id` is held.
pub async fn acquire_advisory_lock(
    pool: &PgPool,
    lock_id: i64,
) -> Result<Box<dyn ExclusiveLock>, CoreError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(lock_id)
        .execute(&mut *conn)
        .await?;
    Ok(Box::new(PgAdvisoryLock {
        conn: Some(conn),
        lock_id,
    }))
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_organization(&self, org: &Organization) -> Result<(), CoreError> {
        create_organization(&self.pool, org).await
    }

    async fn get_organization(&self, name: &str) -> Result<Option<Organization>, CoreError> {
        get_organization(&self.pool, name).await
    }

    async fn list_organizations(&self) -> Result<Vec<Organization>, CoreError> {
        list_organizations(&self.pool).await
    }

    async fn delete_organization(&self, name: &str) -> Result<(), CoreError> {
        delete_organization(&self.pool, name).await
    }

    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        create_workspace(&self.pool, workspace).await
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>, CoreError> {
        get_workspace(&self.pool, workspace_id).await
    }

    async fn list_workspaces(&self, organization: &str) -> Result<Vec<Workspace>, CoreError> {
        list_workspaces(&self.pool, organization).await
    }

    async fn update_workspace(
        &self,
        workspace_id: &str,
        update: WorkspaceUpdate,
    ) -> Result<Workspace, CoreError> {
        update_workspace(&self.pool, workspace_id, update).await
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), CoreError> {
        delete_workspace(&self.pool, workspace_id).await
    }

    async fn create_run(&self, run: &Run) -> Result<(), CoreError> {
        create_run(&self.pool, run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, CoreError> {
        get_run(&self.pool, run_id).await
    }

    async fn list_runs(&self, filter: &RunListFilter) -> Result<Vec<Run>, CoreError> {
        list_runs(&self.pool, filter).await
    }

    async fn update_run(&self, run_id: &str, update: RunUpdate) -> Result<Run, CoreError> {
        update_run(&self.pool, run_id, update).await
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), CoreError> {
        delete_run(&self.pool, run_id).await
    }

    async fn put_chunk(&self, chunk: &Chunk) -> Result<PersistedChunk, CoreError> {
        put_chunk(&self.pool, chunk).await
    }

    async fn get_chunk(&self, chunk_id: i64) -> Result<Option<PersistedChunk>, CoreError> {
        get_chunk(&self.pool, chunk_id).await
    }

    async fn list_chunks(
        &self,
        run_id: &str,
        phase: PhaseKind,
    ) -> Result<Vec<PersistedChunk>, CoreError> {
        list_chunks(&self.pool, run_id, phase).await
    }

    async fn acquire_exclusive(&self, lock_id: i64) -> Result<Box<dyn ExclusiveLock>, CoreError> {
        acquire_advisory_lock(&self.pool, lock_id).await
    }
}
