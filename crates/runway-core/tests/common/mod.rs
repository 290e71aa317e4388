// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runway-core database tests.
//!
//! Provides TestContext for setting up a migrated database with a fresh
//! organization and workspace per test.

#![allow(dead_code)]

use runway_core::persistence::Persistence;
use runway_core::{NewRun, NewWorkspace, Organization, PostgresPersistence, Run, Workspace};
use sqlx::PgPool;
use uuid::Uuid;

/// Test context with a migrated database and a seeded workspace.
pub struct TestContext {
    pub pool: PgPool,
    pub db: PostgresPersistence,
    pub organization: Organization,
    pub workspace: Workspace,
}

impl TestContext {
    /// Create a new test context.
    ///
    /// Returns `None` when TEST_RUNWAY_DATABASE_URL is not set or the database
    /// is unreachable.
    pub async fn new() -> Option<Self> {
        let database_url = std::env::var("TEST_RUNWAY_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;
        runway_core::migrations::run_postgres(&pool).await.ok()?;

        let db = PostgresPersistence::new(pool.clone());

        // Unique per test so tests can share one database.
        let organization = Organization::new(format!("org-{}", Uuid::new_v4().simple())).ok()?;
        db.create_organization(&organization).await.ok()?;

        let workspace = Workspace::new(NewWorkspace {
            name: "default".to_string(),
            organization: organization.name.clone(),
            auto_apply: false,
        });
        db.create_workspace(&workspace).await.ok()?;

        Some(Self {
            pool,
            db,
            organization,
            workspace,
        })
    }

    /// Create and store a run in the seeded workspace.
    pub async fn create_run(&self, speculative: bool) -> Run {
        let run = Run::new(NewRun {
            organization: self.organization.name.clone(),
            workspace_id: self.workspace.id.clone(),
            configuration_version_id: "cv-test".to_string(),
            speculative,
            ..Default::default()
        });
        self.db.create_run(&run).await.expect("Failed to create run");
        run
    }

    /// Remove everything created by this context.
    pub async fn cleanup(&self) {
        let _ = self.db.delete_organization(&self.organization.name).await;
    }
}

/// Helper macro to skip tests if database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_RUNWAY_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_RUNWAY_DATABASE_URL not set");
            return;
        }
    };
}
