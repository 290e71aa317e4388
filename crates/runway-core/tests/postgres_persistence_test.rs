// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence tests.
//!
//! Run with:
//! ```bash
//! TEST_RUNWAY_DATABASE_URL=postgres://localhost/runway_test \
//!     cargo test -p runway-core --test postgres_persistence_test
//! ```

mod common;

use std::time::Duration;

use common::*;
use runway_core::persistence::Persistence;
use runway_core::{
    Chunk, CoreError, LockHolder, PhaseFinishOptions, PhaseKind, ResourceReport, Run,
    RunListFilter, RunStatus, Workspace,
};

// ============================================================================
// Run Tests
// ============================================================================

#[tokio::test]
async fn test_run_round_trip_preserves_history() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let run = ctx.create_run(false).await;
    let updated = ctx
        .db
        .update_run(
            &run.id,
            Box::new(|run: &mut Run| {
                run.enqueue_plan()?;
                run.start(PhaseKind::Plan, "agent-1")?;
                run.finish(
                    PhaseKind::Plan,
                    PhaseFinishOptions {
                        errored: false,
                        report: Some(ResourceReport {
                            additions: 3,
                            changes: 0,
                            destructions: 1,
                        }),
                    },
                )
            }),
        )
        .await
        .expect("update should succeed");

    let stored = ctx.db.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored, updated);
    assert_eq!(stored.status(), RunStatus::Planned);
    assert_eq!(stored.plan().report().unwrap().additions, 3);
    assert_eq!(stored.plan().claimed_by(), Some("agent-1"));
    assert_eq!(stored.status_timestamps().len(), 4);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_claims_one_winner() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let run = ctx.create_run(false).await;
    ctx.db
        .update_run(&run.id, Box::new(|run: &mut Run| run.enqueue_plan()))
        .await
        .unwrap();

    let claims = (0..4).map(|i| {
        let db = ctx.db.clone();
        let run_id = run.id.clone();
        async move {
            let agent = format!("agent-{}", i);
            db.update_run(
                &run_id,
                Box::new(move |run: &mut Run| run.start(PhaseKind::Plan, &agent)),
            )
            .await
        }
    });
    let results = futures::future::join_all(claims).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(result, CoreError::PhaseAlreadyClaimed { .. }));
    }

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_list_runs_oldest_first() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let r1 = ctx.create_run(false).await;
    let _speculative = ctx.create_run(true).await;
    let r2 = ctx.create_run(false).await;
    let r3 = ctx.create_run(false).await;

    let runs = ctx
        .db
        .list_runs(&RunListFilter {
            workspace_id: Some(ctx.workspace.id.clone()),
            speculative: Some(false),
            statuses: Some(vec![RunStatus::Pending]),
            ..Default::default()
        })
        .await
        .unwrap();

    let ids: Vec<String> = runs.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![r1.id, r2.id, r3.id]);

    ctx.cleanup().await;
}

// ============================================================================
// Workspace Tests
// ============================================================================

#[tokio::test]
async fn test_workspace_lock_persists() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    ctx.db
        .update_workspace(
            &ctx.workspace.id,
            Box::new(|ws: &mut Workspace| {
                ws.current_run_id = Some("run-abc".to_string());
                ws.lock(LockHolder::run("run-abc"))
            }),
        )
        .await
        .unwrap();

    let stored = ctx.db.get_workspace(&ctx.workspace.id).await.unwrap().unwrap();
    assert_eq!(
        stored.lock_state().holder(),
        Some(&LockHolder::run("run-abc"))
    );
    assert_eq!(stored.current_run_id.as_deref(), Some("run-abc"));

    let err = ctx
        .db
        .update_workspace(
            &ctx.workspace.id,
            Box::new(|ws: &mut Workspace| ws.lock(LockHolder::run("run-other"))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::WorkspaceAlreadyLocked { .. }));

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_duplicate_workspace_name_rejected() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let duplicate = Workspace::new(runway_core::NewWorkspace {
        name: ctx.workspace.name.clone(),
        organization: ctx.organization.name.clone(),
        auto_apply: false,
    });
    let err = ctx.db.create_workspace(&duplicate).await.unwrap_err();
    assert_eq!(err.error_code(), "ALREADY_EXISTS");

    ctx.cleanup().await;
}

// ============================================================================
// Chunk Tests
// ============================================================================

#[tokio::test]
async fn test_chunks_listed_in_offset_order() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let run = ctx.create_run(false).await;
    for (offset, data) in [(6_i64, &b"world\x03"[..]), (0, &b"\x02hello"[..])] {
        ctx.db
            .put_chunk(&Chunk {
                run_id: run.id.clone(),
                phase: PhaseKind::Plan,
                offset,
                data: data.to_vec(),
            })
            .await
            .unwrap();
    }

    let chunks = ctx.db.list_chunks(&run.id, PhaseKind::Plan).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk.offset, 0);
    let text = runway_core::logs::reassemble(chunks.iter().map(|c| &c.chunk));
    assert_eq!(text, b"helloworld".to_vec());

    let fetched = ctx.db.get_chunk(chunks[1].id).await.unwrap().unwrap();
    assert_eq!(fetched, chunks[1]);

    ctx.cleanup().await;
}

// ============================================================================
// Advisory Lock Tests
// ============================================================================

#[tokio::test]
async fn test_advisory_lock_excludes_second_session() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new().await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    // Random key so parallel test binaries do not contend.
    let lock_id = i64::from(rand_key());
    let held = ctx.db.acquire_exclusive(lock_id).await.unwrap();

    let db = ctx.db.clone();
    let contender = tokio::spawn(async move { db.acquire_exclusive(lock_id).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!contender.is_finished(), "second session must block");

    held.release().await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), contender)
        .await
        .expect("lock should be granted after release")
        .unwrap()
        .unwrap();
    second.release().await.unwrap();

    ctx.cleanup().await;
}

fn rand_key() -> u32 {
    uuid::Uuid::new_v4().as_u128() as u32
}
