// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runway-daemon integration tests.
//!
//! A [`Node`] is one broker plus services on top of shared in-memory storage
//! and a shared in-memory transport, so several nodes in one test behave like
//! daemons attached to the same database.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use runway_core::{MemoryPersistence, NewWorkspace, Persistence, Run, RunStatus, Workspace};
use runway_daemon::pubsub::{Broker, DEFAULT_CHANNEL, MemoryTransport};
use runway_daemon::services::{CreateRunOptions, Services};
use tokio_util::sync::CancellationToken;

/// How long tests wait for asynchronous progress.
pub const WAIT: Duration = Duration::from_secs(5);

/// One simulated daemon node.
pub struct Node {
    pub persistence: MemoryPersistence,
    pub transport: MemoryTransport,
    pub broker: Arc<Broker>,
    pub services: Services,
    listener: CancellationToken,
}

impl Node {
    /// Create a node with its own storage and transport.
    pub fn new() -> Self {
        Self::attach(&MemoryPersistence::new(), &MemoryTransport::new())
    }

    /// Create a node sharing storage and transport with other nodes.
    ///
    /// Starts the node's event listener.
    pub fn attach(persistence: &MemoryPersistence, transport: &MemoryTransport) -> Self {
        let broker = Arc::new(Broker::new(Arc::new(transport.clone()), DEFAULT_CHANNEL));
        let services = Services::new(Arc::new(persistence.clone()), broker.clone());
        services.register_getters(&broker);

        let listener = CancellationToken::new();
        {
            let broker = broker.clone();
            let cancel = listener.clone();
            tokio::spawn(async move { broker.run_listener(cancel).await });
        }

        Self {
            persistence: persistence.clone(),
            transport: transport.clone(),
            broker,
            services,
            listener,
        }
    }

    /// Storage as a trait object.
    pub fn storage(&self) -> Arc<dyn Persistence> {
        Arc::new(self.persistence.clone())
    }

    /// Create organization `acme` and a workspace in it.
    pub async fn seed_workspace(&self, auto_apply: bool) -> Workspace {
        seed_workspace(&self.services, auto_apply).await
    }

    /// Create a run in `workspace`.
    pub async fn create_run(&self, workspace: &Workspace, speculative: bool) -> Run {
        create_run(&self.services, workspace, speculative).await
    }

    /// Wait until run `run_id` reaches `status`.
    pub async fn wait_for_status(&self, run_id: &str, status: RunStatus) -> Run {
        wait_for_status(&self.services, run_id, status).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.cancel();
    }
}

/// Poll `check` until it returns true or [`WAIT`] elapses.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Create organization `acme` if missing and a new workspace in it.
pub async fn seed_workspace(services: &Services, auto_apply: bool) -> Workspace {
    if services.organizations.get("acme").await.is_err() {
        services.organizations.create("acme").await.unwrap();
    }
    services
        .workspaces
        .create(NewWorkspace {
            name: format!("ws-{}", uuid::Uuid::new_v4().simple()),
            organization: "acme".to_string(),
            auto_apply,
        })
        .await
        .unwrap()
}

/// Create a run in `workspace`.
pub async fn create_run(services: &Services, workspace: &Workspace, speculative: bool) -> Run {
    services
        .runs
        .create(CreateRunOptions {
            workspace_id: workspace.id.clone(),
            configuration_version_id: "cv-test".to_string(),
            speculative,
            ..Default::default()
        })
        .await
        .unwrap()
}

/// Wait until run `run_id` reaches `status`, failing the test otherwise.
pub async fn wait_for_status(services: &Services, run_id: &str, status: RunStatus) -> Run {
    let reached = wait_until(|| {
        let services = services.clone();
        let id = run_id.to_string();
        async move {
            services
                .runs
                .get(&id)
                .await
                .is_ok_and(|run| run.status() == status)
        }
    })
    .await;
    let run = services.runs.get(run_id).await.unwrap();
    assert!(
        reached,
        "run {} expected {}, still {}",
        run_id,
        status,
        run.status()
    );
    run
}
