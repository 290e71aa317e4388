// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runway Core - run lifecycle and workspace coordination
//!
//! This crate holds the domain model of the runway scheduler: runs and their
//! plan/apply phases, the workspace lock, log chunks, the domain events every
//! mutation produces, and the storage abstraction behind them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         runway-daemon                             │
//! │      (EventBus, Scheduler + WorkspaceQueues, Agent, Runner)       │
//! └──────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     runway-core (this crate)                      │
//! │   Run state machine · Workspace lock · Events · Log chunks        │
//! │                 Persistence trait + backends                      │
//! └──────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//!                  ┌───────────────────────────┐
//!                  │  PostgreSQL / in-memory   │
//!                  └───────────────────────────┘
//! ```
//!
//! # Run lifecycle
//!
//! | Operation | From | To |
//! |-----------|------|----|
//! | `enqueue_plan` | pending | plan_queued |
//! | `start(plan)` | plan_queued | planning |
//! | `finish(plan)` | planning | planned, planned_and_finished, apply_queued or errored |
//! | `enqueue_apply` | planned | apply_queued |
//! | `start(apply)` | apply_queued | applying |
//! | `finish(apply)` | applying | applied or errored |
//! | `cancel` | any non-terminal | canceled |
//! | `force_cancel` | canceled (after cool-off) | force_canceled |
//! | `discard` | pending, planned | discarded |
//!
//! See [`run`] for the full transition table.

#![deny(missing_docs)]

pub mod error;
pub mod event;
pub mod logs;
pub mod migrations;
pub mod organization;
pub mod persistence;
pub mod run;
pub mod workspace;

pub use error::{CoreError, Result};
pub use event::{Event, EventPayload, EventType, ResourceRef};
pub use logs::{Chunk, PersistedChunk};
pub use organization::Organization;
pub use persistence::{
    ExclusiveLock, MemoryPersistence, Persistence, PostgresPersistence, RunListFilter,
};
pub use run::{
    NewRun, Phase, PhaseFinishOptions, PhaseKind, PhaseStatus, ResourceReport, Run, RunStatus,
};
pub use workspace::{LockHolder, LockState, NewWorkspace, Workspace};
