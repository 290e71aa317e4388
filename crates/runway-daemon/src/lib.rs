// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runway Daemon - event bus, scheduler and agent
//!
//! This crate turns the run model of `runway-core` into a working cluster
//! node. Every node runs the event listener; the scheduler and the agent are
//! optional per node.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                       runway-daemon (node)                         │
//! │  ┌─────────────┐    ┌──────────────────────┐    ┌──────────────┐   │
//! │  │  Services   │───►│       Broker         │───►│  Scheduler   │   │
//! │  │ (mutations) │    │ local fan-out + relay │    │  (leader)    │   │
//! │  └─────────────┘    └──────────────────────┘    └──────────────┘   │
//! │         ▲                      │   ▲                   │           │
//! │         │                      │   │            WorkspaceQueues    │
//! │  ┌─────────────┐               │   │                               │
//! │  │    Agent    │◄──────────────┘   │                               │
//! │  │ + Runner    │                   │                               │
//! │  └─────────────┘                   │                               │
//! └────────────────────────────────────┼───────────────────────────────┘
//!                                      │ NOTIFY / LISTEN
//!                            ┌─────────┴──────────┐
//!                            │     PostgreSQL     │
//!                            └────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pubsub`] | Event broker: in-process subscribers and cross-node relay |
//! | [`services`] | Mutations of the run model that publish their events |
//! | [`scheduler`] | Leader-elected scheduler with one FIFO queue per workspace |
//! | [`agent`] | Claims queued phases and streams their output into logs |
//! | [`runner`] | Phase execution: engine process or mock |
//! | [`runtime`] | Embeddable runtime wiring everything together |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RUNWAY_DATABASE_URL` | required | PostgreSQL connection URL |
//! | `RUNWAY_EVENTS_CHANNEL` | `events` | LISTEN/NOTIFY channel |
//! | `RUNWAY_SCHEDULER_ENABLED` | `true` | Compete for the scheduler lock |
//! | `RUNWAY_AGENT_ENABLED` | `true` | Execute queued phases |
//! | `RUNWAY_AGENT_CONCURRENCY` | `5` | Concurrent phases per agent |
//! | `RUNWAY_ENGINE_BIN` | `terraform` | Engine binary |
//! | `DATA_DIR` | `.data` | Working directory root |
//! | `RUNWAY_RESEED_INTERVAL_SECS` | `300` | Scheduler reconciliation period |

#![deny(missing_docs)]

pub mod agent;
pub mod backoff;
pub mod config;
pub mod error;
pub mod pubsub;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod services;

pub use error::{Error, Result};
pub use runtime::{DaemonRuntime, DaemonRuntimeBuilder};
