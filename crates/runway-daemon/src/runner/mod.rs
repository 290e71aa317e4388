// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase runners.
//!
//! Provides an abstraction over how a run phase is executed:
//! - Process: spawns the IaC engine binary
//! - Mock: simulated execution for tests

pub mod mock;
pub mod process;
pub mod traits;

pub use mock::MockRunner;
pub use process::{ProcessRunner, ProcessRunnerConfig};
pub use traits::*;
