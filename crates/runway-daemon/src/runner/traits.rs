// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface for executing a run phase.

use std::path::PathBuf;

use async_trait::async_trait;
use runway_core::{PhaseKind, ResourceReport};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Engine binary was not found.
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    /// Execution was cancelled.
    #[error("Execution cancelled")]
    Cancelled,

    /// Process failed to start.
    #[error("Process start failed: {0}")]
    StartFailed(String),

    /// Process exited with non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// Phase output could not be stored.
    #[error("Output error: {0}")]
    Output(#[from] runway_core::CoreError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// What to execute.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Run being executed.
    pub run_id: String,
    /// Phase being executed.
    pub phase: PhaseKind,
    /// Workspace the run targets.
    pub workspace_id: String,
    /// Configuration version to execute.
    pub configuration_version_id: String,
    /// Destroy run.
    pub is_destroy: bool,
    /// Directory the engine runs in. Shared by the phases of a run.
    pub working_dir: PathBuf,
}

/// Result of a successfully executed phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    /// Resource changes reported by the engine.
    pub report: Option<ResourceReport>,
}

/// Sink for the output of a phase.
#[async_trait]
pub trait PhaseOutput: Send {
    /// Append bytes to the phase log.
    async fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// Cancellation signal for a running phase.
///
/// A graceful cancel asks the engine to stop at a safe point; a forced cancel
/// kills it immediately. Cancelling after the phase has exited does nothing.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    interrupt: CancellationToken,
    kill: CancellationToken,
}

impl CancelHandle {
    /// Create an untriggered handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; `force` kills instead of interrupting.
    pub fn cancel(&self, force: bool) {
        self.interrupt.cancel();
        if force {
            self.kill.cancel();
        }
    }

    /// Whether any cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Whether a forced cancellation was requested.
    pub fn is_forced(&self) -> bool {
        self.kill.is_cancelled()
    }

    /// Completes once any cancellation is requested.
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await
    }

    /// Completes once a forced cancellation is requested.
    pub async fn killed(&self) {
        self.kill.cancelled().await
    }
}

/// Trait for phase runners.
///
/// Runners are pure execution engines: they write output to the sink they
/// are given and report the outcome, but never touch run state themselves.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g., "process", "mock")
    fn runner_type(&self) -> &'static str;

    /// Execute a phase to completion, failure or cancellation.
    async fn execute(
        &self,
        spec: &JobSpec,
        output: &mut dyn PhaseOutput,
        cancel: &CancelHandle,
    ) -> Result<PhaseOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graceful_cancel_does_not_kill() {
        let handle = CancelHandle::new();
        assert!(!handle.is_canceled());
        handle.cancel(false);
        assert!(handle.is_canceled());
        assert!(!handle.is_forced());
    }

    #[tokio::test]
    async fn test_force_cancel_fires_both_signals() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel(true);
        handle.interrupted().await;
        handle.killed().await;
        assert!(handle.is_forced());
    }

    #[test]
    fn test_exit_code_display() {
        let err = RunnerError::ExitCode {
            exit_code: 1,
            stderr: "Error: invalid configuration".to_string(),
        };
        assert_eq!(err.to_string(), "Exit code 1: Error: invalid configuration");
    }
}
