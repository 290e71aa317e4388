// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! Simulates phase execution without spawning the engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use runway_core::ResourceReport;

use super::traits::*;

/// Mock runner for testing.
pub struct MockRunner {
    /// Delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
    /// If true, phases fail
    pub fail_by_default: bool,
    /// If true, phases run until cancelled
    pub never_complete: bool,
    /// Report returned by successful phases
    pub report: ResourceReport,
    /// Bytes written to the phase output
    pub output: Vec<u8>,
    executed: AtomicUsize,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a mock runner whose phases succeed with one addition.
    pub fn new() -> Self {
        Self {
            execution_delay_ms: 10,
            fail_by_default: false,
            never_complete: false,
            report: ResourceReport {
                additions: 1,
                changes: 0,
                destructions: 0,
            },
            output: b"mock output\n".to_vec(),
            executed: AtomicUsize::new(0),
        }
    }

    /// Create a mock runner whose phases fail.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock runner whose phases only end when cancelled.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Report `report` from successful phases.
    pub fn with_report(mut self, report: ResourceReport) -> Self {
        self.report = report;
        self
    }

    /// Number of phases started.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(
        &self,
        _spec: &JobSpec,
        output: &mut dyn PhaseOutput,
        cancel: &CancelHandle,
    ) -> Result<PhaseOutcome> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        output.write(&self.output).await?;

        if self.never_complete {
            cancel.interrupted().await;
            return Err(RunnerError::Cancelled);
        }

        tokio::select! {
            _ = cancel.interrupted() => return Err(RunnerError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(self.execution_delay_ms)) => {}
        }

        if self.fail_by_default {
            return Err(RunnerError::ExitCode {
                exit_code: 1,
                stderr: "Mock failure".to_string(),
            });
        }

        Ok(PhaseOutcome {
            report: Some(self.report),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runway_core::PhaseKind;

    #[derive(Default)]
    struct Buffer(Vec<u8>);

    #[async_trait]
    impl PhaseOutput for Buffer {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            self.0.extend_from_slice(data);
            Ok(())
        }
    }

    fn spec() -> JobSpec {
        JobSpec {
            run_id: "run-1".to_string(),
            phase: PhaseKind::Plan,
            workspace_id: "ws-1".to_string(),
            configuration_version_id: "cv-1".to_string(),
            is_destroy: false,
            working_dir: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_mock_runner_succeeds() {
        let runner = MockRunner::new();
        let mut out = Buffer::default();
        let outcome = runner
            .execute(&spec(), &mut out, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(outcome.report, Some(runner.report));
        assert_eq!(out.0, b"mock output\n");
        assert_eq!(runner.executed(), 1);
    }

    #[tokio::test]
    async fn test_mock_runner_fails() {
        let runner = MockRunner::failing();
        let err = runner
            .execute(&spec(), &mut Buffer::default(), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ExitCode { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_never_completing_runner_stops_on_cancel() {
        let runner = MockRunner::never_completing();
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel(false);
        });
        let err = runner
            .execute(&spec(), &mut Buffer::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled));
    }
}
