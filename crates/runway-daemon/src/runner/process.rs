// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process runner.
//!
//! Executes a phase by invoking the IaC engine binary in the run's working
//! directory:
//!
//! | Phase | Commands                                           |
//! |-------|----------------------------------------------------|
//! | plan  | `init -input=false`, `plan -input=false -out=...`  |
//! | apply | `init -input=false`, `apply -input=false <plan>`   |
//!
//! Stdout and stderr are streamed to the phase output as they arrive. A
//! graceful cancel sends SIGINT so the engine can stop at a safe point; a
//! forced cancel kills it.
//!
//! Plan output must contain a resource summary (`Plan: ...` or `No changes.`);
//! without one the phase errors rather than passing as a no-op plan.
//!
//! The runner creates the working directory but does not fetch the
//! configuration version into it. Populating `<data_dir>/runs/<run_id>`
//! with the configuration before the agent claims the run is left to the
//! deployment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use runway_core::{PhaseKind, ResourceReport};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::*;

/// Plan file written by the plan phase and consumed by the apply phase.
const PLAN_FILENAME: &str = "plan.out";

/// Read buffer size for engine output.
const READ_BUFFER: usize = 4096;

/// Process runner configuration.
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// Path of the engine binary
    pub engine_bin: PathBuf,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            engine_bin: PathBuf::from("terraform"),
        }
    }
}

/// Runner that spawns the engine as a child process.
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
}

impl ProcessRunner {
    /// Create a process runner.
    pub fn new(config: ProcessRunnerConfig) -> Self {
        Self { config }
    }

    fn commands(spec: &JobSpec) -> Vec<Vec<String>> {
        let mut init = vec!["init".to_string(), "-input=false".to_string()];
        init.push("-no-color".to_string());

        let mut main = match spec.phase {
            PhaseKind::Plan => vec!["plan".to_string(), "-input=false".to_string()],
            PhaseKind::Apply => vec!["apply".to_string(), "-input=false".to_string()],
        };
        main.push("-no-color".to_string());
        if spec.is_destroy {
            main.push("-destroy".to_string());
        }
        match spec.phase {
            PhaseKind::Plan => main.push(format!("-out={PLAN_FILENAME}")),
            PhaseKind::Apply => main.push(PLAN_FILENAME.to_string()),
        }
        vec![init, main]
    }

    /// Run one engine command, streaming its output.
    ///
    /// Returns everything the command wrote to stdout.
    async fn run_command(
        &self,
        args: &[String],
        dir: &Path,
        output: &mut dyn PhaseOutput,
        cancel: &CancelHandle,
    ) -> Result<String> {
        let mut child = Command::new(&self.config.engine_bin)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RunnerError::BinaryNotFound(self.config.engine_bin.display().to_string())
                } else {
                    RunnerError::StartFailed(e.to_string())
                }
            })?;
        let pid = child.id();
        debug!(pid = ?pid, args = ?args, "Spawned engine process");

        let (tx, mut rx) = mpsc::channel::<(bool, Vec<u8>)>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, false, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, true, tx.clone()));
        }
        drop(tx);

        let mut stdout_text = Vec::new();
        let mut stderr_text = Vec::new();
        let mut interrupted = false;
        let mut killed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.killed(), if !killed => {
                    killed = true;
                    info!(pid = ?pid, "Killing engine process");
                    if let Err(e) = child.start_kill() {
                        warn!(pid = ?pid, error = %e, "Failed to kill engine process");
                    }
                }
                _ = cancel.interrupted(), if !interrupted => {
                    interrupted = true;
                    if let Some(pid) = pid {
                        info!(pid, "Sending SIGINT to engine process");
                        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                            warn!(pid, error = %e, "Failed to interrupt engine process");
                        }
                    }
                }
                chunk = rx.recv() => match chunk {
                    Some((is_stderr, data)) => {
                        output.write(&data).await?;
                        if is_stderr {
                            stderr_text.extend_from_slice(&data);
                        } else {
                            stdout_text.extend_from_slice(&data);
                        }
                    }
                    None => break,
                },
            }
        }

        let status = child.wait().await?;
        if killed || (interrupted && !status.success()) {
            return Err(RunnerError::Cancelled);
        }
        if !status.success() {
            return Err(RunnerError::ExitCode {
                exit_code: status.code().unwrap_or(-1),
                stderr: clean_stderr(&String::from_utf8_lossy(&stderr_text)),
            });
        }
        Ok(String::from_utf8_lossy(&stdout_text).into_owned())
    }
}

/// Forward everything read from `reader` to `tx`.
async fn pump<R>(mut reader: R, is_stderr: bool, tx: mpsc::Sender<(bool, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((is_stderr, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Engine output stream closed");
                break;
            }
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        spec: &JobSpec,
        output: &mut dyn PhaseOutput,
        cancel: &CancelHandle,
    ) -> Result<PhaseOutcome> {
        tokio::fs::create_dir_all(&spec.working_dir).await?;

        let mut last_stdout = String::new();
        for args in Self::commands(spec) {
            if cancel.is_canceled() {
                return Err(RunnerError::Cancelled);
            }
            match self
                .run_command(&args, &spec.working_dir, output, cancel)
                .await
            {
                Ok(stdout) => last_stdout = stdout,
                Err(e) => {
                    if !matches!(e, RunnerError::Cancelled) {
                        output.write(format!("\nError: {e}\n").as_bytes()).await?;
                    }
                    return Err(e);
                }
            }
        }

        let report = match spec.phase {
            PhaseKind::Plan => match parse_plan_report(&last_stdout) {
                Some(report) => Some(report),
                None => {
                    let msg = "plan output has no resource summary";
                    output.write(format!("\nError: {msg}\n").as_bytes()).await?;
                    return Err(RunnerError::Other(msg.to_string()));
                }
            },
            PhaseKind::Apply => parse_apply_report(&last_stdout),
        };
        Ok(PhaseOutcome { report })
    }
}

/// Extract the resource summary from plan output.
///
/// Recognises `Plan: X to add, Y to change, Z to destroy.` and the
/// "No changes." message.
pub fn parse_plan_report(stdout: &str) -> Option<ResourceReport> {
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(summary) = line.strip_prefix("Plan: ") {
            return parse_counts(summary, ["to add", "to change", "to destroy"]);
        }
        if line.starts_with("No changes.") {
            return Some(ResourceReport::default());
        }
    }
    None
}

/// Extract the resource summary from apply output.
///
/// Recognises `Apply complete! Resources: X added, Y changed, Z destroyed.`
pub fn parse_apply_report(stdout: &str) -> Option<ResourceReport> {
    stdout.lines().find_map(|line| {
        let summary = line.trim().strip_prefix("Apply complete! Resources: ")?;
        parse_counts(summary, ["added", "changed", "destroyed"])
    })
}

fn parse_counts(summary: &str, labels: [&str; 3]) -> Option<ResourceReport> {
    let parts: Vec<&str> = summary.trim_end_matches('.').split(", ").collect();
    if parts.len() != 3 {
        return None;
    }
    let mut counts = [0u32; 3];
    for ((part, label), count) in parts.iter().zip(labels).zip(counts.iter_mut()) {
        let number = part.strip_suffix(label)?.trim();
        *count = number.parse().ok()?;
    }
    Some(ResourceReport {
        additions: counts[0],
        changes: counts[1],
        destructions: counts[2],
    })
}

/// Collapse stderr into a single line suitable for an error message.
fn clean_stderr(stderr: &str) -> String {
    let mut plain = String::with_capacity(stderr.len());
    let mut chars = stderr.chars().peekable();
    while let Some(c) = chars.next() {
        // Strip ANSI escape sequences: ESC [ ... final byte
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_ascii() {
            plain.push(c);
        }
    }
    plain.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buffer(Vec<u8>);

    #[async_trait]
    impl PhaseOutput for Buffer {
        async fn write(&mut self, data: &[u8]) -> Result<()> {
            self.0.extend_from_slice(data);
            Ok(())
        }
    }

    fn spec(phase: PhaseKind, dir: &Path) -> JobSpec {
        JobSpec {
            run_id: "run-1".to_string(),
            phase,
            workspace_id: "ws-1".to_string(),
            configuration_version_id: "cv-1".to_string(),
            is_destroy: false,
            working_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_parse_plan_report() {
        let out = "\nTerraform will perform the following actions:\n\nPlan: 2 to add, 1 to change, 0 to destroy.\n";
        assert_eq!(
            parse_plan_report(out),
            Some(ResourceReport {
                additions: 2,
                changes: 1,
                destructions: 0
            })
        );
    }

    #[test]
    fn test_parse_plan_no_changes() {
        let out = "No changes. Your infrastructure matches the configuration.\n";
        let report = parse_plan_report(out).unwrap();
        assert!(!report.has_changes());
    }

    #[test]
    fn test_parse_plan_unrecognised() {
        assert_eq!(parse_plan_report("Initializing the backend...\n"), None);
        assert_eq!(parse_plan_report("Plan: lots to add\n"), None);
    }

    #[test]
    fn test_parse_apply_report() {
        let out = "aws_instance.web: Creation complete after 3s\n\nApply complete! Resources: 1 added, 0 changed, 3 destroyed.\n";
        assert_eq!(
            parse_apply_report(out),
            Some(ResourceReport {
                additions: 1,
                changes: 0,
                destructions: 3
            })
        );
    }

    #[test]
    fn test_commands_for_destroy_plan() {
        let mut s = spec(PhaseKind::Plan, Path::new("/tmp"));
        s.is_destroy = true;
        let commands = ProcessRunner::commands(&s);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0][0], "init");
        assert!(commands[1].contains(&"-destroy".to_string()));
        assert!(commands[1].contains(&"-out=plan.out".to_string()));

        let apply = ProcessRunner::commands(&spec(PhaseKind::Apply, Path::new("/tmp")));
        assert_eq!(apply[1].first().map(String::as_str), Some("apply"));
        assert_eq!(apply[1].last().map(String::as_str), Some("plan.out"));
    }

    #[test]
    fn test_clean_stderr() {
        let raw = "\u{1b}[31mError:\u{1b}[0m invalid\n  configuration\n";
        assert_eq!(clean_stderr(raw), "Error: invalid configuration");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(ProcessRunnerConfig {
            engine_bin: PathBuf::from("/nonexistent/engine-binary"),
        });
        let err = runner
            .execute(
                &spec(PhaseKind::Plan, dir.path()),
                &mut Buffer::default(),
                &CancelHandle::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_streams_output_of_engine() {
        // `echo` stands in for the engine: it prints its arguments and exits 0.
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(ProcessRunnerConfig {
            engine_bin: PathBuf::from("echo"),
        });
        let mut out = Buffer::default();
        let outcome = runner
            .execute(
                &spec(PhaseKind::Apply, dir.path()),
                &mut out,
                &CancelHandle::new(),
            )
            .await
            .unwrap();
        let text = String::from_utf8(out.0).unwrap();
        assert!(text.contains("init -input=false"));
        assert!(text.contains("apply -input=false"));
        assert_eq!(outcome.report, None);
    }

    #[tokio::test]
    async fn test_plan_without_summary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let working_dir = dir.path().join("runs").join("run-1");
        let runner = ProcessRunner::new(ProcessRunnerConfig {
            engine_bin: PathBuf::from("echo"),
        });
        let mut out = Buffer::default();
        let err = runner
            .execute(
                &spec(PhaseKind::Plan, &working_dir),
                &mut out,
                &CancelHandle::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Other(_)));
        assert!(working_dir.is_dir());
        let text = String::from_utf8(out.0).unwrap();
        assert!(text.contains("plan -input=false"));
        assert!(text.contains("Error: plan output has no resource summary"));
    }
}
