// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and phase state machine.
//!
//! A run moves through the following statuses:
//!
//! ```text
//! pending ─► plan_queued ─► planning ─┬─► planned_and_finished
//!                                     └─► planned ─► apply_queued ─► applying ─► applied
//!
//! any non-terminal status ─► canceled ─► force_canceled
//! pending | planned ─► discarded
//! planning | applying ─► errored
//! ```
//!
//! Every status change goes through [`RunStatus::can_transition_to`], so the
//! `(status, timestamp)` log of a run is always a valid path through the table
//! above. An action that is not permitted fails with
//! [`CoreError::InvalidTransition`] and leaves the run untouched.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Cool-off period after a cancel before a force cancel is permitted.
pub const FORCE_CANCEL_COOL_OFF: Duration = Duration::seconds(10);

/// Current UTC time truncated to millisecond precision.
///
/// All status timestamps use this so they survive a database round trip
/// unchanged.
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

// ============================================================================
// Statuses
// ============================================================================

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting to be admitted by the workspace queue.
    Pending,
    /// Plan enqueued for an agent.
    PlanQueued,
    /// Plan claimed by an agent and running.
    Planning,
    /// Plan finished with changes, awaiting confirmation.
    Planned,
    /// Plan finished and nothing more will happen.
    PlannedAndFinished,
    /// Apply enqueued for an agent.
    ApplyQueued,
    /// Apply claimed by an agent and running.
    Applying,
    /// Apply finished successfully.
    Applied,
    /// A phase failed.
    Errored,
    /// Canceled by a user.
    Canceled,
    /// Canceled, then forcefully terminated.
    ForceCanceled,
    /// Discarded by a user before applying.
    Discarded,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 12] = [
        RunStatus::Pending,
        RunStatus::PlanQueued,
        RunStatus::Planning,
        RunStatus::Planned,
        RunStatus::PlannedAndFinished,
        RunStatus::ApplyQueued,
        RunStatus::Applying,
        RunStatus::Applied,
        RunStatus::Errored,
        RunStatus::Canceled,
        RunStatus::ForceCanceled,
        RunStatus::Discarded,
    ];

    /// Wire/database name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PlanQueued => "plan_queued",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::PlannedAndFinished => "planned_and_finished",
            Self::ApplyQueued => "apply_queued",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Errored => "errored",
            Self::Canceled => "canceled",
            Self::ForceCanceled => "force_canceled",
            Self::Discarded => "discarded",
        }
    }

    /// Whether the status is terminal.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Applied
                | Self::PlannedAndFinished
                | Self::Errored
                | Self::Canceled
                | Self::ForceCanceled
                | Self::Discarded
        )
    }

    /// The phase waiting for an agent in this status, if any.
    pub fn queued_phase(&self) -> Option<PhaseKind> {
        match self {
            Self::PlanQueued => Some(PhaseKind::Plan),
            Self::ApplyQueued => Some(PhaseKind::Apply),
            _ => None,
        }
    }

    /// Whether `next` may directly follow this status.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, PlanQueued | Canceled | Discarded)
                | (PlanQueued, Planning | Canceled)
                | (Planning, Planned | PlannedAndFinished | Errored | Canceled)
                | (Planned, ApplyQueued | Canceled | Discarded)
                | (ApplyQueued, Applying | Canceled)
                | (Applying, Applied | Errored | Canceled)
                | (Canceled, ForceCanceled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("unknown run status '{}'", s),
            })
    }
}

/// The two phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Compute the change set.
    Plan,
    /// Apply the change set.
    Apply,
}

impl PhaseKind {
    /// Wire/database name of the phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            other => Err(CoreError::ValidationError {
                field: "phase".to_string(),
                message: format!("unknown phase '{}'", other),
            }),
        }
    }
}

/// Status of a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not yet queued.
    Pending,
    /// Waiting for an agent.
    Queued,
    /// Claimed and executing.
    Running,
    /// Completed successfully.
    Finished,
    /// Canceled while queued or running.
    Canceled,
    /// Completed with an error.
    Errored,
    /// Will never run.
    Unreachable,
}

impl PhaseStatus {
    /// Wire/database name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Canceled => "canceled",
            Self::Errored => "errored",
            Self::Unreachable => "unreachable",
        }
    }

    /// Whether the phase has reached an end state.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Canceled | Self::Errored | Self::Unreachable
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status together with the time it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTimestamp<S> {
    /// The status entered.
    pub status: S,
    /// When it was entered.
    pub timestamp: DateTime<Utc>,
}

/// Summary of resource changes produced by a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    /// Resources to be added.
    pub additions: u32,
    /// Resources to be changed in place.
    pub changes: u32,
    /// Resources to be destroyed.
    pub destructions: u32,
}

impl ResourceReport {
    /// Whether the report contains any change at all.
    pub fn has_changes(&self) -> bool {
        self.additions > 0 || self.changes > 0 || self.destructions > 0
    }
}

// ============================================================================
// Phase
// ============================================================================

/// One phase (plan or apply) of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Parent run.
    pub run_id: String,
    /// Which phase this is.
    pub kind: PhaseKind,
    pub(crate) status: PhaseStatus,
    pub(crate) status_timestamps: Vec<StatusTimestamp<PhaseStatus>>,
    pub(crate) report: Option<ResourceReport>,
    pub(crate) claimed_by: Option<String>,
}

impl Phase {
    fn new(run_id: &str, kind: PhaseKind, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            kind,
            status: PhaseStatus::Pending,
            status_timestamps: vec![StatusTimestamp {
                status: PhaseStatus::Pending,
                timestamp: now,
            }],
            report: None,
            claimed_by: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    /// When the phase entered `status`, if it ever did.
    pub fn status_timestamp(&self, status: PhaseStatus) -> Option<DateTime<Utc>> {
        self.status_timestamps
            .iter()
            .find(|ts| ts.status == status)
            .map(|ts| ts.timestamp)
    }

    /// Full status history, oldest first.
    pub fn status_timestamps(&self) -> &[StatusTimestamp<PhaseStatus>] {
        &self.status_timestamps
    }

    /// Resource report, once the phase has finished.
    pub fn report(&self) -> Option<ResourceReport> {
        self.report
    }

    /// Agent that claimed the phase.
    pub fn claimed_by(&self) -> Option<&str> {
        self.claimed_by.as_deref()
    }

    fn update_status(&mut self, status: PhaseStatus, now: DateTime<Utc>) {
        self.status = status;
        self.status_timestamps.push(StatusTimestamp {
            status,
            timestamp: now,
        });
    }
}

// ============================================================================
// Run
// ============================================================================

/// Options for creating a run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    /// Owning organization.
    pub organization: String,
    /// Target workspace.
    pub workspace_id: String,
    /// Configuration version the run executes.
    pub configuration_version_id: String,
    /// Plan-only run that never takes the workspace lock.
    pub speculative: bool,
    /// Apply automatically once the plan has changes.
    pub auto_apply: bool,
    /// Destroy all resources instead of converging them.
    pub is_destroy: bool,
    /// Free-form message from the user.
    pub message: Option<String>,
}

/// Parameters reported by an agent when a phase finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseFinishOptions {
    /// Whether the phase failed.
    pub errored: bool,
    /// Resource report, when the phase produced one.
    pub report: Option<ResourceReport>,
}

/// A single plan/apply cycle against a workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    /// Immutable identifier.
    pub id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Owning organization.
    pub organization: String,
    /// Target workspace.
    pub workspace_id: String,
    /// Configuration version the run executes.
    pub configuration_version_id: String,
    /// Plan-only run.
    pub speculative: bool,
    /// Apply automatically once the plan has changes.
    pub auto_apply: bool,
    /// Destroy run.
    pub is_destroy: bool,
    /// Free-form message from the user.
    pub message: Option<String>,
    pub(crate) status: RunStatus,
    pub(crate) status_timestamps: Vec<StatusTimestamp<RunStatus>>,
    pub(crate) plan: Phase,
    pub(crate) apply: Phase,
    pub(crate) force_cancel_available_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new pending run.
    pub fn new(opts: NewRun) -> Self {
        let id = format!("run-{}", Uuid::new_v4().simple());
        let now = current_timestamp();
        Self {
            plan: Phase::new(&id, PhaseKind::Plan, now),
            apply: Phase::new(&id, PhaseKind::Apply, now),
            id,
            created_at: now,
            organization: opts.organization,
            workspace_id: opts.workspace_id,
            configuration_version_id: opts.configuration_version_id,
            speculative: opts.speculative,
            auto_apply: opts.auto_apply,
            is_destroy: opts.is_destroy,
            message: opts.message,
            status: RunStatus::Pending,
            status_timestamps: vec![StatusTimestamp {
                status: RunStatus::Pending,
                timestamp: now,
            }],
            force_cancel_available_at: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// When the run entered `status`, if it ever did.
    pub fn status_timestamp(&self, status: RunStatus) -> Option<DateTime<Utc>> {
        self.status_timestamps
            .iter()
            .find(|ts| ts.status == status)
            .map(|ts| ts.timestamp)
    }

    /// Full status history, oldest first.
    pub fn status_timestamps(&self) -> &[StatusTimestamp<RunStatus>] {
        &self.status_timestamps
    }

    /// The plan phase.
    pub fn plan(&self) -> &Phase {
        &self.plan
    }

    /// The apply phase.
    pub fn apply(&self) -> &Phase {
        &self.apply
    }

    /// The requested phase.
    pub fn phase(&self, kind: PhaseKind) -> &Phase {
        match kind {
            PhaseKind::Plan => &self.plan,
            PhaseKind::Apply => &self.apply,
        }
    }

    fn phase_mut(&mut self, kind: PhaseKind) -> &mut Phase {
        match kind {
            PhaseKind::Plan => &mut self.plan,
            PhaseKind::Apply => &mut self.apply,
        }
    }

    /// When a force cancel becomes available, if the run has been canceled.
    pub fn force_cancel_available_at(&self) -> Option<DateTime<Utc>> {
        self.force_cancel_available_at
    }

    /// Whether the run has reached a terminal status.
    pub fn done(&self) -> bool {
        self.status.is_done()
    }

    fn invalid(&self, action: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            run_id: self.id.clone(),
            action,
            status: self.status.to_string(),
        }
    }

    fn update_status(
        &mut self,
        action: &'static str,
        next: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(action));
        }
        self.status = next;
        self.status_timestamps.push(StatusTimestamp {
            status: next,
            timestamp: now,
        });
        Ok(())
    }

    /// Queue the plan phase: `pending -> plan_queued`.
    pub fn enqueue_plan(&mut self) -> Result<()> {
        if self.status != RunStatus::Pending {
            return Err(self.invalid("enqueue_plan"));
        }
        let now = current_timestamp();
        self.update_status("enqueue_plan", RunStatus::PlanQueued, now)?;
        self.plan.update_status(PhaseStatus::Queued, now);
        Ok(())
    }

    /// Queue the apply phase of a planned run: `planned -> apply_queued`.
    ///
    /// Used both for user confirmation and for auto-apply.
    pub fn enqueue_apply(&mut self) -> Result<()> {
        if self.status != RunStatus::Planned {
            return Err(self.invalid("enqueue_apply"));
        }
        let now = current_timestamp();
        self.update_status("enqueue_apply", RunStatus::ApplyQueued, now)?;
        self.apply.update_status(PhaseStatus::Queued, now);
        Ok(())
    }

    /// Claim a queued phase on behalf of an agent.
    ///
    /// Fails with [`CoreError::PhaseAlreadyClaimed`] when the phase is already
    /// running, so exactly one of several competing claims succeeds.
    pub fn start(&mut self, kind: PhaseKind, agent_id: &str) -> Result<()> {
        let next = match (kind, self.status) {
            (PhaseKind::Plan, RunStatus::PlanQueued) => RunStatus::Planning,
            (PhaseKind::Apply, RunStatus::ApplyQueued) => RunStatus::Applying,
            (PhaseKind::Plan, RunStatus::Planning) | (PhaseKind::Apply, RunStatus::Applying) => {
                return Err(CoreError::PhaseAlreadyClaimed {
                    run_id: self.id.clone(),
                    phase: kind.to_string(),
                });
            }
            _ => return Err(self.invalid("start")),
        };
        let now = current_timestamp();
        self.update_status("start", next, now)?;
        let phase = self.phase_mut(kind);
        phase.update_status(PhaseStatus::Running, now);
        phase.claimed_by = Some(agent_id.to_string());
        Ok(())
    }

    /// Record the outcome of a running phase.
    ///
    /// A run that was canceled or discarded while the phase ran stays where
    /// it is; the late result is accepted and dropped.
    pub fn finish(&mut self, kind: PhaseKind, opts: PhaseFinishOptions) -> Result<()> {
        if matches!(
            self.status,
            RunStatus::Canceled | RunStatus::ForceCanceled | RunStatus::Discarded
        ) {
            return Ok(());
        }
        let now = current_timestamp();
        match (kind, self.status) {
            (PhaseKind::Plan, RunStatus::Planning) => {
                if opts.errored {
                    self.update_status("finish", RunStatus::Errored, now)?;
                    self.plan.update_status(PhaseStatus::Errored, now);
                    self.apply.update_status(PhaseStatus::Unreachable, now);
                    return Ok(());
                }
                let report = opts.report.unwrap_or_default();
                self.plan.report = Some(report);
                self.plan.update_status(PhaseStatus::Finished, now);
                if !report.has_changes() || self.speculative {
                    self.update_status("finish", RunStatus::PlannedAndFinished, now)?;
                    self.apply.update_status(PhaseStatus::Unreachable, now);
                } else {
                    self.update_status("finish", RunStatus::Planned, now)?;
                    if self.auto_apply {
                        self.enqueue_apply()?;
                    }
                }
                Ok(())
            }
            (PhaseKind::Apply, RunStatus::Applying) => {
                if opts.errored {
                    self.update_status("finish", RunStatus::Errored, now)?;
                    self.apply.update_status(PhaseStatus::Errored, now);
                } else {
                    self.apply.report = opts.report;
                    self.update_status("finish", RunStatus::Applied, now)?;
                    self.apply.update_status(PhaseStatus::Finished, now);
                }
                Ok(())
            }
            _ => Err(self.invalid("finish")),
        }
    }

    /// Cancel the run.
    ///
    /// Returns `true` when a phase is executing and the agent running it must
    /// be told to interrupt it.
    pub fn cancel(&mut self) -> Result<bool> {
        if self.status.is_done() {
            return Err(self.invalid("cancel"));
        }
        let now = current_timestamp();
        let signal = matches!(self.status, RunStatus::Planning | RunStatus::Applying);
        match self.status {
            RunStatus::Pending => {
                self.plan.update_status(PhaseStatus::Unreachable, now);
                self.apply.update_status(PhaseStatus::Unreachable, now);
            }
            RunStatus::PlanQueued | RunStatus::Planning => {
                self.plan.update_status(PhaseStatus::Canceled, now);
                self.apply.update_status(PhaseStatus::Unreachable, now);
            }
            RunStatus::Planned => {
                self.apply.update_status(PhaseStatus::Unreachable, now);
            }
            RunStatus::ApplyQueued | RunStatus::Applying => {
                self.apply.update_status(PhaseStatus::Canceled, now);
            }
            _ => {}
        }
        self.update_status("cancel", RunStatus::Canceled, now)?;
        self.force_cancel_available_at = Some(now + FORCE_CANCEL_COOL_OFF);
        Ok(signal)
    }

    /// Force cancel a canceled run whose cool-off period has elapsed.
    pub fn force_cancel(&mut self) -> Result<()> {
        self.force_cancel_at(current_timestamp())
    }

    /// Force cancel as of `now`.
    pub fn force_cancel_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.force_cancel_available_at {
            Some(available_at) if self.status == RunStatus::Canceled && now > available_at => {
                self.update_status("force_cancel", RunStatus::ForceCanceled, now)
            }
            _ => Err(self.invalid("force_cancel")),
        }
    }

    /// Discard a pending or planned run.
    pub fn discard(&mut self) -> Result<()> {
        if !matches!(self.status, RunStatus::Pending | RunStatus::Planned) {
            return Err(self.invalid("discard"));
        }
        let now = current_timestamp();
        if self.status == RunStatus::Pending {
            self.plan.update_status(PhaseStatus::Unreachable, now);
        }
        self.apply.update_status(PhaseStatus::Unreachable, now);
        self.update_status("discard", RunStatus::Discarded, now)
    }
}
