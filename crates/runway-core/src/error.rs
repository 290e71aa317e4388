// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runway-core.
//!
//! A single error type shared by the run state machine, the workspace lock
//! and the persistence backends. Callers distinguish control-flow conditions
//! (a phase already claimed, a workspace already locked) from real failures
//! with [`CoreError::is_precondition`].

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by run and workspace operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Workspace was not found.
    WorkspaceNotFound {
        /// The workspace ID that was not found.
        workspace_id: String,
    },

    /// Organization was not found.
    OrganizationNotFound {
        /// The organization name that was not found.
        name: String,
    },

    /// Log chunk was not found.
    ChunkNotFound {
        /// The chunk ID that was not found.
        chunk_id: i64,
    },

    /// Resource already exists (duplicate create).
    AlreadyExists {
        /// Kind of resource (organization, workspace, run).
        resource: &'static str,
        /// The identifier that already exists.
        id: String,
    },

    /// The requested action is not permitted from the run's current status.
    InvalidTransition {
        /// The run ID.
        run_id: String,
        /// The attempted action (enqueue_plan, start, finish, cancel, ...).
        action: &'static str,
        /// The run status when the action was attempted.
        status: String,
    },

    /// The phase has already been started by someone else.
    PhaseAlreadyClaimed {
        /// The run ID.
        run_id: String,
        /// The phase (plan or apply).
        phase: String,
    },

    /// The workspace is held by a party that cannot be replaced.
    WorkspaceAlreadyLocked {
        /// The workspace ID.
        workspace_id: String,
        /// Description of the current holder.
        holder: String,
    },

    /// Unlock requested on a workspace that is not locked.
    WorkspaceAlreadyUnlocked {
        /// The workspace ID.
        workspace_id: String,
    },

    /// Unlock requested by someone other than the lock holder.
    WorkspaceLockedByDifferentParty {
        /// The workspace ID.
        workspace_id: String,
        /// Description of the current holder.
        holder: String,
    },

    /// Stored state breaks an invariant the scheduler relies on.
    ConsistencyViolation {
        /// What was found.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WorkspaceNotFound { .. } => "WORKSPACE_NOT_FOUND",
            Self::OrganizationNotFound { .. } => "ORGANIZATION_NOT_FOUND",
            Self::ChunkNotFound { .. } => "CHUNK_NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::PhaseAlreadyClaimed { .. } => "PHASE_ALREADY_CLAIMED",
            Self::WorkspaceAlreadyLocked { .. } => "WORKSPACE_ALREADY_LOCKED",
            Self::WorkspaceAlreadyUnlocked { .. } => "WORKSPACE_ALREADY_UNLOCKED",
            Self::WorkspaceLockedByDifferentParty { .. } => "WORKSPACE_LOCKED_BY_DIFFERENT_PARTY",
            Self::ConsistencyViolation { .. } => "CONSISTENCY_VIOLATION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error only signals that a precondition did not hold.
    ///
    /// These are expected under concurrency and callers react by waiting for
    /// the next event rather than reporting a failure.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::PhaseAlreadyClaimed { .. }
                | Self::WorkspaceAlreadyLocked { .. }
                | Self::WorkspaceAlreadyUnlocked { .. }
                | Self::WorkspaceLockedByDifferentParty { .. }
        )
    }

    /// Whether this error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound { .. }
                | Self::WorkspaceNotFound { .. }
                | Self::OrganizationNotFound { .. }
                | Self::ChunkNotFound { .. }
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "Run '{}' not found", run_id),
            Self::WorkspaceNotFound { workspace_id } => {
                write!(f, "Workspace '{}' not found", workspace_id)
            }
            Self::OrganizationNotFound { name } => {
                write!(f, "Organization '{}' not found", name)
            }
            Self::ChunkNotFound { chunk_id } => write!(f, "Log chunk {} not found", chunk_id),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} '{}' already exists", resource, id)
            }
            Self::InvalidTransition {
                run_id,
                action,
                status,
            } => {
                write!(
                    f,
                    "Invalid state transition: cannot {} run '{}' with status '{}'",
                    action, run_id, status
                )
            }
            Self::PhaseAlreadyClaimed { run_id, phase } => {
                write!(
                    f,
                    "The {} phase of run '{}' has already been started",
                    phase, run_id
                )
            }
            Self::WorkspaceAlreadyLocked {
                workspace_id,
                holder,
            } => {
                write!(
                    f,
                    "Workspace '{}' is already locked by {}",
                    workspace_id, holder
                )
            }
            Self::WorkspaceAlreadyUnlocked { workspace_id } => {
                write!(f, "Workspace '{}' is already unlocked", workspace_id)
            }
            Self::WorkspaceLockedByDifferentParty {
                workspace_id,
                holder,
            } => {
                write!(
                    f,
                    "Workspace '{}' is locked by a different party: {}",
                    workspace_id, holder
                )
            }
            Self::ConsistencyViolation { details } => {
                write!(f, "Consistency violation: {}", details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                CoreError::RunNotFound {
                    run_id: "run-1".to_string(),
                },
                "RUN_NOT_FOUND",
            ),
            (
                CoreError::InvalidTransition {
                    run_id: "run-1".to_string(),
                    action: "discard",
                    status: "applied".to_string(),
                },
                "INVALID_TRANSITION",
            ),
            (
                CoreError::PhaseAlreadyClaimed {
                    run_id: "run-1".to_string(),
                    phase: "plan".to_string(),
                },
                "PHASE_ALREADY_CLAIMED",
            ),
            (
                CoreError::WorkspaceAlreadyLocked {
                    workspace_id: "ws-1".to_string(),
                    holder: "user bob".to_string(),
                },
                "WORKSPACE_ALREADY_LOCKED",
            ),
            (
                CoreError::ConsistencyViolation {
                    details: "two active runs".to_string(),
                },
                "CONSISTENCY_VIOLATION",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_invalid_transition_names_action_and_status() {
        let err = CoreError::InvalidTransition {
            run_id: "run-123".to_string(),
            action: "discard",
            status: "applying".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot discard run 'run-123' with status 'applying'"
        );
    }

    #[test]
    fn test_precondition_classification() {
        assert!(
            CoreError::PhaseAlreadyClaimed {
                run_id: "r".to_string(),
                phase: "plan".to_string()
            }
            .is_precondition()
        );
        assert!(
            CoreError::WorkspaceAlreadyUnlocked {
                workspace_id: "ws".to_string()
            }
            .is_precondition()
        );
        assert!(
            !CoreError::RunNotFound {
                run_id: "r".to_string()
            }
            .is_precondition()
        );
        assert!(
            !CoreError::InvalidTransition {
                run_id: "r".to_string(),
                action: "start",
                status: "pending".to_string()
            }
            .is_precondition()
        );
    }

    #[test]
    fn test_not_found_classification() {
        assert!(CoreError::ChunkNotFound { chunk_id: 7 }.is_not_found());
        assert!(
            CoreError::WorkspaceNotFound {
                workspace_id: "ws".to_string()
            }
            .is_not_found()
        );
        assert!(
            !CoreError::ValidationError {
                field: "name".to_string(),
                message: "empty".to_string()
            }
            .is_not_found()
        );
    }
}
