// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspaces and the workspace lock.
//!
//! A workspace is unlocked, locked by a run, or locked by a user. The lock
//! guarantees that at most one non-speculative run mutates the workspace's
//! state at a time, and lets a user freeze the workspace manually.
//!
//! | Current holder | Requested holder | Result |
//! |----------------|------------------|--------|
//! | none           | anyone           | locked |
//! | run R          | run R            | idempotent success |
//! | run R          | user U           | user replaces run |
//! | run R          | run S            | already locked |
//! | user U         | user U           | idempotent success |
//! | user U         | anyone else      | already locked |

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::run::current_timestamp;

/// Who holds, or asks for, a workspace lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockHolder {
    /// A run, identified by its ID.
    Run(String),
    /// A user, identified by username.
    User(String),
}

impl LockHolder {
    /// Shorthand for a run holder.
    pub fn run(id: impl Into<String>) -> Self {
        Self::Run(id.into())
    }

    /// Shorthand for a user holder.
    pub fn user(name: impl Into<String>) -> Self {
        Self::User(name.into())
    }

    /// Kind column value used by storage.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::User(_) => "user",
        }
    }

    /// Identifier of the holder.
    pub fn id(&self) -> &str {
        match self {
            Self::Run(id) | Self::User(id) => id,
        }
    }

    /// Rebuild a holder from its storage columns.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self> {
        match kind {
            "run" => Ok(Self::Run(id.to_string())),
            "user" => Ok(Self::User(id.to_string())),
            other => Err(CoreError::ValidationError {
                field: "lock_kind".to_string(),
                message: format!("unknown lock kind '{}'", other),
            }),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// State of a workspace lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockState {
    /// Nobody holds the lock.
    #[default]
    Unlocked,
    /// Held by a run or a user.
    Locked(LockHolder),
}

impl LockState {
    /// The current holder, if any.
    pub fn holder(&self) -> Option<&LockHolder> {
        match self {
            Self::Unlocked => None,
            Self::Locked(holder) => Some(holder),
        }
    }

    /// Whether a user holds the lock.
    pub fn is_user_locked(&self) -> bool {
        matches!(self, Self::Locked(LockHolder::User(_)))
    }

    /// Whether anybody holds the lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Options for creating a workspace.
#[derive(Debug, Clone, Default)]
pub struct NewWorkspace {
    /// Name, unique within the organization.
    pub name: String,
    /// Owning organization.
    pub organization: String,
    /// Default auto-apply setting for runs in this workspace.
    pub auto_apply: bool,
}

/// A workspace: the unit of serialization for runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    /// Immutable identifier.
    pub id: String,
    /// Name, unique within the organization.
    pub name: String,
    /// Owning organization.
    pub organization: String,
    /// Default auto-apply setting for runs in this workspace.
    pub auto_apply: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// The run most recently admitted by the scheduler.
    pub current_run_id: Option<String>,
    pub(crate) lock: LockState,
}

impl Workspace {
    /// Create a new unlocked workspace.
    pub fn new(opts: NewWorkspace) -> Self {
        Self {
            id: format!("ws-{}", Uuid::new_v4().simple()),
            name: opts.name,
            organization: opts.organization,
            auto_apply: opts.auto_apply,
            created_at: current_timestamp(),
            current_run_id: None,
            lock: LockState::Unlocked,
        }
    }

    /// Current lock state.
    pub fn lock_state(&self) -> &LockState {
        &self.lock
    }

    /// Whether the workspace is locked by anyone.
    pub fn locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Acquire the lock for `holder`.
    pub fn lock(&mut self, holder: LockHolder) -> Result<()> {
        match &self.lock {
            LockState::Unlocked => {
                self.lock = LockState::Locked(holder);
                Ok(())
            }
            LockState::Locked(current) if *current == holder => Ok(()),
            LockState::Locked(LockHolder::Run(_)) if matches!(holder, LockHolder::User(_)) => {
                self.lock = LockState::Locked(holder);
                Ok(())
            }
            LockState::Locked(current) => Err(CoreError::WorkspaceAlreadyLocked {
                workspace_id: self.id.clone(),
                holder: current.to_string(),
            }),
        }
    }

    /// Release the lock on behalf of `requester`, or unconditionally with
    /// `force`.
    pub fn unlock(&mut self, requester: &LockHolder, force: bool) -> Result<()> {
        match &self.lock {
            LockState::Unlocked => Err(CoreError::WorkspaceAlreadyUnlocked {
                workspace_id: self.id.clone(),
            }),
            LockState::Locked(current) if force || current == requester => {
                self.lock = LockState::Unlocked;
                Ok(())
            }
            LockState::Locked(current) => Err(CoreError::WorkspaceLockedByDifferentParty {
                workspace_id: self.id.clone(),
                holder: current.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::new(NewWorkspace {
            name: "dev".to_string(),
            organization: "acme".to_string(),
            auto_apply: false,
        })
    }

    #[test]
    fn test_lock_unlocked_workspace() {
        let mut ws = workspace();
        ws.lock(LockHolder::user("bob")).unwrap();
        assert_eq!(ws.lock_state().holder(), Some(&LockHolder::user("bob")));
        assert!(ws.lock_state().is_user_locked());
    }

    #[test]
    fn test_user_cannot_lock_user_locked_workspace() {
        let mut ws = workspace();
        ws.lock(LockHolder::user("bob")).unwrap();
        let err = ws.lock(LockHolder::user("alice")).unwrap_err();
        assert!(matches!(err, CoreError::WorkspaceAlreadyLocked { .. }));
    }

    #[test]
    fn test_run_cannot_replace_user_lock() {
        let mut ws = workspace();
        ws.lock(LockHolder::user("bob")).unwrap();
        assert!(ws.lock(LockHolder::run("run-1")).is_err());
        assert_eq!(ws.lock_state().holder(), Some(&LockHolder::user("bob")));
    }

    #[test]
    fn test_run_cannot_replace_other_run_lock() {
        let mut ws = workspace();
        ws.lock(LockHolder::run("run-1")).unwrap();
        assert!(ws.lock(LockHolder::run("run-2")).is_err());
    }

    #[test]
    fn test_user_replaces_run_lock() {
        let mut ws = workspace();
        ws.lock(LockHolder::run("run-1")).unwrap();
        ws.lock(LockHolder::user("bob")).unwrap();
        assert_eq!(ws.lock_state().holder(), Some(&LockHolder::user("bob")));
    }

    #[test]
    fn test_relock_by_holder_is_idempotent() {
        let mut ws = workspace();
        ws.lock(LockHolder::run("run-1")).unwrap();
        ws.lock(LockHolder::run("run-1")).unwrap();
        assert_eq!(ws.lock_state().holder(), Some(&LockHolder::run("run-1")));
    }

    #[test]
    fn test_unlock_already_unlocked() {
        let mut ws = workspace();
        let err = ws.unlock(&LockHolder::user("bob"), false).unwrap_err();
        assert!(matches!(err, CoreError::WorkspaceAlreadyUnlocked { .. }));
    }

    #[test]
    fn test_unlock_by_different_user() {
        let mut ws = workspace();
        ws.lock(LockHolder::user("bob")).unwrap();
        let err = ws.unlock(&LockHolder::user("alice"), false).unwrap_err();
        assert!(matches!(err, CoreError::WorkspaceLockedByDifferentParty { .. }));
        assert!(ws.locked());
    }

    #[test]
    fn test_force_unlock() {
        let mut ws = workspace();
        ws.lock(LockHolder::user("bob")).unwrap();
        ws.unlock(&LockHolder::user("alice"), true).unwrap();
        assert!(!ws.locked());
    }

    #[test]
    fn test_run_unlocks_its_own_lock() {
        let mut ws = workspace();
        ws.lock(LockHolder::run("run-1")).unwrap();
        ws.unlock(&LockHolder::run("run-1"), false).unwrap();
        assert_eq!(ws.lock_state(), &LockState::Unlocked);
    }

    #[test]
    fn test_holder_storage_parts() {
        let holder = LockHolder::from_parts("run", "run-9").unwrap();
        assert_eq!(holder, LockHolder::run("run-9"));
        assert_eq!(holder.kind(), "run");
        assert_eq!(holder.id(), "run-9");
        assert!(LockHolder::from_parts("team", "x").is_err());
    }
}
