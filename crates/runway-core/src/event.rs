// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain events.
//!
//! Every mutation of an organization, workspace, run or log stream produces
//! an [`Event`]. Events travel between nodes as `(relation, action, id)`
//! triples; the receiving node reloads the payload by ID, so only the
//! relation/action naming in this module is part of the wire format.

use std::fmt;

use crate::logs::PersistedChunk;
use crate::organization::Organization;
use crate::run::Run;
use crate::workspace::Workspace;

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Organization created.
    OrganizationCreated,
    /// Organization deleted.
    OrganizationDeleted,
    /// Workspace created.
    WorkspaceCreated,
    /// Workspace settings or current run changed.
    WorkspaceUpdated,
    /// Workspace locked.
    WorkspaceLocked,
    /// Workspace unlocked.
    WorkspaceUnlocked,
    /// Workspace deleted.
    WorkspaceDeleted,
    /// Run created.
    RunCreated,
    /// Run changed status.
    RunStatusUpdate,
    /// Run deleted.
    RunDeleted,
    /// Log chunk written.
    LogChunk,
}

impl EventType {
    const ALL: [EventType; 11] = [
        EventType::OrganizationCreated,
        EventType::OrganizationDeleted,
        EventType::WorkspaceCreated,
        EventType::WorkspaceUpdated,
        EventType::WorkspaceLocked,
        EventType::WorkspaceUnlocked,
        EventType::WorkspaceDeleted,
        EventType::RunCreated,
        EventType::RunStatusUpdate,
        EventType::RunDeleted,
        EventType::LogChunk,
    ];

    /// Relation (table) the event concerns.
    pub fn relation(&self) -> &'static str {
        match self {
            Self::OrganizationCreated | Self::OrganizationDeleted => "organization",
            Self::WorkspaceCreated
            | Self::WorkspaceUpdated
            | Self::WorkspaceLocked
            | Self::WorkspaceUnlocked
            | Self::WorkspaceDeleted => "workspace",
            Self::RunCreated | Self::RunStatusUpdate | Self::RunDeleted => "run",
            Self::LogChunk => "chunk",
        }
    }

    /// Action performed on the relation.
    pub fn action(&self) -> &'static str {
        match self {
            Self::OrganizationCreated
            | Self::WorkspaceCreated
            | Self::RunCreated
            | Self::LogChunk => "created",
            Self::OrganizationDeleted | Self::WorkspaceDeleted | Self::RunDeleted => "deleted",
            Self::WorkspaceUpdated => "updated",
            Self::WorkspaceLocked => "locked",
            Self::WorkspaceUnlocked => "unlocked",
            Self::RunStatusUpdate => "status_update",
        }
    }

    /// Look up an event type by relation and action.
    pub fn from_parts(relation: &str, action: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.relation() == relation && t.action() == action)
    }

    /// Whether the event reports a deletion.
    pub fn is_deletion(&self) -> bool {
        self.action() == "deleted"
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.relation(), self.action())
    }
}

/// Reference to a resource that no longer exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// Relation the resource lived in.
    pub relation: String,
    /// Its identifier.
    pub id: String,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// An organization.
    Organization(Organization),
    /// A workspace.
    Workspace(Workspace),
    /// A run.
    Run(Box<Run>),
    /// A log chunk.
    Chunk(PersistedChunk),
    /// A deleted resource.
    Deleted(ResourceRef),
}

impl EventPayload {
    /// Identifier used to reload the payload on another node.
    pub fn id(&self) -> String {
        match self {
            Self::Organization(org) => org.name.clone(),
            Self::Workspace(ws) => ws.id.clone(),
            Self::Run(run) => run.id.clone(),
            Self::Chunk(chunk) => chunk.id.to_string(),
            Self::Deleted(r) => r.id.clone(),
        }
    }
}

/// A typed domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// What happened.
    pub event_type: EventType,
    /// The affected resource.
    pub payload: EventPayload,
    /// Deliver only to subscribers on this node.
    pub local: bool,
}

impl Event {
    /// Create an event that is relayed to every node.
    pub fn new(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            event_type,
            payload,
            local: false,
        }
    }

    /// Create an event that stays on this node.
    pub fn local(event_type: EventType, payload: EventPayload) -> Self {
        Self {
            event_type,
            payload,
            local: true,
        }
    }

    /// Event announcing a deletion.
    pub fn deleted(event_type: EventType, id: impl Into<String>) -> Self {
        Self::new(
            event_type,
            EventPayload::Deleted(ResourceRef {
                relation: event_type.relation().to_string(),
                id: id.into(),
            }),
        )
    }

    /// Run status update for `run`.
    pub fn run_status(run: &Run) -> Self {
        Self::new(EventType::RunStatusUpdate, EventPayload::Run(Box::new(run.clone())))
    }

    /// Workspace event for `workspace`.
    pub fn workspace(event_type: EventType, workspace: &Workspace) -> Self {
        Self::new(event_type, EventPayload::Workspace(workspace.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parts_round_trip() {
        for t in EventType::ALL {
            assert_eq!(EventType::from_parts(t.relation(), t.action()), Some(t));
        }
        assert_eq!(EventType::from_parts("run", "exploded"), None);
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(EventType::RunStatusUpdate.to_string(), "run_status_update");
        assert_eq!(EventType::WorkspaceUnlocked.to_string(), "workspace_unlocked");
    }

    #[test]
    fn test_deleted_event_carries_reference() {
        let event = Event::deleted(EventType::WorkspaceDeleted, "ws-1");
        assert!(event.event_type.is_deletion());
        assert_eq!(event.payload.id(), "ws-1");
        assert_eq!(
            event.payload,
            EventPayload::Deleted(ResourceRef {
                relation: "workspace".to_string(),
                id: "ws-1".to_string()
            })
        );
    }
}
