// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-node notification transport.
//!
//! The broker relays a small JSON message per event through a broadcast
//! channel shared by every node. Payloads are never sent over the wire; each
//! receiving node reloads them from storage by ID.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Message relayed between nodes for each published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Relation (table) of the event, e.g. `run`.
    pub relation: String,
    /// Action performed, e.g. `status_update`.
    pub action: String,
    /// Identifier used to reload the payload.
    pub id: String,
    /// Process ID of the publishing broker.
    pub pid: String,
}

/// An open subscription to a notification channel.
#[async_trait]
pub trait NotificationStream: Send {
    /// Wait for the next raw payload.
    ///
    /// Returns `Ok(None)` when the underlying connection was lost; the caller
    /// should open a new stream.
    async fn recv(&mut self) -> Result<Option<String>>;
}

/// Broadcast primitive shared by every node.
#[async_trait]
pub trait NotifyTransport: Send + Sync {
    /// Short name for logging.
    fn transport_type(&self) -> &'static str;

    /// Send `payload` to every listener of `channel`, including this node's.
    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;

    /// Start listening on `channel`.
    async fn listen(&self, channel: &str) -> Result<Box<dyn NotificationStream>>;
}
