// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process notification transport.
//!
//! Clones share one broadcast channel, so several brokers built on clones of
//! the same transport behave like nodes attached to one database. The
//! transport can be switched offline to simulate a connection outage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use super::transport::{NotificationStream, NotifyTransport};
use crate::error::{Error, Result};

const CAPACITY: usize = 1024;

/// Broadcast transport for tests and single-process deployments.
#[derive(Clone)]
pub struct MemoryTransport {
    tx: broadcast::Sender<(String, String)>,
    offline: Arc<AtomicBool>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a new, empty transport.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self {
            tx,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate losing (`true`) or regaining (`false`) the connection.
    ///
    /// While offline, notifications fail and open streams report a lost
    /// connection on their next receive.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            // Wake listeners so they observe the outage.
            let _ = self.tx.send((String::new(), String::new()));
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("transport offline".to_string()));
        }
        Ok(())
    }
}

struct MemoryStream {
    channel: String,
    rx: broadcast::Receiver<(String, String)>,
    offline: Arc<AtomicBool>,
}

#[async_trait]
impl NotificationStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            if self.offline.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match self.rx.recv().await {
                Ok((channel, payload)) if channel == self.channel => return Ok(Some(payload)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Memory transport listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl NotifyTransport for MemoryTransport {
    fn transport_type(&self) -> &'static str {
        "memory"
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        self.check_online()?;
        // No receivers is not an error: nobody is listening yet.
        let _ = self.tx.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        self.check_online()?;
        Ok(Box::new(MemoryStream {
            channel: channel.to_string(),
            rx: self.tx.subscribe(),
            offline: self.offline.clone(),
        }))
    }
}
