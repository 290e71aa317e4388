// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL LISTEN/NOTIFY transport.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use super::transport::{NotificationStream, NotifyTransport};
use crate::error::Result;

/// Relays notifications through `pg_notify` on a shared channel.
#[derive(Clone)]
pub struct PgNotifyTransport {
    pool: PgPool,
}

impl PgNotifyTransport {
    /// Create a transport using connections from `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgNotificationStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn recv(&mut self) -> Result<Option<String>> {
        // try_recv yields None once when the connection drops.
        let notification = self.listener.try_recv().await?;
        Ok(notification.map(|n| n.payload().to_string()))
    }
}

#[async_trait]
impl NotifyTransport for PgNotifyTransport {
    fn transport_type(&self) -> &'static str {
        "postgres"
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<Box<dyn NotificationStream>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        Ok(Box::new(PgNotificationStream { listener }))
    }
}
