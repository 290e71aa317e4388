// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide event bus.
//!
//! The [`Broker`] fans events out to named in-process subscribers and relays
//! them to other nodes through a [`NotifyTransport`]:
//!
//! ```text
//!   publish(event) ──► local subscribers (bounded channels, never blocks)
//!         │
//!         └─► transport.notify({relation, action, id, pid})
//!                         │
//!   other node: listener ─┴─► drop own pid ─► Getter::get_by_id ─► local subscribers
//! ```
//!
//! A subscriber whose channel is full is evicted: its stream ends and it is
//! expected to resubscribe and resynchronise from storage. Events published
//! while the transport is down still reach local subscribers; remote nodes
//! miss them and rely on periodic reconciliation.

pub mod memory;
pub mod postgres;
pub mod transport;

pub use memory::MemoryTransport;
pub use postgres::PgNotifyTransport;
pub use transport::{NotificationMessage, NotificationStream, NotifyTransport};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use runway_core::{Event, EventPayload, EventType, ResourceRef};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, Result};

/// Capacity of each subscriber's channel.
pub const SUBSCRIBER_BUFFER: usize = 16;

/// Default notification channel name.
pub const DEFAULT_CHANNEL: &str = "events";

/// Reloads an event payload by ID on behalf of the remote listener.
#[async_trait]
pub trait Getter: Send + Sync {
    /// Fetch the current state of the resource with this ID.
    async fn get_by_id(&self, id: &str) -> runway_core::Result<EventPayload>;
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Subscribers {
    entries: HashMap<String, Subscriber>,
    next_generation: u64,
}

type SharedSubscribers = Arc<Mutex<Subscribers>>;

fn lock(subs: &SharedSubscribers) -> MutexGuard<'_, Subscribers> {
    // A panic while holding the lock leaves the map itself consistent.
    subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A named subscription. Ends when canceled, evicted, or the broker is gone.
pub struct Subscription {
    name: String,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Subscriber name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drain the subscription into an unbounded channel on a separate task.
    ///
    /// For consumers that publish events themselves while handling one and
    /// would otherwise fill their own buffer and get evicted. The returned
    /// receiver ends when the subscription does.
    pub fn relay(mut self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = self.rx.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!(subscriber = %self.name, "Subscription relay finished");
        });
        rx
    }
}

/// Publish/subscribe hub for domain events.
pub struct Broker {
    pid: String,
    channel: String,
    transport: Arc<dyn NotifyTransport>,
    subscribers: SharedSubscribers,
    getters: Mutex<HashMap<String, Arc<dyn Getter>>>,
}

impl Broker {
    /// Create a broker relaying through `transport` on `channel`.
    pub fn new(transport: Arc<dyn NotifyTransport>, channel: impl Into<String>) -> Self {
        Self {
            pid: uuid::Uuid::new_v4().to_string(),
            channel: channel.into(),
            transport,
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            getters: Mutex::new(HashMap::new()),
        }
    }

    /// Unique ID of this broker, stamped on every relayed message.
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Notification channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Register the getter used to reload payloads of `relation`.
    pub fn register(&self, relation: &str, getter: Arc<dyn Getter>) {
        self.getters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(relation.to_string(), getter);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).entries.len()
    }

    /// Subscribe under a unique `name`.
    ///
    /// The subscription is removed when `cancel` fires, which ends its stream.
    pub fn subscribe(&self, name: &str, cancel: CancellationToken) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let token = cancel.child_token();

        let generation = {
            let mut subs = lock(&self.subscribers);
            if subs.entries.contains_key(name) {
                return Err(Error::SubscriptionExists(name.to_string()));
            }
            subs.next_generation += 1;
            let generation = subs.next_generation;
            subs.entries.insert(
                name.to_string(),
                Subscriber {
                    tx,
                    generation,
                    token: token.clone(),
                },
            );
            generation
        };

        let subscribers = self.subscribers.clone();
        let owned_name = name.to_string();
        tokio::spawn(async move {
            token.cancelled().await;
            let mut subs = lock(&subscribers);
            if subs
                .entries
                .get(&owned_name)
                .is_some_and(|s| s.generation == generation)
            {
                subs.entries.remove(&owned_name);
                debug!(subscriber = %owned_name, "Subscriber removed");
            }
        });

        debug!(subscriber = %name, "Subscriber added");
        Ok(Subscription {
            name: name.to_string(),
            rx,
        })
    }

    /// Publish an event to local subscribers and, unless it is local-only,
    /// to every other node.
    pub async fn publish(&self, event: Event) {
        self.deliver_local(&event);

        if event.local {
            return;
        }

        let message = NotificationMessage {
            relation: event.event_type.relation().to_string(),
            action: event.event_type.action().to_string(),
            id: event.payload.id(),
            pid: self.pid.clone(),
        };
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Failed to encode notification");
                return;
            }
        };
        if let Err(e) = self.transport.notify(&self.channel, &payload).await {
            warn!(
                error = %e,
                event = %event.event_type,
                id = %message.id,
                "Failed to relay event to other nodes; delivered locally only"
            );
        }
    }

    /// Hand an event to every local subscriber without blocking.
    fn deliver_local(&self, event: &Event) {
        let mut subs = lock(&self.subscribers);
        let mut evicted = Vec::new();
        for (name, sub) in subs.entries.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %name, event = %event.event_type, "Subscriber buffer full; evicting");
                    evicted.push(name.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %name, "Subscriber gone; removing");
                    evicted.push(name.clone());
                }
            }
        }
        for name in evicted {
            if let Some(sub) = subs.entries.remove(&name) {
                sub.token.cancel();
            }
        }
    }

    /// Receive notifications from other nodes until `cancel` fires.
    ///
    /// Reconnects with exponential backoff whenever the transport fails.
    pub async fn run_listener(&self, cancel: CancellationToken) {
        info!(
            channel = %self.channel,
            pid = %self.pid,
            transport = self.transport.transport_type(),
            "Event listener started"
        );
        let mut backoff = ExponentialBackoff::default();

        'connect: loop {
            let listened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'connect,
                r = self.transport.listen(&self.channel) => r,
            };

            match listened {
                Ok(mut stream) => {
                    backoff.reset();
                    debug!(channel = %self.channel, "Listening for notifications");
                    loop {
                        let received = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break 'connect,
                            r = stream.recv() => r,
                        };
                        match received {
                            Ok(Some(payload)) => self.handle_notification(&payload).await,
                            Ok(None) => {
                                warn!(channel = %self.channel, "Notification connection lost");
                                break;
                            }
                            Err(e) => {
                                warn!(error = %e, "Failed to receive notification");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, channel = %self.channel, "Failed to listen for notifications");
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting event listener");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'connect,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Event listener stopped");
    }

    /// Decode a relayed message, reload its payload and deliver it locally.
    async fn handle_notification(&self, raw: &str) {
        let message: NotificationMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed notification");
                return;
            }
        };

        if message.pid == self.pid {
            return;
        }

        let Some(event_type) = EventType::from_parts(&message.relation, &message.action) else {
            warn!(
                relation = %message.relation,
                action = %message.action,
                "Ignoring notification with unknown event type"
            );
            return;
        };

        let payload = if event_type.is_deletion() {
            EventPayload::Deleted(ResourceRef {
                relation: message.relation.clone(),
                id: message.id.clone(),
            })
        } else {
            let getter = self
                .getters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&message.relation)
                .cloned();
            let Some(getter) = getter else {
                warn!(relation = %message.relation, "No getter registered for relation");
                return;
            };
            match getter.get_by_id(&message.id).await {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(
                        error = %e,
                        event = %event_type,
                        id = %message.id,
                        "Failed to reload notification payload"
                    );
                    return;
                }
            }
        };

        self.deliver_local(&Event::new(event_type, payload));
    }
}
