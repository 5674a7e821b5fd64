//! Best-effort advisory pub/sub across client instances.
//!
//! Preferred transport is a process-wide low-level broadcast channel;
//! when instances cannot share one (separate processes), the fallback is
//! a storage-change relay over the shared `SQLite` file, polled on a
//! short interval.
//!
//! Every envelope carries the sender's ephemeral identity so senders
//! ignore their own echoes. Nothing here is safety-critical: messages
//! may be lost or duplicated, and consumers must tolerate both. The
//! durable lease in [`crate::lease`] is the only cross-tab primitive
//! correctness relies on.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::frames::epoch_ms;
use tether_core::ids::ClientId;

use crate::errors::Result;
use crate::lease::LeaseStore;

/// Capacity of the in-process broadcast bus.
const BUS_CAPACITY: usize = 64;

/// Advisory event types exchanged between client instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvisoryType {
    /// A task was started somewhere.
    #[serde(rename = "task-started")]
    TaskStarted,
    /// A task completed; the owner released its lease.
    #[serde(rename = "task-completed")]
    TaskCompleted,
    /// A task failed terminally.
    #[serde(rename = "task-failed")]
    TaskFailed,
    /// The credit balance changed.
    #[serde(rename = "credits-changed")]
    CreditsChanged,
    /// A pending task was already resumed by another instance.
    #[serde(rename = "task-resumed")]
    TaskResumed,
}

/// One advisory message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    /// Advisory event type.
    #[serde(rename = "type")]
    pub event: AdvisoryType,
    /// Event-specific payload.
    pub payload: Value,
    /// Send time, Unix ms.
    pub timestamp: i64,
    /// Identity of the sender, for echo suppression only.
    pub sender_id: ClientId,
}

enum Transport {
    Channel(broadcast::Sender<BroadcastEnvelope>),
    Relay {
        store: Arc<LeaseStore>,
        poll_interval: Duration,
    },
}

/// Best-effort same-session publish/subscribe.
pub struct TabBroadcaster {
    sender_id: ClientId,
    transport: Transport,
}

impl TabBroadcaster {
    /// Create a broadcaster on a fresh in-process bus.
    #[must_use]
    pub fn channel(sender_id: ClientId) -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender_id,
            transport: Transport::Channel(tx),
        }
    }

    /// Join an existing in-process bus (another instance's handle).
    #[must_use]
    pub fn attach(sender_id: ClientId, bus: broadcast::Sender<BroadcastEnvelope>) -> Self {
        Self {
            sender_id,
            transport: Transport::Channel(bus),
        }
    }

    /// Create a broadcaster over the storage-change relay fallback.
    #[must_use]
    pub fn storage_relay(
        sender_id: ClientId,
        store: Arc<LeaseStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sender_id,
            transport: Transport::Relay {
                store,
                poll_interval,
            },
        }
    }

    /// The identity stamped on outgoing envelopes.
    #[must_use]
    pub fn sender_id(&self) -> &ClientId {
        &self.sender_id
    }

    /// Handle to the in-process bus, for attaching further instances.
    ///
    /// `None` when this broadcaster runs on the storage relay.
    #[must_use]
    pub fn bus(&self) -> Option<broadcast::Sender<BroadcastEnvelope>> {
        match &self.transport {
            Transport::Channel(tx) => Some(tx.clone()),
            Transport::Relay { .. } => None,
        }
    }

    /// Publish an advisory event. Best-effort: failures are logged and
    /// swallowed.
    pub fn publish(&self, event: AdvisoryType, payload: Value) {
        let envelope = BroadcastEnvelope {
            event,
            payload,
            timestamp: epoch_ms(),
            sender_id: self.sender_id.clone(),
        };
        match &self.transport {
            Transport::Channel(tx) => {
                // Err means no subscribers; that is fine for advisory traffic.
                let _ = tx.send(envelope);
            }
            Transport::Relay { store, .. } => {
                if let Err(e) = relay_insert(store, &envelope) {
                    warn!(error = %e, ?event, "failed to publish via storage relay");
                }
            }
        }
    }

    /// Subscribe to advisory events from *other* instances.
    ///
    /// Own echoes are filtered out. For the relay transport only events
    /// published after the subscription are delivered.
    #[must_use]
    pub fn subscribe(&self) -> BroadcastSubscription {
        match &self.transport {
            Transport::Channel(tx) => BroadcastSubscription {
                own_id: self.sender_id.clone(),
                source: SubscriptionSource::Channel(tx.subscribe()),
                _cancel: None,
            },
            Transport::Relay {
                store,
                poll_interval,
            } => {
                let (tx, rx) = mpsc::channel(BUS_CAPACITY);
                let cancel = CancellationToken::new();
                let loop_cancel = cancel.clone();
                let store = Arc::clone(store);
                let interval = *poll_interval;
                let _handle = tokio::spawn(async move {
                    relay_poll_loop(store, interval, tx, loop_cancel).await;
                });
                BroadcastSubscription {
                    own_id: self.sender_id.clone(),
                    source: SubscriptionSource::Relay(rx),
                    _cancel: Some(cancel.drop_guard()),
                }
            }
        }
    }
}

enum SubscriptionSource {
    Channel(broadcast::Receiver<BroadcastEnvelope>),
    Relay(mpsc::Receiver<BroadcastEnvelope>),
}

/// A live subscription to advisory events.
pub struct BroadcastSubscription {
    own_id: ClientId,
    source: SubscriptionSource,
    _cancel: Option<tokio_util::sync::DropGuard>,
}

impl BroadcastSubscription {
    /// Receive the next envelope from another instance.
    ///
    /// Returns `None` when the transport is closed. Own echoes are
    /// skipped; on the channel transport, lagging silently drops the
    /// missed advisory messages.
    pub async fn recv(&mut self) -> Option<BroadcastEnvelope> {
        loop {
            let envelope = match &mut self.source {
                SubscriptionSource::Channel(rx) => match rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(lagged = n, "broadcast subscription lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                SubscriptionSource::Relay(rx) => rx.recv().await?,
            };
            if envelope.sender_id != self.own_id {
                return Some(envelope);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage relay
// ─────────────────────────────────────────────────────────────────────────────

fn relay_insert(store: &LeaseStore, envelope: &BroadcastEnvelope) -> Result<()> {
    let payload = serde_json::to_string(&envelope.payload)?;
    let event = serde_json::to_string(&envelope.event)?;
    store.with_conn(|conn| {
        let _ = conn.execute(
            "INSERT INTO broadcasts (event, payload, timestamp, sender_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.trim_matches('"'),
                payload,
                envelope.timestamp,
                envelope.sender_id.as_str()
            ],
        )?;
        Ok(())
    })
}

/// The highest broadcast row id currently stored.
fn relay_cursor(store: &LeaseStore) -> Result<i64> {
    store.with_conn(|conn| {
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM broadcasts", [], |row| {
            row.get(0)
        })
    })
}

/// Fetch every envelope with a row id greater than `cursor`.
fn relay_fetch_since(store: &LeaseStore, cursor: i64) -> Result<Vec<(i64, BroadcastEnvelope)>> {
    let rows: Vec<(i64, String, String, i64, String)> = store.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, event, payload, timestamp, sender_id
             FROM broadcasts WHERE id > ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![cursor], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })?;

    let mut envelopes = Vec::with_capacity(rows.len());
    for (id, event, payload, timestamp, sender_id) in rows {
        let event: AdvisoryType = serde_json::from_value(Value::String(event))?;
        envelopes.push((
            id,
            BroadcastEnvelope {
                event,
                payload: serde_json::from_str(&payload)?,
                timestamp,
                sender_id: ClientId::from_string(sender_id),
            },
        ));
    }
    Ok(envelopes)
}

/// Delete relay rows older than `cutoff_ms`, returning the count.
pub(crate) fn relay_sweep_older_than(store: &LeaseStore, cutoff_ms: i64) -> Result<usize> {
    store.with_conn(|conn| {
        conn.execute(
            "DELETE FROM broadcasts WHERE timestamp < ?1",
            params![cutoff_ms],
        )
    })
}

async fn relay_poll_loop(
    store: Arc<LeaseStore>,
    poll_interval: Duration,
    tx: mpsc::Sender<BroadcastEnvelope>,
    cancel: CancellationToken,
) {
    // Start at the current head so only new events are delivered.
    let mut cursor = match relay_cursor(&store) {
        Ok(cursor) => cursor,
        Err(e) => {
            warn!(error = %e, "storage relay cursor read failed");
            return;
        }
    };
    let mut ticker = tokio::time::interval(poll_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let batch = match relay_fetch_since(&store, cursor) {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "storage relay poll failed");
                        continue;
                    }
                };
                for (id, envelope) in batch {
                    cursor = cursor.max(id);
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
