//! Deterministic in-memory transport for tests.
//!
//! [`MockTransport`] hands the manager a scripted link on each connect
//! and surfaces a [`LinkController`] per connection so tests can feed
//! inbound frames, observe outbound traffic, and drop the link at will.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::errors::ConnectionError;
use crate::transport::{Transport, TransportEvent, TransportLink};

/// Test-side handle to one established mock connection.
pub struct LinkController {
    /// Feed inbound events to the manager.
    pub events: mpsc::Sender<TransportEvent>,
    /// Observe raw text frames the manager sent.
    pub sent: mpsc::Receiver<String>,
}

impl LinkController {
    /// Feed one inbound raw frame.
    pub async fn push_frame(&self, raw: impl Into<String>) {
        self.events
            .send(TransportEvent::Frame(raw.into()))
            .await
            .expect("manager dropped inbound receiver");
    }

    /// End the link.
    pub async fn close(&self, abnormal: bool) {
        let _ = self.events.send(TransportEvent::Closed { abnormal }).await;
    }
}

/// Scripted transport: each connect yields a fresh in-memory link, or a
/// scripted failure.
pub struct MockTransport {
    controllers: mpsc::UnboundedSender<LinkController>,
    failures_remaining: Mutex<u32>,
    connect_count: AtomicU32,
}

impl MockTransport {
    /// Create a transport plus the stream of controllers, one per
    /// successful connect.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkController>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                controllers: tx,
                failures_remaining: Mutex::new(0),
                connect_count: AtomicU32::new(0),
            }),
            rx,
        )
    }

    /// Make the next `n` connect calls fail.
    pub fn fail_next_connects(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    /// Total connect calls observed (successful or not).
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<TransportLink, ConnectionError> {
        let _ = self.connect_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ConnectionError::Connect("scripted failure".into()));
            }
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.controllers.send(LinkController {
            events: in_tx,
            sent: out_rx,
        });
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
