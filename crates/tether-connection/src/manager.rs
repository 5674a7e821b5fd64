//! Connection lifecycle state machine and frame dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::backoff::restart_jitter_with_random;
use tether_core::frames::{Frame, FrameType};
use tether_settings::ConnectionSettings;

use crate::transport::{Transport, TransportEvent};

/// Lifecycle state of the push connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Live and dispatching frames.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Down, and staying down until externally retriggered.
    Disconnected,
}

type Handler = Arc<dyn Fn(&Frame) + Send + Sync>;

enum LinkOutcome {
    Closed,
    ServerRestarting,
    Shutdown,
}

/// Owns the one live push connection for a client instance.
///
/// Created once per session; [`ConnectionManager::start`] spawns the
/// connect/dispatch loop and [`ConnectionManager::shutdown`] tears it
/// down. Frame handlers registered via [`ConnectionManager::subscribe`]
/// run synchronously on the dispatch task, in arrival order.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    state_tx: watch::Sender<ConnectionState>,
    handlers: RwLock<HashMap<FrameType, Vec<(u64, Handler)>>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    cancel: CancellationToken,
    next_handler_id: AtomicU64,
    running: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager over a transport. No connection is made until
    /// [`ConnectionManager::start`].
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Arc<Self> {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            transport,
            settings,
            state_tx,
            handlers: RwLock::new(HashMap::new()),
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
            next_handler_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Spawn the connect/dispatch loop.
    ///
    /// Returns `false` if the loop is already running. May be called
    /// again after the loop ended in `Disconnected` (the external
    /// retrigger, e.g. re-authentication).
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let manager = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            manager.run().await;
            manager.running.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Tear the connection down permanently (logout, session teardown).
    pub fn shutdown(&self) {
        self.cancel.cancel();
        *self.outbound.lock() = None;
        let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Register a handler for one frame type. Handlers for the same type
    /// form a set; each registration gets its own [`Subscription`].
    ///
    /// Dropping the subscription without calling
    /// [`Subscription::unsubscribe`] leaves the handler registered.
    pub fn subscribe(
        self: &Arc<Self>,
        frame_type: FrameType,
        handler: impl Fn(&Frame) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .entry(frame_type)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            manager: Arc::clone(self),
            frame_type,
            id,
        }
    }

    /// Fire-and-forget send.
    ///
    /// Dropped silently when not connected or when the outbound channel
    /// is full; there is no outbound queue.
    pub fn send(&self, frame: &Frame) {
        let Some(tx) = self.outbound.lock().clone() else {
            debug!(frame_type = ?frame.frame_type, "not connected, dropping outbound frame");
            return;
        };
        match frame.to_json() {
            Ok(json) => {
                if tx.try_send(json).is_err() {
                    debug!(frame_type = ?frame.frame_type, "outbound channel unavailable, dropping frame");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode outbound frame"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Run loop
    // ─────────────────────────────────────────────────────────────────────

    async fn run(self: &Arc<Self>) {
        let policy = self.settings.reconnect.clone();
        let mut attempts: u32 = 0;
        let mut ever_connected = false;

        loop {
            if self.cancel.is_cancelled() {
                let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }

            let _ = self.state_tx.send_replace(if ever_connected || attempts > 0 {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            match self.transport.connect().await {
                Ok(link) => {
                    ever_connected = true;
                    attempts = 0;
                    *self.outbound.lock() = Some(link.outbound);
                    let _ = self.state_tx.send_replace(ConnectionState::Connected);
                    info!("push connection established");

                    let outcome = self.drive_link(link.inbound).await;
                    *self.outbound.lock() = None;

                    match outcome {
                        LinkOutcome::Shutdown => {
                            let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                            return;
                        }
                        LinkOutcome::ServerRestarting => {
                            // Reset the attempt counter and spread the
                            // fleet's reconnects over a jitter window.
                            attempts = 0;
                            let _ = self.state_tx.send_replace(ConnectionState::Reconnecting);
                            let jitter = restart_jitter_with_random(
                                policy.restart_jitter_ms,
                                rand::random::<f64>(),
                            );
                            info!(jitter_ms = jitter, "server restarting, reconnecting after jitter");
                            if self.wait_or_shutdown(Duration::from_millis(jitter)).await {
                                return;
                            }
                            continue;
                        }
                        LinkOutcome::Closed => {
                            warn!("push connection lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = attempts, "push connect failed");
                }
            }

            if !policy.attempt_allowed(attempts) {
                warn!(attempts, "reconnect ceiling reached, staying disconnected");
                let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                return;
            }
            let delay = Duration::from_millis(policy.delay_for_attempt(attempts));
            attempts += 1;
            let _ = self.state_tx.send_replace(ConnectionState::Reconnecting);
            debug!(?delay, attempt = attempts, "scheduling reconnect");
            if self.wait_or_shutdown(delay).await {
                return;
            }
        }
    }

    /// Sleep, unless shut down first. Returns `true` on shutdown.
    async fn wait_or_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => false,
            () = self.cancel.cancelled() => {
                let _ = self.state_tx.send_replace(ConnectionState::Disconnected);
                true
            }
        }
    }

    async fn drive_link(&self, mut inbound: mpsc::Receiver<TransportEvent>) -> LinkOutcome {
        let mut last_activity = tokio::time::Instant::now();
        let liveness = Duration::from_millis(self.settings.liveness_timeout_ms);
        let mut watchdog =
            tokio::time::interval(Duration::from_millis(self.settings.heartbeat_interval_ms));
        // The first interval tick fires immediately; consume it.
        let _ = watchdog.tick().await;

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(TransportEvent::Frame(raw)) => {
                        last_activity = tokio::time::Instant::now();
                        match Frame::parse(&raw) {
                            Ok(frame) => {
                                if frame.frame_type == FrameType::Ping {
                                    self.send(&Frame::pong());
                                }
                                self.dispatch(&frame);
                                if frame.frame_type == FrameType::ServerRestarting {
                                    return LinkOutcome::ServerRestarting;
                                }
                            }
                            Err(e) => warn!(error = %e, "dropping malformed frame"),
                        }
                    }
                    Some(TransportEvent::Closed { abnormal }) => {
                        debug!(abnormal, "link closed");
                        return LinkOutcome::Closed;
                    }
                    None => return LinkOutcome::Closed,
                },
                _ = watchdog.tick() => {
                    if last_activity.elapsed() >= liveness {
                        warn!("no traffic within liveness window, dropping link");
                        return LinkOutcome::Closed;
                    }
                }
                () = self.cancel.cancelled() => return LinkOutcome::Shutdown,
            }
        }
    }

    /// Invoke every handler registered for the frame's type, in
    /// registration order, synchronously.
    fn dispatch(&self, frame: &Frame) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&frame.frame_type)
            .map(|entries| entries.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(frame);
        }
    }

    fn remove_handler(&self, frame_type: FrameType, id: u64) {
        let mut handlers = self.handlers.write();
        if let Some(entries) = handlers.get_mut(&frame_type) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                let _ = handlers.remove(&frame_type);
            }
        }
    }
}

/// Registration handle returned by [`ConnectionManager::subscribe`].
pub struct Subscription {
    manager: Arc<ConnectionManager>,
    frame_type: FrameType,
    id: u64,
}

impl Subscription {
    /// Remove the handler.
    pub fn unsubscribe(self) {
        self.manager.remove_handler(self.frame_type, self.id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LinkController, MockTransport};
    use serde_json::json;
    use tether_core::backoff::ReconnectPolicy;
    use tether_core::ids::TaskId;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            ws_url: "ws://mock".into(),
            heartbeat_interval_ms: 1000,
            liveness_timeout_ms: 5000,
            reconnect: ReconnectPolicy {
                base_delay_ms: 100,
                max_delay_ms: 1000,
                max_attempts: 3,
                restart_jitter_ms: 200,
            },
        }
    }

    async fn connected_manager() -> (
        Arc<ConnectionManager>,
        Arc<MockTransport>,
        tokio::sync::mpsc::UnboundedReceiver<LinkController>,
        LinkController,
    ) {
        let (transport, mut controllers) = MockTransport::new();
        let manager = ConnectionManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            settings(),
        );
        assert!(manager.start());
        let controller = controllers.recv().await.unwrap();
        // Let the run loop process the established link.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        (manager, transport, controllers, controller)
    }

    fn frame_json(frame_type: &str) -> String {
        format!(r#"{{"type": "{frame_type}", "payload": {{}}, "timestamp": 1}}"#)
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_reports_state() {
        let (_manager, transport, _controllers, _controller) = connected_manager().await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_answered_with_pong() {
        let (_manager, _transport, _controllers, mut controller) = connected_manager().await;

        controller.push_frame(frame_json("ping")).await;
        let sent = controller.sent.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&sent).unwrap();
        assert_eq!(value["type"], "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn frames_dispatch_to_subscribers() {
        let (manager, _transport, _controllers, controller) = connected_manager().await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let _subscription = manager.subscribe(FrameType::ChatChunk, move |frame| {
            sink.lock().push(frame.payload.clone());
        });

        controller
            .push_frame(
                json!({
                    "type": "chat_chunk",
                    "payload": {"text": "hi"},
                    "timestamp": 1,
                    "task_id": "t1"
                })
                .to_string(),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let frames = received.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_delivery() {
        let (manager, _transport, _controllers, controller) = connected_manager().await;

        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let subscription = manager.subscribe(FrameType::ChatDone, move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });

        controller.push_frame(frame_json("chat_done")).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        controller.push_frame(frame_json("chat_done")).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_handlers_per_type() {
        let (manager, _transport, _controllers, controller) = connected_manager().await;

        let count = Arc::new(AtomicU64::new(0));
        let c1 = Arc::clone(&count);
        let c2 = Arc::clone(&count);
        let _s1 = manager.subscribe(FrameType::ChatStart, move |_| {
            let _ = c1.fetch_add(1, Ordering::SeqCst);
        });
        let _s2 = manager.subscribe(FrameType::ChatStart, move |_| {
            let _ = c2.fetch_add(1, Ordering::SeqCst);
        });

        controller.push_frame(frame_json("chat_start")).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_drops_silently() {
        let (transport, _controllers) = MockTransport::new();
        let manager = ConnectionManager::new(
            transport as Arc<dyn Transport>,
            settings(),
        );
        // Never started; no connection. Must not panic.
        manager.send(&Frame::subscribe(TaskId::from("t1"), -1));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_reconnects_and_resets_attempts() {
        let (manager, transport, mut controllers, controller) = connected_manager().await;

        controller.close(true).await;
        // Backoff for attempt 0 is 100ms; reconnect follows.
        let second = controllers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_count(), 2);

        // The new link works.
        second.push_frame(frame_json("ping")).await;
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_ceiling_ends_disconnected() {
        let (transport, mut controllers) = MockTransport::new();
        transport.fail_next_connects(100);
        let manager = ConnectionManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            settings(),
        );
        assert!(manager.start());

        // 1 initial + 3 allowed retries, then terminal.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.connect_count(), 4);
        assert!(controllers.try_recv().is_err());

        // External retrigger starts a fresh loop.
        transport.fail_next_connects(0);
        assert!(manager.start());
        let _controller = controllers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_restarting_reconnects_with_fresh_attempts() {
        let (manager, transport, mut controllers, controller) = connected_manager().await;

        controller.push_frame(frame_json("server_restarting")).await;
        // Jitter is at most 200ms; the reconnect must land.
        let _second = controllers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_is_dropped_after_liveness_timeout() {
        let (manager, transport, mut controllers, _controller) = connected_manager().await;

        // No inbound traffic at all: the watchdog reconnects.
        let _second = controllers.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(transport.connect_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn regular_pings_keep_link_alive() {
        let (manager, transport, _controllers, controller) = connected_manager().await;

        for _ in 0..10 {
            controller.push_frame(frame_json("ping")).await;
            tokio::time::sleep(Duration::from_millis(900)).await;
        }
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_terminal() {
        let (manager, transport, mut controllers, _controller) = connected_manager().await;

        manager.shutdown();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // No reconnect after shutdown.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_count(), 1);
        assert!(controllers.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_dropped_not_fatal() {
        let (manager, _transport, _controllers, controller) = connected_manager().await;

        controller.push_frame("definitely not json").await;
        controller.push_frame(frame_json("ping")).await;
        let sent = controller_recv_pong(controller).await;
        assert!(sent);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    async fn controller_recv_pong(mut controller: LinkController) -> bool {
        match controller.sent.recv().await {
            Some(raw) => {
                let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
                value["type"] == "pong"
            }
            None => false,
        }
    }
}
