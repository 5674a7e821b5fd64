//! The per-instance service-object bundle.
//!
//! One [`SessionRuntime`] per client instance ("tab"), owning the
//! connection, registry, polling engine, coordinator, broadcaster,
//! runtime state, and recovery manager — created by
//! [`SessionRuntime::initialize`], torn down by
//! [`SessionRuntime::teardown`]. Consumers receive it by reference;
//! nothing here is ambient or global.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use tether_connection::{ConnectionManager, Transport};
use tether_coordination::{CrossTabCoordinator, LeaseStore, TabBroadcaster};
use tether_core::ids::{ConversationId, TaskId};
use tether_core::frames::Frame;
use tether_core::messages::PersistedMessage;
use tether_reconcile::{ReconciliationEngine, TimelineMessage};
use tether_settings::TetherSettings;
use tether_tasks::{PollingEngine, TaskRegistry};

use crate::api::ApiClient;
use crate::errors::RecoveryError;
use crate::events::RuntimeEvent;
use crate::recovery::RecoveryManager;
use crate::router::MessageRouter;
use crate::state::RuntimeState;

/// Capacity of the runtime event channel.
const EVENT_CAPACITY: usize = 256;

/// The engine's service objects for one client instance.
pub struct SessionRuntime {
    connection: Arc<ConnectionManager>,
    registry: Arc<TaskRegistry>,
    polling: Arc<PollingEngine>,
    coordinator: Arc<CrossTabCoordinator>,
    broadcaster: Arc<TabBroadcaster>,
    state: Arc<RuntimeState>,
    recovery: Arc<RecoveryManager>,
    reconciler: ReconciliationEngine,
    events_tx: broadcast::Sender<RuntimeEvent>,
    router: Mutex<Option<MessageRouter>>,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl SessionRuntime {
    /// Build the full service bundle. Nothing runs until
    /// [`SessionRuntime::start`].
    #[must_use]
    pub fn initialize(
        settings: &TetherSettings,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ApiClient>,
        lease_store: Arc<LeaseStore>,
        broadcaster: Arc<TabBroadcaster>,
    ) -> Arc<Self> {
        tether_core::logging::init_subscriber(&settings.logging.level);

        let client_id = broadcaster.sender_id().clone();
        let connection = ConnectionManager::new(transport, settings.connection.clone());
        let registry = Arc::new(TaskRegistry::new(settings.tasks));
        let polling = Arc::new(PollingEngine::new());
        let coordinator = Arc::new(CrossTabCoordinator::new(
            lease_store,
            client_id,
            Arc::clone(&broadcaster),
            settings.coordination,
        ));
        let state = Arc::new(RuntimeState::new());
        let (events_tx, _events_rx) = broadcast::channel(EVENT_CAPACITY);

        let recovery = Arc::new(RecoveryManager::new(
            api,
            Arc::clone(&registry),
            Arc::clone(&state),
            Arc::clone(&polling),
            Arc::clone(&coordinator),
            Arc::clone(&broadcaster),
            events_tx.clone(),
            settings.recovery.clone(),
            settings.polling,
        ));

        let router = MessageRouter::attach(&connection, &registry, &state, events_tx.clone());
        let reconciler = ReconciliationEngine::new(Duration::from_millis(
            settings.reconcile.match_window_ms,
        ));

        Arc::new(Self {
            connection,
            registry,
            polling,
            coordinator,
            broadcaster,
            state,
            recovery,
            reconciler,
            events_tx,
            router: Mutex::new(Some(router)),
            sweeper: Mutex::new(None),
        })
    }

    /// Bring the session online: open the push connection, arm the
    /// lease sweeper, and start guarding against duplicate recovery.
    pub fn start(self: &Arc<Self>) {
        let _ = self.connection.start();
        self.recovery.start_advisory_guard();
        *self.sweeper.lock() = Some(self.coordinator.spawn_sweeper());
    }

    /// Re-attach server-reported pending tasks (reload recovery).
    pub async fn recover(&self) -> Result<usize, RecoveryError> {
        self.recovery.recover().await
    }

    /// Watch runtime events (completions, failures, credits, refresh
    /// requests).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to a task's live stream over the push channel.
    pub fn subscribe_task(&self, task_id: TaskId, last_index: i64) {
        self.connection.send(&Frame::subscribe(task_id, last_index));
    }

    /// Unsubscribe from a task's live stream.
    pub fn unsubscribe_task(&self, task_id: TaskId) {
        self.connection.send(&Frame::unsubscribe(task_id));
    }

    /// The merged, de-duplicated timeline for a conversation: the given
    /// authoritative history reconciled with this instance's optimistic
    /// state.
    #[must_use]
    pub fn merge_timeline(
        &self,
        conversation_id: &ConversationId,
        persisted: &[PersistedMessage],
    ) -> Vec<TimelineMessage> {
        let (optimistic, active) = self.state.snapshot(conversation_id);
        self.reconciler
            .merge(persisted, &optimistic, active.as_ref())
    }

    /// The push connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// The task registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The polling engine.
    #[must_use]
    pub fn polling(&self) -> &Arc<PollingEngine> {
        &self.polling
    }

    /// The cross-tab coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<CrossTabCoordinator> {
        &self.coordinator
    }

    /// The advisory broadcaster.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<TabBroadcaster> {
        &self.broadcaster
    }

    /// The per-conversation runtime state.
    #[must_use]
    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    /// Tear everything down: close the connection, cancel recovery,
    /// stop every poll, and disarm the sweeper. Idempotent.
    pub fn teardown(&self) {
        self.connection.shutdown();
        self.recovery.cancel_all();
        self.polling.stop_all();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.cancel();
        }
        if let Some(router) = self.router.lock().take() {
            router.detach();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
