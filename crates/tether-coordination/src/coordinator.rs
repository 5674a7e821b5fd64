//! Per-task polling ownership across client instances.
//!
//! [`CrossTabCoordinator`] wraps the durable [`LeaseStore`] with the
//! engine's acquisition protocol: refuse when another identity holds a
//! fresh lease, heartbeat-renew while owning, release on completion, and
//! sweep abandoned leases in the background.
//!
//! The lease is time-based mutual exclusion, not consensus: under clock
//! skew between instances a bounded window of duplicate work is possible
//! and accepted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::frames::epoch_ms;
use tether_core::ids::{ClientId, TaskId};
use tether_settings::CoordinationSettings;

use crate::broadcast::{AdvisoryType, TabBroadcaster, relay_sweep_older_than};
use crate::errors::Result;
use crate::lease::LeaseStore;

/// Elects a single owning client instance per task.
pub struct CrossTabCoordinator {
    store: Arc<LeaseStore>,
    client_id: ClientId,
    broadcaster: Arc<TabBroadcaster>,
    settings: CoordinationSettings,
}

impl CrossTabCoordinator {
    /// Create a coordinator for one client instance.
    #[must_use]
    pub fn new(
        store: Arc<LeaseStore>,
        client_id: ClientId,
        broadcaster: Arc<TabBroadcaster>,
        settings: CoordinationSettings,
    ) -> Self {
        Self {
            store,
            client_id,
            broadcaster,
            settings,
        }
    }

    /// This instance's identity.
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Try to become the poller for `task_id`.
    ///
    /// Returns `false` when an unexpired lease is held by another
    /// identity — the caller must do no polling at all for that task.
    /// Refusal is expected behavior, not an error. On `true` the lease
    /// is written (or refreshed) with this instance's identity.
    pub fn can_start_polling(&self, task_id: &TaskId) -> Result<bool> {
        let acquired = self.store.acquire(
            task_id,
            &self.client_id,
            epoch_ms(),
            self.settings.lease_ttl_ms,
        )?;
        if acquired {
            debug!(%task_id, "acquired polling lease");
        } else {
            debug!(%task_id, "polling lease held elsewhere, refusing");
        }
        Ok(acquired)
    }

    /// Heartbeat: refresh the lease timestamp while owning.
    ///
    /// A no-op returning `false` if ownership was lost (expiry and theft
    /// by another identity, or sweep deletion).
    pub fn renew_lock(&self, task_id: &TaskId) -> Result<bool> {
        self.store.renew(task_id, &self.client_id, epoch_ms())
    }

    /// Release the lease after the task reached a terminal state, and
    /// advise other instances.
    pub fn release_polling(&self, task_id: &TaskId) -> Result<()> {
        let released = self.store.delete_owned(task_id, &self.client_id)?;
        if released {
            self.broadcaster.publish(
                AdvisoryType::TaskCompleted,
                serde_json::json!({ "task_id": task_id.as_str() }),
            );
        } else {
            debug!(%task_id, "release found no owned lease");
        }
        Ok(())
    }

    /// Spawn the heartbeat renewal loop for an owned task.
    ///
    /// The loop exits when cancelled or when ownership is observed lost.
    /// Cancel the returned token on release or teardown.
    #[must_use]
    pub fn spawn_renewal(self: &Arc<Self>, task_id: TaskId) -> CancellationToken {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let coordinator = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(coordinator.settings.renew_interval_ms));
            // The first tick fires immediately; skip it, the lease was
            // just written by acquisition.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match coordinator.renew_lock(&task_id) {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(%task_id, "lease ownership lost, stopping renewal");
                                return;
                            }
                            Err(e) => {
                                warn!(%task_id, error = %e, "lease renewal failed");
                            }
                        }
                    }
                    () = loop_cancel.cancelled() => return,
                }
            }
        });
        cancel
    }

    /// Spawn the background sweep that deletes leases (and relay rows)
    /// older than the absolute TTL, recovering from instances that
    /// closed without releasing.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let coordinator = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_millis(coordinator.settings.sweep_interval_ms));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => coordinator.sweep_once(),
                    () = loop_cancel.cancelled() => return,
                }
            }
        });
        cancel
    }

    /// One sweep pass; also called directly by tests.
    pub fn sweep_once(&self) {
        let cutoff = epoch_ms().saturating_sub(
            i64::try_from(self.settings.sweep_ttl_ms).unwrap_or(i64::MAX),
        );
        match self.store.sweep_older_than(cutoff) {
            Ok(0) => {}
            Ok(swept) => debug!(swept, "swept abandoned leases"),
            Err(e) => warn!(error = %e, "lease sweep failed"),
        }
        if let Err(e) = relay_sweep_older_than(&self.store, cutoff) {
            warn!(error = %e, "broadcast relay sweep failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator_pair() -> (Arc<CrossTabCoordinator>, Arc<CrossTabCoordinator>) {
        let store = Arc::new(LeaseStore::open_in_memory().unwrap());
        coordinator_pair_with(store, CoordinationSettings::default())
    }

    fn coordinator_pair_with(
        store: Arc<LeaseStore>,
        settings: CoordinationSettings,
    ) -> (Arc<CrossTabCoordinator>, Arc<CrossTabCoordinator>) {
        let bus_a = Arc::new(TabBroadcaster::channel(ClientId::from("tab-a")));
        let bus_b = Arc::new(TabBroadcaster::attach(
            ClientId::from("tab-b"),
            bus_a.bus().unwrap(),
        ));
        let a = Arc::new(CrossTabCoordinator::new(
            Arc::clone(&store),
            ClientId::from("tab-a"),
            bus_a,
            settings,
        ));
        let b = Arc::new(CrossTabCoordinator::new(
            store,
            ClientId::from("tab-b"),
            bus_b,
            settings,
        ));
        (a, b)
    }

    #[tokio::test]
    async fn only_one_identity_wins() {
        let (a, b) = coordinator_pair();
        let task = TaskId::from("t1");
        let got_a = a.can_start_polling(&task).unwrap();
        let got_b = b.can_start_polling(&task).unwrap();
        assert!(got_a);
        assert!(!got_b);
    }

    #[tokio::test]
    async fn release_lets_the_other_identity_in() {
        let (a, b) = coordinator_pair();
        let task = TaskId::from("t1");
        assert!(a.can_start_polling(&task).unwrap());
        assert!(!b.can_start_polling(&task).unwrap());

        a.release_polling(&task).unwrap();
        assert!(b.can_start_polling(&task).unwrap());
    }

    #[tokio::test]
    async fn release_emits_task_completed_advisory() {
        let (a, b) = coordinator_pair();
        let mut sub_b = b.broadcaster.subscribe();
        let task = TaskId::from("t1");

        assert!(a.can_start_polling(&task).unwrap());
        a.release_polling(&task).unwrap();

        let envelope = sub_b.recv().await.unwrap();
        assert_eq!(envelope.event, AdvisoryType::TaskCompleted);
        assert_eq!(envelope.payload["task_id"], "t1");
    }

    #[tokio::test]
    async fn release_without_ownership_is_silent() {
        let (a, b) = coordinator_pair();
        let task = TaskId::from("t1");
        assert!(a.can_start_polling(&task).unwrap());
        // b never owned it; releasing must not delete a's lease
        b.release_polling(&task).unwrap();
        assert!(!b.can_start_polling(&task).unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_stolen() {
        let store = Arc::new(LeaseStore::open_in_memory().unwrap());
        let settings = CoordinationSettings {
            lease_ttl_ms: 30,
            ..CoordinationSettings::default()
        };
        let (a, b) = coordinator_pair_with(store, settings);
        let task = TaskId::from("t1");

        assert!(a.can_start_polling(&task).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // a's lease is past the TTL: treated as absent and overwritten
        assert!(b.can_start_polling(&task).unwrap());

        // a's renewal is now a no-op
        assert!(!a.renew_lock(&task).unwrap());
    }

    #[tokio::test]
    async fn renewal_loop_keeps_lease_fresh() {
        let store = Arc::new(LeaseStore::open_in_memory().unwrap());
        let settings = CoordinationSettings {
            lease_ttl_ms: 60,
            renew_interval_ms: 15,
            ..CoordinationSettings::default()
        };
        let (a, b) = coordinator_pair_with(store, settings);
        let task = TaskId::from("t1");

        assert!(a.can_start_polling(&task).unwrap());
        let renewal = a.spawn_renewal(task.clone());

        // Well past the raw TTL, but renewals kept it fresh.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!b.can_start_polling(&task).unwrap());

        renewal.cancel();
    }

    #[tokio::test]
    async fn sweep_recovers_abandoned_lease() {
        let store = Arc::new(LeaseStore::open_in_memory().unwrap());
        let settings = CoordinationSettings {
            lease_ttl_ms: 10_000,
            sweep_ttl_ms: 20,
            ..CoordinationSettings::default()
        };
        let (a, b) = coordinator_pair_with(store, settings);
        let task = TaskId::from("t1");

        assert!(a.can_start_polling(&task).unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        b.sweep_once();

        // Sweep removed the abandoned record entirely.
        assert!(b.can_start_polling(&task).unwrap());
    }

    #[tokio::test]
    async fn owner_can_reenter_its_own_lease() {
        let (a, _b) = coordinator_pair();
        let task = TaskId::from("t1");
        assert!(a.can_start_polling(&task).unwrap());
        // Same identity asking again is permitted (refresh, not refusal).
        assert!(a.can_start_polling(&task).unwrap());
    }
}
