//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` to match the JSON
//! settings file format. Each type implements [`Default`] with production
//! default values; `#[serde(default)]` allows partial JSON — missing
//! fields get their default value during deserialization.

use serde::{Deserialize, Serialize};
use tether_core::backoff::ReconnectPolicy;

/// Root settings type for the Tether engine.
///
/// Loaded from `~/.tether/settings.json` with defaults applied for
/// missing fields. Environment variables can override specific values.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Settings schema version.
    pub version: String,
    /// Push-connection settings.
    pub connection: ConnectionSettings,
    /// Polling-engine settings.
    pub polling: PollingSettings,
    /// Cross-tab lease and broadcast settings.
    pub coordination: CoordinationSettings,
    /// Task registry settings.
    pub tasks: TaskSettings,
    /// Reconciliation settings.
    pub reconcile: ReconcileSettings,
    /// Recovery settings.
    pub recovery: RecoverySettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            connection: ConnectionSettings::default(),
            polling: PollingSettings::default(),
            coordination: CoordinationSettings::default(),
            tasks: TaskSettings::default(),
            reconcile: ReconcileSettings::default(),
            recovery: RecoverySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// Push-connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint URL.
    pub ws_url: String,
    /// Interval between heartbeat liveness checks in ms.
    pub heartbeat_interval_ms: u64,
    /// A channel silent for longer than this is considered dead and is
    /// reconnected.
    pub liveness_timeout_ms: u64,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000/ws".to_string(),
            heartbeat_interval_ms: 30_000,
            liveness_timeout_ms: 90_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Polling
// ─────────────────────────────────────────────────────────────────────────────

/// Polling-engine settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingSettings {
    /// Fixed interval between polls in ms. No adaptive slowdown.
    pub interval_ms: u64,
    /// Wall-clock budget per task in ms; exceeding it is a terminal
    /// timeout.
    pub max_duration_ms: u64,
    /// Consecutive poll failures tolerated before the task is treated as
    /// expired.
    pub failure_threshold: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_duration_ms: 600_000,
            failure_threshold: 5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordination
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-tab lease and broadcast settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinationSettings {
    /// A lease older than this is treated as absent at acquisition time.
    pub lease_ttl_ms: u64,
    /// Interval between ownership heartbeat renewals in ms.
    pub renew_interval_ms: u64,
    /// Absolute age beyond which the background sweep deletes a lease.
    pub sweep_ttl_ms: u64,
    /// Interval between background sweeps in ms.
    pub sweep_interval_ms: u64,
    /// Poll interval of the storage-relay broadcast fallback in ms.
    pub relay_poll_interval_ms: u64,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            renew_interval_ms: 10_000,
            sweep_ttl_ms: 300_000,
            sweep_interval_ms: 60_000,
            relay_poll_interval_ms: 500,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

/// Task registry settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSettings {
    /// Global ceiling on concurrently active tasks across all kinds.
    pub global_task_limit: usize,
    /// Ceiling on concurrently active tasks within one conversation.
    pub conversation_task_limit: usize,
    /// Maximum retained completion notifications; oldest evicted first.
    pub notification_cap: usize,
    /// How long an errored task stays in the registry before garbage
    /// collection, in ms.
    pub error_grace_ms: u64,
    /// How long a conversation keeps its "recently completed" highlight
    /// if the consumer never views it, in ms.
    pub recently_completed_ttl_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            global_task_limit: 15,
            conversation_task_limit: 5,
            notification_cap: 50,
            error_grace_ms: 5000,
            recently_completed_ttl_ms: 300_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconcile
// ─────────────────────────────────────────────────────────────────────────────

/// Reconciliation settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileSettings {
    /// Time window for the heuristic content match of pending sends
    /// without an idempotency token, in ms.
    pub match_window_ms: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            match_window_ms: 10_000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recovery
// ─────────────────────────────────────────────────────────────────────────────

/// Recovery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecoverySettings {
    /// Base URL of the HTTP API (pending tasks, status, content).
    pub api_base_url: String,
    /// Per-task reattachment stagger in ms (multiplied by list index).
    pub stagger_delay_ms: u64,
    /// Interval of the accumulated-content fallback poll in ms.
    pub fallback_poll_interval_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            stagger_delay_ms: 500,
            fallback_poll_interval_ms: 2000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum log level when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
