//! Reconnect delay math.
//!
//! The connection manager reconnects after an abnormal close with
//! exponential backoff: `min(base · 2^attempt, cap)`, up to a hard attempt
//! ceiling. A dedicated "server restarting" signal instead applies a
//! random jitter delay so a fleet of clients does not reconnect in one
//! stampede.
//!
//! These are the portable, sync-only building blocks; the async timers
//! live in `tether-connection`.

use serde::{Deserialize, Serialize};

/// Default base reconnect delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default reconnect delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default ceiling on reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default upper bound of the server-restart jitter window in milliseconds.
pub const DEFAULT_RESTART_JITTER_MS: u64 = 5000;

/// Reconnect policy parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Base delay for exponential backoff in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay between reconnect attempts in ms.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Hard ceiling on attempts; beyond it the connection stays down
    /// until externally retriggered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound of the random delay applied on `server_restarting`.
    #[serde(default = "default_restart_jitter_ms")]
    pub restart_jitter_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_restart_jitter_ms() -> u64 {
    DEFAULT_RESTART_JITTER_MS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            restart_jitter_ms: DEFAULT_RESTART_JITTER_MS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        reconnect_delay(attempt, self.base_delay_ms, self.max_delay_ms)
    }

    /// Whether `attempt` (zero-based) is still within the ceiling.
    #[must_use]
    pub fn attempt_allowed(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Exponential reconnect delay: `min(base · 2^attempt, cap)`.
///
/// Saturates instead of overflowing for large attempt counts.
#[must_use]
pub fn reconnect_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    exponential.min(max_delay_ms)
}

/// Jitter delay for the server-restarting signal.
///
/// `random` must be in `[0.0, 1.0)` from a PRNG; the result is uniform in
/// `[0, max_jitter_ms)`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn restart_jitter_with_random(max_jitter_ms: u64, random: f64) -> u64 {
    ((max_jitter_ms as f64) * random.clamp(0.0, 1.0)).floor() as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
