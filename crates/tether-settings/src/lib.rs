//! # tether-settings
//!
//! Configuration management with layered sources for the Tether engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** — [`TetherSettings::default()`]
//! 2. **User file** — `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** — `TETHER_*` overrides (highest priority)
//!
//! Every timing knob the engine exposes lives here: reconnect backoff,
//! heartbeat cadence, poll interval and budgets, lease TTLs, the
//! reconciliation match window, task concurrency ceilings.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

use std::sync::OnceLock;

/// Global settings singleton.
///
/// Initialized on first access via [`get_settings`]. Loaded from
/// `~/.tether/settings.json` with env var overrides, falling back to
/// compiled defaults if loading fails.
static SETTINGS: OnceLock<TetherSettings> = OnceLock::new();

/// Get the global settings instance.
pub fn get_settings() -> &'static TetherSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Initialize the global settings with a specific value.
///
/// # Errors
///
/// Returns the provided settings back if the global was already
/// initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: TetherSettings) -> std::result::Result<(), TetherSettings> {
    SETTINGS.set(settings)
}
