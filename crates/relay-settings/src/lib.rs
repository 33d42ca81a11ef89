//! # relay-settings
//!
//! Configuration for the relay, loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: optional JSON file, deep-merged over defaults
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! The binary applies its command-line flags on top and calls
//! [`RelaySettings::validate`] before starting.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::{LogFormat, LoggingSettings, RelaySettings, ServerSettings};
