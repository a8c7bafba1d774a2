//! # roomhub-settings
//!
//! Layered configuration for the roomhub server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`RoomhubSettings::default()`])
//! 2. **User file** `~/.roomhub/settings.json`, deep-merged over defaults
//! 3. **Environment variables** `ROOMHUB_*` (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, roomhub_dir, settings_path};
pub use types::*;
