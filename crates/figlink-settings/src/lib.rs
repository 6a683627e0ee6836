//! # figlink-settings
//!
//! Layered configuration for figlink clients and servers.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`FiglinkSettings::default()`]
//! 2. **User file**: `~/.figlink/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `FIGLINK_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_env_overrides_from, deep_merge, load_settings,
    load_settings_from_path, load_with_env, settings_path,
};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = FiglinkSettings::default();
        assert!(settings_path().ends_with(".figlink/settings.json"));
    }
}
