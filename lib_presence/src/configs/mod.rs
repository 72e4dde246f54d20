//! # Configuration Modules
//!
//! Timing configuration of the sync core, layered from defaults, an optional
//! JSON file and the environment.

/// Layered `PresenceConfig` loading.
pub mod presence_config;

pub use presence_config::{ConfigError, PresenceConfig, ENV_PREFIX};
