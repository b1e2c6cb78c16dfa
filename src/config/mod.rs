//! Configuration management
//!
//! Loads the YAML configuration file, per-provider endpoint settings and
//! validation.

mod bridge_config;
mod provider_settings;
pub mod validation;

pub use bridge_config::BridgeConfig;
pub use provider_settings::{ProviderSettings, ProvidersConfig};
pub use validation::{validate_config, validate_config_result, ValidationError};
