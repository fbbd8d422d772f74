pub mod audit;
pub mod check;
pub mod config_cmd;
pub mod env;
pub mod exec;

use std::path::Path;

use toolgate_config::{ConfigError, SecurityConfig};

/// Load the configuration from `path` if given, else from the default location.
pub fn load_config(path: Option<&Path>) -> Result<SecurityConfig, ConfigError> {
    let config = match path {
        Some(path) => SecurityConfig::load_from(path)?,
        None => SecurityConfig::load()?,
    };
    config.validate()?;
    tracing::debug!(roots = ?config.paths.allowed_roots, "Loaded configuration");
    Ok(config)
}
