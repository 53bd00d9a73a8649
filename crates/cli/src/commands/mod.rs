pub mod chat;
pub mod init;
pub mod serve;
pub mod servers;
pub mod status;

use std::path::Path;

use switchboard_config::AppConfig;

/// Load `path` or the default config file, with environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    config.map_err(|e| format!("Failed to load config: {e}").into())
}
