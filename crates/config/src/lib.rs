//! Configuration loading, validation, and management for Switchboard.
//!
//! Loads configuration from `~/.switchboard/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use switchboard_core::tool::QUALIFIED_SEPARATOR;

/// The root configuration structure.
///
/// Maps directly to `~/.switchboard/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Session lifetime settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Conversation window settings
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Tool server endpoints and retry policy
    #[serde(default)]
    pub tool_servers: ToolServersConfig,

    /// Inference endpoint settings
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Minutes of inactivity before a session expires (`SESSION_TTL`)
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,

    /// Seconds between background expiry sweeps (`SESSION_SWEEP_INTERVAL`)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Upper bound on `session.ttl_minutes`: one year.
pub const MAX_TTL_MINUTES: u64 = 365 * 24 * 60;

fn default_ttl_minutes() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    60
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.saturating_mul(60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Truncation budget in turns (`CONVERSATION_WINDOW_MAX_TURNS`)
    #[serde(default = "default_window_max_turns")]
    pub window_max_turns: usize,
}

fn default_window_max_turns() -> usize {
    20
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            window_max_turns: default_window_max_turns(),
        }
    }
}

/// One configured tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Stable server id used to namespace its tools
    pub id: String,

    /// Base URL of the server's JSON-RPC endpoint
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServersConfig {
    /// Servers to connect to (`TOOL_SERVER_ENDPOINTS`)
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Connect attempts per endpoint (`TOOL_SERVER_MAX_ATTEMPTS`)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts, seconds (`TOOL_SERVER_RETRY_DELAY`)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Per-attempt timeout covering handshake + tool list
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for a single tool invocation
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_retry_delay_secs() -> u64 {
    2
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_call_timeout_secs() -> u64 {
    30
}

impl ToolServersConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for ToolServersConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Provider name: "openrouter", "openai", "ollama", or any custom name with `api_url`
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Override the provider's base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Upper bound on one whole inference call, tool round trips included
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum model ↔ tool round trips per query
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_inference_timeout_secs() -> u64 {
    120
}
fn default_max_tool_rounds() -> u32 {
    10
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_url: None,
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_inference_timeout_secs(),
            max_tool_rounds: default_max_tool_rounds(),
            system_prompt: None,
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for InferenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceConfig")
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_tool_rounds", &self.max_tool_rounds)
            .field("system_prompt", &self.system_prompt)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.switchboard/config.toml),
    /// then apply environment overrides from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_path())
    }

    /// Load `path` (defaults if absent), then apply process-environment
    /// overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides.
    ///
    /// `lookup` resolves a variable name to its value; `load()` passes
    /// `std::env::var`, tests pass a map.
    ///
    /// - `SESSION_TTL` (minutes), `SESSION_SWEEP_INTERVAL` (seconds)
    /// - `CONVERSATION_WINDOW_MAX_TURNS`
    /// - `TOOL_SERVER_ENDPOINTS` (comma-separated `id=url` or bare `url`)
    /// - `TOOL_SERVER_MAX_ATTEMPTS`, `TOOL_SERVER_RETRY_DELAY` (seconds)
    /// - `SWITCHBOARD_API_KEY` > `OPENROUTER_API_KEY` > `OPENAI_API_KEY`
    /// - `SWITCHBOARD_PROVIDER`, `SWITCHBOARD_MODEL`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SESSION_TTL") {
            self.session.ttl_minutes = parse_env("SESSION_TTL", &v)?;
        }
        if let Some(v) = lookup("SESSION_SWEEP_INTERVAL") {
            self.session.sweep_interval_secs = parse_env("SESSION_SWEEP_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("CONVERSATION_WINDOW_MAX_TURNS") {
            self.conversation.window_max_turns = parse_env("CONVERSATION_WINDOW_MAX_TURNS", &v)?;
        }
        if let Some(v) = lookup("TOOL_SERVER_ENDPOINTS") {
            self.tool_servers.endpoints = parse_endpoints(&v);
        }
        if let Some(v) = lookup("TOOL_SERVER_MAX_ATTEMPTS") {
            self.tool_servers.max_attempts = parse_env("TOOL_SERVER_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("TOOL_SERVER_RETRY_DELAY") {
            self.tool_servers.retry_delay_secs = parse_env("TOOL_SERVER_RETRY_DELAY", &v)?;
        }

        if self.inference.api_key.is_none() {
            self.inference.api_key = lookup("SWITCHBOARD_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(provider) = lookup("SWITCHBOARD_PROVIDER") {
            self.inference.provider = provider;
        }
        if let Some(model) = lookup("SWITCHBOARD_MODEL") {
            self.inference.model = model;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".switchboard")
    }

    /// Default config file: `config_dir()/config.toml`.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.ttl_minutes == 0 || self.session.ttl_minutes > MAX_TTL_MINUTES {
            return Err(ConfigError::ValidationError(format!(
                "session.ttl_minutes must be between 1 and {MAX_TTL_MINUTES}"
            )));
        }

        if self.session.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session.sweep_interval_secs must be at least 1".into(),
            ));
        }

        if self.conversation.window_max_turns < 2 {
            return Err(ConfigError::ValidationError(
                "conversation.window_max_turns must hold at least one user/assistant pair".into(),
            ));
        }

        if self.tool_servers.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "tool_servers.max_attempts must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.tool_servers.endpoints {
            if endpoint.id.is_empty() || endpoint.id.contains(QUALIFIED_SEPARATOR) {
                return Err(ConfigError::ValidationError(format!(
                    "tool server id '{}' must be non-empty and must not contain '{}'",
                    endpoint.id, QUALIFIED_SEPARATOR
                )));
            }
            if !seen.insert(endpoint.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool server id '{}'",
                    endpoint.id
                )));
            }
        }

        if self.inference.temperature < 0.0 || self.inference.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "inference.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.into(),
            value: value.into(),
        })
}

/// Parse `TOOL_SERVER_ENDPOINTS`. Entries without an explicit id get
/// `server-N` by position (1-based).
fn parse_endpoints(raw: &str) -> Vec<EndpointConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once('=') {
            Some((id, url)) if !id.contains("://") => EndpointConfig {
                id: id.trim().to_string(),
                url: url.trim().to_string(),
            },
            _ => EndpointConfig {
                id: format!("server-{}", i + 1),
                url: entry.to_string(),
            },
        })
        .collect()
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.ttl_minutes, 60);
        assert_eq!(config.conversation.window_max_turns, 20);
        assert_eq!(config.tool_servers.max_attempts, 5);
        assert!(config.tool_servers.endpoints.is_empty());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.inference.provider, config.inference.provider);
        assert_eq!(parsed.gateway.port, config.gateway.port);
    }

    #[test]
    fn endpoints_parse_from_toml() {
        let toml_str = r#"
[tool_servers]
max_attempts = 3
retry_delay_secs = 1

[[tool_servers.endpoints]]
id = "weather"
url = "http://localhost:8001/mcp"

[[tool_servers.endpoints]]
id = "search"
url = "http://localhost:8002/mcp"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tool_servers.endpoints.len(), 2);
        assert_eq!(config.tool_servers.endpoints[0].id, "weather");
        assert_eq!(config.tool_servers.max_attempts, 3);
        assert_eq!(config.tool_servers.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.tool_servers.call_timeout_secs, 30);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(env(&[
                ("SESSION_TTL", "15"),
                ("SESSION_SWEEP_INTERVAL", "30"),
                ("CONVERSATION_WINDOW_MAX_TURNS", "4"),
                ("TOOL_SERVER_MAX_ATTEMPTS", "2"),
                ("TOOL_SERVER_RETRY_DELAY", "5"),
                ("OPENAI_API_KEY", "sk-test"),
            ]))
            .unwrap();

        assert_eq!(config.session.ttl(), Duration::from_secs(15 * 60));
        assert_eq!(config.session.sweep_interval_secs, 30);
        assert_eq!(config.conversation.window_max_turns, 4);
        assert_eq!(config.tool_servers.max_attempts, 2);
        assert_eq!(config.tool_servers.retry_delay_secs, 5);
        assert_eq!(config.inference.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn api_key_precedence() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(env(&[
                ("OPENAI_API_KEY", "openai"),
                ("SWITCHBOARD_API_KEY", "switchboard"),
            ]))
            .unwrap();
        assert_eq!(config.inference.api_key.as_deref(), Some("switchboard"));
    }

    #[test]
    fn endpoint_list_accepts_named_and_bare_entries() {
        let endpoints =
            parse_endpoints("weather=http://localhost:8001/mcp, http://localhost:8002/mcp ,");
        assert_eq!(
            endpoints,
            vec![
                EndpointConfig {
                    id: "weather".into(),
                    url: "http://localhost:8001/mcp".into(),
                },
                EndpointConfig {
                    id: "server-2".into(),
                    url: "http://localhost:8002/mcp".into(),
                },
            ]
        );
    }

    #[test]
    fn bare_url_with_query_string_keeps_whole_url() {
        let endpoints = parse_endpoints("http://localhost:8003/mcp?token=abc");
        assert_eq!(endpoints[0].id, "server-1");
        assert_eq!(endpoints[0].url, "http://localhost:8003/mcp?token=abc");
    }

    #[test]
    fn invalid_env_value_is_reported() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env_overrides(env(&[("SESSION_TTL", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "SESSION_TTL"));
    }

    #[test]
    fn huge_session_ttl_rejected() {
        let mut config = AppConfig::default();
        config
            .apply_env_overrides(env(&[("SESSION_TTL", "1000000000000")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.session.ttl_minutes = MAX_TTL_MINUTES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ttl_conversion_saturates() {
        let session = SessionConfig {
            ttl_minutes: u64::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(session.ttl(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.inference.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn window_budget_below_one_pair_rejected() {
        let mut config = AppConfig::default();
        config.conversation.window_max_turns = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_or_separator_endpoint_ids_rejected() {
        let mut config = AppConfig::default();
        config.tool_servers.endpoints = vec![
            EndpointConfig {
                id: "a".into(),
                url: "http://a".into(),
            },
            EndpointConfig {
                id: "a".into(),
                url: "http://b".into(),
            },
        ];
        assert!(config.validate().is_err());

        config.tool_servers.endpoints = vec![EndpointConfig {
            id: "bad__id".into(),
            url: "http://a".into(),
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.inference.provider, "openrouter");
    }

    #[test]
    fn load_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nttl_minutes = 0\n").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut config = AppConfig::default();
        config.inference.api_key = Some("sk-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter"));
        assert!(toml_str.contains("ttl_minutes"));
    }
}
