use crate::error::{ApiError, Result};
use crate::rate_limit::{LimiterSettings, Policy, PolicyConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Redis connection URL; in-memory only when absent
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Bound on the Redis handshake and on each check
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Reconnection attempts after Redis fails
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Reconnection delay step
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Reconnection delay ceiling
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// How often expired in-memory records are swept
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Key clients by the first `X-Forwarded-For` entry
    #[serde(default)]
    pub trust_proxy: bool,
    /// Policy applied broadly
    #[serde(default = "PolicyConfig::standard")]
    pub standard: PolicyConfig,
    /// Policy for login and bulk operations
    #[serde(default = "PolicyConfig::strict")]
    pub strict: PolicyConfig,
    /// Policy for the versioned API
    #[serde(default = "PolicyConfig::api")]
    pub api: PolicyConfig,
}

/// The three named policies, validated
#[derive(Debug, Clone)]
pub struct Policies {
    pub standard: Policy,
    pub strict: Policy,
    pub api: Policy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            standard: Policy::standard(),
            strict: Policy::strict(),
            api: Policy::api(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_base_delay_ms() -> u64 {
    100
}

fn default_reconnect_max_delay_ms() -> u64 {
    3_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            trust_proxy: false,
            standard: PolicyConfig::standard(),
            strict: PolicyConfig::strict(),
            api: PolicyConfig::api(),
        }
    }
}

impl RateLimitingConfig {
    /// Runtime settings for the limiter
    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }

    /// Build the named policies
    pub fn policies(&self) -> Result<Policies> {
        Ok(Policies {
            standard: Policy::new("standard", self.standard.clone())?,
            strict: Policy::new("strict", self.strict.clone())?,
            api: Policy::new("api", self.api.clone())?,
        })
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ApiError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from `path` if it exists, otherwise start from defaults; then
    /// apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            Self::from_file(path)?
        } else {
            info!(
                "No configuration file at {}, using defaults",
                path.display()
            );
            Self::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HOST`, `PORT`, `REDIS_URL`, `RATE_LIMIT_WINDOW_MS`,
    /// `RATE_LIMIT_MAX_REQUESTS` and `TRUST_PROXY`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.rate_limiting.redis_url = Some(url).filter(|url| !url.is_empty());
        }
        if let Some(window) = lookup("RATE_LIMIT_WINDOW_MS") {
            self.rate_limiting.standard.window_ms = parse_env("RATE_LIMIT_WINDOW_MS", &window)?;
        }
        if let Some(max) = lookup("RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limiting.standard.max_requests = parse_env("RATE_LIMIT_MAX_REQUESTS", &max)?;
        }
        if let Some(trust) = lookup("TRUST_PROXY") {
            self.rate_limiting.trust_proxy = trust.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let limits = &self.rate_limiting;

        self.rate_limiting.policies()?;

        if limits.connect_timeout_ms == 0 {
            return Err(ApiError::Config(
                "Rate limit connect timeout must be > 0".to_string(),
            ));
        }
        if limits.sweep_interval_ms == 0 {
            return Err(ApiError::Config(
                "Rate limit sweep interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Socket address string to bind
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::Config(format!("Environment variable {} must be a number", key)))
}
