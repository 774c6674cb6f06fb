use crate::error::{ApiError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Client key used when neither the peer address nor a forwarded-for
/// header is available.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Raw policy settings as they appear in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Admission ceiling per window
    pub max_requests: u32,
    /// Namespace prepended to the client key
    pub key_prefix: String,
    /// Message returned with 429 responses
    pub message: String,
}

impl PolicyConfig {
    /// 100 requests per 15 minutes
    pub fn standard() -> Self {
        Self {
            window_ms: 15 * 60 * 1000,
            max_requests: 100,
            key_prefix: "rl:".to_string(),
            message: "Too many requests, please try again later".to_string(),
        }
    }

    /// 10 requests per 15 minutes, for login and bulk operations
    pub fn strict() -> Self {
        Self {
            window_ms: 15 * 60 * 1000,
            max_requests: 10,
            key_prefix: "rl:strict:".to_string(),
            message: "Too many attempts, please try again later".to_string(),
        }
    }

    /// 60 requests per minute
    pub fn api() -> Self {
        Self {
            window_ms: 60 * 1000,
            max_requests: 60,
            key_prefix: "rl:api:".to_string(),
            message: "API rate limit exceeded, please slow down".to_string(),
        }
    }

    /// Reject zero windows and zero ceilings
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            return Err(ApiError::Config(format!(
                "Rate limit window must be > 0 for policy: {}",
                name
            )));
        }
        if self.max_requests == 0 {
            return Err(ApiError::Config(format!(
                "Rate limit requests must be > 0 for policy: {}",
                name
            )));
        }
        Ok(())
    }
}

/// A validated, immutable rate limit policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    config: PolicyConfig,
}

impl Policy {
    /// Build a policy, rejecting invalid settings
    pub fn new(name: impl Into<String>, config: PolicyConfig) -> Result<Self> {
        let name = name.into();
        config.validate(&name)?;
        Ok(Self { name, config })
    }

    pub fn standard() -> Self {
        Self {
            name: "standard".to_string(),
            config: PolicyConfig::standard(),
        }
    }

    pub fn strict() -> Self {
        Self {
            name: "strict".to_string(),
            config: PolicyConfig::strict(),
        }
    }

    pub fn api() -> Self {
        Self {
            name: "api".to_string(),
            config: PolicyConfig::api(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window_ms(&self) -> u64 {
        self.config.window_ms
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.config.window_ms)
    }

    pub fn max_requests(&self) -> u32 {
        self.config.max_requests
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }

    pub fn message(&self) -> &str {
        &self.config.message
    }

    /// Seconds a rejected client should wait: `ceil(window_ms / 1000)`
    pub fn retry_after_secs(&self) -> u64 {
        self.config.window_ms.div_ceil(1000)
    }

    /// Storage key for a client under this policy
    pub fn key_for(&self, client_key: &str) -> String {
        format!("{}{}", self.config.key_prefix, client_key)
    }
}

/// Outcome of a single check-and-increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Requests observed in the current window, including this one
    pub count: u64,
    /// The policy ceiling
    pub limit: u32,
    /// Requests left before rejection starts
    pub remaining: u64,
    /// End of the current window
    pub reset_at: DateTime<Utc>,
}

impl Decision {
    /// Derive a decision from an observed count
    pub fn from_count(count: u64, limit: u32, reset_at_ms: u64) -> Self {
        Self {
            admitted: count <= u64::from(limit),
            count,
            limit,
            remaining: u64::from(limit).saturating_sub(count),
            reset_at: datetime_from_millis(reset_at_ms),
        }
    }

    /// Admit without counting. Used when the shared store fails mid-check.
    pub fn fail_open(policy: &Policy, now_ms: u64) -> Self {
        Self {
            admitted: true,
            count: 0,
            limit: policy.max_requests(),
            remaining: u64::from(policy.max_requests()),
            reset_at: datetime_from_millis(now_ms.saturating_add(policy.window_ms())),
        }
    }
}

/// Which backend the limiter is currently consulting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BackendState {
    /// No shared store configured; local forever
    Unconfigured = 0,
    /// Handshake with the shared store in progress
    Connecting = 1,
    /// Shared store reachable and in use
    SharedActive = 2,
    /// Shared store failed; local backend in use
    DegradedLocal = 3,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Unconfigured => "unconfigured",
            BackendState::Connecting => "connecting",
            BackendState::SharedActive => "shared_active",
            BackendState::DegradedLocal => "degraded_local",
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => BackendState::Unconfigured,
            1 => BackendState::Connecting,
            2 => BackendState::SharedActive,
            _ => BackendState::DegradedLocal,
        }
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the client key for a request.
///
/// With `trust_proxy` the first `X-Forwarded-For` entry wins; otherwise the
/// socket peer is preferred and the header is only a fallback. The result is
/// never empty.
pub fn client_key(peer: Option<IpAddr>, forwarded_for: Option<&str>, trust_proxy: bool) -> String {
    let forwarded = forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if trust_proxy {
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|ip| ip.to_string())
        .or_else(|| forwarded.map(str::to_string))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub(crate) fn datetime_from_millis(ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(i64::try_from(ms).unwrap_or(i64::MAX)).unwrap_or_default()
}
