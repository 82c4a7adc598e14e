//! Harness configuration.
//!
//! Configuration is passed to [`Scenario::acquire()`](crate::scenario::Scenario::acquire)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use conformance_harness::config::{HarnessConfig, UserConfig};
//!
//! let config = HarnessConfig {
//!     users: vec![
//!         UserConfig::for_testing("U1", "user1"),
//!         UserConfig::for_testing("U2", "user2"),
//!     ],
//!     ..HarnessConfig::for_testing()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! HarnessConfig
//! ├── server: ServerConfig         # SUT host, protocol version, domain
//! ├── device: DeviceConfig         # Device id/type sent with every exchange
//! ├── users: Vec<UserConfig>       # Identities; the first is primary
//! ├── poll: PollSettings           # Retry-poll count, interval, deadline
//! ├── transport: TransportConfig   # Transport retry and exchange timeout
//! ├── rate_limit: RateLimitSettings
//! └── cursor: CursorConfig         # Optional SQLite cursor ledger
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "server": { "host": "sut01.contoso.com", "domain": "contoso.com", "protocol_version": "16.1" },
//!   "users": [
//!     { "label": "U1", "user_name": "user1", "password": "Password01!" },
//!     { "label": "U2", "user_name": "user2", "password": "Password01!" }
//!   ],
//!   "poll": { "retry_count": 30, "wait_time": "3s" },
//!   "cursor": { "sqlite_path": "/var/lib/harness/cursors.db" }
//! }
//! ```

use crate::error::{HarnessError, Result};
use crate::poll::PollConfig;
use crate::protocol::{ClientContext, Credentials, Owner};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to Scenario::acquire()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    /// Identities scenarios may act as. The first one is primary.
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub poll: PollSettings,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub cursor: CursorConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            device: DeviceConfig::default(),
            users: Vec::new(),
            poll: PollSettings::default(),
            transport: TransportConfig::default(),
            rate_limit: RateLimitSettings::default(),
            cursor: CursorConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Two identities against the memory server, fast polling, no persistence.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            device: DeviceConfig::default(),
            users: vec![
                UserConfig::for_testing("U1", "user1"),
                UserConfig::for_testing("U2", "user2"),
            ],
            poll: PollSettings::for_testing(),
            transport: TransportConfig::for_testing(),
            rate_limit: RateLimitSettings::default(),
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| HarnessError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| HarnessError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations a scenario cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.users.is_empty() {
            return Err(HarnessError::Config("at least one user is required".to_string()));
        }
        let mut labels = HashSet::new();
        for user in &self.users {
            if user.label.is_empty() || user.user_name.is_empty() {
                return Err(HarnessError::Config("user label and user_name must be set".to_string()));
            }
            if !labels.insert(user.label.as_str()) {
                return Err(HarnessError::Config(format!("duplicate user label {}", user.label)));
            }
        }
        if self.poll.retry_count == 0 {
            return Err(HarnessError::Config("poll.retry_count must be at least 1".to_string()));
        }
        for (field, value) in [
            ("poll.wait_time", Some(&self.poll.wait_time)),
            ("poll.deadline", self.poll.deadline.as_ref()),
            ("transport.initial_delay", Some(&self.transport.initial_delay)),
            ("transport.max_delay", Some(&self.transport.max_delay)),
            ("transport.exchange_timeout", Some(&self.transport.exchange_timeout)),
        ] {
            if let Some(value) = value {
                humantime::parse_duration(value)
                    .map_err(|e| HarnessError::Config(format!("{} {:?}: {}", field, value, e)))?;
            }
        }
        if self.device.device_id.is_empty() {
            return Err(HarnessError::Config("device.device_id must be set".to_string()));
        }
        Ok(())
    }

    /// The first configured identity.
    pub fn primary(&self) -> Result<Owner> {
        self.users
            .first()
            .map(|u| Owner::new(u.label.clone()))
            .ok_or_else(|| HarnessError::Config("no users configured".to_string()))
    }

    pub fn identities(&self) -> Vec<(Owner, Credentials)> {
        self.users
            .iter()
            .map(|u| (Owner::new(u.label.clone()), u.credentials(&self.server.domain)))
            .collect()
    }

    pub fn user(&self, owner: &Owner) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.label == owner.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig / DeviceConfig: where and as what the harness connects
// ═══════════════════════════════════════════════════════════════════════════════

/// Server under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    /// Protocol version header value (e.g. "14.1", "16.1").
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// "https" or "http".
    #[serde(default = "default_transport")]
    pub transport: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_domain() -> String {
    "contoso.com".to_string()
}

fn default_protocol_version() -> String {
    "16.1".to_string()
}

fn default_transport() -> String {
    "https".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            domain: default_domain(),
            protocol_version: default_protocol_version(),
            transport: default_transport(),
        }
    }
}

/// Device identity sent with every exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Policy key from a prior Provision, if the server enforces one.
    #[serde(default)]
    pub policy_key: Option<String>,
}

fn default_device_id() -> String {
    "HARNESSDEVICE01".to_string()
}

fn default_device_type() -> String {
    "ConformanceHarness".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            device_type: default_device_type(),
            policy_key: None,
        }
    }
}

impl DeviceConfig {
    pub fn client_context(&self) -> ClientContext {
        ClientContext {
            device_id: self.device_id.clone(),
            device_type: self.device_type.clone(),
            policy_key: self.policy_key.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// UserConfig: one entry per identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a single identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Label scenarios refer to the identity by ("U1").
    pub label: String,

    pub user_name: String,

    #[serde(default)]
    pub password: String,

    /// Overrides `server.domain` for this user.
    #[serde(default)]
    pub domain: Option<String>,
}

impl UserConfig {
    /// A user accepted by the memory server.
    pub fn for_testing(label: &str, user_name: &str) -> Self {
        Self {
            label: label.to_string(),
            user_name: user_name.to_string(),
            password: crate::memory::DEFAULT_PASSWORD.to_string(),
            domain: None,
        }
    }

    pub fn credentials(&self, default_domain: &str) -> Credentials {
        Credentials {
            user_name: self.user_name.clone(),
            password: self.password.clone(),
            domain: self.domain.clone().unwrap_or_else(|| default_domain.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PollSettings: eventual-consistency polling
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry-poll settings for waiting on asynchronous server effects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    /// Maximum number of checks.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Sleep before each check, as a duration string (e.g., "3s").
    #[serde(default = "default_wait_time")]
    pub wait_time: String,

    /// Optional wall-clock cap on the whole poll (e.g., "2m").
    #[serde(default)]
    pub deadline: Option<String>,
}

fn default_retry_count() -> u32 {
    30
}

fn default_wait_time() -> String {
    "3s".to_string()
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            wait_time: default_wait_time(),
            deadline: None,
        }
    }
}

impl PollSettings {
    pub fn for_testing() -> Self {
        Self {
            retry_count: 5,
            wait_time: "10ms".to_string(),
            deadline: None,
        }
    }

    /// Parse the wait_time string to a Duration.
    pub fn wait_time_duration(&self) -> Duration {
        humantime::parse_duration(&self.wait_time).unwrap_or(Duration::from_secs(3))
    }

    pub fn deadline_duration(&self) -> Option<Duration> {
        self.deadline
            .as_deref()
            .and_then(|d| humantime::parse_duration(d).ok())
    }

    pub fn poll_config(&self) -> PollConfig {
        let config = PollConfig::new(self.retry_count, self.wait_time_duration());
        match self.deadline_duration() {
            Some(deadline) => config.with_deadline(deadline),
            None => config,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransportConfig / RateLimitSettings: exchange resilience
// ═══════════════════════════════════════════════════════════════════════════════

/// Transport retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,

    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Per-exchange timeout.
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout: String,
}

fn default_max_attempts() -> usize {
    4
}

fn default_initial_delay() -> String {
    "500ms".to_string()
}

fn default_max_delay() -> String {
    "10s".to_string()
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_exchange_timeout() -> String {
    "100s".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            exchange_timeout: default_exchange_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: "10ms".to_string(),
            max_delay: "100ms".to_string(),
            backoff_factor: 2.0,
            exchange_timeout: "500ms".to_string(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        let parse = |raw: &str, fallback: Duration| humantime::parse_duration(raw).unwrap_or(fallback);
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: parse(&self.initial_delay, defaults.initial_delay),
            max_delay: parse(&self.max_delay, defaults.max_delay),
            backoff_factor: self.backoff_factor,
            exchange_timeout: parse(&self.exchange_timeout, defaults.exchange_timeout),
        }
    }
}

/// Client-side throttling, to stay under the server's per-user budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Sustained exchanges per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub burst: u32,
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    20
}

fn default_rate_limit_burst() -> u32 {
    5
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            per_sec: default_rate_limit_per_sec(),
            burst: default_rate_limit_burst(),
        }
    }
}

impl RateLimitSettings {
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.enabled {
            Some(RateLimitConfig {
                burst_size: self.burst,
                refill_rate: self.per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: cursor ledger persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Cursor persistence configuration.
///
/// Without a path, cursors live only as long as the scenario.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CursorConfig {
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

impl CursorConfig {
    pub fn in_memory() -> Self {
        Self { sqlite_path: None }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_testing_is_valid() {
        let config = HarnessConfig::for_testing();
        assert!(config.validate().is_ok());
        assert_eq!(config.primary().unwrap(), Owner::from("U1"));
        assert_eq!(config.identities().len(), 2);
    }

    #[test]
    fn test_default_requires_users() {
        let err = HarnessConfig::default().validate().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(HarnessConfig::default().primary().is_err());
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let mut config = HarnessConfig::for_testing();
        config.users.push(UserConfig::for_testing("U1", "user3"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let mut config = HarnessConfig::for_testing();
        config.poll.wait_time = "soon".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll.wait_time"));

        let mut config = HarnessConfig::for_testing();
        config.poll.retry_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_settings_parsing() {
        let poll = PollSettings {
            retry_count: 10,
            wait_time: "250ms".to_string(),
            deadline: Some("1m".to_string()),
        };
        let config = poll.poll_config();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.deadline, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_poll_wait_time_invalid_fallback() {
        let poll = PollSettings {
            wait_time: "invalid".to_string(),
            ..PollSettings::default()
        };
        assert_eq!(poll.wait_time_duration(), Duration::from_secs(3));
        assert_eq!(poll.deadline_duration(), None);
    }

    #[test]
    fn test_transport_retry_config() {
        let retry = TransportConfig::default().retry_config();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.exchange_timeout, Duration::from_secs(100));

        let zero = TransportConfig {
            max_attempts: 0,
            ..TransportConfig::for_testing()
        };
        assert_eq!(zero.retry_config().max_attempts, 1);
    }

    #[test]
    fn test_rate_limit_settings() {
        assert!(RateLimitSettings::default().rate_limit_config().is_none());
        let enabled = RateLimitSettings {
            enabled: true,
            per_sec: 7,
            burst: 2,
        };
        let limit = enabled.rate_limit_config().unwrap();
        assert_eq!(limit.refill_rate, 7);
        assert_eq!(limit.burst_size, 2);
    }

    #[test]
    fn test_user_domain_override() {
        let mut user = UserConfig::for_testing("U1", "user1");
        assert_eq!(user.credentials("contoso.com").domain, "contoso.com");
        user.domain = Some("fabrikam.com".to_string());
        assert_eq!(user.credentials("contoso.com").domain, "fabrikam.com");
    }

    #[test]
    fn test_minimal_json() {
        let config = HarnessConfig::from_json(
            r#"{ "users": [ { "label": "U1", "user_name": "user1", "password": "p" } ] }"#,
        )
        .unwrap();
        assert_eq!(config.poll.retry_count, 30);
        assert_eq!(config.poll.wait_time, "3s");
        assert_eq!(config.device.device_type, "ConformanceHarness");
        assert!(config.cursor.sqlite_path.is_none());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = HarnessConfig::for_testing();
        config.cursor.sqlite_path = Some("/tmp/cursors.db".to_string());
        config.device.policy_key = Some("123".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let parsed = HarnessConfig::from_json(&json).unwrap();

        assert_eq!(parsed.users.len(), 2);
        assert_eq!(parsed.users[1].label, "U2");
        assert_eq!(parsed.cursor.sqlite_path.as_deref(), Some("/tmp/cursors.db"));
        assert_eq!(parsed.device.client_context().policy_key.as_deref(), Some("123"));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        std::fs::write(&path, serde_json::to_string(&HarnessConfig::for_testing()).unwrap()).unwrap();
        assert!(HarnessConfig::from_json_file(&path).is_ok());
        assert!(HarnessConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
