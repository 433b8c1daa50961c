//! Client configuration
//!
//! [`ConnectOptions`] can be built in code with chained setters or loaded from a TOML
//! file. Durations are stored as millisecond integers so the file format stays flat.
//! Credentials named through `*_env` fields are resolved at connect time.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// What `publish` does when the outbound buffer is at its ceiling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Block the publishing thread until the engine drains enough bytes
    #[default]
    Block,
    /// Return `BufferFull` immediately
    FailFast,
}

/// Reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// First backoff delay; doubled on every attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    25
}

fn default_max_delay_ms() -> u64 {
    4000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Backoff before `attempt` (1-based): `min(base * 2^(attempt-1), max)`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Sum of all backoff delays, or None if retries are unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .fold(0u64, u64::saturating_add)
        })
    }
}

/// Options for [`crate::Client::connect`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectOptions {
    /// Server used by [`crate::Client::connect_with_options`]
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Client name reported in CONNECT
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Time allowed for a PONG before the connection is considered stale
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Deadline used by `flush()` without an explicit timeout
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    #[serde(default = "default_outbound_ceiling_bytes")]
    pub outbound_ceiling_bytes: usize,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
    /// Written publishes awaiting a PONG are kept for replay after a reconnect;
    /// once they reach this many bytes, writing pauses until the server catches up
    #[serde(default = "default_max_unacked_bytes")]
    pub max_unacked_bytes: usize,
    /// Queued messages per subscription before new ones are dropped
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
    #[serde(default)]
    pub no_echo: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    /// Enter Reconnecting instead of failing when the first connection fails
    #[serde(default)]
    pub retry_on_initial_connect: bool,
    #[serde(default = "default_inbox_prefix")]
    pub inbox_prefix: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub user_env: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_server_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

/// Upper bound for every `*_ms` setting (30 days)
pub const MAX_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Saturating conversion for the builder methods; `validate` rejects the result
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_ping_interval_ms() -> u64 {
    60_000
}

fn default_ping_timeout_ms() -> u64 {
    10_000
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_ceiling_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_unacked_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_subscription_capacity() -> usize {
    65_536
}

fn default_inbox_prefix() -> String {
    "_INBOX".to_string()
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            name: None,
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            outbound_ceiling_bytes: default_outbound_ceiling_bytes(),
            backpressure: BackpressurePolicy::default(),
            max_unacked_bytes: default_max_unacked_bytes(),
            subscription_capacity: default_subscription_capacity(),
            no_echo: false,
            verbose: false,
            pedantic: false,
            retry_on_initial_connect: false,
            inbox_prefix: default_inbox_prefix(),
            token: None,
            token_env: None,
            user: None,
            password: None,
            user_env: None,
            password_env: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Credentials sent in CONNECT
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a TOML file and validate them
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let options: ConnectOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounded = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("flush_timeout_ms", self.flush_timeout_ms),
            ("reconnect.max_delay_ms", self.reconnect.max_delay_ms),
        ];
        if let Some((field, _)) = bounded.iter().find(|(_, value)| *value > MAX_DURATION_MS) {
            return Err(ConfigError::InvalidConfig(format!(
                "{field} must not exceed {MAX_DURATION_MS}"
            )));
        }
        let non_zero = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("flush_timeout_ms", self.flush_timeout_ms),
            ("outbound_ceiling_bytes", self.outbound_ceiling_bytes as u64),
            ("max_unacked_bytes", self.max_unacked_bytes as u64),
            ("subscription_capacity", self.subscription_capacity as u64),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "{field} must be greater than 0"
            )));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or unset for unlimited".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must not be below reconnect.base_delay_ms".to_string(),
            ));
        }
        if self.inbox_prefix.is_empty() || self.inbox_prefix.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidConfig(format!(
                "invalid inbox_prefix: {:?}",
                self.inbox_prefix
            )));
        }
        Ok(())
    }

    /// Resolve inline and environment-provided credentials
    pub fn resolve_credentials(&self) -> Result<Credentials, ConfigError> {
        Ok(Credentials {
            token: Self::inline_or_env(&self.token, &self.token_env)?,
            user: Self::inline_or_env(&self.user, &self.user_env)?,
            password: Self::inline_or_env(&self.password, &self.password_env)?,
        })
    }

    fn inline_or_env(
        inline: &Option<String>,
        env_name: &Option<String>,
    ) -> Result<Option<String>, ConfigError> {
        match (inline, env_name) {
            (Some(value), _) => Ok(Some(value.clone())),
            (None, Some(name)) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            (None, None) => Ok(None),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn with_server_url<S: Into<String>>(mut self, url: S) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = millis(interval);
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = millis(timeout);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = millis(timeout);
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout_ms = millis(timeout);
        self
    }

    pub fn with_outbound_ceiling(mut self, bytes: usize) -> Self {
        self.outbound_ceiling_bytes = bytes;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_max_unacked_bytes(mut self, bytes: usize) -> Self {
        self.max_unacked_bytes = bytes;
        self
    }

    pub fn with_subscription_capacity(mut self, messages: usize) -> Self {
        self.subscription_capacity = messages;
        self
    }

    pub fn with_no_echo(mut self) -> Self {
        self.no_echo = true;
        self
    }

    pub fn with_retry_on_initial_connect(mut self) -> Self {
        self.retry_on_initial_connect = true;
        self
    }

    pub fn with_inbox_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user_and_password<U: Into<String>, P: Into<String>>(
        mut self,
        user: U,
        password: P,
    ) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect.base_delay_ms = millis(base);
        self.reconnect.max_delay_ms = millis(max);
        self
    }
}
