//! Transport configuration.
//!
//! Values come from three layers, later layers winning: built-in defaults,
//! an optional TOML file, and `TETHER_*` environment variables.
//!
//! ```toml
//! idle_timeout_ms = 15000
//! handshake_timeout_ms = 15000
//! max_sessions_per_connection = 128
//! prefer_nonblocking_io = true
//!
//! [accept]
//! burst_window_ms = 5000
//! burst_threshold = 10
//! cooldown_ms = 10000
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`TransportConfig::idle_timeout_ms`].
pub const ENV_IDLE_TIMEOUT_MS: &str = "TETHER_IDLE_TIMEOUT_MS";
/// Environment variable overriding [`TransportConfig::handshake_timeout_ms`].
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "TETHER_HANDSHAKE_TIMEOUT_MS";
/// Environment variable overriding
/// [`TransportConfig::max_sessions_per_connection`].
pub const ENV_MAX_SESSIONS_PER_CONNECTION: &str = "TETHER_MAX_SESSIONS_PER_CONNECTION";
/// Environment variable overriding [`TransportConfig::prefer_nonblocking_io`].
pub const ENV_PREFER_NONBLOCKING_IO: &str = "TETHER_PREFER_NONBLOCKING_IO";
/// Environment variable overriding [`AcceptConfig::burst_window_ms`].
pub const ENV_ACCEPT_BURST_WINDOW_MS: &str = "TETHER_ACCEPT_BURST_WINDOW_MS";
/// Environment variable overriding [`AcceptConfig::burst_threshold`].
pub const ENV_ACCEPT_BURST_THRESHOLD: &str = "TETHER_ACCEPT_BURST_THRESHOLD";
/// Environment variable overriding [`AcceptConfig::cooldown_ms`].
pub const ENV_ACCEPT_COOLDOWN_MS: &str = "TETHER_ACCEPT_COOLDOWN_MS";

/// Upper bound on sessions per connection imposed by the mux id space.
pub const MAX_SESSIONS_LIMIT: u32 = 65_536;

/// Transport-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    /// How long a pooled connection may sit idle before it is closed.
    ///
    /// The reaper sweeps every half timeout, so an idle connection is closed
    /// after more than this and at most one and a half times this.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Bound on TCP connect, TLS handshake and mux handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Concurrent sessions allowed on one connection.
    #[serde(default = "default_max_sessions_per_connection")]
    pub max_sessions_per_connection: u32,

    /// Use the runtime's nonblocking sockets for bind and connect. When
    /// `false`, sockets are created with blocking calls on the blocking pool
    /// and converted afterwards.
    #[serde(default = "default_prefer_nonblocking_io")]
    pub prefer_nonblocking_io: bool,

    /// Accept loop throttling.
    #[serde(default)]
    pub accept: AcceptConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_sessions_per_connection: default_max_sessions_per_connection(),
            prefer_nonblocking_io: default_prefer_nonblocking_io(),
            accept: AcceptConfig::default(),
        }
    }
}

/// Accept-failure burst throttling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptConfig {
    /// Length of the failure-counting window.
    #[serde(default = "default_burst_window_ms")]
    pub burst_window_ms: u64,

    /// Failures inside one window that trigger a cooldown.
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,

    /// Pause applied once the threshold is reached.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            burst_window_ms: default_burst_window_ms(),
            burst_threshold: default_burst_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl AcceptConfig {
    /// Window length as a [`Duration`].
    #[must_use]
    pub const fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    /// Cooldown as a [`Duration`].
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

const fn default_idle_timeout_ms() -> u64 {
    15_000
}

const fn default_handshake_timeout_ms() -> u64 {
    15_000
}

const fn default_max_sessions_per_connection() -> u32 {
    128
}

const fn default_prefer_nonblocking_io() -> bool {
    true
}

const fn default_burst_window_ms() -> u64 {
    5_000
}

const fn default_burst_threshold() -> u32 {
    10
}

const fn default_cooldown_ms() -> u64 {
    10_000
}

impl TransportConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable does not parse or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `TETHER_*` overrides obtained through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a value does not parse or the
    /// resulting configuration is invalid.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, ENV_IDLE_TIMEOUT_MS, &mut self.idle_timeout_ms)?;
        override_from(&lookup, ENV_HANDSHAKE_TIMEOUT_MS, &mut self.handshake_timeout_ms)?;
        override_from(
            &lookup,
            ENV_MAX_SESSIONS_PER_CONNECTION,
            &mut self.max_sessions_per_connection,
        )?;
        override_from(&lookup, ENV_PREFER_NONBLOCKING_IO, &mut self.prefer_nonblocking_io)?;
        override_from(&lookup, ENV_ACCEPT_BURST_WINDOW_MS, &mut self.accept.burst_window_ms)?;
        override_from(&lookup, ENV_ACCEPT_BURST_THRESHOLD, &mut self.accept.burst_threshold)?;
        override_from(&lookup, ENV_ACCEPT_COOLDOWN_MS, &mut self.accept.cooldown_ms)?;
        self.validate()
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "idle_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "handshake_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_sessions_per_connection == 0
            || self.max_sessions_per_connection > MAX_SESSIONS_LIMIT
        {
            return Err(ConfigError::Validation(format!(
                "max_sessions_per_connection must be in 1..={MAX_SESSIONS_LIMIT}, got {}",
                self.max_sessions_per_connection
            )));
        }
        if self.accept.burst_threshold == 0 {
            return Err(ConfigError::Validation(
                "accept.burst_threshold must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Idle timeout as a [`Duration`].
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn override_from<F, T>(lookup: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::Validation(format!("{name}={raw}: {e}")))?;
    }
    Ok(())
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(15));
        assert_eq!(config.max_sessions_per_connection, 128);
        assert!(config.prefer_nonblocking_io);
        assert_eq!(config.accept.burst_window(), Duration::from_secs(5));
        assert_eq!(config.accept.burst_threshold, 10);
        assert_eq!(config.accept.cooldown(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r"
            idle_timeout_ms = 500

            [accept]
            cooldown_ms = 20
        ";
        let config = TransportConfig::from_toml(toml).unwrap();
        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.handshake_timeout_ms, 15_000);
        assert_eq!(config.accept.cooldown_ms, 20);
        assert_eq!(config.accept.burst_threshold, 10);
    }

    #[test]
    fn test_roundtrip_toml() {
        let mut config = TransportConfig::default();
        config.prefer_nonblocking_io = false;
        let text = config.to_toml().unwrap();
        assert_eq!(TransportConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_sessions_per_connection = 2").unwrap();
        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_sessions_per_connection, 2);
    }

    #[test]
    fn test_missing_file() {
        let err = TransportConfig::from_file(Path::new("/nonexistent/tether.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_reject_zero_sessions() {
        let err = TransportConfig::from_toml("max_sessions_per_connection = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_IDLE_TIMEOUT_MS, "250"),
            (ENV_PREFER_NONBLOCKING_IO, "false"),
            (ENV_ACCEPT_BURST_THRESHOLD, " 3 "),
        ]
        .into_iter()
        .collect();

        let mut config = TransportConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.idle_timeout_ms, 250);
        assert!(!config.prefer_nonblocking_io);
        assert_eq!(config.accept.burst_threshold, 3);
        assert_eq!(config.handshake_timeout_ms, 15_000);
    }

    #[test]
    fn test_env_override_parse_error() {
        let mut config = TransportConfig::default();
        let err = config
            .apply_overrides(|name| (name == ENV_HANDSHAKE_TIMEOUT_MS).then(|| "soon".to_string()))
            .unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains(ENV_HANDSHAKE_TIMEOUT_MS)),
            other => panic!("Expected ConfigError::Validation, got {other:?}"),
        }
    }
}
