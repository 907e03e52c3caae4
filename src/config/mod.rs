//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipSettings,
    pub timers: TimerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipSettings {
    /// Registrar address override; when unset the profile's domain and
    /// port are resolved via DNS.
    pub registrar_addr: Option<SocketAddr>,
    /// Requested registration lifetime in seconds
    pub register_expires: u32,
    /// Port advertised in SDP audio offers
    pub audio_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    /// REGISTER transaction timeout per attempt (SIP timer F default, 32s)
    pub register_timeout_ms: u64,
    /// Maximum REGISTER sends before giving up
    pub register_max_attempts: u32,
    /// INVITE setup timeout (the original binding used 30s)
    pub call_setup_timeout_ms: u64,
    /// re-INVITE (hold/resume) timeout
    pub reinvite_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipSettings::default(),
            timers: TimerSettings::default(),
        }
    }
}

impl Default for SipSettings {
    fn default() -> Self {
        Self {
            registrar_addr: None,
            register_expires: 3600,
            audio_port: 5004,
        }
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            register_timeout_ms: 32_000,
            register_max_attempts: 3,
            call_setup_timeout_ms: 30_000,
            reinvite_timeout_ms: 30_000,
        }
    }
}

impl TimerSettings {
    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.register_timeout_ms)
    }

    pub fn call_setup_timeout(&self) -> Duration {
        Duration::from_millis(self.call_setup_timeout_ms)
    }

    pub fn reinvite_timeout(&self) -> Duration {
        Duration::from_millis(self.reinvite_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sip.register_expires, 3600);
        assert_eq!(config.timers.register_max_attempts, 3);
        assert_eq!(config.timers.register_timeout(), Duration::from_secs(32));
        assert_eq!(config.timers.call_setup_timeout(), Duration::from_secs(30));
        assert!(config.sip.registrar_addr.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [sip]
            registrar_addr = "127.0.0.1:5060"
            register_expires = 600

            [timers]
            register_timeout_ms = 50
            "#,
        )
        .unwrap();

        assert_eq!(
            config.sip.registrar_addr,
            Some("127.0.0.1:5060".parse().unwrap())
        );
        assert_eq!(config.sip.register_expires, 600);
        assert_eq!(config.timers.register_timeout_ms, 50);
        // Unspecified fields fall back to defaults
        assert_eq!(config.timers.register_max_attempts, 3);
    }
}
