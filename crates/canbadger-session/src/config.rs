//! Client configuration
//!
//! Loaded from TOML. Every section is optional:
//!
//! ```toml
//! [probe]
//! address = "192.168.0.42"
//! reply_port = 15555
//!
//! [ack]
//! type = "resend"
//! timeout_ms = 500
//! attempts = 3
//!
//! [capture]
//! channel_capacity = 4096
//! ```

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use canbadger_proto::COMMAND_PORT;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::TransportError;

/// Range the reply port is drawn from when none is configured
pub const REPLY_PORT_RANGE: std::ops::RangeInclusive<u16> = 10000..=13372;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub session: SessionOptions,
    #[serde(default)]
    pub ack: AckPolicy,
    #[serde(default)]
    pub replay: ReplayPolicy,
    #[serde(default)]
    pub capture: CaptureConfig,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

// =============================================================================
// Probe Link
// =============================================================================

/// Where the probe lives and how to listen for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe IP address or hostname
    #[serde(default = "default_address")]
    pub address: String,
    /// Probe command port
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    /// Local reply port; drawn at random when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_port: Option<u16>,
    /// Local address the reply socket binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    COMMAND_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            command_port: default_command_port(),
            reply_port: None,
            bind_address: default_bind_address(),
        }
    }
}

impl ProbeConfig {
    pub fn probe_addr(&self) -> Result<SocketAddr, TransportError> {
        if let Ok(ip) = self.address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.command_port));
        }
        (self.address.as_str(), self.command_port)
            .to_socket_addrs()
            .map_err(|e| TransportError::InvalidConfig(format!("probe '{}': {e}", self.address)))?
            .next()
            .ok_or_else(|| {
                TransportError::InvalidConfig(format!("probe '{}' did not resolve", self.address))
            })
    }

    pub fn random_reply_port() -> u16 {
        rand::thread_rng().gen_range(REPLY_PORT_RANGE)
    }
}

/// Behaviour of the sans-IO session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Ask for the settings blob as soon as the probe answers CONNECT
    #[serde(default = "default_true")]
    pub request_settings_on_connect: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_settings_on_connect: true,
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// How the client waits for the probe to acknowledge a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AckPolicy {
    /// Wait indefinitely
    #[default]
    Wait,
    /// Give up after `timeout_ms` of silence
    Timeout { timeout_ms: u64 },
    /// Re-send the last command after `timeout_ms` of silence, `attempts` times
    Resend { timeout_ms: u64, attempts: u32 },
}

impl AckPolicy {
    /// Silence tolerated before the policy acts
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Wait => None,
            Self::Timeout { timeout_ms } | Self::Resend { timeout_ms, .. } => {
                Some(Duration::from_millis(*timeout_ms))
            }
        }
    }

    /// Re-sends allowed after the first timeout
    pub fn resends(&self) -> u32 {
        match self {
            Self::Resend { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPolicy {
    /// Advance the replay queue on NACK as well as ACK
    #[serde(default = "default_true")]
    pub advance_on_nack: bool,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            advance_on_nack: true,
        }
    }
}

/// Logging capture worker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Frames buffered between the worker and its consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long to wait for the probe to ACK a stop
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Start logging in bridge mode
    #[serde(default)]
    pub bridge_mode: bool,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_stop_grace_ms() -> u64 {
    500
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            stop_grace_ms: default_stop_grace_ms(),
            bridge_mode: false,
        }
    }
}

impl CaptureConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClientConfig::from_toml("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.probe.command_port, 13371);
        assert_eq!(config.ack, AckPolicy::Wait);
        assert!(config.replay.advance_on_nack);
        assert!(config.session.request_settings_on_connect);
        assert_eq!(config.capture.channel_capacity, 1024);
    }

    #[test]
    fn test_ack_policy_variants() {
        let config = ClientConfig::from_toml(
            r#"
            [ack]
            type = "resend"
            timeout_ms = 250
            attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.ack,
            AckPolicy::Resend {
                timeout_ms: 250,
                attempts: 3
            }
        );
        assert_eq!(config.ack.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.ack.resends(), 3);

        let config = ClientConfig::from_toml("[ack]\ntype = \"timeout\"\ntimeout_ms = 100\n").unwrap();
        assert_eq!(config.ack.resends(), 0);
        assert_eq!(AckPolicy::Wait.timeout(), None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[probe]\naddress = \"10.0.0.123\"\nreply_port = 15555\n\n[replay]\nadvance_on_nack = false"
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.probe.address, "10.0.0.123");
        assert_eq!(config.probe.reply_port, Some(15555));
        assert!(!config.replay.advance_on_nack);
        assert_eq!(
            config.probe.probe_addr().unwrap(),
            "10.0.0.123:13371".parse().unwrap()
        );
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            ClientConfig::load(Path::new("/nonexistent/canbadger.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_random_reply_port_in_range() {
        for _ in 0..100 {
            assert!(REPLY_PORT_RANGE.contains(&ProbeConfig::random_reply_port()));
        }
    }
}
