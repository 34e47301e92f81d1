//! Simulator configuration

use std::path::Path;

use canbadger_proto::{ProbeSettings, StatusBit, StatusBits, COMMAND_PORT};
use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Complete simulator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Probe id reported in the settings blob
    #[serde(default = "default_id")]
    pub id: String,

    /// Address the command socket binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub uds: UdsSimConfig,

    /// Files present on the simulated SD card at start, path -> content
    #[serde(default)]
    pub sd_files: Vec<SdFile>,
}

fn default_id() -> String {
    "cb_sim".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    COMMAND_PORT
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            bind_address: default_bind_address(),
            command_port: default_command_port(),
            logging: LoggingConfig::default(),
            uds: UdsSimConfig::default(),
            sd_files: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SimError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| SimError::Config(e.to_string()))
    }

    /// Settings the simulated probe starts with
    pub fn initial_settings(&self) -> ProbeSettings {
        let mut status = StatusBits::default();
        for bit in [
            StatusBit::SdEnabled,
            StatusBit::EthernetEnabled,
            StatusBit::Can1IntEnabled,
            StatusBit::Can2IntEnabled,
        ] {
            status.set(bit, true);
        }
        ProbeSettings {
            id: self.id.clone(),
            ip: self.bind_address.as_bytes().to_vec(),
            status,
            spi_speed: 2_000_000,
            can1_speed: 500_000,
            can2_speed: 500_000,
            kline1_speed: 10_400,
            kline2_speed: 10_400,
        }
    }
}

/// Random traffic streamed while logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_id_low")]
    pub id_low: u32,
    #[serde(default = "default_id_high")]
    pub id_high: u32,
}

fn default_interval_ms() -> u64 {
    10
}

fn default_id_low() -> u32 {
    0x7F0
}

fn default_id_high() -> u32 {
    0x7FF
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            id_low: default_id_low(),
            id_high: default_id_high(),
        }
    }
}

/// How the simulated ECU behind the probe answers UDS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdsSimConfig {
    /// Grant session starts and hijacks; NACK them otherwise
    #[serde(default = "default_true")]
    pub accept_sessions: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UdsSimConfig {
    fn default() -> Self {
        Self {
            accept_sessions: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdFile {
    pub path: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
id = "bench"
command_port = 0

[uds]
accept_sessions = false

[[sd_files]]
path = "/MITM/rules.txt"
content = "0"
"#
        )
        .unwrap();

        let config = SimConfig::load(file.path()).unwrap();
        assert_eq!(config.id, "bench");
        assert_eq!(config.command_port, 0);
        assert!(!config.uds.accept_sessions);
        assert_eq!(config.sd_files.len(), 1);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_initial_settings_encode() {
        let settings = SimConfig::default().initial_settings();
        assert!(settings.status.get(StatusBit::SdEnabled));
        assert_eq!(ProbeSettings::parse(&settings.encode().unwrap()).unwrap(), settings);
    }
}
