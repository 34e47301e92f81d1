//! Configuration file handling for canbadger

use anyhow::{Context, Result};
use canbadger_session::{AckPolicy, ClientConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ack policy used when neither the config file nor `--timeout-ms` sets one
const DEFAULT_ACK: AckPolicy = AckPolicy::Resend {
    timeout_ms: 2000,
    attempts: 2,
};

/// Configuration for the CLI tool
///
/// The client sections (`[probe]`, `[ack]`, `[replay]`, `[capture]`) sit at
/// the top level next to the CLI's own keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    #[serde(flatten)]
    pub client: ClientConfig,
    /// Whether the file named an `[ack]` section
    #[serde(skip)]
    ack_configured: bool,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        let table: toml::Table = toml::from_str(content)?;
        config.ack_configured = table.contains_key("ack");
        Ok(config)
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("canbadger");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(&self, args: &ConnectArgs, no_color: bool) -> MergedConfig {
        let mut client = self.client.clone();
        if let Some(probe) = &args.probe {
            client.probe.address = probe.clone();
        }
        if let Some(port) = args.port {
            client.probe.command_port = port;
        }
        if args.reply_port.is_some() {
            client.probe.reply_port = args.reply_port;
        }
        client.ack = match args.timeout_ms {
            Some(timeout_ms) => AckPolicy::Resend {
                timeout_ms,
                attempts: args.resends,
            },
            None if self.ack_configured => self.client.ack,
            None => DEFAULT_ACK,
        };

        MergedConfig {
            client,
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Connection overrides taken from the command line
#[derive(Debug, Clone, Default)]
pub struct ConnectArgs {
    pub probe: Option<String>,
    pub port: Option<u16>,
    pub reply_port: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub resends: u32,
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub client: ClientConfig,
    pub no_color: bool,
}
