//! canbadger - command-line tool for the CanBadger CAN probe
//!
//! Talks to a probe (or `canbadger-sim`) over its UDP command port.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use canbadger_session::{create_transport, ClientConfig, ProbeClient};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::commands::rules::RuleArgs;
use crate::commands::uds::SessionArgs;
use crate::config::{Config, ConnectArgs};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "canbadger")]
#[command(author, version, about = "CanBadger CAN probe CLI")]
#[command(propagate_version = true)]
struct Cli {
    /// Probe address
    #[arg(short, long, env = "CANBADGER_PROBE")]
    probe: Option<String>,

    /// Probe command port
    #[arg(long, env = "CANBADGER_PORT")]
    port: Option<u16>,

    /// Local port the probe replies to (random when unset)
    #[arg(long)]
    reply_port: Option<u16>,

    /// Give up on a command after this many milliseconds of silence
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Re-sends before giving up (with --timeout-ms)
    #[arg(long, default_value = "2")]
    resends: u32,

    /// Configuration file path
    #[arg(short, long, env = "CANBADGER_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or change probe settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },

    /// Capture CAN traffic
    Log {
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Log in bridge mode
        #[arg(long)]
        bridge: bool,
    },

    /// Replay frames given as ID#DATA[*COUNT]
    Replay {
        #[arg(required = true)]
        frames: Vec<String>,

        /// CAN interface (1 or 2)
        #[arg(long, default_value = "1")]
        interface: u8,

        /// Sends per frame without an explicit *COUNT
        #[arg(long, default_value = "1")]
        count: u32,
    },

    /// UDS diagnostics through the probe
    Uds {
        #[command(flatten)]
        session: SessionArgs,

        #[command(subcommand)]
        action: UdsAction,
    },

    /// MITM rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// SD card files
    Sd {
        #[command(subcommand)]
        action: SdAction,
    },

    /// Set a relay output, or query both
    Gpio {
        /// GPIO number (1 or 2)
        number: Option<u8>,

        /// on or off
        #[arg(value_parser = parse_on_off)]
        state: Option<bool>,
    },

    /// Stop the current probe action
    Stop,

    /// Reset the probe
    Reset,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show the settings (default)
    Show {
        /// List every status bit
        #[arg(long)]
        bits: bool,
    },

    /// Send a key;value update (id, ip, can1_speed, a status bit name, ...)
    Set { key: String, value: String },

    /// Enable or disable one status bit
    SetBit {
        /// Bit name (e.g. CAN1_LOGGING) or position
        bit: String,

        /// on or off
        #[arg(value_parser = parse_on_off)]
        state: bool,
    },

    /// Persist settings to EEPROM
    Save {
        /// Settings file on the SD card
        #[arg(long)]
        file: Option<String>,
    },
}

#[derive(Subcommand)]
enum UdsAction {
    /// Open a diagnostic session
    StartSession,

    /// Send a raw request
    Request {
        /// Service id (hex)
        service: String,

        /// Request data (hex)
        data: Option<String>,
    },

    /// ReadDataByIdentifier
    ReadDid {
        /// Data identifier (hex)
        did: String,
    },

    /// ReadMemoryByAddress
    ReadMem {
        /// Start address (hex)
        address: String,

        /// Number of bytes
        length: u32,
    },

    /// Take over a session once a tester unlocks the ECU
    Hijack {
        /// Security access level to wait for
        #[arg(long, default_value = "1")]
        security_level: u16,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Print the rule line for the given fields
    Encode(RuleArgs),

    /// Show the rules in a rule file
    Decode { file: PathBuf },

    /// Push a rule file and enable MITM mode
    Push { file: PathBuf },

    /// Enable MITM mode from a rule file on the probe
    Start {
        #[arg(default_value = "rules.txt")]
        name: String,
    },
}

#[derive(Subcommand)]
enum SdAction {
    /// List all files
    Ls,

    /// Download a file
    Get {
        path: String,

        /// Write here instead of stdout
        #[arg(short = 'O', long)]
        out: Option<PathBuf>,
    },

    /// Upload a file
    Put {
        file: PathBuf,

        /// Target directory
        #[arg(default_value = "/")]
        dir: String,

        /// Name on the card (defaults to the local name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Delete a file
    Rm { path: String },
}

fn parse_on_off(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "high" => Ok(true),
        "off" | "0" | "false" | "low" => Ok(false),
        other => Err(format!("expected on or off, got '{other}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("canbadger_session=debug,canbadger_proto=debug,canbadger_cli=debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let connect = ConnectArgs {
        probe: cli.probe.clone(),
        port: cli.port,
        reply_port: cli.reply_port,
        timeout_ms: cli.timeout_ms,
        resends: cli.resends,
    };
    let merged = config.merge_with_args(&connect, cli.no_color);
    let format = cli
        .output
        .or_else(|| config.output.as_deref().and_then(OutputFormat::from_name))
        .unwrap_or_default();

    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    match &cli.command {
        Commands::Settings { action } => {
            let client = connect_client(&merged.client).await?;
            match action {
                None => commands::show(&client, false, &ctx).await?,
                Some(SettingsAction::Show { bits }) => commands::show(&client, *bits, &ctx).await?,
                Some(SettingsAction::Set { key, value }) => {
                    commands::set(&client, key, value, &ctx).await?
                }
                Some(SettingsAction::SetBit { bit, state }) => {
                    commands::set_bit(&client, bit, *state, &ctx).await?
                }
                Some(SettingsAction::Save { file }) => {
                    commands::save(&client, file.as_deref(), &ctx).await?
                }
            }
        }

        Commands::Log { count, bridge } => {
            commands::log(&merged.client, *count, *bridge, &ctx).await?;
        }

        Commands::Replay {
            frames,
            interface,
            count,
        } => {
            let interface = commands::uds::interface(*interface)?;
            let client = connect_client(&merged.client).await?;
            commands::replay(&client, frames, interface, *count, &ctx).await?;
        }

        Commands::Uds { session, action } => {
            let client = connect_client(&merged.client).await?;
            match action {
                UdsAction::StartSession => {
                    commands::uds::start_session(&client, session, &ctx).await?;
                }
                UdsAction::Request { service, data } => {
                    commands::uds::start_session(&client, session, &ctx).await?;
                    commands::uds::request(&client, service, data.as_deref(), &ctx).await?;
                }
                UdsAction::ReadDid { did } => {
                    commands::uds::start_session(&client, session, &ctx).await?;
                    commands::uds::read_did(&client, did, &ctx).await?;
                }
                UdsAction::ReadMem { address, length } => {
                    commands::uds::start_session(&client, session, &ctx).await?;
                    commands::uds::read_mem(&client, address, *length, &ctx).await?;
                }
                UdsAction::Hijack { security_level } => {
                    commands::uds::hijack(&client, session, *security_level, &ctx).await?;
                }
            }
        }

        Commands::Rules { action } => match action {
            RulesAction::Encode(args) => commands::rules::encode(args)?,
            RulesAction::Decode { file } => commands::rules::decode(file, &ctx)?,
            RulesAction::Push { file } => {
                let client = connect_client(&merged.client).await?;
                commands::rules::push(&client, file, &ctx).await?;
            }
            RulesAction::Start { name } => {
                let client = connect_client(&merged.client).await?;
                commands::rules::start(&client, name, &ctx).await?;
            }
        },

        Commands::Sd { action } => {
            let client = connect_client(&merged.client).await?;
            match action {
                SdAction::Ls => commands::sd::ls(&client, &ctx).await?,
                SdAction::Get { path, out } => {
                    commands::sd::get(&client, path, out.as_deref(), &ctx).await?
                }
                SdAction::Put { file, dir, name } => {
                    commands::sd::put(&client, file, dir, name.as_deref(), &ctx).await?
                }
                SdAction::Rm { path } => commands::sd::rm(&client, path, &ctx).await?,
            }
        }

        Commands::Gpio { number, state } => {
            let client = connect_client(&merged.client).await?;
            commands::gpio(&client, *number, *state, &ctx).await?;
        }

        Commands::Stop => {
            let client = connect_client(&merged.client).await?;
            commands::stop(&client, &ctx).await?;
        }

        Commands::Reset => {
            let client = connect_client(&merged.client).await?;
            commands::reset(&client, &ctx).await?;
        }
    }

    Ok(())
}

/// Open the UDP link and wait for the probe to answer CONNECT
async fn connect_client(config: &ClientConfig) -> Result<ProbeClient> {
    debug!(probe = %config.probe.address, port = config.probe.command_port, ack = ?config.ack, "Connecting");
    let transport = create_transport(&config.probe)
        .await
        .context("Failed to open probe link")?;
    let client = ProbeClient::new(transport, config);
    client.connect().await.with_context(|| {
        format!(
            "Probe at {}:{} did not answer",
            config.probe.address, config.probe.command_port
        )
    })?;
    Ok(client)
}
