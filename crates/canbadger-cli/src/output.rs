//! Output formatting for canbadger (table, json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "table" => Some(Self::Table),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
        }
    }

    /// Print a single item in the configured format
    pub fn print_one<T: Tabled + Serialize>(&self, data: &T) {
        match self.format {
            OutputFormat::Table => println!("{}", Table::new([data])),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
    }

    /// Print one streamed record as it arrives
    pub fn print_stream<T: Serialize>(&self, line: &str, record: &T) {
        match self.format {
            OutputFormat::Table => println!("{line}"),
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(record) {
                    println!("{json}");
                }
            }
        }
    }
}

// =============================================================================
// Display types for various commands
// =============================================================================

/// Status bit display for settings command
#[derive(Debug, Tabled, Serialize)]
pub struct StatusBitRow {
    #[tabled(rename = "Bit")]
    pub position: u8,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Enabled")]
    pub enabled: String,
}

/// Logged frame for log command
#[derive(Debug, Tabled, Serialize)]
pub struct FrameRow {
    #[tabled(rename = "#")]
    pub counter: u64,
    #[tabled(rename = "Interface")]
    pub interface: String,
    #[tabled(rename = "Timestamp (us)")]
    pub timestamp_us: u32,
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Len")]
    pub len: usize,
    #[tabled(rename = "Data")]
    pub data: String,
}

/// UDS response display
#[derive(Debug, Tabled, Serialize)]
pub struct UdsResponseRow {
    #[tabled(rename = "Service")]
    pub service: String,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "Data")]
    pub data: String,
}

/// MITM rule display for rules decode
#[derive(Debug, Tabled, Serialize)]
pub struct RuleRow {
    #[tabled(rename = "#")]
    pub index: usize,
    #[tabled(rename = "Target")]
    pub target: String,
    #[tabled(rename = "Condition")]
    pub condition: String,
    #[tabled(rename = "Cond. mask")]
    pub condition_mask: String,
    #[tabled(rename = "Cond. value")]
    pub condition_value: String,
    #[tabled(rename = "Action")]
    pub action: String,
    #[tabled(rename = "Act. mask")]
    pub action_mask: String,
    #[tabled(rename = "Act. argument")]
    pub action_argument: String,
}

/// SD card entry for sd ls
#[derive(Debug, Tabled, Serialize)]
pub struct EntryRow {
    #[tabled(rename = "Type")]
    pub kind: String,
    #[tabled(rename = "Path")]
    pub path: String,
}
