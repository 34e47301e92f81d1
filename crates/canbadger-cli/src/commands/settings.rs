//! Settings commands - read, change and persist the probe configuration

use anyhow::{Context, Result};
use canbadger_proto::StatusBit;
use canbadger_session::ProbeClient;

use crate::output::{OutputContext, StatusBitRow};

/// Show the settings blob
pub async fn show(client: &ProbeClient, bits: bool, ctx: &OutputContext) -> Result<()> {
    let settings = client.settings().await?;

    let ip = settings
        .ip_text()
        .map(str::to_string)
        .unwrap_or_else(|| hex::encode(&settings.ip));
    ctx.print_kv(&[
        ("ID", settings.id.clone()),
        ("IP", ip),
        ("Status", format!("0x{:08X}", settings.status.0)),
        ("SPI speed", settings.spi_speed.to_string()),
        ("CAN1 speed", settings.can1_speed.to_string()),
        ("CAN2 speed", settings.can2_speed.to_string()),
        ("K-Line1 speed", settings.kline1_speed.to_string()),
        ("K-Line2 speed", settings.kline2_speed.to_string()),
    ]);

    if bits {
        let rows: Vec<StatusBitRow> = StatusBit::ALL
            .iter()
            .map(|bit| StatusBitRow {
                position: bit.position(),
                name: bit.name(),
                enabled: if settings.status.get(*bit) { "yes" } else { "-" }.to_string(),
            })
            .collect();
        ctx.print(&rows);
    }
    Ok(())
}

/// Send a single `key;value` update
pub async fn set(client: &ProbeClient, key: &str, value: &str, ctx: &OutputContext) -> Result<()> {
    client.update_setting(key, value).await?;
    ctx.success(&format!("{key} set to {value}"));
    Ok(())
}

/// Flip one status bit and write the full blob back
pub async fn set_bit(
    client: &ProbeClient,
    bit: &str,
    enabled: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let bit: StatusBit = bit.parse().context("Unknown status bit")?;
    let mut settings = client.settings().await?;
    if settings.status.get(bit) == enabled {
        ctx.info(&format!("{bit} already {}", on_off(enabled)));
        return Ok(());
    }

    settings.status.set(bit, enabled);
    client.update_settings(&settings).await?;
    ctx.success(&format!("{bit} {}", on_off(enabled)));
    Ok(())
}

/// Persist the current settings to EEPROM
pub async fn save(client: &ProbeClient, file: Option<&str>, ctx: &OutputContext) -> Result<()> {
    client.save_settings(file).await?;
    ctx.success("Settings saved");
    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}
