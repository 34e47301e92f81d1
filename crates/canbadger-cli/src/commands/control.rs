//! Stop, reset and relay control

use anyhow::{bail, Result};
use canbadger_proto::commands::Gpio;
use canbadger_session::ProbeClient;

use crate::output::OutputContext;

/// Stop whatever the probe is doing
pub async fn stop(client: &ProbeClient, ctx: &OutputContext) -> Result<()> {
    client.stop().await?;
    ctx.success("Current action stopped");
    Ok(())
}

/// Reset the probe; the link has to be re-established afterwards
pub async fn reset(client: &ProbeClient, ctx: &OutputContext) -> Result<()> {
    client.reset().await?;
    ctx.success("Probe reset");
    Ok(())
}

/// Set a relay, or show both when no GPIO is given
pub async fn gpio(
    client: &ProbeClient,
    number: Option<u8>,
    state: Option<bool>,
    ctx: &OutputContext,
) -> Result<()> {
    match (number, state) {
        (Some(number), Some(high)) => {
            let Some(gpio) = Gpio::from_number(number) else {
                bail!("GPIO must be 1 or 2");
            };
            client.set_gpio(gpio, high).await?;
            ctx.success(&format!("GPIO{number} {}", if high { "on" } else { "off" }));
        }
        (None, None) => match client.query_gpio().await? {
            Some(state) => {
                let pairs: Vec<(&str, String)> = ["GPIO1", "GPIO2"]
                    .into_iter()
                    .zip(state.iter())
                    .map(|(name, on)| (name, if *on != 0 { "on" } else { "off" }.to_string()))
                    .collect();
                ctx.print_kv(&pairs);
            }
            None => ctx.info("Probe did not report relay state"),
        },
        _ => bail!("Give both GPIO number and state, or neither to query"),
    }
    Ok(())
}
