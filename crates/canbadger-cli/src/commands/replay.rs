//! Replay command - send recorded frames back onto the bus

use anyhow::{bail, Result};
use canbadger_proto::{Interface, ReplayQueue};
use canbadger_session::ProbeClient;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::commands::{parse_hex_bytes, parse_hex_u32};
use crate::output::OutputContext;

/// One frame given on the command line as `ID#DATA[*COUNT]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSpec {
    pub arbitration_id: u32,
    pub payload: Vec<u8>,
    pub count: u32,
}

impl FrameSpec {
    pub fn parse(text: &str, default_count: u32) -> Result<Self> {
        let (frame, count) = match text.split_once('*') {
            Some((frame, count)) => (frame, count.parse()?),
            None => (text, default_count),
        };
        let Some((id, data)) = frame.split_once('#') else {
            bail!("Frame '{text}' must look like ID#DATA, e.g. 7DF#0201");
        };
        Ok(Self {
            arbitration_id: parse_hex_u32(id)?,
            payload: parse_hex_bytes(data)?,
            count,
        })
    }
}

/// Replay frames in order, each `count` times
pub async fn replay(
    client: &ProbeClient,
    frames: &[String],
    interface: Interface,
    count: u32,
    ctx: &OutputContext,
) -> Result<()> {
    let mut queue = ReplayQueue::new();
    for text in frames {
        let frame = FrameSpec::parse(text, count)?;
        if !queue.enqueue_frame(frame.count, interface, frame.arbitration_id, &frame.payload) {
            ctx.warn(&format!("Skipping '{text}': nothing to send"));
        }
    }
    if queue.is_empty() {
        bail!("No frames to replay");
    }

    let total = queue.remaining_sends();
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(format!("Replaying {total} frame(s) on {interface}..."));
    pb.enable_steady_tick(Duration::from_millis(100));

    let result = client.replay(queue).await;
    pb.finish_and_clear();

    let sent = result?;
    ctx.success(&format!("Replayed {sent} frame(s)"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_spec() {
        assert_eq!(
            FrameSpec::parse("7DF#0201", 1).unwrap(),
            FrameSpec {
                arbitration_id: 0x7DF,
                payload: vec![0x02, 0x01],
                count: 1
            }
        );
        assert_eq!(FrameSpec::parse("123#AABB*5", 1).unwrap().count, 5);
        assert!(FrameSpec::parse("123", 1).is_err());
        assert!(FrameSpec::parse("123#AA*x", 1).is_err());
    }
}
