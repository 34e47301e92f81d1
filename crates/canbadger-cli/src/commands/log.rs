//! Log command - stream CAN traffic from the probe

use anyhow::{Context, Result};
use canbadger_proto::{CanFormat, CanFrame};
use canbadger_session::{create_transport, CaptureWorker, ClientConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::output::{FrameRow, OutputContext};

/// Capture frames until `count` is reached or Ctrl+C
pub async fn log(
    config: &ClientConfig,
    count: Option<u64>,
    bridge: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let mut config = config.clone();
    config.capture.bridge_mode = bridge;

    let transport = create_transport(&config.probe)
        .await
        .context("Failed to open probe link")?;
    let (handle, mut frames) = CaptureWorker::spawn(transport, &config);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match count {
        Some(n) => ctx.info(&format!("Capturing {n} frame(s), Ctrl+C to stop early")),
        None => ctx.info("Capturing, press Ctrl+C to stop"),
    }

    let mut received = 0u64;
    while running.load(Ordering::SeqCst) && count.map_or(true, |n| received < n) {
        tokio::select! {
            item = frames.recv() => {
                match item {
                    Some(Ok(frame)) => {
                        received += 1;
                        let row = frame_row(&frame);
                        ctx.print_stream(&format!("{:>6} {frame}", row.counter), &row);
                    }
                    Some(Err(e)) => ctx.warn(&format!("Skipped frame: {e}")),
                    None => {
                        ctx.error("Capture ended unexpectedly");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    // keep draining while the stop is in flight; the worker closes the channel on exit
    let stop = tokio::spawn(handle.stop());
    while frames.recv().await.is_some() {}
    let stats = stop.await??;
    if stats.stopped_cleanly {
        ctx.success(&format!(
            "Captured {} frame(s), {} decode error(s)",
            stats.frames, stats.decode_errors
        ));
    } else {
        ctx.warn(&format!(
            "Captured {} frame(s); probe did not acknowledge the stop",
            stats.frames
        ));
    }
    Ok(())
}

fn frame_row(frame: &CanFrame) -> FrameRow {
    let id = match frame.format() {
        CanFormat::Standard => format!("{:03X}", frame.arbitration_id()),
        _ => format!("{:08X}", frame.arbitration_id()),
    };
    FrameRow {
        counter: frame.counter().unwrap_or_default(),
        interface: frame.interface().to_string(),
        timestamp_us: frame.timestamp_us(),
        id,
        len: frame.payload().len(),
        data: hex::encode_upper(frame.payload()),
    }
}
