//! CAN capture worker
//!
//! A dedicated task owns its transport and session, puts the probe into
//! logging mode and forwards decoded frames over an mpsc channel. The task
//! ends when it is told to stop (after the probe ACKs the stop or the grace
//! period runs out) or when the transport closes. Its sender is dropped on
//! exit so the consumer's `recv` returns `None`.

use std::sync::Arc;

use canbadger_proto::CanFrame;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CaptureConfig, ClientConfig};
use crate::error::{ClientError, SessionError};
use crate::event::SessionEvent;
use crate::session::{LinkState, Outgoing, Session};
use crate::transport::{ProbeTransport, TransportError};

/// Item delivered to the capture consumer
pub type CaptureItem = Result<CanFrame, SessionError>;

/// Summary returned when the worker ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    pub frames: u64,
    pub decode_errors: u64,
    /// Whether the probe acknowledged the stop
    pub stopped_cleanly: bool,
}

/// Handle to a running capture worker
pub struct CaptureHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<CaptureStats, ClientError>>,
}

impl CaptureHandle {
    /// Ask the worker to stop logging and wait for it to finish
    pub async fn stop(mut self) -> Result<CaptureStats, ClientError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the worker to finish on its own
    pub async fn join(self) -> Result<CaptureStats, ClientError> {
        self.task.await.map_err(|_| ClientError::Closed)?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct CaptureWorker;

impl CaptureWorker {
    /// Connect over `transport`, start logging and spawn the worker
    pub fn spawn(
        transport: Arc<dyn ProbeTransport>,
        config: &ClientConfig,
    ) -> (CaptureHandle, mpsc::Receiver<CaptureItem>) {
        let capture = config.capture;
        let (frame_tx, frame_rx) = mpsc::channel(capture.channel_capacity.max(1));
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut options = config.session;
        options.request_settings_on_connect = false;
        let session = Session::new(transport.reply_port(), options, config.replay);

        let task = tokio::spawn(run(transport, session, capture, frame_tx, stop_rx));
        (
            CaptureHandle {
                stop_tx: Some(stop_tx),
                task,
            },
            frame_rx,
        )
    }
}

async fn send(transport: &dyn ProbeTransport, outgoing: &Outgoing) -> Result<(), ClientError> {
    transport.send(&outgoing.encode()).await?;
    Ok(())
}

async fn run(
    transport: Arc<dyn ProbeTransport>,
    mut session: Session,
    config: CaptureConfig,
    frames: mpsc::Sender<CaptureItem>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Result<CaptureStats, ClientError> {
    let mut stats = CaptureStats::default();

    send(transport.as_ref(), &session.connect()).await?;

    let mut stop_deadline: Option<tokio::time::Instant> = None;
    let mut stop_requested = false;

    loop {
        let deadline = stop_deadline;
        let link = transport.as_ref();
        let recv = async move {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, link.recv()).await.ok(),
                None => Some(link.recv().await),
            }
        };

        let datagram = tokio::select! {
            _ = &mut stop_rx, if !stop_requested => {
                stop_requested = true;
                match session.state() {
                    LinkState::Logging => {
                        let msg = session.stop()?;
                        send(transport.as_ref(), &Outgoing::Message(msg)).await?;
                        stop_deadline = Some(tokio::time::Instant::now() + config.stop_grace());
                        debug!(frames = stats.frames, "Stop sent, draining");
                        continue;
                    }
                    _ => break,
                }
            }
            received = recv => received,
        };

        let datagram = match datagram {
            None => {
                warn!(grace_ms = config.stop_grace_ms, "Probe did not acknowledge stop");
                break;
            }
            Some(Err(TransportError::ConnectionClosed)) => break,
            Some(Err(e)) => {
                warn!(error = %e, "Receive failed");
                continue;
            }
            Some(Ok(datagram)) => datagram,
        };

        let reaction = match session.handle_datagram(&datagram) {
            Ok(reaction) => reaction,
            Err(e) => {
                stats.decode_errors += 1;
                if frames.send(Err(e)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        for outgoing in &reaction.outbound {
            // settings requests are disabled; only connect retries remain
            send(transport.as_ref(), outgoing).await?;
        }

        for event in reaction.events {
            match event {
                SessionEvent::Connected => {
                    let msg = session.start_logging(config.bridge_mode)?;
                    info!(bridge_mode = config.bridge_mode, "Capture started");
                    send(transport.as_ref(), &Outgoing::Message(msg)).await?;
                }
                SessionEvent::Frame(frame) => {
                    stats.frames += 1;
                    if frames.send(Ok(frame)).await.is_err() {
                        debug!("Capture consumer gone");
                        return finish(transport.as_ref(), &mut session, stats).await;
                    }
                }
                SessionEvent::LoggingStopped => {
                    stats.stopped_cleanly = true;
                }
                other => debug!(event = ?other, "Ignoring event during capture"),
            }
        }

        if session.state() == LinkState::Terminated {
            break;
        }
    }

    info!(
        frames = stats.frames,
        decode_errors = stats.decode_errors,
        clean = stats.stopped_cleanly,
        "Capture ended"
    );
    Ok(stats)
}

/// Consumer dropped its receiver: stop the probe without waiting for the ACK
async fn finish(
    transport: &dyn ProbeTransport,
    session: &mut Session,
    stats: CaptureStats,
) -> Result<CaptureStats, ClientError> {
    if let Ok(msg) = session.stop() {
        send(transport, &Outgoing::Message(msg)).await?;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use canbadger_proto::{ActionKind, Message};
    use std::time::Duration;

    fn block(id: u16, payload: &[u8]) -> Vec<u8> {
        let mut block = vec![0x11, 0, 0, 0, 0, 0, 0];
        block.extend_from_slice(&id.to_be_bytes());
        block.extend_from_slice(&500_000u32.to_le_bytes());
        block.push(payload.len() as u8);
        block.extend_from_slice(payload);
        block
    }

    fn config() -> ClientConfig {
        ClientConfig {
            capture: CaptureConfig {
                channel_capacity: 16,
                stop_grace_ms: 100,
                bridge_mode: false,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_capture_forwards_frames_and_stops() {
        let mock = Arc::new(MockTransport::new(15555));
        mock.ack_connect();
        mock.add_action_response(
            ActionKind::LogRawCanTraffic,
            vec![
                Message::data(ActionKind::LogRawCanTraffic, block(0x100, &[1])),
                Message::data(ActionKind::LogRawCanTraffic, block(0x101, &[2, 3])),
            ],
        );
        mock.add_action_response(ActionKind::StopCurrentAction, vec![Message::ack()]);

        let (handle, mut frames) = CaptureWorker::spawn(mock.clone(), &config());
        let first = frames.recv().await.unwrap().unwrap();
        let second = frames.recv().await.unwrap().unwrap();
        assert_eq!(first.arbitration_id(), 0x100);
        assert_eq!(second.arbitration_id(), 0x101);
        assert_eq!(second.counter(), Some(1));

        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.frames, 2);
        assert!(stats.stopped_cleanly);
        assert!(frames.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_capture_reports_bad_blocks() {
        let mock = Arc::new(MockTransport::new(15555));
        mock.ack_connect();
        mock.add_action_response(
            ActionKind::LogRawCanTraffic,
            vec![Message::data(ActionKind::LogRawCanTraffic, vec![0x33; 14])],
        );

        let (handle, mut frames) = CaptureWorker::spawn(mock.clone(), &config());
        assert!(frames.recv().await.unwrap().is_err());

        // no ACK for the stop: the grace period ends the worker
        let stats = tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.decode_errors, 1);
        assert!(!stats.stopped_cleanly);
    }

    #[tokio::test]
    async fn test_capture_ends_when_transport_closes() {
        let mock = Arc::new(MockTransport::new(15555));
        mock.ack_connect();
        let (handle, mut frames) = CaptureWorker::spawn(mock.clone(), &config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        mock.close();
        assert!(frames.recv().await.is_none());
        assert_eq!(handle.join().await.unwrap().frames, 0);
    }
}
