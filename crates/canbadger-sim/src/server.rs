//! UDP front end of the simulated probe

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use canbadger_proto::{connect_reply_port, ActionKind, Message};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::probe::SimulatedProbe;

const MAX_DATAGRAM: usize = 4096;

pub struct ProbeSimulator {
    socket: UdpSocket,
    probe: Arc<Mutex<SimulatedProbe>>,
    log_interval: Duration,
}

impl ProbeSimulator {
    /// Bind the command socket
    pub async fn bind(config: SimConfig) -> SimResult<Self> {
        let ip: IpAddr = config
            .bind_address
            .parse()
            .map_err(|e| SimError::Address(format!("{}: {e}", config.bind_address)))?;
        let socket = UdpSocket::bind((ip, config.command_port)).await?;
        let log_interval = Duration::from_millis(config.logging.interval_ms.max(1));
        info!(addr = %socket.local_addr()?, id = %config.id, "Probe simulator bound");
        Ok(Self {
            socket,
            probe: Arc::new(Mutex::new(SimulatedProbe::new(config))),
            log_interval,
        })
    }

    pub fn local_addr(&self) -> SimResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Shared probe state, for inspection
    pub fn probe(&self) -> Arc<Mutex<SimulatedProbe>> {
        self.probe.clone()
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> SimResult<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut peer: Option<SocketAddr> = None;
        let mut ticker = tokio::time::interval(self.log_interval);
        let mut rng = StdRng::from_entropy();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from, &mut peer).await,
                        Err(e) => warn!(error = %e, "Receive failed"),
                    }
                }
                _ = ticker.tick() => {
                    let Some(to) = peer else { continue };
                    let frame = self.probe.lock().next_log_frame(&mut rng);
                    if let Some(msg) = frame {
                        self.send(&msg, to).await;
                    }
                }
            }
        }

        info!("Probe simulator stopped");
        Ok(())
    }

    /// Serve on a background task
    pub fn spawn(self) -> SimResult<SimHandle> {
        let addr = self.local_addr()?;
        let probe = self.probe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run(async {
            let _ = shutdown_rx.await;
        }));
        Ok(SimHandle {
            addr,
            probe,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn on_datagram(&self, raw: &[u8], from: SocketAddr, peer: &mut Option<SocketAddr>) {
        if let Some(port) = connect_reply_port(raw) {
            let to = SocketAddr::new(from.ip(), port);
            info!(client = %to, "Client connected");
            *peer = Some(to);
            self.send(&Message::ack(), to).await;
            return;
        }

        let msg = match Message::decode(raw, true) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "Malformed datagram");
                return;
            }
        };
        let to = peer.unwrap_or(from);
        let replies = self.probe.lock().handle(&msg);
        for reply in &replies {
            self.send(reply, to).await;
        }
        if msg.action == ActionKind::Reset {
            *peer = None;
        }
    }

    async fn send(&self, msg: &Message, to: SocketAddr) {
        debug!(kind = %msg.kind, action = %msg.action, len = msg.payload.len(), %to, "Reply");
        if let Err(e) = self.socket.send_to(&msg.encode(), to).await {
            warn!(error = %e, %to, "Send failed");
        }
    }
}

/// Running simulator
pub struct SimHandle {
    addr: SocketAddr,
    probe: Arc<Mutex<SimulatedProbe>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<SimResult<()>>,
}

impl SimHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn probe(&self) -> Arc<Mutex<SimulatedProbe>> {
        self.probe.clone()
    }

    pub async fn shutdown(mut self) -> SimResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SimError::Io(std::io::Error::other(e))),
        }
    }
}
