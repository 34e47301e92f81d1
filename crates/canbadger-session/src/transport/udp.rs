//! UDP transport to a probe

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use super::{ProbeTransport, TransportError};
use crate::config::ProbeConfig;

/// Receive buffer size, comfortably above the largest probe datagram
const MAX_DATAGRAM: usize = 4096;

pub struct UdpTransport {
    socket: UdpSocket,
    probe: SocketAddr,
    reply_port: u16,
}

impl UdpTransport {
    /// Bind the local reply socket for `config`
    pub async fn bind(config: &ProbeConfig) -> Result<Self, TransportError> {
        let probe = config.probe_addr()?;
        let bind_ip: IpAddr = config.bind_address.parse().map_err(|e| {
            TransportError::InvalidConfig(format!("bind address '{}': {e}", config.bind_address))
        })?;
        let port = config.reply_port.unwrap_or_else(ProbeConfig::random_reply_port);

        let socket = UdpSocket::bind((bind_ip, port))
            .await
            .map_err(|e| TransportError::BindFailed(format!("{bind_ip}:{port}: {e}")))?;
        let reply_port = socket
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?
            .port();

        info!(%probe, reply_port, "UDP transport bound");
        Ok(Self {
            socket,
            probe,
            reply_port,
        })
    }
}

#[async_trait]
impl ProbeTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        trace!(len = datagram.len(), probe = %self.probe, "Sending datagram");
        self.socket
            .send_to(datagram, self.probe)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
            if from.ip() != self.probe.ip() {
                debug!(%from, "Dropping datagram from unexpected sender");
                continue;
            }
            return Ok(Bytes::copy_from_slice(&buf[..len]));
        }
    }

    fn reply_port(&self) -> u16 {
        self.reply_port
    }

    fn probe_addr(&self) -> SocketAddr {
        self.probe
    }
}
