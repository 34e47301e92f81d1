//! Transport adapter trait

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

use super::TransportError;

/// Datagram link to one probe
///
/// Commands go out to the probe's command port; replies arrive on the local
/// reply port announced in the CONNECT datagram.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Send one datagram to the probe's command port
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next datagram from the probe
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Local port the probe should reply to
    fn reply_port(&self) -> u16;

    /// Address of the probe's command port
    fn probe_addr(&self) -> SocketAddr;
}
