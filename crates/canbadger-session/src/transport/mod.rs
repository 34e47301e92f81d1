//! Transport layer for probe communication
//!
//! - UDP adapter for real probes and the simulator
//! - Mock adapter for testing

mod adapter;
pub mod error;
pub mod mock;
pub mod udp;

pub use adapter::ProbeTransport;
pub use error::TransportError;
pub use mock::MockTransport;
pub use udp::UdpTransport;

use std::sync::Arc;

use crate::config::ProbeConfig;

/// Bind a UDP transport for the configured probe
pub async fn create_transport(
    config: &ProbeConfig,
) -> Result<Arc<dyn ProbeTransport>, TransportError> {
    let transport = UdpTransport::bind(config).await?;
    Ok(Arc::new(transport))
}
