//! End-to-end test harness
//!
//! Runs a [`ProbeSimulator`] on loopback and connects real
//! [`ProbeClient`]s to it over UDP. The tests live in `tests/`.

use std::sync::Arc;

use canbadger_session::{
    create_transport, AckPolicy, ClientConfig, ClientError, ProbeClient, ProbeConfig,
    ProbeTransport,
};
use canbadger_sim::{ProbeSimulator, SimConfig, SimHandle, SimResult, SimulatedProbe};
use parking_lot::Mutex;

/// Ack timeout used by every harness client
pub const ACK_TIMEOUT_MS: u64 = 1000;

/// A running simulator plus the client config that reaches it
pub struct SimHarness {
    sim: SimHandle,
    config: ClientConfig,
}

impl SimHarness {
    /// Simulator with default settings
    pub async fn start() -> SimResult<Self> {
        Self::with_config(SimConfig::default()).await
    }

    /// Simulator from `config`; the command port is always picked by the OS
    pub async fn with_config(mut config: SimConfig) -> SimResult<Self> {
        config.bind_address = "127.0.0.1".to_string();
        config.command_port = 0;
        let sim = ProbeSimulator::bind(config).await?.spawn()?;

        let client = ClientConfig {
            probe: ProbeConfig {
                address: "127.0.0.1".to_string(),
                command_port: sim.addr().port(),
                reply_port: None,
                bind_address: "127.0.0.1".to_string(),
            },
            ack: AckPolicy::Resend {
                timeout_ms: ACK_TIMEOUT_MS,
                attempts: 1,
            },
            ..Default::default()
        };

        Ok(Self {
            sim,
            config: client,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared simulator state
    pub fn probe(&self) -> Arc<Mutex<SimulatedProbe>> {
        self.sim.probe()
    }

    /// Fresh transport bound to an OS-chosen reply port
    pub async fn transport(&self) -> Result<Arc<dyn ProbeTransport>, ClientError> {
        let mut probe = self.config.probe.clone();
        probe.reply_port = Some(0);
        Ok(create_transport(&probe).await?)
    }

    /// Client that has completed the CONNECT handshake
    pub async fn client(&self) -> Result<ProbeClient, ClientError> {
        let client = ProbeClient::new(self.transport().await?, &self.config);
        client.connect().await?;
        Ok(client)
    }

    pub async fn shutdown(self) -> SimResult<()> {
        self.sim.shutdown().await
    }
}
