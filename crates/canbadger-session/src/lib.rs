//! CanBadger probe sessions
//!
//! - [`session::Session`]: sans-IO state machine for one probe link
//! - [`client::ProbeClient`]: async command/response client over a transport
//! - [`capture::CaptureWorker`]: dedicated logging task feeding an mpsc channel
//! - [`registry::ProbeRegistry`]: probes seen on the network, with generation-checked handles
//!
//! # Example
//!
//! ```ignore
//! let config = ClientConfig::load(Path::new("canbadger.toml"))?;
//! let transport = create_transport(&config.probe).await?;
//! let client = ProbeClient::new(transport, &config);
//! client.connect().await?;
//! let settings = client.settings().await?;
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod session;
pub mod transport;

pub use capture::{CaptureHandle, CaptureItem, CaptureStats, CaptureWorker};
pub use client::ProbeClient;
pub use config::{AckPolicy, CaptureConfig, ClientConfig, ProbeConfig, ReplayPolicy, SessionOptions};
pub use error::{ClientError, ConfigError, RegistryError, SessionError};
pub use event::SessionEvent;
pub use registry::{parse_beacon, Observation, ProbeHandle, ProbeInfo, ProbeRegistry};
pub use session::{LinkState, OperationKind, Outgoing, Reaction, Session, UdsLink};
pub use transport::{create_transport, MockTransport, ProbeTransport, TransportError, UdpTransport};
