//! Simulated CanBadger probe
//!
//! Speaks the probe side of the UDP command protocol so clients can be
//! developed and tested without hardware. [`probe::SimulatedProbe`] holds the
//! protocol logic; [`server::ProbeSimulator`] puts it on a socket.
//!
//! ```bash
//! canbadger-sim --port 13371
//! canbadger-sim --config config/canbadger-sim.toml --verbose
//! ```

pub mod config;
pub mod error;
pub mod probe;
pub mod server;

pub use config::{LoggingConfig, SdFile, SimConfig, UdsSimConfig};
pub use error::{SimError, SimResult};
pub use probe::SimulatedProbe;
pub use server::{ProbeSimulator, SimHandle};
