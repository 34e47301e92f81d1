//! canbadger-proto - wire protocol for the CanBadger CAN probe
//!
//! Everything here is pure and synchronous. The sub-protocol drivers
//! ([`mitm::RulePush`], [`transfer::Upload`], [`replay::ReplayQueue`], ...)
//! are sans-IO: they hand back the next [`Message`] to send and expect to be
//! told about the probe's replies.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Message                              │
//! │  kind:u8 | action:u8 | payload_length:u32 LE | payload       │
//! │                                                              │
//! │  ┌──────────┐ ┌──────────┐ ┌─────────┐ ┌──────────────────┐  │
//! │  │ CanFrame │ │   UDS    │ │  MITM   │ │ transfer/replay  │  │
//! │  │ (DATA    │ │ (START_  │ │ (rule   │ │ (SD card, replay │  │
//! │  │ logging) │ │ UDS/UDS) │ │  lines) │ │  queue)          │  │
//! │  └──────────┘ └──────────┘ └─────────┘ └──────────────────┘  │
//! │                                                              │
//! │                  ProbeSettings (SETTINGS blob)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod commands;
pub mod error;
pub mod frame;
pub mod message;
pub mod mitm;
pub mod replay;
pub mod settings;
pub mod transfer;
pub mod uds;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{encode_for_replay, CanFormat, CanFrame, FrameField, Interface, InvalidFrameError};
pub use message::{
    connect_datagram, connect_reply_port, ActionKind, FramingError, Message, MessageKind,
    COMMAND_PORT, DISCOVERY_PORT, HEADER_LEN,
};
pub use mitm::{ByteMask, ConditionKind, MitmError, MitmRule, Pattern, RuleKind, RulePush};
pub use replay::{ReplayEntry, ReplayQueue, ReplayStep};
pub use settings::{ProbeSettings, SettingsError, StatusBit, StatusBits};
pub use transfer::{DirEntry, DirectoryListing, Download, EntryKind, TransferError, Upload};
pub use uds::{NegativeResponseCode, UdsError, UdsResponse};
