//! Probe session state
//!
//! [`Session`] is sans-IO: commands return the datagram to send, and
//! incoming datagrams are fed back through [`Session::handle_datagram`].

mod machine;

pub use machine::{Outgoing, Reaction, Session};

use std::fmt;

use canbadger_proto::mitm::RulePush;
use canbadger_proto::transfer::{DirectoryListing, Download, Upload};
use canbadger_proto::{ActionKind, ReplayQueue};

/// Link state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// CONNECT sent, no reply yet
    #[default]
    Unconnected,
    Connected,
    /// Streaming CAN frames
    Logging,
    /// Logging stop sent, waiting for the ACK
    Stopping,
    /// Logging ended; the session is done
    Terminated,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connected => "connected",
            Self::Logging => "logging",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the UDS session the probe holds towards an ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdsLink {
    #[default]
    Disconnected,
    Connecting,
    Connected { level: u8 },
}

/// Exclusive operations; at most one is in flight per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    SettingsUpdate,
    EepromSave,
    TestMode,
    UdsStart,
    TpStart,
    UdsRequest,
    FunctionCall,
    Hijack,
    Upload,
    Download,
    Listing,
    Delete,
    RulePush,
    MitmFromFile,
    Replay,
    Stop,
    Gpio,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SettingsUpdate => "settings update",
            Self::EepromSave => "EEPROM save",
            Self::TestMode => "test mode",
            Self::UdsStart => "UDS session start",
            Self::TpStart => "TP session start",
            Self::UdsRequest => "UDS request",
            Self::FunctionCall => "function call",
            Self::Hijack => "security hijack",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Listing => "directory listing",
            Self::Delete => "delete",
            Self::RulePush => "rule push",
            Self::MitmFromFile => "MITM from file",
            Self::Replay => "replay",
            Self::Stop => "stop",
            Self::Gpio => "GPIO",
        };
        f.write_str(name)
    }
}

impl OperationKind {
    /// Whether sending the command twice leaves the probe in the same state.
    /// Only these are re-sent under [`crate::AckPolicy::Resend`].
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::SettingsUpdate | Self::TestMode | Self::Gpio)
    }
}

/// In-flight operation with its driver state
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    SettingsUpdate,
    EepromSave,
    TestMode,
    UdsStart,
    TpStart,
    UdsRequest,
    FunctionCall { action: ActionKind },
    Hijack,
    Upload(Upload),
    Download(Download),
    Listing(DirectoryListing),
    Delete { path: String },
    RulePush(RulePush),
    MitmFromFile,
    Replay { queue: ReplayQueue, sent: u64 },
    Stop,
    Gpio,
}

impl Operation {
    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            Self::SettingsUpdate => OperationKind::SettingsUpdate,
            Self::EepromSave => OperationKind::EepromSave,
            Self::TestMode => OperationKind::TestMode,
            Self::UdsStart => OperationKind::UdsStart,
            Self::TpStart => OperationKind::TpStart,
            Self::UdsRequest => OperationKind::UdsRequest,
            Self::FunctionCall { .. } => OperationKind::FunctionCall,
            Self::Hijack => OperationKind::Hijack,
            Self::Upload(_) => OperationKind::Upload,
            Self::Download(_) => OperationKind::Download,
            Self::Listing(_) => OperationKind::Listing,
            Self::Delete { .. } => OperationKind::Delete,
            Self::RulePush(_) => OperationKind::RulePush,
            Self::MitmFromFile => OperationKind::MitmFromFile,
            Self::Replay { .. } => OperationKind::Replay,
            Self::Stop => OperationKind::Stop,
            Self::Gpio => OperationKind::Gpio,
        }
    }

    /// Action the probe rejects when it NACKs this operation
    pub(crate) fn action(&self) -> ActionKind {
        match self {
            Self::SettingsUpdate => ActionKind::Settings,
            Self::EepromSave => ActionKind::EepromWrite,
            Self::TestMode => ActionKind::EnableTestMode,
            Self::UdsStart => ActionKind::StartUds,
            Self::TpStart => ActionKind::StartTp,
            Self::UdsRequest => ActionKind::Uds,
            Self::FunctionCall { action } => *action,
            Self::Hijack => ActionKind::UdsHijack,
            Self::Upload(_) | Self::Listing(_) => ActionKind::UpdateSd,
            Self::Download(_) => ActionKind::DownloadFile,
            Self::Delete { .. } => ActionKind::DeleteFile,
            Self::RulePush(push) if push.is_enabling() => ActionKind::Mitm,
            Self::RulePush(push) if push.sent() > 0 => ActionKind::AddRule,
            Self::RulePush(_) => ActionKind::ReceiveRules,
            Self::MitmFromFile => ActionKind::EnableMitmMode,
            Self::Replay { .. } => ActionKind::StartReplay,
            Self::Stop => ActionKind::StopCurrentAction,
            Self::Gpio => ActionKind::Relay,
        }
    }

    /// Whether the operation is completed by `DATA` rather than ACK
    pub(crate) fn awaits_data(&self) -> bool {
        matches!(
            self,
            Self::UdsStart | Self::UdsRequest | Self::Hijack | Self::Listing(_)
        )
    }
}
