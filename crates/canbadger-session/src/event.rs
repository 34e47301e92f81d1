//! Events surfaced by a session

use bytes::Bytes;
use canbadger_proto::transfer::DirEntry;
use canbadger_proto::uds::HijackResponse;
use canbadger_proto::{ActionKind, CanFrame, ProbeSettings, UdsResponse};

use crate::error::SessionError;
use crate::session::OperationKind;

/// Something the probe told us, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The probe answered CONNECT
    Connected,
    /// The probe sent something other than a connect reply; CONNECT was re-sent
    ConnectRetry,
    /// ACK with no operation waiting for it
    Ack,
    /// NACK with no operation waiting for it
    Nack,
    DebugText(String),
    SettingsReceived(ProbeSettings),
    /// A logged CAN frame, counter assigned
    Frame(CanFrame),
    /// `DATA` nobody owns
    Data { action: ActionKind, payload: Bytes },
    TestData(Bytes),

    UdsSessionEstablished { level: u8 },
    UdsSessionFailed(UdsResponse),
    UdsResponse(UdsResponse),
    HijackCompleted(HijackResponse),

    RulesActive { rules: usize },
    /// A transfer chunk went out or came in; `total` is known for uploads
    TransferProgress {
        operation: OperationKind,
        bytes: usize,
        total: Option<usize>,
    },
    UploadComplete { path: String, packets: u32 },
    DownloadComplete { path: String, data: Bytes },
    DirectoryListed(Vec<DirEntry>),
    FileDeleted { path: String },
    ReplayComplete { sent: u64 },

    /// `STOP_CURRENT_ACTION` acknowledged outside logging
    ActionStopped,
    /// Logging stop acknowledged; the session is terminated
    LoggingStopped,
    /// An operation that only waits for an ACK got it
    Completed(OperationKind),
    OperationFailed { op: OperationKind, error: SessionError },
    /// A datagram the session could not accept; it was dropped
    Error(SessionError),
}

impl SessionEvent {
    /// Whether this event ends the operation of kind `op`
    pub fn completes(&self, op: OperationKind) -> bool {
        use OperationKind as K;
        match self {
            Self::OperationFailed { op: failed, .. } => *failed == op,
            Self::Completed(done) => *done == op,
            Self::UdsSessionEstablished { .. } | Self::UdsSessionFailed(_) => op == K::UdsStart,
            Self::UdsResponse(_) => op == K::UdsRequest,
            Self::HijackCompleted(_) => op == K::Hijack,
            Self::RulesActive { .. } => op == K::RulePush,
            Self::UploadComplete { .. } => op == K::Upload,
            Self::DownloadComplete { .. } => op == K::Download,
            Self::DirectoryListed(_) => op == K::Listing,
            Self::FileDeleted { .. } => op == K::Delete,
            Self::ReplayComplete { .. } => op == K::Replay,
            Self::ActionStopped | Self::LoggingStopped => op == K::Stop,
            _ => false,
        }
    }
}
