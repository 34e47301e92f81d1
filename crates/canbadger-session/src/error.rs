//! Session and client errors

use canbadger_proto::{
    ActionKind, FramingError, InvalidFrameError, MessageKind, MitmError, ProtocolError,
    SettingsError, TransferError, UdsError,
};
use thiserror::Error;

use crate::session::OperationKind;
use crate::transport::TransportError;

/// Failures of the sans-IO session
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Probe busy: {0}")]
    Busy(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Replay queue is empty")]
    EmptyReplay,

    #[error("Unhandled message: {kind} {action}")]
    UnhandledMessage { kind: MessageKind, action: ActionKind },

    #[error("Probe rejected {action}")]
    ProtocolNack { action: ActionKind },

    #[error("Transfer aborted: {operation}")]
    TransferAborted { operation: OperationKind },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

macro_rules! impl_from_protocol {
    ($($error:ty),+) => {
        $(impl From<$error> for SessionError {
            fn from(err: $error) -> Self {
                Self::Protocol(err.into())
            }
        })+
    };
}

impl_from_protocol!(
    FramingError,
    InvalidFrameError,
    UdsError,
    MitmError,
    SettingsError,
    TransferError
);

/// Failures of the async client
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Client closed")]
    Closed,
}

macro_rules! impl_client_from_protocol {
    ($($error:ty),+) => {
        $(impl From<$error> for ClientError {
            fn from(err: $error) -> Self {
                Self::Session(err.into())
            }
        })+
    };
}

impl_client_from_protocol!(
    FramingError,
    InvalidFrameError,
    UdsError,
    MitmError,
    SettingsError,
    TransferError
);

/// Probe registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown probe: {0}")]
    UnknownProbe(String),

    #[error("Stale handle: {0}")]
    StaleHandle(String),

    #[error("Duplicate probe id: {0}")]
    DuplicateId(String),

    #[error("Invalid probe id: '{0}'")]
    InvalidId(String),
}

/// Configuration file errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cannot read config: {0}")]
    Io(String),

    #[error("Invalid config: {0}")]
    Parse(String),
}
