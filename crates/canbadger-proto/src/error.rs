//! Aggregate codec error

use thiserror::Error;

use crate::frame::InvalidFrameError;
use crate::message::FramingError;
use crate::mitm::MitmError;
use crate::settings::SettingsError;
use crate::transfer::TransferError;
use crate::uds::UdsError;

/// Any failure while encoding or decoding probe traffic
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    InvalidFrame(#[from] InvalidFrameError),

    #[error("UDS error: {0}")]
    Uds(#[from] UdsError),

    #[error(transparent)]
    Mitm(#[from] MitmError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
