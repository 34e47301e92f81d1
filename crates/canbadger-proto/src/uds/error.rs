//! UDS protocol errors

use thiserror::Error;

use super::NegativeResponseCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown diagnostic session 0x{0:02X}")]
    UnknownSession(u8),
}
