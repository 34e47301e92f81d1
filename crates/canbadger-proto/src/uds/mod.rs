//! UDS (Unified Diagnostic Services) tunnelled through the probe
//!
//! The probe runs the ISO-TP side of a diagnostic session itself. The host
//! starts the session with a `START_UDS` action, then exchanges requests
//! (`ACTION UDS`) and receives responses as `DATA` envelopes.

mod error;
mod hijack;
mod memory;
mod nrc;
mod response;
mod session;
mod tp;

pub use error::UdsError;
pub use hijack::{HijackResponse, SecurityHijack};
pub use memory::{read_data_by_id, read_memory_by_address};
pub use nrc::NegativeResponseCode;
pub use response::{parse_negative, parse_response, NegativeResponse, UdsResponse};
pub use session::{
    build_start_session, AddressingType, DiagnosticSession, StartSession, UdsCanFormat,
};
pub use tp::{build_start_tp, tp_function};

use bytes::{BufMut, BytesMut};

use crate::message::{ActionKind, FramingError, Message, MessageKind};

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const READ_SCALING_DATA_BY_ID: u8 = 0x24;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const READ_DATA_BY_PERIODIC_ID: u8 = 0x2A;
    pub const DYNAMICALLY_DEFINE_DATA_ID: u8 = 0x2C;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const REQUEST_FILE_TRANSFER: u8 = 0x38;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    pub const ACCESS_TIMING_PARAMETERS: u8 = 0x83;
    pub const SECURED_DATA_TRANSMISSION: u8 = 0x84;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const RESPONSE_ON_EVENT: u8 = 0x86;
    pub const LINK_CONTROL: u8 = 0x87;
}

/// Offset added to a service id in its positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Build a generic UDS request: `ACTION UDS` carrying the service id and its parameters
pub fn build_request(service_id: u8, payload: &[u8]) -> Result<Message, FramingError> {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(service_id);
    buf.put_slice(payload);
    Message::try_new(MessageKind::Action, ActionKind::Uds, buf.freeze())
}

/// Invoke one of the probe's built-in UDS routines by its function id
pub fn uds_function(function_id: u8) -> Message {
    Message::action(ActionKind::Uds, vec![function_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request() {
        let msg = build_request(service_id::READ_DATA_BY_ID, &[0xF1, 0x90]).unwrap();
        assert_eq!(msg.kind, MessageKind::Action);
        assert_eq!(msg.action, ActionKind::Uds);
        assert_eq!(msg.payload.as_ref(), &[0x22, 0xF1, 0x90]);
        assert_eq!(msg.payload_length, 3);
    }

    #[test]
    fn test_uds_function() {
        let msg = uds_function(4);
        assert_eq!(msg.encode().as_ref(), &[0x03, 0x09, 0x01, 0, 0, 0, 0x04]);
    }
}
