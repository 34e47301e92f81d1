//! Security access hijack
//!
//! The probe waits for a tester on the bus to unlock an ECU, then takes over
//! the authenticated session.

use bytes::{Buf, BufMut, BytesMut};

use super::UdsError;
use crate::message::{ActionKind, Message};

/// Parameters of a `UDS_HIJACK` action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityHijack {
    pub local_id: u32,
    pub remote_id: u32,
    pub security_level: u16,
    pub session_level: u16,
}

impl SecurityHijack {
    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32_le(self.local_id);
        buf.put_u32_le(self.remote_id);
        buf.put_u16_le(self.security_level);
        buf.put_u16_le(self.session_level);
        Message::action(ActionKind::UdsHijack, buf.freeze())
    }
}

/// Outcome reported by the probe once the hijack attempt finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HijackResponse {
    pub success: bool,
    pub session_level: u16,
}

impl HijackResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, UdsError> {
        if payload.len() < 3 {
            return Err(UdsError::InvalidResponse(format!(
                "hijack response is {} bytes, expected 3",
                payload.len()
            )));
        }
        let mut buf = payload;
        Ok(Self {
            success: buf.get_u8() != 0,
            session_level: buf.get_u16_le(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3);
        buf.push(u8::from(self.success));
        buf.extend_from_slice(&self.session_level.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hijack_request_layout() {
        let msg = SecurityHijack {
            local_id: 0x7E0,
            remote_id: 0x7E8,
            security_level: 0x11,
            session_level: 0x03,
        }
        .to_message();
        assert_eq!(msg.action, ActionKind::UdsHijack);
        assert_eq!(
            msg.payload.as_ref(),
            &[0xE0, 0x07, 0, 0, 0xE8, 0x07, 0, 0, 0x11, 0x00, 0x03, 0x00]
        );
    }

    #[test]
    fn test_hijack_response() {
        let response = HijackResponse::parse(&[0x01, 0x03, 0x00]).unwrap();
        assert!(response.success);
        assert_eq!(response.session_level, 3);
        assert_eq!(response.encode(), vec![0x01, 0x03, 0x00]);
        assert!(HijackResponse::parse(&[0x01]).is_err());
    }
}
