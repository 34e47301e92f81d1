//! Diagnostic session start request

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::UdsError;
use crate::frame::Interface;
use crate::message::{ActionKind, Message};

/// Encoded size of a [`StartSession`] payload
pub const START_SESSION_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DiagnosticSession {
    Default = 0x01,
    Programming = 0x02,
    Extended = 0x03,
    #[serde(rename = "safety")]
    SafetySystem = 0x04,
}

impl TryFrom<u8> for DiagnosticSession {
    type Error = UdsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Default),
            0x02 => Ok(Self::Programming),
            0x03 => Ok(Self::Extended),
            0x04 => Ok(Self::SafetySystem),
            other => Err(UdsError::UnknownSession(other)),
        }
    }
}

/// CAN id format the probe should use for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum UdsCanFormat {
    #[default]
    Standard = 0,
    Extended = 1,
    Any = 2,
}

/// ISO-TP addressing scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AddressingType {
    #[default]
    Standard = 0,
    Extended = 1,
}

/// Parameters of a `START_UDS` action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSession {
    pub interface: Interface,
    pub local_id: u32,
    pub remote_id: u32,
    #[serde(default)]
    pub can_format: UdsCanFormat,
    #[serde(default)]
    pub enable_padding: bool,
    #[serde(default)]
    pub padding_byte: u8,
    #[serde(default)]
    pub addressing: AddressingType,
    pub target_session: DiagnosticSession,
}

impl StartSession {
    /// Payload layout: interface index, local id, remote id, can format,
    /// padding flag, padding byte, addressing, session. Integers little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(START_SESSION_LEN);
        // the probe numbers its interfaces from 0 here
        buf.put_u8(self.interface.number() - 1);
        buf.put_u32_le(self.local_id);
        buf.put_u32_le(self.remote_id);
        buf.put_u8(self.can_format as u8);
        buf.put_u8(u8::from(self.enable_padding));
        buf.put_u8(self.padding_byte);
        buf.put_u8(self.addressing as u8);
        buf.put_u8(self.target_session as u8);
        buf.to_vec()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, UdsError> {
        if payload.len() != START_SESSION_LEN {
            return Err(UdsError::InvalidRequest(format!(
                "session start payload is {} bytes, expected {}",
                payload.len(),
                START_SESSION_LEN
            )));
        }

        let mut buf = payload;
        let interface = match buf.get_u8() {
            0 => Interface::Can1,
            1 => Interface::Can2,
            other => {
                return Err(UdsError::InvalidRequest(format!(
                    "interface index {other}"
                )))
            }
        };
        let local_id = buf.get_u32_le();
        let remote_id = buf.get_u32_le();
        let can_format = match buf.get_u8() {
            0 => UdsCanFormat::Standard,
            1 => UdsCanFormat::Extended,
            2 => UdsCanFormat::Any,
            other => return Err(UdsError::InvalidRequest(format!("can format {other}"))),
        };
        let enable_padding = buf.get_u8() != 0;
        let padding_byte = buf.get_u8();
        let addressing = match buf.get_u8() {
            0 => AddressingType::Standard,
            1 => AddressingType::Extended,
            other => return Err(UdsError::InvalidRequest(format!("addressing {other}"))),
        };
        let target_session = DiagnosticSession::try_from(buf.get_u8())?;

        Ok(Self {
            interface,
            local_id,
            remote_id,
            can_format,
            enable_padding,
            padding_byte,
            addressing,
            target_session,
        })
    }
}

/// Build the `START_UDS` action. The probe answers with a `DATA` envelope
/// carrying the session control response.
pub fn build_start_session(request: &StartSession) -> Message {
    Message::action(ActionKind::StartUds, request.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> StartSession {
        StartSession {
            interface: Interface::Can2,
            local_id: 0x7E0,
            remote_id: 0x7E8,
            can_format: UdsCanFormat::Standard,
            enable_padding: true,
            padding_byte: 0xCC,
            addressing: AddressingType::Standard,
            target_session: DiagnosticSession::Extended,
        }
    }

    #[test]
    fn test_start_session_layout() {
        let msg = build_start_session(&request());
        assert_eq!(msg.action, ActionKind::StartUds);
        assert_eq!(
            msg.payload.as_ref(),
            &[
                0x01, 0xE0, 0x07, 0x00, 0x00, 0xE8, 0x07, 0x00, 0x00, 0x00, 0x01, 0xCC, 0x00,
                0x03
            ]
        );
    }

    #[test]
    fn test_start_session_decode() {
        let decoded = StartSession::decode(&request().encode()).unwrap();
        assert_eq!(decoded, request());
    }

    #[test]
    fn test_start_session_decode_rejects_bad_length() {
        assert!(StartSession::decode(&[0x00; 5]).is_err());
    }

    #[test]
    fn test_session_deserialize_defaults() {
        let parsed: StartSession = serde_json::from_str(
            r#"{"interface":"1","local_id":2016,"remote_id":2024,"target_session":"programming"}"#,
        )
        .unwrap();
        assert_eq!(parsed.interface, Interface::Can1);
        assert_eq!(parsed.target_session, DiagnosticSession::Programming);
        assert_eq!(parsed.can_format, UdsCanFormat::Standard);
        assert!(!parsed.enable_padding);
    }
}
