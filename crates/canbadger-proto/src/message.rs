//! Envelope codec
//!
//! Every datagram exchanged with the probe is wrapped in a 6-byte header:
//!
//! ```text
//! +------+--------+--------------------+-----------------+
//! | kind | action | payload_length LE  | payload ...     |
//! |  u8  |   u8   |        u32         | length bytes    |
//! +------+--------+--------------------+-----------------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed envelope header
pub const HEADER_LEN: usize = 6;

/// Well-known port the probe listens on for commands
pub const COMMAND_PORT: u16 = 13371;

/// Port the probe broadcasts its `CB|id|version` beacon on
pub const DISCOVERY_PORT: u16 = 13370;

/// Errors raised while parsing an envelope
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Envelope too short: {0} bytes, header needs {HEADER_LEN}")]
    TooShort(usize),

    #[error("Unknown message kind 0x{0:02X}")]
    UnknownKind(u8),

    #[error("Unknown action kind 0x{0:02X}")]
    UnknownAction(u8),

    #[error("Payload of {0} bytes does not fit the u32 length field")]
    PayloadTooLarge(usize),
}

/// Length field value for a payload of `len` bytes
pub fn declared_length(len: usize) -> Result<u32, FramingError> {
    u32::try_from(len).map_err(|_| FramingError::PayloadTooLarge(len))
}

/// Envelope type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ack = 0,
    Nack = 1,
    Data = 2,
    Action = 3,
    Connect = 4,
    Debug = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ack),
            1 => Ok(Self::Nack),
            2 => Ok(Self::Data),
            3 => Ok(Self::Action),
            4 => Ok(Self::Connect),
            5 => Ok(Self::Debug),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Data => "DATA",
            Self::Action => "ACTION",
            Self::Connect => "CONNECT",
            Self::Debug => "DEBUG",
        };
        f.write_str(name)
    }
}

/// Command tag, meaningful for `ACTION` envelopes and echoed on some `DATA` replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ActionKind {
    NoType = 0,
    Settings = 1,
    EepromWrite = 2,
    LogRawCanTraffic = 3,
    EnableTestMode = 4,
    StopCurrentAction = 5,
    Reset = 6,
    StartUds = 7,
    StartTp = 8,
    Uds = 9,
    Tp = 10,
    UdsHijack = 11,
    Mitm = 12,
    UpdateSd = 13,
    DownloadFile = 14,
    DeleteFile = 15,
    ReceiveRules = 16,
    AddRule = 17,
    EnableMitmMode = 18,
    StartReplay = 19,
    Relay = 20,
    Led = 21,
}

impl ActionKind {
    const ALL: [ActionKind; 22] = [
        Self::NoType,
        Self::Settings,
        Self::EepromWrite,
        Self::LogRawCanTraffic,
        Self::EnableTestMode,
        Self::StopCurrentAction,
        Self::Reset,
        Self::StartUds,
        Self::StartTp,
        Self::Uds,
        Self::Tp,
        Self::UdsHijack,
        Self::Mitm,
        Self::UpdateSd,
        Self::DownloadFile,
        Self::DeleteFile,
        Self::ReceiveRules,
        Self::AddRule,
        Self::EnableMitmMode,
        Self::StartReplay,
        Self::Relay,
        Self::Led,
    ];
}

impl ActionKind {
    /// Firmware name of the action, e.g. `START_UDS`
    pub fn name(self) -> &'static str {
        match self {
            Self::NoType => "NO_TYPE",
            Self::Settings => "SETTINGS",
            Self::EepromWrite => "EEPROM_WRITE",
            Self::LogRawCanTraffic => "LOG_RAW_CAN_TRAFFIC",
            Self::EnableTestMode => "ENABLE_TESTMODE",
            Self::StopCurrentAction => "STOP_CURRENT_ACTION",
            Self::Reset => "RESET",
            Self::StartUds => "START_UDS",
            Self::StartTp => "START_TP",
            Self::Uds => "UDS",
            Self::Tp => "TP",
            Self::UdsHijack => "UDS_HIJACK",
            Self::Mitm => "MITM",
            Self::UpdateSd => "UPDATE_SD",
            Self::DownloadFile => "DOWNLOAD_FILE",
            Self::DeleteFile => "DELETE_FILE",
            Self::ReceiveRules => "RECEIVE_RULES",
            Self::AddRule => "ADD_RULE",
            Self::EnableMitmMode => "ENABLE_MITM_MODE",
            Self::StartReplay => "START_REPLAY",
            Self::Relay => "RELAY",
            Self::Led => "LED",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for ActionKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(FramingError::UnknownAction(value))
    }
}

/// A decoded or to-be-encoded envelope
///
/// `payload_length` is carried separately from `payload` because a header-only
/// decode keeps the declared length while leaving the payload empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub action: ActionKind,
    pub payload_length: u32,
    pub payload: Bytes,
}

impl Message {
    /// Build a message whose declared length matches the attached payload.
    ///
    /// The payload must fit the u32 length field; use [`Message::try_new`]
    /// for payloads of caller-controlled size.
    pub fn new(kind: MessageKind, action: ActionKind, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        debug_assert!(declared_length(payload.len()).is_ok());
        Self {
            kind,
            action,
            payload_length: payload.len() as u32,
            payload,
        }
    }

    pub fn try_new(
        kind: MessageKind,
        action: ActionKind,
        payload: impl Into<Bytes>,
    ) -> Result<Self, FramingError> {
        let payload = payload.into();
        Ok(Self {
            kind,
            action,
            payload_length: declared_length(payload.len())?,
            payload,
        })
    }

    pub fn action(action: ActionKind, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Action, action, payload)
    }

    /// Payload-less `ACTION` command
    pub fn command(action: ActionKind) -> Self {
        Self::new(MessageKind::Action, action, Bytes::new())
    }

    pub fn data(action: ActionKind, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Data, action, payload)
    }

    pub fn ack() -> Self {
        Self::new(MessageKind::Ack, ActionKind::NoType, Bytes::new())
    }

    pub fn nack() -> Self {
        Self::new(MessageKind::Nack, ActionKind::NoType, Bytes::new())
    }

    pub fn debug(text: &str) -> Self {
        Self::new(
            MessageKind::Debug,
            ActionKind::NoType,
            Bytes::copy_from_slice(text.as_bytes()),
        )
    }

    /// Whether the attached payload is complete with respect to the declared length
    pub fn has_payload(&self) -> bool {
        self.payload_length > 0 && self.payload.len() == self.payload_length as usize
    }

    /// Serialize the envelope. Payload bytes are only written for a non-zero declared length.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.action as u8);
        buf.put_u32_le(self.payload_length);
        if self.payload_length > 0 {
            buf.put_slice(&self.payload);
        }
        buf.freeze()
    }

    /// Parse an envelope.
    ///
    /// With `extract_payload` set, the payload is attached only when the bytes
    /// following the header match the declared length exactly. Anything else
    /// yields a header-only message.
    pub fn decode(raw: &[u8], extract_payload: bool) -> Result<Self, FramingError> {
        if raw.len() < HEADER_LEN {
            return Err(FramingError::TooShort(raw.len()));
        }

        let mut header = &raw[..HEADER_LEN];
        let kind = MessageKind::try_from(header.get_u8())?;
        let action = ActionKind::try_from(header.get_u8())?;
        let payload_length = header.get_u32_le();

        let rest = &raw[HEADER_LEN..];
        let payload = if extract_payload && rest.len() == payload_length as usize {
            Bytes::copy_from_slice(rest)
        } else {
            Bytes::new()
        };

        Ok(Self {
            kind,
            action,
            payload_length,
            payload,
        })
    }
}

/// Build the CONNECT datagram announcing the local reply port.
///
/// The header declares a 4-byte payload; the probe also expects a trailing NUL.
pub fn connect_datagram(reply_port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 5);
    buf.put_u8(MessageKind::Connect as u8);
    buf.put_u8(ActionKind::NoType as u8);
    buf.put_u32_le(4);
    buf.put_u32_le(u32::from(reply_port));
    buf.put_u8(0);
    buf.freeze()
}

/// Extract the announced reply port from a CONNECT datagram
pub fn connect_reply_port(raw: &[u8]) -> Option<u16> {
    if raw.first() != Some(&(MessageKind::Connect as u8)) || raw.len() < HEADER_LEN + 4 {
        return None;
    }
    let mut port = &raw[HEADER_LEN..HEADER_LEN + 4];
    u16::try_from(port.get_u32_le()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_declared_length_bounds() {
        assert_eq!(declared_length(0).unwrap(), 0);
        assert_eq!(declared_length(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_declared_length_rejects_oversized_payload() {
        let len = u32::MAX as usize + 1;
        assert_eq!(declared_length(len), Err(FramingError::PayloadTooLarge(len)));
    }

    #[test]
    fn test_try_new_sets_length() {
        let msg = Message::try_new(MessageKind::Action, ActionKind::Uds, vec![0x22, 0xF1]).unwrap();
        assert_eq!(msg.payload_length, 2);
    }

    #[test]
    fn test_settings_request_bytes() {
        let msg = Message::command(ActionKind::Settings);
        assert_eq!(msg.encode().as_ref(), &[0x03, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_round_trip_with_payload() {
        let msg = Message::action(ActionKind::AddRule, Bytes::from_static(b"abc\0"));
        let decoded = Message::decode(&msg.encode(), true).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_round_trip_every_kind() {
        for kind in 0u8..=5 {
            for action in 0u8..=21 {
                let msg = Message::new(
                    MessageKind::try_from(kind).unwrap(),
                    ActionKind::try_from(action).unwrap(),
                    vec![kind, action],
                );
                assert_eq!(Message::decode(&msg.encode(), true).unwrap(), msg);
            }
        }
    }

    #[test]
    fn test_zero_length_skips_payload() {
        let msg = Message {
            kind: MessageKind::Data,
            action: ActionKind::NoType,
            payload_length: 0,
            payload: Bytes::from_static(b"ignored"),
        };
        assert_eq!(msg.encode().len(), HEADER_LEN);
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            Message::decode(&[0x00, 0x00, 0x00], true),
            Err(FramingError::TooShort(3))
        );
    }

    #[test]
    fn test_decode_length_mismatch_is_header_only() {
        let raw = [0x02, 0x00, 0x05, 0x00, 0x00, 0x00, 0xAA, 0xBB];
        let msg = Message::decode(&raw, true).unwrap();
        assert_eq!(msg.kind, MessageKind::Data);
        assert_eq!(msg.payload_length, 5);
        assert!(msg.payload.is_empty());
        assert!(!msg.has_payload());
    }

    #[test]
    fn test_decode_without_extraction() {
        let raw = [0x02, 0x00, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB];
        let msg = Message::decode(&raw, false).unwrap();
        assert_eq!(msg.payload_length, 2);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_decode_unknown_tags() {
        assert_eq!(
            Message::decode(&[0x09, 0x00, 0, 0, 0, 0], true),
            Err(FramingError::UnknownKind(0x09))
        );
        assert_eq!(
            Message::decode(&[0x03, 0x40, 0, 0, 0, 0], true),
            Err(FramingError::UnknownAction(0x40))
        );
    }

    #[test]
    fn test_connect_datagram() {
        let raw = connect_datagram(13000);
        assert_eq!(
            raw.as_ref(),
            &[0x04, 0x00, 0x04, 0x00, 0x00, 0x00, 0xC8, 0x32, 0x00, 0x00, 0x00]
        );
        assert_eq!(connect_reply_port(&raw), Some(13000));
        assert_eq!(connect_reply_port(&Message::ack().encode()), None);
    }
}
