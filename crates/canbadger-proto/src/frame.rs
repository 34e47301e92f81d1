//! CAN frame codec
//!
//! The probe reports every logged frame as a 14-byte header followed by the
//! payload:
//!
//! ```text
//! protocol(1) | timestamp LE(4) | arbitration id, byte-reversed(4) | speed LE(4) | length(1) | payload
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the fixed raw frame header
pub const CAN_HEADER_LEN: usize = 14;

pub const MAX_STANDARD_ID: u32 = 0x7FF;
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
pub const MAX_CLASSIC_PAYLOAD: usize = 8;
pub const MAX_FD_PAYLOAD: usize = 64;
pub const MAX_CLASSIC_SPEED: u32 = 2_000_000;
pub const MAX_FD_SPEED: u32 = 12_000_000;

/// Bits of the protocol byte
pub mod protocol_bits {
    pub const INTERFACE_1: u8 = 0x01;
    pub const INTERFACE_2: u8 = 0x02;
    pub const CAN: u8 = 0x04;
    pub const KLINE: u8 = 0x08;
    pub const STANDARD: u8 = 0x10;
    pub const EXTENDED: u8 = 0x20;
}

/// Frame field named in validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    ProtocolByte,
    Interface,
    Format,
    ArbitrationId,
    BusSpeed,
    PayloadLength,
}

impl fmt::Display for FrameField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProtocolByte => "protocol byte",
            Self::Interface => "interface",
            Self::Format => "format",
            Self::ArbitrationId => "arbitration id",
            Self::BusSpeed => "bus speed",
            Self::PayloadLength => "payload length",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidFrameError {
    #[error("Frame block too short: {0} bytes, header needs {CAN_HEADER_LEN}")]
    Truncated(usize),

    #[error("Invalid {field}: 0x{value:X}")]
    OutOfBounds { field: FrameField, value: u64 },

    #[error("Declared length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

impl InvalidFrameError {
    fn out_of_bounds(field: FrameField, value: impl Into<u64>) -> Self {
        Self::OutOfBounds {
            field,
            value: value.into(),
        }
    }

    /// Field the error refers to
    pub fn field(&self) -> FrameField {
        match self {
            Self::OutOfBounds { field, .. } => *field,
            Self::Truncated(_) | Self::LengthMismatch { .. } => FrameField::PayloadLength,
        }
    }
}

/// Probe-side CAN interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interface {
    #[serde(rename = "1")]
    Can1,
    #[serde(rename = "2")]
    Can2,
}

impl Interface {
    pub fn number(self) -> u8 {
        match self {
            Self::Can1 => 1,
            Self::Can2 => 2,
        }
    }

    pub fn from_number(number: u8) -> Result<Self, InvalidFrameError> {
        match number {
            1 => Ok(Self::Can1),
            2 => Ok(Self::Can2),
            other => Err(InvalidFrameError::out_of_bounds(FrameField::Interface, other)),
        }
    }

    fn protocol_bit(self) -> u8 {
        match self {
            Self::Can1 => protocol_bits::INTERFACE_1,
            Self::Can2 => protocol_bits::INTERFACE_2,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CAN{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanFormat {
    Standard,
    Extended,
    #[serde(rename = "fd")]
    CanFd,
}

impl CanFormat {
    pub fn max_id(self) -> u32 {
        match self {
            Self::Standard => MAX_STANDARD_ID,
            Self::Extended | Self::CanFd => MAX_EXTENDED_ID,
        }
    }

    pub fn max_payload(self) -> usize {
        match self {
            Self::Standard | Self::Extended => MAX_CLASSIC_PAYLOAD,
            Self::CanFd => MAX_FD_PAYLOAD,
        }
    }

    pub fn max_speed(self) -> u32 {
        match self {
            Self::Standard | Self::Extended => MAX_CLASSIC_SPEED,
            Self::CanFd => MAX_FD_SPEED,
        }
    }
}

/// Split a protocol byte into interface and frame format.
///
/// Interface and format bits are each mutually exclusive, and exactly one of
/// each pair must be present.
pub fn parse_protocol_byte(byte: u8) -> Result<(Interface, CanFormat), InvalidFrameError> {
    use self::protocol_bits::*;

    let interface = match (byte & INTERFACE_1 != 0, byte & INTERFACE_2 != 0) {
        (true, false) => Interface::Can1,
        (false, true) => Interface::Can2,
        (true, true) => {
            return Err(InvalidFrameError::out_of_bounds(FrameField::ProtocolByte, byte))
        }
        (false, false) => return Err(InvalidFrameError::out_of_bounds(FrameField::Interface, byte)),
    };

    let format = match (byte & STANDARD != 0, byte & EXTENDED != 0) {
        (true, false) => CanFormat::Standard,
        (false, true) => CanFormat::Extended,
        (true, true) => {
            return Err(InvalidFrameError::out_of_bounds(FrameField::ProtocolByte, byte))
        }
        // unidentified
        (false, false) => return Err(InvalidFrameError::out_of_bounds(FrameField::Format, byte)),
    };

    Ok((interface, format))
}

/// A validated CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    interface: Interface,
    format: CanFormat,
    timestamp_us: u32,
    arbitration_id: u32,
    bus_speed: u32,
    payload: Bytes,
    counter: Option<u64>,
}

impl CanFrame {
    /// Validate and build a frame. `declared_len` must match the payload length.
    pub fn new(
        interface: Interface,
        format: CanFormat,
        timestamp_us: u32,
        arbitration_id: u32,
        bus_speed: u32,
        declared_len: usize,
        payload: impl Into<Bytes>,
    ) -> Result<Self, InvalidFrameError> {
        let payload = payload.into();

        if arbitration_id > format.max_id() {
            return Err(InvalidFrameError::out_of_bounds(
                FrameField::ArbitrationId,
                arbitration_id,
            ));
        }
        if bus_speed > format.max_speed() {
            return Err(InvalidFrameError::out_of_bounds(FrameField::BusSpeed, bus_speed));
        }
        if declared_len > format.max_payload() {
            return Err(InvalidFrameError::out_of_bounds(
                FrameField::PayloadLength,
                declared_len as u64,
            ));
        }
        if declared_len != payload.len() {
            return Err(InvalidFrameError::LengthMismatch {
                declared: declared_len,
                actual: payload.len(),
            });
        }

        Ok(Self {
            interface,
            format,
            timestamp_us,
            arbitration_id,
            bus_speed,
            payload,
            counter: None,
        })
    }

    /// Decode a raw logging block as sent by the probe
    pub fn decode_from_probe(raw: &[u8]) -> Result<Self, InvalidFrameError> {
        if raw.len() < CAN_HEADER_LEN {
            return Err(InvalidFrameError::Truncated(raw.len()));
        }

        let mut header = &raw[..CAN_HEADER_LEN];
        let protocol = header.get_u8();
        let timestamp_us = header.get_u32_le();
        let arbitration_id = header.get_u32_le().swap_bytes();
        let bus_speed = header.get_u32_le();
        let declared_len = usize::from(header.get_u8());

        let (interface, format) = parse_protocol_byte(protocol)?;
        Self::new(
            interface,
            format,
            timestamp_us,
            arbitration_id,
            bus_speed,
            declared_len,
            Bytes::copy_from_slice(&raw[CAN_HEADER_LEN..]),
        )
    }

    /// Synthesize a frame from a logging-bridge tuple (interface 1, speed 0)
    pub fn from_bridge(
        arbitration_id: u32,
        timestamp_us: u32,
        payload: impl Into<Bytes>,
    ) -> Result<Self, InvalidFrameError> {
        let payload = payload.into();
        let format = if arbitration_id > MAX_STANDARD_ID {
            CanFormat::Extended
        } else {
            CanFormat::Standard
        };
        Self::new(
            Interface::Can1,
            format,
            timestamp_us,
            arbitration_id,
            0,
            payload.len(),
            payload,
        )
    }

    /// Inverse of [`CanFrame::decode_from_probe`]. CAN-FD frames have no
    /// protocol-byte representation and are rejected.
    pub fn encode_for_probe(&self) -> Result<Bytes, InvalidFrameError> {
        let format_bit = match self.format {
            CanFormat::Standard => protocol_bits::STANDARD,
            CanFormat::Extended => protocol_bits::EXTENDED,
            CanFormat::CanFd => {
                return Err(InvalidFrameError::out_of_bounds(FrameField::Format, 0u8))
            }
        };

        let mut buf = BytesMut::with_capacity(CAN_HEADER_LEN + self.payload.len());
        buf.put_u8(self.interface.protocol_bit() | protocol_bits::CAN | format_bit);
        buf.put_u32_le(self.timestamp_us);
        buf.put_u32_le(self.arbitration_id.swap_bytes());
        buf.put_u32_le(self.bus_speed);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn interface(&self) -> Interface {
        self.interface
    }

    pub fn format(&self) -> CanFormat {
        self.format
    }

    pub fn timestamp_us(&self) -> u32 {
        self.timestamp_us
    }

    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    pub fn bus_speed(&self) -> u32 {
        self.bus_speed
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn counter(&self) -> Option<u64> {
        self.counter
    }

    /// Assign the capture-order counter. This is the only mutation after validation.
    pub fn set_counter(&mut self, counter: u64) {
        self.counter = Some(counter);
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = if self.format == CanFormat::Standard { 3 } else { 8 };
        write!(
            f,
            "{} {:>10} {:0width$X} [{}] {}",
            self.interface,
            self.timestamp_us,
            self.arbitration_id,
            self.payload.len(),
            hex::encode_upper(&self.payload),
            width = width,
        )
    }
}

/// Build the body of a replay/bridge command: interface, arbitration id (LE), raw payload
pub fn encode_for_replay(interface: Interface, arbitration_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(interface.number());
    buf.put_u32_le(arbitration_id);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn raw(protocol: u8, id_bytes: [u8; 4], speed: [u8; 4], len: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![protocol, 0xAA, 0xAA, 0xAA, 0xAA];
        v.extend_from_slice(&id_bytes);
        v.extend_from_slice(&speed);
        v.push(len);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn test_decode_reference_block() {
        let block = raw(0x16, [0, 0, 0x02, 0x35], [0x40, 0x42, 0x0F, 0x00], 2, &[0xCC, 0xDD]);
        let frame = CanFrame::decode_from_probe(&block).unwrap();

        assert_eq!(frame.format(), CanFormat::Standard);
        // bit 0x02 is set in 0x16
        assert_eq!(frame.interface(), Interface::Can2);
        assert_eq!(frame.arbitration_id(), 0x235);
        assert_eq!(frame.bus_speed(), 1_000_000);
        assert_eq!(frame.timestamp_us(), 0xAAAA_AAAA);
        assert_eq!(frame.payload(), &[0xCC, 0xDD]);
        assert_eq!(frame.counter(), None);
    }

    #[rstest]
    #[case(0x11, Interface::Can1, CanFormat::Standard)]
    #[case(0x15, Interface::Can1, CanFormat::Standard)]
    #[case(0x16, Interface::Can2, CanFormat::Standard)]
    #[case(0x22, Interface::Can2, CanFormat::Extended)]
    #[case(0x26, Interface::Can2, CanFormat::Extended)]
    #[case(0x25, Interface::Can1, CanFormat::Extended)]
    fn test_protocol_byte(
        #[case] byte: u8,
        #[case] interface: Interface,
        #[case] format: CanFormat,
    ) {
        assert_eq!(parse_protocol_byte(byte).unwrap(), (interface, format));
    }

    #[rstest]
    #[case(0x35, FrameField::ProtocolByte)]
    #[case(0x13, FrameField::ProtocolByte)]
    #[case(0x05, FrameField::Format)]
    #[case(0x10, FrameField::Interface)]
    fn test_protocol_byte_rejected(#[case] byte: u8, #[case] field: FrameField) {
        let err = parse_protocol_byte(byte).unwrap_err();
        assert_eq!(err.field(), field);
    }

    #[test]
    fn test_standard_id_out_of_range() {
        let block = raw(0x16, [0x35, 0x09, 0, 0], [0x00, 0x0F, 0x42, 0x40], 2, &[0xCC, 0xDD]);
        let err = CanFrame::decode_from_probe(&block).unwrap_err();
        assert_eq!(
            err,
            InvalidFrameError::OutOfBounds {
                field: FrameField::ArbitrationId,
                value: 0x3509_0000,
            }
        );
    }

    #[test]
    fn test_speed_out_of_range() {
        let block = raw(0x16, [0, 0, 0x02, 0x35], [0x00, 0x1E, 0x85, 0x48], 2, &[0xCC, 0xDD]);
        let err = CanFrame::decode_from_probe(&block).unwrap_err();
        assert_eq!(err.field(), FrameField::BusSpeed);
    }

    #[test]
    fn test_length_mismatch() {
        let block = raw(0x16, [0, 0, 0x02, 0x35], [0x40, 0x42, 0x0F, 0x00], 5, &[0xCC, 0xDD]);
        assert_eq!(
            CanFrame::decode_from_probe(&block).unwrap_err(),
            InvalidFrameError::LengthMismatch {
                declared: 5,
                actual: 2
            }
        );
    }

    #[test]
    fn test_truncated_block() {
        assert_eq!(
            CanFrame::decode_from_probe(&[0x16, 0x00]).unwrap_err(),
            InvalidFrameError::Truncated(2)
        );
    }

    #[rstest]
    #[case(CanFormat::Standard, 0x800, 500_000, 8)]
    #[case(CanFormat::Extended, 0x2000_0000, 500_000, 8)]
    #[case(CanFormat::CanFd, 0x2000_0000, 500_000, 8)]
    #[case(CanFormat::Standard, 0x123, 2_000_001, 8)]
    #[case(CanFormat::CanFd, 0x123, 12_000_001, 8)]
    #[case(CanFormat::Extended, 0x123, 500_000, 9)]
    #[case(CanFormat::CanFd, 0x123, 500_000, 65)]
    fn test_construction_bounds(
        #[case] format: CanFormat,
        #[case] id: u32,
        #[case] speed: u32,
        #[case] len: usize,
    ) {
        let payload = vec![0u8; len];
        assert!(CanFrame::new(Interface::Can1, format, 0, id, speed, len, payload).is_err());
    }

    #[rstest]
    #[case(CanFormat::Standard, 0x7FF, 2_000_000, 8)]
    #[case(CanFormat::Extended, 0x1FFF_FFFF, 2_000_000, 0)]
    #[case(CanFormat::CanFd, 0x1FFF_FFFF, 12_000_000, 64)]
    fn test_construction_at_bounds(
        #[case] format: CanFormat,
        #[case] id: u32,
        #[case] speed: u32,
        #[case] len: usize,
    ) {
        let payload = vec![0x5Au8; len];
        assert!(CanFrame::new(Interface::Can2, format, 7, id, speed, len, payload).is_ok());
    }

    #[test]
    fn test_probe_encoding_round_trip() {
        for (interface, format, id) in [
            (Interface::Can1, CanFormat::Standard, 0x7DF),
            (Interface::Can2, CanFormat::Standard, 0x001),
            (Interface::Can1, CanFormat::Extended, 0x18DA_F110),
        ] {
            let frame = CanFrame::new(interface, format, 1234, id, 500_000, 3, vec![1, 2, 3]).unwrap();
            let encoded = frame.encode_for_probe().unwrap();
            assert_eq!(CanFrame::decode_from_probe(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn test_fd_has_no_probe_encoding() {
        let frame =
            CanFrame::new(Interface::Can1, CanFormat::CanFd, 0, 0x10, 0, 12, vec![0u8; 12]).unwrap();
        assert_eq!(frame.encode_for_probe().unwrap_err().field(), FrameField::Format);
    }

    #[test]
    fn test_bridge_frame() {
        let frame = CanFrame::from_bridge(0x18DA_F110, 99, vec![0x02, 0x10, 0x03]).unwrap();
        assert_eq!(frame.interface(), Interface::Can1);
        assert_eq!(frame.format(), CanFormat::Extended);
        assert_eq!(frame.bus_speed(), 0);

        let frame = CanFrame::from_bridge(0x7E0, 0, vec![]).unwrap();
        assert_eq!(frame.format(), CanFormat::Standard);
    }

    #[test]
    fn test_counter_assignment() {
        let mut frame = CanFrame::from_bridge(0x100, 0, vec![1]).unwrap();
        frame.set_counter(42);
        assert_eq!(frame.counter(), Some(42));
    }

    #[test]
    fn test_replay_encoding() {
        let body = encode_for_replay(Interface::Can2, 0x123, &[0xDE, 0xAD]);
        assert_eq!(body.as_ref(), &[0x02, 0x23, 0x01, 0x00, 0x00, 0xDE, 0xAD]);
    }

    #[test]
    fn test_display() {
        let frame = CanFrame::new(Interface::Can1, CanFormat::Standard, 5, 0x7E8, 0, 2, vec![0x50, 0x03])
            .unwrap();
        assert_eq!(frame.to_string(), "CAN1          5 7E8 [2] 5003");
    }
}
