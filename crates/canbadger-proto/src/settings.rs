//! Probe settings blob
//!
//! ```text
//! +--------+------------+--------+------------+--------------------------+
//! | id_len | id (ASCII) | ip_len | ip         | 6 x u32 LE               |
//! | ≤ 18   |            |        |            | status, spi, can1, can2, |
//! |        |            |        |            | kline1, kline2           |
//! +--------+------------+--------+------------+--------------------------+
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{ActionKind, Message};

pub const MAX_ID_LEN: usize = 18;

/// Bytes following the ip field
pub const SPEEDS_LEN: usize = 24;

const MAX_KEY_LEN: usize = 127;
const MAX_VALUE_LEN: usize = 255;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Settings blob truncated at {0} bytes")]
    Truncated(usize),

    #[error("Probe id length {0} exceeds 18")]
    IdTooLong(usize),

    #[error("Expected 24 bytes of settings after the ip, found {0}")]
    WrongLength(usize),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Positions in the probe's 32-bit status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum StatusBit {
    SdEnabled = 0,
    UsbSerialEnabled = 1,
    EthernetEnabled = 2,
    OledEnabled = 3,
    KeyboardEnabled = 4,
    LedsEnabled = 5,
    Kline1IntEnabled = 6,
    Kline2IntEnabled = 7,
    Can1IntEnabled = 8,
    Can2IntEnabled = 9,
    KlineBridgeEnabled = 10,
    CanBridgeEnabled = 11,
    Can1Logging = 12,
    Can2Logging = 13,
    Kline1Logging = 14,
    Kline2Logging = 15,
    Can1Standard = 16,
    Can1Extended = 17,
    Can2Standard = 18,
    Can2Extended = 19,
    Can1ToCan2Bridge = 20,
    Can2ToCan1Bridge = 21,
    Kline1ToKline2Bridge = 22,
    Kline2ToKline1Bridge = 23,
    UdsCan1Enabled = 24,
    UdsCan2Enabled = 25,
    Can1UseFullframe = 26,
    Can2UseFullframe = 27,
    Can1Monitor = 28,
    Can2Monitor = 29,
}

impl StatusBit {
    pub const ALL: [StatusBit; 30] = [
        Self::SdEnabled,
        Self::UsbSerialEnabled,
        Self::EthernetEnabled,
        Self::OledEnabled,
        Self::KeyboardEnabled,
        Self::LedsEnabled,
        Self::Kline1IntEnabled,
        Self::Kline2IntEnabled,
        Self::Can1IntEnabled,
        Self::Can2IntEnabled,
        Self::KlineBridgeEnabled,
        Self::CanBridgeEnabled,
        Self::Can1Logging,
        Self::Can2Logging,
        Self::Kline1Logging,
        Self::Kline2Logging,
        Self::Can1Standard,
        Self::Can1Extended,
        Self::Can2Standard,
        Self::Can2Extended,
        Self::Can1ToCan2Bridge,
        Self::Can2ToCan1Bridge,
        Self::Kline1ToKline2Bridge,
        Self::Kline2ToKline1Bridge,
        Self::UdsCan1Enabled,
        Self::UdsCan2Enabled,
        Self::Can1UseFullframe,
        Self::Can2UseFullframe,
        Self::Can1Monitor,
        Self::Can2Monitor,
    ];

    pub fn position(self) -> u8 {
        self as u8
    }

    pub fn from_position(position: u8) -> Option<Self> {
        Self::ALL.get(position as usize).copied()
    }

    /// Firmware name, e.g. `CAN1_LOGGING`
    pub fn name(self) -> String {
        screaming_snake(self)
    }
}

fn screaming_snake(bit: StatusBit) -> String {
    let debug = format!("{bit:?}");
    let mut out = String::with_capacity(debug.len() + 4);
    for (i, c) in debug.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

impl fmt::Display for StatusBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl std::str::FromStr for StatusBit {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(position) = s.parse::<u8>() {
            return Self::from_position(position)
                .ok_or_else(|| SettingsError::Invalid(format!("status bit {position} out of range")));
        }
        let wanted = s.to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|bit| bit.name() == wanted)
            .ok_or_else(|| SettingsError::Invalid(format!("unknown status bit '{s}'")))
    }
}

/// The probe's status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusBits(pub u32);

impl StatusBits {
    pub fn get(self, bit: StatusBit) -> bool {
        self.0 & (1 << bit.position()) != 0
    }

    pub fn set(&mut self, bit: StatusBit, enabled: bool) {
        if enabled {
            self.0 |= 1 << bit.position();
        } else {
            self.0 &= !(1 << bit.position());
        }
    }

    pub fn toggle(&mut self, bit: StatusBit) {
        self.0 ^= 1 << bit.position();
    }

    /// Bits currently set
    pub fn enabled(self) -> impl Iterator<Item = StatusBit> {
        StatusBit::ALL.into_iter().filter(move |bit| self.get(*bit))
    }
}

/// Decoded settings blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub id: String,
    /// Raw ip field, kept opaque and written back unchanged
    #[serde(with = "hex_bytes")]
    pub ip: Vec<u8>,
    pub status: StatusBits,
    pub spi_speed: u32,
    pub can1_speed: u32,
    pub can2_speed: u32,
    pub kline1_speed: u32,
    pub kline2_speed: u32,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

impl ProbeSettings {
    pub fn parse(blob: &[u8]) -> Result<Self, SettingsError> {
        let mut buf = blob;
        if !buf.has_remaining() {
            return Err(SettingsError::Truncated(0));
        }
        let id_len = buf.get_u8() as usize;
        if id_len > MAX_ID_LEN {
            return Err(SettingsError::IdTooLong(id_len));
        }
        if buf.remaining() < id_len + 1 {
            return Err(SettingsError::Truncated(blob.len()));
        }
        let id = ascii(&buf[..id_len])?;
        buf.advance(id_len);

        let ip_len = buf.get_u8() as usize;
        if buf.remaining() < ip_len {
            return Err(SettingsError::Truncated(blob.len()));
        }
        let ip = buf[..ip_len].to_vec();
        buf.advance(ip_len);

        if buf.remaining() != SPEEDS_LEN {
            return Err(SettingsError::WrongLength(buf.remaining()));
        }
        Ok(Self {
            id,
            ip,
            status: StatusBits(buf.get_u32_le()),
            spi_speed: buf.get_u32_le(),
            can1_speed: buf.get_u32_le(),
            can2_speed: buf.get_u32_le(),
            kline1_speed: buf.get_u32_le(),
            kline2_speed: buf.get_u32_le(),
        })
    }

    pub fn encode(&self) -> Result<Bytes, SettingsError> {
        if self.id.len() > MAX_ID_LEN {
            return Err(SettingsError::IdTooLong(self.id.len()));
        }
        if !self.id.is_ascii() {
            return Err(SettingsError::Invalid(format!("probe id '{}' is not ASCII", self.id)));
        }
        let ip_len = u8::try_from(self.ip.len())
            .map_err(|_| SettingsError::Invalid(format!("ip field of {} bytes", self.ip.len())))?;

        let mut buf = BytesMut::with_capacity(2 + self.id.len() + self.ip.len() + SPEEDS_LEN);
        buf.put_u8(self.id.len() as u8);
        buf.put_slice(self.id.as_bytes());
        buf.put_u8(ip_len);
        buf.put_slice(&self.ip);
        for value in [
            self.status.0,
            self.spi_speed,
            self.can1_speed,
            self.can2_speed,
            self.kline1_speed,
            self.kline2_speed,
        ] {
            buf.put_u32_le(value);
        }
        Ok(buf.freeze())
    }

    /// Ip field as text, when it is printable
    pub fn ip_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.ip)
            .ok()
            .filter(|s| s.chars().all(|c| c.is_ascii_graphic()))
    }

    /// `ACTION SETTINGS` carrying this blob
    pub fn to_update(&self) -> Result<Message, SettingsError> {
        Ok(Message::action(ActionKind::Settings, self.encode()?))
    }
}

fn ascii(bytes: &[u8]) -> Result<String, SettingsError> {
    if !bytes.is_ascii() {
        return Err(SettingsError::Invalid(format!(
            "probe id {} is not ASCII",
            hex::encode(bytes)
        )));
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Empty `ACTION SETTINGS`, asking the probe for its blob
pub fn request_settings() -> Message {
    Message::command(ActionKind::Settings)
}

/// Single `key;value` update
pub fn update_setting(key: &str, value: &str) -> Result<Message, SettingsError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(SettingsError::Invalid(format!(
            "key '{key}' must be 1 to {MAX_KEY_LEN} bytes"
        )));
    }
    if value.len() > MAX_VALUE_LEN {
        return Err(SettingsError::Invalid(format!(
            "value of '{key}' exceeds {MAX_VALUE_LEN} bytes"
        )));
    }
    if key.contains(';') || value.contains(';') {
        return Err(SettingsError::Invalid("semicolons are not allowed".to_string()));
    }
    if !key.is_ascii() || !value.is_ascii() {
        return Err(SettingsError::Invalid("settings must be ASCII".to_string()));
    }
    Ok(Message::action(
        ActionKind::Settings,
        format!("{key};{value}").into_bytes(),
    ))
}

/// `EEPROM_WRITE` persisting the current settings, optionally naming the
/// settings file on the SD card
pub fn save_settings(file_name: Option<&str>) -> Message {
    match file_name {
        Some(name) => Message::action(ActionKind::EepromWrite, name.as_bytes().to_vec()),
        None => Message::command(ActionKind::EepromWrite),
    }
}
