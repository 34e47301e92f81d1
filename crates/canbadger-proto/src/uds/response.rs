//! UDS response parsing
//!
//! The probe wraps every ECU reply in `<H?I`: service id (u16 LE), positive
//! flag, payload length (u32 LE), followed by the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{service_id, NegativeResponseCode, UdsError, POSITIVE_RESPONSE_OFFSET};

/// Size of the response sub-header
pub const RESPONSE_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsResponse {
    pub service_id: u16,
    pub is_positive: bool,
    pub payload_length: u32,
    pub payload: Bytes,
}

/// Decoded negative response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeResponse {
    pub service_id: u8,
    pub code: NegativeResponseCode,
}

impl NegativeResponse {
    pub fn reason(&self) -> &'static str {
        self.code.description()
    }
}

impl From<NegativeResponse> for UdsError {
    fn from(nr: NegativeResponse) -> Self {
        UdsError::NegativeResponse {
            service_id: nr.service_id,
            nrc: nr.code,
        }
    }
}

impl UdsResponse {
    pub fn positive(service_id: u16, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            service_id,
            is_positive: true,
            payload_length: payload.len() as u32,
            payload,
        }
    }

    pub fn negative(service_id: u16, code: NegativeResponseCode) -> Self {
        let payload = Bytes::from(vec![service_id as u8, code.into()]);
        Self {
            service_id,
            is_positive: false,
            payload_length: payload.len() as u32,
            payload,
        }
    }

    /// Body of the `DATA` envelope carrying this response
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + self.payload.len());
        buf.put_u16_le(self.service_id);
        buf.put_u8(u8::from(self.is_positive));
        buf.put_u32_le(self.payload_length);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Session level granted by a positive session control response.
    ///
    /// The probe echoes the level as the first payload byte; some firmware
    /// prefixes the positive response id (0x50), which is skipped.
    pub fn granted_session_level(&self) -> Option<u8> {
        if !self.is_positive {
            return None;
        }
        let positive_sid = service_id::DIAGNOSTIC_SESSION_CONTROL + POSITIVE_RESPONSE_OFFSET;
        match self.payload.as_ref() {
            [sid, level, ..] if *sid == positive_sid => Some(*level),
            [level, ..] => Some(*level),
            [] => None,
        }
    }

    /// Positive payload, or the negative response as an error
    pub fn into_result(self) -> Result<Bytes, UdsError> {
        if self.is_positive {
            Ok(self.payload)
        } else {
            Err(parse_negative(&self.payload)?.into())
        }
    }
}

/// Parse the body of a UDS `DATA` reply
pub fn parse_response(payload: &[u8]) -> Result<UdsResponse, UdsError> {
    if payload.len() < RESPONSE_HEADER_LEN {
        return Err(UdsError::InvalidResponse(format!(
            "response is {} bytes, header needs {}",
            payload.len(),
            RESPONSE_HEADER_LEN
        )));
    }

    let mut header = &payload[..RESPONSE_HEADER_LEN];
    let service_id = header.get_u16_le();
    let is_positive = header.get_u8() != 0;
    let payload_length = header.get_u32_le();

    Ok(UdsResponse {
        service_id,
        is_positive,
        payload_length,
        payload: Bytes::copy_from_slice(&payload[RESPONSE_HEADER_LEN..]),
    })
}

/// Decode a negative response payload: `(original service id, code)`,
/// optionally prefixed with the 0x7F marker.
pub fn parse_negative(payload: &[u8]) -> Result<NegativeResponse, UdsError> {
    let body = match payload {
        [service_id::NEGATIVE_RESPONSE, rest @ ..] if rest.len() >= 2 => rest,
        other => other,
    };
    match body {
        [sid, code, ..] => Ok(NegativeResponse {
            service_id: *sid,
            code: NegativeResponseCode::from(*code),
        }),
        _ => Err(UdsError::InvalidResponse(format!(
            "negative response needs 2 bytes, got {}",
            payload.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_positive_session_response() {
        let raw = [0x10, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x03];
        let response = parse_response(&raw).unwrap();
        assert_eq!(response.service_id, 0x10);
        assert!(response.is_positive);
        assert_eq!(response.payload_length, 1);
        assert_eq!(response.granted_session_level(), Some(3));
    }

    #[test]
    fn test_granted_level_skips_positive_sid() {
        let response = UdsResponse::positive(0x10, vec![0x50, 0x02]);
        assert_eq!(response.granted_session_level(), Some(2));
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let response = UdsResponse::positive(0x22, vec![0x62, 0xF1, 0x90, 0x41]);
        assert_eq!(parse_response(&response.encode()).unwrap(), response);
    }

    #[test]
    fn test_parse_short_response() {
        assert!(matches!(
            parse_response(&[0x10, 0x00, 0x01]),
            Err(UdsError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_negative_response() {
        let response = UdsResponse::negative(0x27, NegativeResponseCode::InvalidKey);
        assert!(!response.is_positive);
        assert_eq!(response.granted_session_level(), None);

        let nr = parse_negative(&response.payload).unwrap();
        assert_eq!(nr.service_id, 0x27);
        assert_eq!(nr.code, NegativeResponseCode::InvalidKey);
        assert_eq!(nr.reason(), "invalid key");

        assert_eq!(
            response.into_result(),
            Err(UdsError::NegativeResponse {
                service_id: 0x27,
                nrc: NegativeResponseCode::InvalidKey
            })
        );
    }

    #[test]
    fn test_negative_with_marker_prefix() {
        let nr = parse_negative(&[0x7F, 0x10, 0x22]).unwrap();
        assert_eq!(nr.service_id, 0x10);
        assert_eq!(nr.code, NegativeResponseCode::ConditionsNotCorrect);
    }

    #[test]
    fn test_negative_unknown_code() {
        let nr = parse_negative(&[0x22, 0xEE]).unwrap();
        assert_eq!(nr.code, NegativeResponseCode::Unknown(0xEE));
    }

    #[test]
    fn test_negative_too_short() {
        assert!(parse_negative(&[0x22]).is_err());
    }
}
