//! UDS Negative Response Codes (NRC)

use std::fmt;

/// UDS Negative Response Codes (ISO 14229-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NegativeResponseCode {
    // General NRCs
    GeneralReject = 0x10,
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLengthOrFormat = 0x13,
    ResponseTooLong = 0x14,

    // Condition NRCs
    BusyRepeatRequest = 0x21,
    ConditionsNotCorrect = 0x22,
    RoutineNotComplete = 0x23,

    // Sequence NRCs
    RequestSequenceError = 0x24,
    NoResponseFromSubnet = 0x25,
    FailurePreventsExecution = 0x26,

    // Request NRCs
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceededNumberOfAttempts = 0x36,
    RequiredTimeDelayNotExpired = 0x37,

    // Legacy download/upload NRCs (KWP heritage)
    DownloadNotAccepted = 0x40,
    ImproperDownloadType = 0x41,
    CantDownloadToSpecifiedAddress = 0x42,
    CantDownloadNumberOfBytesRequested = 0x43,
    UploadNotAccepted = 0x50,
    ImproperUploadType = 0x51,
    CantUploadFromSpecifiedAddress = 0x52,
    CantUploadNumberOfBytesRequested = 0x53,

    // Upload/Download NRCs
    UploadDownloadNotAccepted = 0x70,
    TransferDataSuspended = 0x71,
    GeneralProgrammingFailure = 0x72,
    WrongBlockSequenceCounter = 0x73,
    IllegalAddressInBlockTransfer = 0x74,
    IllegalByteCountInBlockTransfer = 0x75,
    IllegalBlockTransferType = 0x76,
    BlockTransferDataChecksumError = 0x77,

    // Response Pending
    ResponsePending = 0x78,
    IncorrectByteCountDuringBlockTransfer = 0x79,

    // Sub-function NRCs
    SubFunctionNotSupportedInActiveSession = 0x7E,
    ServiceNotSupportedInActiveSession = 0x7F,
    ServiceNotSupportedInActiveDiagnosticMode = 0x80,

    // Vehicle specific
    RpmTooHigh = 0x81,
    RpmTooLow = 0x82,
    EngineRunning = 0x83,
    EngineNotRunning = 0x84,
    EngineRunTimeTooLow = 0x85,
    TemperatureTooHigh = 0x86,
    TemperatureTooLow = 0x87,
    VehicleSpeedTooHigh = 0x88,
    VehicleSpeedTooLow = 0x89,
    ThrottleTooHigh = 0x8A,
    ThrottleTooLow = 0x8B,
    TransmissionNotInNeutral = 0x8C,
    TransmissionNotInGear = 0x8D,
    BrakeSwitchNotClosed = 0x8F,
    ShifterNotInPark = 0x90,
    TorqueConverterClutchLocked = 0x91,
    VoltageTooHigh = 0x92,
    VoltageTooLow = 0x93,

    /// Unknown/reserved NRC
    Unknown(u8),
}

/// Code, variant and human-readable reason, in one table so both
/// directions of the mapping stay in sync.
const TABLE: &[(u8, NegativeResponseCode, &str)] = {
    use NegativeResponseCode::*;
    &[
        (0x10, GeneralReject, "general reject"),
        (0x11, ServiceNotSupported, "service not supported"),
        (0x12, SubFunctionNotSupported, "sub-function not supported"),
        (0x13, IncorrectMessageLengthOrFormat, "incorrect message length or invalid format"),
        (0x14, ResponseTooLong, "response too long"),
        (0x21, BusyRepeatRequest, "busy, repeat request"),
        (0x22, ConditionsNotCorrect, "conditions not correct"),
        (0x23, RoutineNotComplete, "routine not complete"),
        (0x24, RequestSequenceError, "request sequence error"),
        (0x25, NoResponseFromSubnet, "no response from subnet component"),
        (0x26, FailurePreventsExecution, "failure prevents execution of requested action"),
        (0x31, RequestOutOfRange, "request out of range"),
        (0x33, SecurityAccessDenied, "security access denied"),
        (0x35, InvalidKey, "invalid key"),
        (0x36, ExceededNumberOfAttempts, "exceeded number of attempts"),
        (0x37, RequiredTimeDelayNotExpired, "required time delay not expired"),
        (0x40, DownloadNotAccepted, "download not accepted"),
        (0x41, ImproperDownloadType, "improper download type"),
        (0x42, CantDownloadToSpecifiedAddress, "can't download to specified address"),
        (0x43, CantDownloadNumberOfBytesRequested, "can't download number of bytes requested"),
        (0x50, UploadNotAccepted, "upload not accepted"),
        (0x51, ImproperUploadType, "improper upload type"),
        (0x52, CantUploadFromSpecifiedAddress, "can't upload from specified address"),
        (0x53, CantUploadNumberOfBytesRequested, "can't upload number of bytes requested"),
        (0x70, UploadDownloadNotAccepted, "upload/download not accepted"),
        (0x71, TransferDataSuspended, "transfer data suspended"),
        (0x72, GeneralProgrammingFailure, "general programming failure"),
        (0x73, WrongBlockSequenceCounter, "wrong block sequence counter"),
        (0x74, IllegalAddressInBlockTransfer, "illegal address in block transfer"),
        (0x75, IllegalByteCountInBlockTransfer, "illegal byte count in block transfer"),
        (0x76, IllegalBlockTransferType, "illegal block transfer type"),
        (0x77, BlockTransferDataChecksumError, "block transfer data checksum error"),
        (0x78, ResponsePending, "request correctly received, response pending"),
        (0x79, IncorrectByteCountDuringBlockTransfer, "incorrect byte count during block transfer"),
        (0x7E, SubFunctionNotSupportedInActiveSession, "sub-function not supported in active session"),
        (0x7F, ServiceNotSupportedInActiveSession, "service not supported in active session"),
        (0x80, ServiceNotSupportedInActiveDiagnosticMode, "service not supported in active diagnostic mode"),
        (0x81, RpmTooHigh, "rpm too high"),
        (0x82, RpmTooLow, "rpm too low"),
        (0x83, EngineRunning, "engine is running"),
        (0x84, EngineNotRunning, "engine is not running"),
        (0x85, EngineRunTimeTooLow, "engine run time too low"),
        (0x86, TemperatureTooHigh, "temperature too high"),
        (0x87, TemperatureTooLow, "temperature too low"),
        (0x88, VehicleSpeedTooHigh, "vehicle speed too high"),
        (0x89, VehicleSpeedTooLow, "vehicle speed too low"),
        (0x8A, ThrottleTooHigh, "throttle/pedal too high"),
        (0x8B, ThrottleTooLow, "throttle/pedal too low"),
        (0x8C, TransmissionNotInNeutral, "transmission range not in neutral"),
        (0x8D, TransmissionNotInGear, "transmission range not in gear"),
        (0x8F, BrakeSwitchNotClosed, "brake switch not closed"),
        (0x90, ShifterNotInPark, "shifter lever not in park"),
        (0x91, TorqueConverterClutchLocked, "torque converter clutch locked"),
        (0x92, VoltageTooHigh, "voltage too high"),
        (0x93, VoltageTooLow, "voltage too low"),
    ]
};

impl NegativeResponseCode {
    /// Human-readable reason for the code
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unknown(0x38..=0x4F) => "reserved by extended data link security",
            Self::Unknown(_) => "unknown negative response code",
            known => TABLE
                .iter()
                .find(|(_, nrc, _)| nrc == known)
                .map(|(_, _, reason)| *reason)
                .unwrap_or("unknown negative response code"),
        }
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        TABLE
            .iter()
            .find(|(code, _, _)| *code == value)
            .map(|(_, nrc, _)| *nrc)
            .unwrap_or(Self::Unknown(value))
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::Unknown(v) => v,
            known => TABLE
                .iter()
                .find(|(_, candidate, _)| *candidate == known)
                .map(|(code, _, _)| *code)
                .unwrap_or(0),
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(v) => write!(f, "Unknown(0x{:02X})", v),
            known => fmt::Debug::fmt(known, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_round_trip() {
        assert_eq!(TABLE.len(), 55);
        for (code, nrc, _) in TABLE {
            assert_eq!(NegativeResponseCode::from(*code), *nrc);
            assert_eq!(u8::from(*nrc), *code);
        }
    }

    #[test]
    fn test_unknown_code_surfaces_raw() {
        let nrc = NegativeResponseCode::from(0xFE);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0xFE));
        assert_eq!(u8::from(nrc), 0xFE);
        assert_eq!(nrc.to_string(), "Unknown(0xFE)");
        assert_eq!(nrc.description(), "unknown negative response code");
    }

    #[test]
    fn test_reserved_range() {
        assert_eq!(
            NegativeResponseCode::from(0x38).description(),
            "reserved by extended data link security"
        );
    }

    #[test]
    fn test_display_and_hex() {
        let nrc = NegativeResponseCode::RequestOutOfRange;
        assert_eq!(nrc.to_string(), "RequestOutOfRange");
        assert_eq!(format!("0x{:02X}", nrc), "0x31");
        assert_eq!(nrc.description(), "request out of range");
    }
}
