//! UDS commands - diagnostic sessions and requests through the probe

use anyhow::{bail, Result};
use canbadger_proto::uds::{
    self, service_id, AddressingType, DiagnosticSession, SecurityHijack, StartSession,
    UdsCanFormat,
};
use canbadger_proto::{Interface, UdsResponse};
use canbadger_session::ProbeClient;
use clap::{Args, ValueEnum};

use crate::commands::{parse_hex_bytes, parse_hex_u32};
use crate::output::{OutputContext, UdsResponseRow};

/// Diagnostic session requested from the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SessionType {
    Default,
    Programming,
    Extended,
    Safety,
}

impl From<SessionType> for DiagnosticSession {
    fn from(session: SessionType) -> Self {
        match session {
            SessionType::Default => Self::Default,
            SessionType::Programming => Self::Programming,
            SessionType::Extended => Self::Extended,
            SessionType::Safety => Self::SafetySystem,
        }
    }
}

/// How the probe reaches the ECU
#[derive(Debug, Clone, Args)]
pub struct SessionArgs {
    /// Tester CAN id (hex)
    #[arg(long, default_value = "7E0")]
    pub local_id: String,

    /// ECU CAN id (hex)
    #[arg(long, default_value = "7E8")]
    pub remote_id: String,

    /// CAN interface (1 or 2)
    #[arg(long, default_value = "1")]
    pub interface: u8,

    /// Use 29-bit identifiers
    #[arg(long)]
    pub extended_ids: bool,

    /// Pad frames with this byte (hex)
    #[arg(long)]
    pub padding: Option<String>,

    /// Target diagnostic session
    #[arg(long, value_enum, default_value = "extended")]
    pub session: SessionType,
}

impl SessionArgs {
    pub fn to_request(&self) -> Result<StartSession> {
        let padding_byte = self
            .padding
            .as_deref()
            .map(parse_hex_u32)
            .transpose()?
            .map(u8::try_from)
            .transpose()?;
        Ok(StartSession {
            interface: interface(self.interface)?,
            local_id: parse_hex_u32(&self.local_id)?,
            remote_id: parse_hex_u32(&self.remote_id)?,
            can_format: if self.extended_ids {
                UdsCanFormat::Extended
            } else {
                UdsCanFormat::Standard
            },
            enable_padding: padding_byte.is_some(),
            padding_byte: padding_byte.unwrap_or_default(),
            addressing: AddressingType::Standard,
            target_session: self.session.into(),
        })
    }
}

pub fn interface(number: u8) -> Result<Interface> {
    match number {
        1 => Ok(Interface::Can1),
        2 => Ok(Interface::Can2),
        other => bail!("Interface must be 1 or 2, got {other}"),
    }
}

/// Open the session; fails when the ECU refuses
pub async fn start_session(
    client: &ProbeClient,
    args: &SessionArgs,
    ctx: &OutputContext,
) -> Result<u8> {
    let request = args.to_request()?;
    ctx.info(&format!(
        "Starting {:?} session {:X} -> {:X} on {}...",
        args.session, request.local_id, request.remote_id, request.interface
    ));
    match client.start_uds_session(&request).await? {
        Ok(level) => {
            ctx.success(&format!("UDS session established (level {level})"));
            Ok(level)
        }
        Err(response) => {
            let reason = uds::parse_negative(&response.payload)
                .map(|nr| format!("{} ({})", nr.code, nr.reason()))
                .unwrap_or_else(|_| hex::encode(&response.payload));
            bail!("ECU refused the session: {reason}");
        }
    }
}

/// Raw request: service id plus data, both hex
pub async fn request(
    client: &ProbeClient,
    service: &str,
    data: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let sid = u8::try_from(parse_hex_u32(service)?)?;
    let payload = data.map(parse_hex_bytes).transpose()?.unwrap_or_default();
    let response = client.uds_request(sid, &payload).await?;
    print_response(sid, &response, ctx);
    Ok(())
}

/// ReadDataByIdentifier
pub async fn read_did(client: &ProbeClient, did: &str, ctx: &OutputContext) -> Result<()> {
    let did = u16::try_from(parse_hex_u32(did)?)?;
    let response = client
        .uds_request(service_id::READ_DATA_BY_ID, &uds::read_data_by_id(did))
        .await?;
    print_response(service_id::READ_DATA_BY_ID, &response, ctx);
    Ok(())
}

/// ReadMemoryByAddress
pub async fn read_mem(
    client: &ProbeClient,
    address: &str,
    length: u32,
    ctx: &OutputContext,
) -> Result<()> {
    let address = u64::from(parse_hex_u32(address)?);
    let body = uds::read_memory_by_address(address, length)?;
    let response = client
        .uds_request(service_id::READ_MEMORY_BY_ADDRESS, &body)
        .await?;
    print_response(service_id::READ_MEMORY_BY_ADDRESS, &response, ctx);
    Ok(())
}

/// Wait for a tester to unlock the ECU and take over its session
pub async fn hijack(
    client: &ProbeClient,
    args: &SessionArgs,
    security_level: u16,
    ctx: &OutputContext,
) -> Result<()> {
    let request = args.to_request()?;
    ctx.info("Waiting for a tester to unlock the ECU...");
    let response = client
        .hijack(&SecurityHijack {
            local_id: request.local_id,
            remote_id: request.remote_id,
            security_level,
            session_level: request.target_session as u16,
        })
        .await?;
    if !response.success {
        bail!("Hijack failed");
    }
    ctx.success(&format!(
        "Session taken over at level {}",
        response.session_level
    ));
    Ok(())
}

fn print_response(sid: u8, response: &UdsResponse, ctx: &OutputContext) {
    let result = if response.is_positive {
        "positive".to_string()
    } else {
        match uds::parse_negative(&response.payload) {
            Ok(nr) => format!("{} ({})", nr.code, nr.reason()),
            Err(_) => "negative".to_string(),
        }
    };
    ctx.print_one(&UdsResponseRow {
        service: format!("0x{sid:02X}"),
        result,
        data: hex::encode_upper(&response.payload),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_args_to_request() {
        let args = SessionArgs {
            local_id: "18DA00F1".to_string(),
            remote_id: "18DAF100".to_string(),
            interface: 2,
            extended_ids: true,
            padding: Some("CC".to_string()),
            session: SessionType::Programming,
        };
        let request = args.to_request().unwrap();
        assert_eq!(request.interface, Interface::Can2);
        assert_eq!(request.local_id, 0x18DA_00F1);
        assert_eq!(request.can_format, UdsCanFormat::Extended);
        assert!(request.enable_padding);
        assert_eq!(request.padding_byte, 0xCC);
        assert_eq!(request.target_session, DiagnosticSession::Programming);
    }

    #[test]
    fn test_bad_interface_rejected() {
        assert!(interface(3).is_err());
    }
}
