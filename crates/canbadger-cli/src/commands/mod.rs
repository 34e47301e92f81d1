//! Command implementations for canbadger

pub mod control;
pub mod log;
pub mod replay;
pub mod rules;
pub mod sd;
pub mod settings;
pub mod uds;

pub use control::{gpio, reset, stop};
pub use log::log;
pub use replay::replay;
pub use settings::{save, set, set_bit, show};

/// Parse a hex number, with or without a `0x` prefix
pub fn parse_hex_u32(value: &str) -> anyhow::Result<u32> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| anyhow::anyhow!("Invalid hex value '{value}': {e}"))
}

/// Parse hex bytes, tolerating spaces and a `0x` prefix
pub fn parse_hex_bytes(value: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = value
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    hex::decode(&digits).map_err(|e| anyhow::anyhow!("Invalid hex data '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex_u32("0x7E0").unwrap(), 0x7E0);
        assert_eq!(parse_hex_u32("18DA00F1").unwrap(), 0x18DA_00F1);
        assert!(parse_hex_u32("xyz").is_err());
        assert_eq!(parse_hex_bytes("0x0102 03").unwrap(), vec![1, 2, 3]);
        assert!(parse_hex_bytes("123").is_err());
    }
}
