//! Request bodies for the read services

use super::UdsError;

/// Largest address expressible with the 5 address bytes the probe accepts
const MAX_ADDRESS: u64 = 0xFF_FFFF_FFFF;

/// Body of a ReadDataByIdentifier (0x22) request. Identifiers below 0x100
/// are sent as a single byte.
pub fn read_data_by_id(id: u16) -> Vec<u8> {
    match u8::try_from(id) {
        Ok(short) => vec![short],
        Err(_) => id.to_be_bytes().to_vec(),
    }
}

/// Body of a ReadMemoryByAddress (0x23) request: the address-and-length
/// format identifier followed by the big-endian address and size.
pub fn read_memory_by_address(address: u64, length: u32) -> Result<Vec<u8>, UdsError> {
    if address > MAX_ADDRESS {
        return Err(UdsError::InvalidRequest(format!(
            "address 0x{address:X} needs more than 5 bytes"
        )));
    }

    let address_bytes = significant_bytes(address).max(1);
    let length_bytes = match length {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };

    let mut body = Vec::with_capacity(1 + address_bytes + length_bytes);
    body.push(((length_bytes as u8) << 4) | address_bytes as u8);
    body.extend_from_slice(&address.to_be_bytes()[8 - address_bytes..]);
    body.extend_from_slice(&length.to_be_bytes()[4 - length_bytes..]);
    Ok(body)
}

fn significant_bytes(value: u64) -> usize {
    8 - (value.leading_zeros() as usize / 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x0D, vec![0x0D])]
    #[case(0xFF, vec![0xFF])]
    #[case(0x100, vec![0x01, 0x00])]
    #[case(0xF190, vec![0xF1, 0x90])]
    fn test_read_data_by_id(#[case] id: u16, #[case] expected: Vec<u8>) {
        assert_eq!(read_data_by_id(id), expected);
    }

    #[rstest]
    #[case(0x00, 0x10, vec![0x11, 0x00, 0x10])]
    #[case(0x1234, 0x80, vec![0x12, 0x12, 0x34, 0x80])]
    #[case(0x12_3456, 0x100, vec![0x23, 0x12, 0x34, 0x56, 0x01, 0x00])]
    #[case(0x2000_0000, 0x1_0000, vec![0x34, 0x20, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00])]
    #[case(
        0x01_0000_0000,
        0x0100_0000,
        vec![0x45, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
    )]
    fn test_read_memory_by_address(
        #[case] address: u64,
        #[case] length: u32,
        #[case] expected: Vec<u8>,
    ) {
        assert_eq!(read_memory_by_address(address, length).unwrap(), expected);
    }

    #[test]
    fn test_address_too_wide() {
        assert!(read_memory_by_address(0x0100_0000_0000, 1).is_err());
    }
}
