//! Transport and application layer translation of a TPDU

use super::frame::Destination;
use thiserror::Error;

/// TPDU translation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApduError {
    /// Empty TPDU
    #[error("Empty TPDU")]
    Empty,

    /// Data TPDU without an application control field
    #[error("Data TPDU of {0} byte(s) has no APCI")]
    MissingApci(usize),
}

// 4-bit application service codes (APCI with the low 6 bits masked)
const SHORT_SERVICES: &[(u16, &str)] = &[
    (0x000, "GroupValue_Read"),
    (0x040, "GroupValue_Response"),
    (0x080, "GroupValue_Write"),
    (0x0C0, "IndividualAddress_Write"),
    (0x100, "IndividualAddress_Read"),
    (0x140, "IndividualAddress_Response"),
    (0x180, "ADC_Read"),
    (0x1C0, "ADC_Response"),
    (0x200, "Memory_Read"),
    (0x240, "Memory_Response"),
    (0x280, "Memory_Write"),
    (0x300, "DeviceDescriptor_Read"),
    (0x340, "DeviceDescriptor_Response"),
    (0x380, "Restart"),
];

// 10-bit application service codes
const LONG_SERVICES: &[(u16, &str)] = &[
    (0x2C0, "UserMemory_Read"),
    (0x2C1, "UserMemory_Response"),
    (0x2C2, "UserMemory_Write"),
    (0x2C5, "UserManufacturerInfo_Read"),
    (0x2C6, "UserManufacturerInfo_Response"),
    (0x3D1, "Authorize_Request"),
    (0x3D2, "Authorize_Response"),
    (0x3D3, "Key_Write"),
    (0x3D4, "Key_Response"),
    (0x3D5, "PropertyValue_Read"),
    (0x3D6, "PropertyValue_Response"),
    (0x3D7, "PropertyValue_Write"),
    (0x3D8, "PropertyDescription_Read"),
    (0x3D9, "PropertyDescription_Response"),
    (0x3DC, "IndividualAddressSerialNumber_Read"),
    (0x3DD, "IndividualAddressSerialNumber_Response"),
    (0x3DE, "IndividualAddressSerialNumber_Write"),
    (0x3E0, "DomainAddress_Write"),
    (0x3E1, "DomainAddress_Read"),
    (0x3E2, "DomainAddress_Response"),
    (0x3E3, "DomainAddressSelective_Read"),
];

/// Application layer service code of a data TPDU
pub fn apci(tpdu: &[u8]) -> Result<u16, ApduError> {
    match tpdu {
        [] => Err(ApduError::Empty),
        [_] => Err(ApduError::MissingApci(1)),
        [tpci, apci, ..] => Ok((u16::from(tpci & 0x03) << 8) | u16::from(*apci)),
    }
}

fn service_name(apci: u16) -> String {
    if let Some((_, name)) = LONG_SERVICES.iter().find(|(code, _)| *code == apci) {
        return (*name).to_string();
    }
    let short = apci & 0x3C0;
    if short != 0x2C0 && short != 0x3C0 {
        if let Some((_, name)) = SHORT_SERVICES.iter().find(|(code, _)| *code == short) {
            return (*name).to_string();
        }
    }
    format!("APCI 0x{apci:03x}")
}

/// Translate a TPDU into the name of the service it carries.
///
/// Control TPDUs translate to their transport layer service; numbered data
/// TPDUs sent to an individual address are prefixed with the connected-mode
/// sequence number.
pub fn decode(tpdu: &[u8], destination: &Destination) -> Result<String, ApduError> {
    let tpci = *tpdu.first().ok_or(ApduError::Empty)?;
    let seq = (tpci >> 2) & 0x0F;

    if tpci & 0x80 != 0 {
        let name = match tpci & 0xC3 {
            0x80 => "T_Connect".to_string(),
            0x81 => "T_Disconnect".to_string(),
            0xC2 => format!("T_ACK #{seq}"),
            0xC3 => format!("T_NAK #{seq}"),
            other => format!("TPCI 0x{other:02x}"),
        };
        return Ok(name);
    }

    let service = service_name(apci(tpdu)?);
    let numbered = tpci & 0x40 != 0;
    match destination {
        Destination::Individual(_) if numbered => Ok(format!("T_Data_Connected #{seq} {service}")),
        _ => Ok(service),
    }
}

/// Extract the application service data unit of a TPDU.
///
/// A two byte TPDU carries its data in the low 6 bits of the APCI octet.
pub fn extract_asdu(tpdu: &[u8]) -> Vec<u8> {
    match tpdu {
        [] | [_] => Vec::new(),
        [_, apci] => vec![apci & 0x3F],
        [_, _, data @ ..] => data.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{GroupAddress, IndividualAddress};

    fn group() -> Destination {
        Destination::Group(GroupAddress(0x0801))
    }

    fn device() -> Destination {
        Destination::Individual(IndividualAddress(0x1101))
    }

    #[test]
    fn test_group_services() {
        assert_eq!(decode(&[0x00, 0x00], &group()).unwrap(), "GroupValue_Read");
        assert_eq!(decode(&[0x00, 0x41], &group()).unwrap(), "GroupValue_Response");
        assert_eq!(decode(&[0x00, 0x81], &group()).unwrap(), "GroupValue_Write");
        assert_eq!(
            decode(&[0x00, 0x80, 0x0C, 0x1A], &group()).unwrap(),
            "GroupValue_Write"
        );
    }

    #[test]
    fn test_control_services() {
        assert_eq!(decode(&[0x80], &device()).unwrap(), "T_Connect");
        assert_eq!(decode(&[0x81], &device()).unwrap(), "T_Disconnect");
        assert_eq!(decode(&[0xC6], &device()).unwrap(), "T_ACK #1");
        assert_eq!(decode(&[0xCB], &device()).unwrap(), "T_NAK #2");
    }

    #[test]
    fn test_connected_data() {
        // Memory_Read, sequence 3
        assert_eq!(
            decode(&[0x4E, 0x01, 0x01, 0x00], &device()).unwrap(),
            "T_Data_Connected #3 Memory_Read"
        );
        assert_eq!(
            decode(&[0x43, 0xD5, 0x00, 0x0B], &device()).unwrap(),
            "T_Data_Connected #0 PropertyValue_Read"
        );
    }

    #[test]
    fn test_unknown_service() {
        assert_eq!(decode(&[0x03, 0xFF], &group()).unwrap(), "APCI 0x3ff");
    }

    #[test]
    fn test_malformed_tpdu() {
        assert_eq!(decode(&[], &group()), Err(ApduError::Empty));
        assert_eq!(decode(&[0x00], &group()), Err(ApduError::MissingApci(1)));
    }

    #[test]
    fn test_extract_asdu() {
        assert!(extract_asdu(&[0x80]).is_empty());
        assert_eq!(extract_asdu(&[0x00, 0x81]), vec![0x01]);
        assert_eq!(extract_asdu(&[0x00, 0x80, 0x0C, 0x1A]), vec![0x0C, 0x1A]);
    }
}
