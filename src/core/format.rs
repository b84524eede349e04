//! Frame line rendering

use super::apdu::{self, ApduError};
use super::frame::{to_hex, MonitorFrameEvent};
use chrono::{DateTime, Local};
use std::fmt::Write;
use thiserror::Error;

/// Timestamp prefix of every frame line
pub const TIMESTAMP_FORMAT: &str = "%H:%M:%S%.3f";

/// Formatting errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// TPDU could not be translated
    #[error("cannot translate TPDU: {0}")]
    Apdu(#[from] ApduError),

    /// Writing into the line failed
    #[error("formatting failed")]
    Fmt(#[from] std::fmt::Error),
}

/// Render one event without timestamp.
///
/// Compact mode renders the sequence number only, verbose mode the full
/// envelope. A decoded raw frame is appended after `" "` (compact) or
/// `" = "` (verbose); a data frame additionally gets its service name and
/// the ASDU in hex.
pub fn format_event(event: &MonitorFrameEvent, compact: bool) -> Result<String, FormatError> {
    let mut line = String::with_capacity(96);
    if compact {
        write!(line, "Seq {}", event.frame.sequence)?;
    } else {
        write!(line, "{}", event.frame)?;
    }

    if let Some(raw) = &event.raw {
        let separator = if compact { " " } else { " = " };
        write!(line, "{separator}{raw}")?;
        if let Some(base) = raw.as_base() {
            let service = apdu::decode(&base.tpdu, &base.destination)?;
            let asdu = apdu::extract_asdu(&base.tpdu);
            write!(line, ": {service} {}", to_hex(&asdu, " "))?;
        }
    }
    Ok(line)
}

/// Render one event prefixed with the given local time
pub fn format_line_at(
    event: &MonitorFrameEvent,
    compact: bool,
    time: &DateTime<Local>,
) -> Result<String, FormatError> {
    Ok(format!("{} {}", time.format(TIMESTAMP_FORMAT), format_event(event, compact)?))
}

/// Render one event prefixed with the current local time
pub fn format_line(event: &MonitorFrameEvent, compact: bool) -> Result<String, FormatError> {
    format_line_at(event, compact, &Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediumSettings;
    use crate::core::frame::MC_BUSMON_IND;
    use chrono::TimeZone;

    fn with_checksum(frame: &[u8]) -> Vec<u8> {
        let mut out = frame.to_vec();
        out.push(!frame.iter().fold(0u8, |acc, b| acc ^ b));
        out
    }

    fn event(status: u8, raw: &[u8], decode: bool) -> MonitorFrameEvent {
        let mut cemi = vec![MC_BUSMON_IND, 0x03, 0x03, 0x01, status];
        cemi.extend_from_slice(raw);
        MonitorFrameEvent::from_cemi("test", &cemi, &MediumSettings::Tp1, decode).unwrap()
    }

    fn group_write() -> Vec<u8> {
        with_checksum(&[0xBC, 0x11, 0x05, 0x08, 0x01, 0xE1, 0x00, 0x81])
    }

    #[test]
    fn test_compact_with_base_frame() {
        let e = event(0x04, &group_write(), true);
        assert_eq!(
            format_event(&e, true).unwrap(),
            "Seq 4 L_Data low from 1.1.5 to 1/0/1, hop count 6, tpdu 00 81: GroupValue_Write 01"
        );
    }

    #[test]
    fn test_verbose_with_base_frame() {
        let raw = group_write();
        let e = event(0x04, &raw, true);
        let envelope = e.frame.to_string();
        assert_eq!(
            format_event(&e, false).unwrap(),
            format!(
                "{envelope} = L_Data low from 1.1.5 to 1/0/1, hop count 6, tpdu 00 81: GroupValue_Write 01"
            )
        );
        assert!(envelope.starts_with("BusMon.ind seq 4: bc 11 05"));
    }

    #[test]
    fn test_ack_frame_has_no_service() {
        let e = event(0x01, &[0xCC], true);
        assert_eq!(format_event(&e, true).unwrap(), "Seq 1 ACK");
        assert_eq!(format_event(&e, false).unwrap(), "BusMon.ind seq 1: cc = ACK");
    }

    #[test]
    fn test_undecoded_frame_is_envelope_only() {
        let e = event(0x02, &group_write(), false);
        assert_eq!(format_event(&e, true).unwrap(), "Seq 2");
        assert_eq!(format_event(&e, false).unwrap(), e.frame.to_string());

        let mut corrupt = group_write();
        corrupt[8] ^= 0xFF;
        let e = event(0x02, &corrupt, true);
        assert!(e.raw.is_none());
        assert_eq!(format_event(&e, true).unwrap(), "Seq 2");
    }

    #[test]
    fn test_untranslatable_tpdu_is_an_error() {
        // Data TPDU without APCI octet
        let e = event(0x00, &with_checksum(&[0xBC, 0x11, 0x05, 0x08, 0x01, 0xE0, 0x00]), true);
        assert!(e.raw.is_some());
        assert_eq!(
            format_event(&e, true),
            Err(FormatError::Apdu(ApduError::MissingApci(1)))
        );
    }

    #[test]
    fn test_timestamp_prefix() {
        let e = event(0x03, &[0xCC], false);
        let time = Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        assert_eq!(format_line_at(&e, true, &time).unwrap(), "13:04:05.000 Seq 3");
        assert!(format_line(&e, true).unwrap().ends_with(" Seq 3"));
    }
}
