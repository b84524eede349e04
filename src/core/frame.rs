//! Bus monitor frames
//!
//! A monitored frame arrives as a cEMI `L_Busmon.ind` message. The message
//! envelope ([`BusmonFrame`]) carries the sequence number, an optional
//! timestamp and the status flags reported by the interface. The monitored
//! bytes themselves may be decoded further into a [`RawFrame`]; decoding is
//! best effort and an event without a raw frame is still a valid event.

use crate::config::MediumSettings;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// cEMI message code of a bus monitor indication
pub const MC_BUSMON_IND: u8 = 0x2B;

const ADD_INFO_BUSMON_STATUS: u8 = 0x03;
const ADD_INFO_TIMESTAMP: u8 = 0x04;
const ADD_INFO_EXT_TIMESTAMP: u8 = 0x06;

/// Frame decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes for the announced structure
    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Unexpected cEMI message code
    #[error("Unexpected cEMI message code 0x{0:02x}")]
    MessageCode(u8),

    /// Checksum mismatch
    #[error("Checksum mismatch (0x{0:02x})")]
    Checksum(u8),

    /// Raw frames of this medium are not decoded
    #[error("No raw frame decoder for medium {0}")]
    UnsupportedMedium(&'static str),
}

/// Individual (physical) device address, `area.line.device`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndividualAddress(pub u16);

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0 >> 12, (self.0 >> 8) & 0x0F, self.0 & 0xFF)
    }
}

/// Group address, three-level notation `main/middle/sub`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupAddress(pub u16);

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.0 >> 11, (self.0 >> 8) & 0x07, self.0 & 0xFF)
    }
}

/// Destination of a link layer frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point destination
    Individual(IndividualAddress),
    /// Multicast destination
    Group(GroupAddress),
}

impl Destination {
    fn from_raw(address: u16, group: bool) -> Self {
        if group {
            Self::Group(GroupAddress(address))
        } else {
            Self::Individual(IndividualAddress(address))
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Individual(a) => a.fmt(f),
            Self::Group(a) => a.fmt(f),
        }
    }
}

/// Frame priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// System priority
    System,
    /// Normal priority
    Normal,
    /// Urgent priority
    Urgent,
    /// Low priority
    Low,
}

impl Priority {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::System,
            1 => Self::Normal,
            2 => Self::Urgent,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Normal => write!(f, "normal"),
            Self::Urgent => write!(f, "urgent"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// Format bytes as lowercase hex pairs joined by `separator`
pub fn to_hex(data: &[u8], separator: &str) -> String {
    let encoded = hex::encode(data);
    let mut out = String::with_capacity(encoded.len() + data.len() * separator.len());
    for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        out.extend(pair.iter().map(|&c| c as char));
    }
    out
}

/// Envelope of one bus monitor indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusmonFrame {
    /// Sequence number reported by the interface (0..=7)
    pub sequence: u8,
    /// Relative timestamp, if the interface supplied one
    pub timestamp: Option<u32>,
    /// Raw bus monitor status byte
    pub status: u8,
    /// Monitored bytes, as seen on the medium
    pub payload: Bytes,
}

impl BusmonFrame {
    /// Parse a cEMI `L_Busmon.ind` message
    pub fn parse(cemi: &[u8]) -> Result<Self, FrameError> {
        if cemi.len() < 2 {
            return Err(FrameError::Truncated {
                expected: 2,
                actual: cemi.len(),
            });
        }
        if cemi[0] != MC_BUSMON_IND {
            return Err(FrameError::MessageCode(cemi[0]));
        }

        let info_len = usize::from(cemi[1]);
        let body_start = 2 + info_len;
        if cemi.len() < body_start {
            return Err(FrameError::Truncated {
                expected: body_start,
                actual: cemi.len(),
            });
        }

        let mut status = 0;
        let mut timestamp = None;
        let mut info = &cemi[2..body_start];
        while info.len() >= 2 {
            let (kind, len) = (info[0], usize::from(info[1]));
            let Some(data) = info.get(2..2 + len) else {
                return Err(FrameError::Truncated {
                    expected: 2 + len,
                    actual: info.len(),
                });
            };
            match (kind, data) {
                (ADD_INFO_BUSMON_STATUS, [s]) => status = *s,
                (ADD_INFO_TIMESTAMP, [hi, lo]) => {
                    timestamp = Some(u32::from(u16::from_be_bytes([*hi, *lo])));
                }
                (ADD_INFO_EXT_TIMESTAMP, [a, b, c, d]) => {
                    timestamp = Some(u32::from_be_bytes([*a, *b, *c, *d]));
                }
                _ => {}
            }
            info = &info[2 + len..];
        }

        Ok(Self {
            sequence: status & 0x07,
            timestamp,
            status,
            payload: Bytes::copy_from_slice(&cemi[body_start..]),
        })
    }

    /// Frame error flag
    pub fn frame_error(&self) -> bool {
        self.status & 0x80 != 0
    }

    /// Bit error flag
    pub fn bit_error(&self) -> bool {
        self.status & 0x40 != 0
    }

    /// Parity error flag
    pub fn parity_error(&self) -> bool {
        self.status & 0x20 != 0
    }

    /// Interface buffer overflow flag
    pub fn overflow(&self) -> bool {
        self.status & 0x10 != 0
    }

    /// Lost frame flag
    pub fn lost(&self) -> bool {
        self.status & 0x08 != 0
    }
}

impl fmt::Display for BusmonFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusMon.ind seq {}", self.sequence)?;
        if let Some(ts) = self.timestamp {
            write!(f, " ts {ts}")?;
        }
        for (set, flag) in [
            (self.frame_error(), "frame error"),
            (self.bit_error(), "bit error"),
            (self.parity_error(), "parity error"),
            (self.overflow(), "overflow"),
            (self.lost(), "lost"),
        ] {
            if set {
                write!(f, " {flag}")?;
            }
        }
        write!(f, ": {}", to_hex(&self.payload, " "))
    }
}

/// Acknowledge frame kinds on TP1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFrame {
    /// Positive acknowledge
    Ack,
    /// Negative acknowledge
    Nak,
    /// Receiver busy
    Busy,
    /// Negative acknowledge and busy
    NakBusy,
}

impl AckFrame {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0xCC => Self::Ack,
            0xC0 => Self::Busy,
            0x00 => Self::NakBusy,
            _ => Self::Nak,
        }
    }
}

impl fmt::Display for AckFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Busy => write!(f, "BUSY"),
            Self::NakBusy => write!(f, "NAK+BUSY"),
        }
    }
}

/// Link layer data frame (standard or extended format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LDataFrame {
    /// Extended frame format
    pub extended: bool,
    /// Repeated transmission
    pub repeated: bool,
    /// Priority
    pub priority: Priority,
    /// Source address
    pub source: IndividualAddress,
    /// Destination address
    pub destination: Destination,
    /// Hop count
    pub hop_count: u8,
    /// Transport protocol data unit
    pub tpdu: Bytes,
}

impl LDataFrame {
    fn parse(data: &[u8], verify_checksum: bool) -> Result<Self, FrameError> {
        let extended = data[0] & 0x80 == 0;
        let header = if extended { 7 } else { 6 };
        if data.len() < header + 1 {
            return Err(FrameError::Truncated {
                expected: header + 1,
                actual: data.len(),
            });
        }

        let ctrl = data[0];
        let (addr_ctrl, len) = if extended {
            (data[1], usize::from(data[6]))
        } else {
            (data[5], usize::from(data[5] & 0x0F))
        };
        let total = header + len + 1 + 1;
        if data.len() < total {
            return Err(FrameError::Truncated {
                expected: total,
                actual: data.len(),
            });
        }
        if verify_checksum {
            let check = data[..total].iter().fold(0u8, |acc, b| acc ^ b);
            if check != 0xFF {
                return Err(FrameError::Checksum(data[total - 1]));
            }
        }

        Ok(Self {
            extended,
            repeated: ctrl & 0x20 == 0,
            priority: Priority::from_bits(ctrl >> 2),
            source: IndividualAddress(u16::from_be_bytes([data[header - 5], data[header - 4]])),
            destination: Destination::from_raw(
                u16::from_be_bytes([data[header - 3], data[header - 2]]),
                addr_ctrl & 0x80 != 0,
            ),
            hop_count: (addr_ctrl >> 4) & 0x07,
            tpdu: Bytes::copy_from_slice(&data[header..header + len + 1]),
        })
    }
}

impl fmt::Display for LDataFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.extended { "L_Data_Ext" } else { "L_Data" };
        write!(
            f,
            "{kind} {} from {} to {}, hop count {}",
            self.priority, self.source, self.destination, self.hop_count
        )?;
        if self.repeated {
            write!(f, " repeated")?;
        }
        write!(f, ", tpdu {}", to_hex(&self.tpdu, " "))
    }
}

/// Decoded structure of the monitored bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// Data frame; exposes the link layer structure
    LData(LDataFrame),
    /// Acknowledge frame
    Ack(AckFrame),
}

impl RawFrame {
    /// Decode the monitored bytes for the given medium
    pub fn decode(medium: &MediumSettings, data: &[u8]) -> Result<Self, FrameError> {
        let verify = match medium {
            MediumSettings::Tp1 => true,
            MediumSettings::Pl110 { .. } | MediumSettings::Pl132 { .. } => false,
            MediumSettings::Rf { .. } => return Err(FrameError::UnsupportedMedium("RF")),
        };
        match data {
            [] => Err(FrameError::Truncated {
                expected: 1,
                actual: 0,
            }),
            [byte] => Ok(Self::Ack(AckFrame::from_byte(*byte))),
            _ => LDataFrame::parse(data, verify).map(Self::LData),
        }
    }

    /// The link layer structure, if this is a base (data) frame
    pub fn as_base(&self) -> Option<&LDataFrame> {
        match self {
            Self::LData(frame) => Some(frame),
            Self::Ack(_) => None,
        }
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LData(frame) => frame.fmt(f),
            Self::Ack(ack) => ack.fmt(f),
        }
    }
}

/// One monitored frame as delivered to link listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorFrameEvent {
    /// Name of the link that received the frame
    pub source: String,
    /// Indication envelope
    pub frame: BusmonFrame,
    /// Decoded raw frame; `None` if decoding was disabled or failed
    pub raw: Option<RawFrame>,
}

impl MonitorFrameEvent {
    /// Build an event from a cEMI message, decoding the raw frame when asked to
    pub fn from_cemi(
        source: &str,
        cemi: &[u8],
        medium: &MediumSettings,
        decode_raw: bool,
    ) -> Result<Self, FrameError> {
        let frame = BusmonFrame::parse(cemi)?;
        let raw = if decode_raw {
            match RawFrame::decode(medium, &frame.payload) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    tracing::trace!("{source}: raw frame not decoded: {e}");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            source: source.to_string(),
            frame,
            raw,
        })
    }
}
