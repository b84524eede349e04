//! FT1.2 serial link in bus monitor mode

use super::{CloseInitiator, LinkCore, LinkError, LinkListener, MonitorLink};
use crate::config::MediumSettings;
use crate::core::frame::{to_hex, MC_BUSMON_IND};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// FT1.2 line speed
pub const BAUD_RATE: u32 = 19200;

const ACK: u8 = 0xE5;
const START_FIXED: u8 = 0x10;
const START_VARIABLE: u8 = 0x68;
const END: u8 = 0x16;

const CTRL_RESET: u8 = 0x40;
const CTRL_SEND_FCB_SET: u8 = 0x73;
const CTRL_SEND_FCB_CLEAR: u8 = 0x53;

const COMM_MODE_DATA_LINK: u8 = 0x00;
const COMM_MODE_BUSMONITOR: u8 = 0x01;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const ACK_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_REPETITIONS: usize = 3;

/// cEMI M_PropWrite.req of the communication mode property (PID 52)
fn comm_mode_request(mode: u8) -> [u8; 8] {
    [0xF6, 0x00, 0x08, 0x01, 0x34, 0x10, 0x01, mode]
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn fixed_frame(control: u8) -> [u8; 4] {
    [START_FIXED, control, control, END]
}

fn variable_frame(control: u8, data: &[u8]) -> Vec<u8> {
    let len = (data.len() + 1) as u8;
    let mut out = Vec::with_capacity(data.len() + 7);
    out.extend_from_slice(&[START_VARIABLE, len, len, START_VARIABLE, control]);
    out.extend_from_slice(data);
    out.push(control.wrapping_add(checksum(data)));
    out.push(END);
    out
}

/// Frames received from an FT1.2 interface
#[derive(Debug, Clone, PartialEq, Eq)]
enum Ft12Frame {
    Ack,
    Fixed(u8),
    Variable { control: u8, data: Bytes },
}

/// Reassembles FT1.2 frames from the byte stream, resynchronizing on garbage
#[derive(Debug, Default)]
struct Ft12Decoder {
    buffer: BytesMut,
}

impl Ft12Decoder {
    fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Ft12Frame> {
        loop {
            match *self.buffer.first()? {
                ACK => {
                    self.buffer.advance(1);
                    return Some(Ft12Frame::Ack);
                }
                START_FIXED => {
                    let frame = self.buffer.get(..4)?;
                    if frame[1] == frame[2] && frame[3] == END {
                        let control = frame[1];
                        self.buffer.advance(4);
                        return Some(Ft12Frame::Fixed(control));
                    }
                    self.buffer.advance(1);
                }
                START_VARIABLE => {
                    let header = self.buffer.get(..4)?;
                    let len = usize::from(header[1]);
                    if len == 0 || header[2] != header[1] || header[3] != START_VARIABLE {
                        self.buffer.advance(1);
                        continue;
                    }
                    let frame = self.buffer.get(..len + 6)?;
                    let body = &frame[4..4 + len];
                    if frame[4 + len] != checksum(body) || frame[5 + len] != END {
                        tracing::debug!("FT1.2 frame with bad checksum or end byte");
                        self.buffer.advance(1);
                        continue;
                    }
                    let control = body[0];
                    let data = Bytes::copy_from_slice(&body[1..]);
                    self.buffer.advance(len + 6);
                    return Some(Ft12Frame::Variable { control, data });
                }
                other => {
                    tracing::trace!("FT1.2 skipping byte 0x{other:02x}");
                    self.buffer.advance(1);
                }
            }
        }
    }
}

fn map_open_error(device: &str, e: serialport::Error) -> LinkError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => LinkError::PortNotFound(device.to_string()),
        serialport::ErrorKind::Io(ErrorKind::NotFound) => LinkError::PortNotFound(device.to_string()),
        serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => {
            LinkError::PermissionDenied(device.to_string())
        }
        _ => LinkError::ConnectionFailed(e.to_string()),
    }
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// Send `frame` and wait for the interface's acknowledge, repeating on silence
fn send_confirmed(
    port: &mut dyn SerialPort,
    decoder: &mut Ft12Decoder,
    frame: &[u8],
) -> Result<(), LinkError> {
    let mut buf = [0u8; 64];
    for attempt in 1..=MAX_REPETITIONS {
        port.write_all(frame)?;
        port.flush()?;
        let deadline = Instant::now() + ACK_TIMEOUT;
        while Instant::now() < deadline {
            match port.read(&mut buf) {
                Ok(n) => decoder.push(&buf[..n]),
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
            while let Some(received) = decoder.next_frame() {
                match received {
                    Ft12Frame::Ack => return Ok(()),
                    other => tracing::trace!("FT1.2 unexpected {other:?} while awaiting ack"),
                }
            }
        }
        tracing::debug!("FT1.2 no acknowledge (attempt {attempt}/{MAX_REPETITIONS})");
    }
    Err(LinkError::Timeout(ACK_TIMEOUT.as_secs() * MAX_REPETITIONS as u64))
}

/// Serial FT1.2 interface switched to bus monitor mode
pub struct SerialMonitorLink {
    core: LinkCore,
    port: Mutex<Box<dyn SerialPort>>,
    frame_count_bit: bool,
}

impl SerialMonitorLink {
    /// Open `device`, reset the interface and enter bus monitor mode
    pub fn open(device: &str, medium: MediumSettings) -> Result<Self, LinkError> {
        let mut port = serialport::new(device, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| map_open_error(device, e))?;

        let mut decoder = Ft12Decoder::default();
        send_confirmed(port.as_mut(), &mut decoder, &fixed_frame(CTRL_RESET))?;
        send_confirmed(
            port.as_mut(),
            &mut decoder,
            &variable_frame(CTRL_SEND_FCB_SET, &comm_mode_request(COMM_MODE_BUSMONITOR)),
        )?;

        let name = format!("FT1.2 {device}");
        let reader_port = port
            .try_clone()
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;
        let core = LinkCore::start(&name, medium)?;
        tracing::info!("{name}: bus monitor mode active at {BAUD_RATE} baud");

        let reader = core.clone();
        if let Err(e) = std::thread::Builder::new()
            .name(format!("{name} reader"))
            .spawn(move || read_loop(&reader, reader_port, decoder))
        {
            core.close(CloseInitiator::Internal, "reader thread failed");
            return Err(e.into());
        }

        Ok(Self {
            core,
            port: Mutex::new(port),
            frame_count_bit: false,
        })
    }
}

fn read_loop(core: &LinkCore, mut port: Box<dyn SerialPort>, mut decoder: Ft12Decoder) {
    let mut buf = [0u8; 256];
    while core.is_open() {
        match port.read(&mut buf) {
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) if is_poll_timeout(&e) => continue,
            Err(e) => {
                core.close(CloseInitiator::Internal, &e.to_string());
                break;
            }
        }

        while let Some(frame) = decoder.next_frame() {
            let data = match frame {
                Ft12Frame::Ack => continue,
                Ft12Frame::Fixed(_) => None,
                Ft12Frame::Variable { data, .. } => Some(data),
            };
            if let Err(e) = port.write_all(&[ACK]) {
                core.close(CloseInitiator::Internal, &e.to_string());
                return;
            }
            match data {
                Some(cemi) if cemi.first() == Some(&MC_BUSMON_IND) => core.deliver_frame(&cemi),
                Some(cemi) => {
                    tracing::trace!("{}: ignoring cEMI {}", core.name(), to_hex(&cemi, " "));
                }
                None => {}
            }
        }
    }
    tracing::trace!("{}: reader finished", core.name());
}

impl MonitorLink for SerialMonitorLink {
    fn add_listener(&mut self, listener: Arc<dyn LinkListener>) {
        self.core.add_listener(listener);
    }

    fn set_decode_raw_frames(&mut self, decode: bool) {
        self.core.set_decode_raw_frames(decode);
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn close(&mut self) {
        if !self.core.close(CloseInitiator::Client, "user request") {
            return;
        }
        // Back to data link mode; the reader consumes the acknowledge
        let control = if self.frame_count_bit {
            CTRL_SEND_FCB_SET
        } else {
            CTRL_SEND_FCB_CLEAR
        };
        self.frame_count_bit = !self.frame_count_bit;
        let frame = variable_frame(control, &comm_mode_request(COMM_MODE_DATA_LINK));
        let mut port = self.port.lock();
        if let Err(e) = port.write_all(&frame).and_then(|()| port.flush()) {
            tracing::debug!("{}: leaving bus monitor mode failed: {e}", self.core.name());
        }
    }

    fn medium(&self) -> &MediumSettings {
        self.core.medium()
    }

    fn name(&self) -> &str {
        self.core.name()
    }
}

impl Drop for SerialMonitorLink {
    fn drop(&mut self) {
        self.close();
    }
}
