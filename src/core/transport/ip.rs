//! KNXnet/IP tunneling link in bus monitor layer

use super::{outbound_address, CloseInitiator, LinkCore, LinkError, LinkListener, MonitorLink};
use crate::config::MediumSettings;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEADER_SIZE: usize = 6;
const KNXNETIP_VERSION: u8 = 0x10;

const CONNECT_REQ: u16 = 0x0205;
const CONNECT_RES: u16 = 0x0206;
const CONNECTIONSTATE_REQ: u16 = 0x0207;
const CONNECTIONSTATE_RES: u16 = 0x0208;
const DISCONNECT_REQ: u16 = 0x0209;
const DISCONNECT_RES: u16 = 0x020A;
const TUNNELING_REQ: u16 = 0x0420;
const TUNNELING_ACK: u16 = 0x0421;

const HOST_PROTOCOL_UDP: u8 = 0x01;
const TUNNEL_CONNECTION: u8 = 0x04;
const BUSMONITOR_LAYER: u8 = 0x80;
const CONNECTION_HEADER_SIZE: u8 = 0x04;

/// Wait limit for a response from the server
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection state requests
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

const MAX_HEARTBEAT_FAILURES: u32 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn packet(service: u16, body: &[u8]) -> Vec<u8> {
    let total = (HEADER_SIZE + body.len()) as u16;
    let mut out = Vec::with_capacity(usize::from(total));
    out.extend_from_slice(&[HEADER_SIZE as u8, KNXNETIP_VERSION]);
    out.extend_from_slice(&service.to_be_bytes());
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn parse_packet(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < HEADER_SIZE || data[0] != HEADER_SIZE as u8 || data[1] != KNXNETIP_VERSION {
        return None;
    }
    let service = u16::from_be_bytes([data[2], data[3]]);
    let total = usize::from(u16::from_be_bytes([data[4], data[5]]));
    if total < HEADER_SIZE || total > data.len() {
        return None;
    }
    Some((service, &data[HEADER_SIZE..total]))
}

/// Host protocol address information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hpai(SocketAddrV4);

impl Hpai {
    /// Route-back endpoint: the server answers to the sender address
    const NAT: Self = Self(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[0x08, HOST_PROTOCOL_UDP]);
        out.extend_from_slice(&self.0.ip().octets());
        out.extend_from_slice(&self.0.port().to_be_bytes());
    }

    fn parse(data: &[u8]) -> Option<Self> {
        match data {
            [0x08, _, a, b, c, d, hi, lo, ..] => Some(Self(SocketAddrV4::new(
                Ipv4Addr::new(*a, *b, *c, *d),
                u16::from_be_bytes([*hi, *lo]),
            ))),
            _ => None,
        }
    }

    fn is_route_back(&self) -> bool {
        self.0.ip().is_unspecified() || self.0.port() == 0
    }
}

fn connect_request(endpoint: Hpai) -> Vec<u8> {
    let mut body = Vec::with_capacity(20);
    endpoint.encode(&mut body);
    endpoint.encode(&mut body);
    body.extend_from_slice(&[0x04, TUNNEL_CONNECTION, BUSMONITOR_LAYER, 0x00]);
    packet(CONNECT_REQ, &body)
}

fn channel_request(service: u16, channel: u8, endpoint: Hpai) -> Vec<u8> {
    let mut body = vec![channel, 0x00];
    endpoint.encode(&mut body);
    packet(service, &body)
}

fn tunneling_ack(channel: u8, seq: u8) -> Vec<u8> {
    packet(TUNNELING_ACK, &[CONNECTION_HEADER_SIZE, channel, seq, 0x00])
}

#[derive(Debug, PartialEq, Eq)]
struct ConnectResponse {
    channel: u8,
    status: u8,
    data_endpoint: Option<Hpai>,
}

fn parse_connect_response(body: &[u8]) -> Option<ConnectResponse> {
    let (&channel, &status) = (body.first()?, body.get(1)?);
    Some(ConnectResponse {
        channel,
        status,
        data_endpoint: Hpai::parse(&body[2..]),
    })
}

fn status_text(status: u8) -> String {
    match status {
        0x00 => "no error".to_string(),
        0x21 => "unknown connection id".to_string(),
        0x22 => "connection type not supported".to_string(),
        0x23 => "connection option not supported".to_string(),
        0x24 => "no more connections".to_string(),
        0x26 => "data connection error".to_string(),
        0x27 => "KNX subnetwork connection error".to_string(),
        0x29 => "tunneling layer not supported".to_string(),
        other => format!("status 0x{other:02x}"),
    }
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Wait for a packet of `service`, ignoring anything else
fn await_response(
    socket: &UdpSocket,
    service: u16,
    timeout: Duration,
) -> Result<(Vec<u8>, SocketAddr), LinkError> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 512];
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => match parse_packet(&buf[..n]) {
                Some((s, body)) if s == service => return Ok((body.to_vec(), from)),
                Some((s, _)) => tracing::trace!("ignoring service 0x{s:04x} from {from}"),
                None => tracing::trace!("ignoring malformed packet from {from}"),
            },
            Err(e) if is_poll_timeout(&e) || e.kind() == ErrorKind::ConnectionReset => {}
            Err(e) => return Err(e.into()),
        }
    }
    Err(LinkError::Timeout(timeout.as_secs()))
}

/// Tunnel connection to a KNXnet/IP server in bus monitor layer
pub struct IpMonitorLink {
    core: LinkCore,
    socket: UdpSocket,
    channel: u8,
    control: SocketAddr,
    endpoint: Hpai,
}

impl IpMonitorLink {
    /// Connect to `remote` from `local`.
    ///
    /// With `nat` the server is asked to answer to the sender address
    /// instead of the local endpoint.
    pub fn open(
        local: SocketAddr,
        remote: SocketAddr,
        nat: bool,
        medium: MediumSettings,
    ) -> Result<Self, LinkError> {
        if !remote.is_ipv4() {
            return Err(LinkError::InvalidAddress(format!(
                "{remote}: KNXnet/IP requires IPv4"
            )));
        }
        let socket = UdpSocket::bind(local)?;
        let endpoint = if nat {
            Hpai::NAT
        } else {
            local_endpoint(socket.local_addr()?, remote)?
        };
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        tracing::debug!("connect request to {remote}, local endpoint {}", endpoint.0);
        socket.send_to(&connect_request(endpoint), remote)?;
        let (body, from) = await_response(&socket, CONNECT_RES, RESPONSE_TIMEOUT)?;
        let response = parse_connect_response(&body)
            .ok_or_else(|| LinkError::ConnectionFailed("malformed connect response".to_string()))?;
        if response.status != 0 {
            return Err(LinkError::Rejected(status_text(response.status)));
        }
        let data = match response.data_endpoint {
            Some(hpai) if !nat && !hpai.is_route_back() => SocketAddr::V4(hpai.0),
            _ => from,
        };

        let name = format!("KNXnet/IP {remote}");
        let core = LinkCore::start(&name, medium)?;
        tracing::info!(
            "{name}: tunnel channel {} open, data endpoint {data}",
            response.channel
        );

        let reader = Reader {
            core: core.clone(),
            socket: socket.try_clone()?,
            channel: response.channel,
            control: remote,
            data,
            endpoint,
            expected_seq: 0,
            pending_heartbeat: None,
            heartbeat_failures: 0,
        };
        if let Err(e) = std::thread::Builder::new()
            .name(format!("{name} reader"))
            .spawn(move || reader.run())
        {
            core.close(CloseInitiator::Internal, "reader thread failed");
            return Err(e.into());
        }

        Ok(Self {
            core,
            socket,
            channel: response.channel,
            control: remote,
            endpoint,
        })
    }
}

fn local_endpoint(bound: SocketAddr, remote: SocketAddr) -> Result<Hpai, LinkError> {
    let ip = match bound.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => IpAddr::V4(ip),
        IpAddr::V4(_) => outbound_address(remote)?,
        IpAddr::V6(ip) => IpAddr::V6(ip),
    };
    match ip {
        IpAddr::V4(ip) => Ok(Hpai(SocketAddrV4::new(ip, bound.port()))),
        IpAddr::V6(ip) => Err(LinkError::InvalidAddress(format!(
            "{ip}: KNXnet/IP requires IPv4"
        ))),
    }
}

impl MonitorLink for IpMonitorLink {
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
        if self.core.close(CloseInitiator::Client, "user request") {
            let request = channel_request(DISCONNECT_REQ, self.channel, self.endpoint);
            if let Err(e) = self.socket.send_to(&request, self.control) {
                tracing::debug!("{}: disconnect request failed: {e}", self.core.name());
            }
        }
    }

    fn medium(&self) -> &MediumSettings {
        self.core.medium()
    }

    fn name(&self) -> &str {
        self.core.name()
    }
}

impl Drop for IpMonitorLink {
    fn drop(&mut self) {
        self.close();
    }
}

struct Reader {
    core: LinkCore,
    socket: UdpSocket,
    channel: u8,
    control: SocketAddr,
    data: SocketAddr,
    endpoint: Hpai,
    expected_seq: u8,
    pending_heartbeat: Option<Instant>,
    heartbeat_failures: u32,
}

impl Reader {
    fn run(mut self) {
        let mut buf = [0u8; 512];
        let mut next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;

        while self.core.is_open() {
            let now = Instant::now();
            if let Some(sent) = self.pending_heartbeat {
                if now.duration_since(sent) >= RESPONSE_TIMEOUT {
                    self.pending_heartbeat = None;
                    self.heartbeat_failures += 1;
                    tracing::warn!(
                        "{}: no connection state response ({}/{MAX_HEARTBEAT_FAILURES})",
                        self.core.name(),
                        self.heartbeat_failures
                    );
                    if self.heartbeat_failures >= MAX_HEARTBEAT_FAILURES {
                        self.core.close(
                            CloseInitiator::Internal,
                            "no response to connection state requests",
                        );
                        break;
                    }
                    next_heartbeat = now;
                }
            }
            if self.pending_heartbeat.is_none() && now >= next_heartbeat {
                let request = channel_request(CONNECTIONSTATE_REQ, self.channel, self.endpoint);
                if let Err(e) = self.socket.send_to(&request, self.control) {
                    self.core.close(CloseInitiator::Internal, &e.to_string());
                    break;
                }
                self.pending_heartbeat = Some(now);
                next_heartbeat = now + HEARTBEAT_INTERVAL;
            }

            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => self.handle(&buf[..n], from),
                Err(e) if is_poll_timeout(&e) || e.kind() == ErrorKind::ConnectionReset => {}
                Err(e) => {
                    self.core.close(CloseInitiator::Internal, &e.to_string());
                    break;
                }
            }
        }
        tracing::trace!("{}: reader finished", self.core.name());
    }

    fn handle(&mut self, data: &[u8], from: SocketAddr) {
        let Some((service, body)) = parse_packet(data) else {
            tracing::trace!("{}: malformed packet from {from}", self.core.name());
            return;
        };
        if body.len() < 2 {
            return;
        }

        match service {
            TUNNELING_REQ => self.tunneling_request(body),
            CONNECTIONSTATE_RES if body[0] == self.channel => {
                self.pending_heartbeat = None;
                if body[1] == 0 {
                    self.heartbeat_failures = 0;
                } else {
                    let reason = format!("connection state: {}", status_text(body[1]));
                    self.core.close(CloseInitiator::Internal, &reason);
                }
            }
            DISCONNECT_REQ if body[0] == self.channel => {
                let response = packet(DISCONNECT_RES, &[self.channel, 0x00]);
                let _ = self.socket.send_to(&response, self.control);
                self.core.close(CloseInitiator::Server, "server request");
            }
            DISCONNECT_RES => {}
            other => tracing::trace!("{}: ignoring service 0x{other:04x}", self.core.name()),
        }
    }

    fn tunneling_request(&mut self, body: &[u8]) {
        let [CONNECTION_HEADER_SIZE, channel, seq, _, cemi @ ..] = body else {
            return;
        };
        if *channel != self.channel {
            return;
        }
        if *seq == self.expected_seq {
            self.ack(*seq);
            self.expected_seq = self.expected_seq.wrapping_add(1);
            self.core.deliver_frame(cemi);
        } else if *seq == self.expected_seq.wrapping_sub(1) {
            // Repeated request; our ack got lost
            self.ack(*seq);
        } else {
            tracing::debug!(
                "{}: out of sequence request {seq}, expected {}",
                self.core.name(),
                self.expected_seq
            );
        }
    }

    fn ack(&self, seq: u8) {
        if let Err(e) = self.socket.send_to(&tunneling_ack(self.channel, seq), self.data) {
            tracing::debug!("{}: tunneling ack failed: {e}", self.core.name());
        }
    }
}
