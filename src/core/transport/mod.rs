//! Monitoring links
//!
//! Supports:
//! - KNXnet/IP tunneling in bus monitor layer
//! - Serial FT1.2 interfaces switched to bus monitor mode
//!
//! A link pushes [`MonitorFrameEvent`]s and one final [`CloseEvent`] to its
//! registered [`LinkListener`]s. Delivery runs on a dedicated thread fed by an
//! ordered channel, so a slow listener never stalls the transport reader.
//! Frames received before the first listener is registered are held and
//! delivered to it in order.

mod ip;
mod serial;

pub use ip::IpMonitorLink;
pub use serial::SerialMonitorLink;

use crate::config::{ConfigError, Configuration, LocalBind, MediumSettings, Target};
use crate::core::frame::MonitorFrameEvent;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Link error types
#[derive(Error, Debug)]
pub enum LinkError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No response within the protocol timeout
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Serial port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Address unusable for this transport
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Remote side refused the connection
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// Host resolution failed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Who closed a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// Closed on request of this side
    Client,
    /// Closed by the remote endpoint
    Server,
    /// Closed by the link itself after an error
    Internal,
}

impl fmt::Display for CloseInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Final notification of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Initiator of the close
    pub initiator: CloseInitiator,
    /// Human readable reason
    pub reason: String,
}

impl CloseEvent {
    /// Create a new close event
    pub fn new(initiator: CloseInitiator, reason: impl Into<String>) -> Self {
        Self {
            initiator,
            reason: reason.into(),
        }
    }
}

/// Receiver of link notifications.
///
/// Callbacks run on the link's delivery thread.
#[cfg_attr(test, mockall::automock)]
pub trait LinkListener: Send + Sync {
    /// One monitored frame
    fn frame_received(&self, event: &MonitorFrameEvent);

    /// The link is closed; no further callbacks follow
    fn link_closed(&self, event: &CloseEvent);
}

/// A passive monitoring link
pub trait MonitorLink: Send {
    /// Register a listener for frames and the close notification
    fn add_listener(&mut self, listener: Arc<dyn LinkListener>);

    /// Decode monitored bytes into raw frames before delivery
    fn set_decode_raw_frames(&mut self, decode: bool);

    /// Check if the link is open
    fn is_open(&self) -> bool;

    /// Close the link; closing a closed link does nothing
    fn close(&mut self);

    /// Medium of the monitored network
    fn medium(&self) -> &MediumSettings;

    /// Link name for diagnostics
    fn name(&self) -> &str;
}

/// Frames kept while no listener is registered
pub const HELD_FRAMES_LIMIT: usize = 256;

enum LinkEvent {
    Frame(Bytes),
    ListenerAdded,
    Closed(CloseEvent),
}

struct CoreInner {
    name: String,
    medium: MediumSettings,
    open: AtomicBool,
    decode_raw: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn LinkListener>>>,
    tx: Sender<LinkEvent>,
}

/// Shared state and event delivery of a link.
///
/// Cloned into transport reader threads. The first [`LinkCore::close`] wins
/// and is the only one that produces a close notification.
#[derive(Clone)]
pub struct LinkCore {
    inner: Arc<CoreInner>,
}

impl LinkCore {
    /// Create the core and start its delivery thread
    pub fn start(name: &str, medium: MediumSettings) -> Result<Self, LinkError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(CoreInner {
            name: name.to_string(),
            medium,
            open: AtomicBool::new(true),
            decode_raw: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            tx,
        });

        let delivery = inner.clone();
        std::thread::Builder::new()
            .name(format!("{name} delivery"))
            .spawn(move || deliver(&delivery, &rx))?;

        Ok(Self { inner })
    }

    /// Link name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Medium settings
    pub fn medium(&self) -> &MediumSettings {
        &self.inner.medium
    }

    /// Check if the link is open
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn LinkListener>) {
        self.inner.listeners.write().push(listener);
        let _ = self.inner.tx.send(LinkEvent::ListenerAdded);
    }

    /// Enable or disable raw frame decoding
    pub fn set_decode_raw_frames(&self, decode: bool) {
        self.inner.decode_raw.store(decode, Ordering::SeqCst);
    }

    /// Queue a received cEMI message for delivery
    pub fn deliver_frame(&self, cemi: &[u8]) {
        if self.is_open() {
            let _ = self.inner.tx.send(LinkEvent::Frame(Bytes::copy_from_slice(cemi)));
        }
    }

    /// Mark the link closed and queue the close notification.
    ///
    /// Returns `true` only for the call that actually closed the link.
    pub fn close(&self, initiator: CloseInitiator, reason: &str) -> bool {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!("{}: closed by {initiator} ({reason})", self.inner.name);
        let _ = self
            .inner
            .tx
            .send(LinkEvent::Closed(CloseEvent::new(initiator, reason)));
        true
    }
}

fn dispatch(inner: &CoreInner, listeners: &[Arc<dyn LinkListener>], cemi: &[u8]) {
    let decode = inner.decode_raw.load(Ordering::SeqCst);
    match MonitorFrameEvent::from_cemi(&inner.name, cemi, &inner.medium, decode) {
        Ok(event) => {
            for listener in listeners {
                listener.frame_received(&event);
            }
        }
        Err(e) => tracing::warn!("{}: discarding message: {e}", inner.name),
    }
}

fn deliver(inner: &CoreInner, rx: &Receiver<LinkEvent>) {
    let mut held: VecDeque<Bytes> = VecDeque::new();
    for event in rx {
        let listeners = inner.listeners.read().clone();
        let closed = match event {
            LinkEvent::Frame(cemi) => {
                held.push_back(cemi);
                if held.len() > HELD_FRAMES_LIMIT {
                    held.pop_front();
                    tracing::debug!("{}: no listener, oldest held frame dropped", inner.name);
                }
                None
            }
            LinkEvent::ListenerAdded => None,
            LinkEvent::Closed(event) => Some(event),
        };

        // Held frames go out first so delivery order matches arrival order
        if !listeners.is_empty() {
            for cemi in held.drain(..) {
                dispatch(inner, &listeners, &cemi);
            }
        }
        if let Some(event) = closed {
            for listener in &listeners {
                listener.link_closed(&event);
            }
            break;
        }
    }
    tracing::trace!("{}: delivery finished", inner.name);
}

/// Builds links from a configuration
pub trait LinkFactory: Send + Sync {
    /// Construct and open a link
    fn open(&self, config: &Configuration) -> Result<Box<dyn MonitorLink>, LinkError>;
}

impl<F> LinkFactory for F
where
    F: Fn(&Configuration) -> Result<Box<dyn MonitorLink>, LinkError> + Send + Sync,
{
    fn open(&self, config: &Configuration) -> Result<Box<dyn MonitorLink>, LinkError> {
        self(config)
    }
}

/// Factory for the links shipped with this crate
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLinkFactory;

impl LinkFactory for DefaultLinkFactory {
    fn open(&self, config: &Configuration) -> Result<Box<dyn MonitorLink>, LinkError> {
        create_link(config)
    }
}

/// Create a link instance from configuration
pub fn create_link(config: &Configuration) -> Result<Box<dyn MonitorLink>, LinkError> {
    let medium = config.medium_settings();
    match &config.target {
        Target::Serial(target) => {
            let device = target.device_name();
            tracing::info!("opening serial link on {device} ({target}), medium {medium}");
            Ok(Box::new(SerialMonitorLink::open(&device, medium)?))
        }
        Target::Ip(endpoint) => {
            let remote = endpoint.resolve()?;
            let local = local_address(config.local.as_ref(), remote)?;
            tracing::info!(
                "opening KNXnet/IP link {local} -> {remote}{}, medium {medium}",
                if config.nat { " (NAT)" } else { "" }
            );
            Ok(Box::new(IpMonitorLink::open(local, remote, config.nat, medium)?))
        }
    }
}

/// Local socket address for a tunnel towards `remote`
fn local_address(bind: Option<&LocalBind>, remote: SocketAddr) -> Result<SocketAddr, LinkError> {
    match bind {
        Some(LocalBind::Endpoint(endpoint)) => Ok(endpoint.resolve()?),
        Some(LocalBind::Port(port)) => Ok(SocketAddr::new(outbound_address(remote)?, *port)),
        None if remote.is_ipv4() => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        None => Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)),
    }
}

/// Address of this host on the route towards `remote`
pub(crate) fn outbound_address(remote: SocketAddr) -> Result<IpAddr, LinkError> {
    let unspecified: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let probe = UdpSocket::bind(unspecified)?;
    probe.connect(remote)?;
    Ok(probe.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::MC_BUSMON_IND;
    use std::time::Duration;

    fn wait_closed(core: &LinkCore) {
        // The delivery thread keeps a clone of the inner state until it exits
        for _ in 0..200 {
            if Arc::strong_count(&core.inner) == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("delivery thread did not finish");
    }

    #[test]
    fn test_delivery_order_and_single_close() {
        let core = LinkCore::start("test", MediumSettings::Tp1).unwrap();

        let mut listener = MockLinkListener::new();
        let mut seq = mockall::Sequence::new();
        for expected in 0..3u8 {
            listener
                .expect_frame_received()
                .withf(move |e| e.frame.sequence == expected)
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }
        listener
            .expect_link_closed()
            .withf(|e| e.initiator == CloseInitiator::Server)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        core.add_listener(Arc::new(listener));

        for status in 0..3u8 {
            core.deliver_frame(&[MC_BUSMON_IND, 0x03, 0x03, 0x01, status, 0xCC]);
        }
        assert!(core.close(CloseInitiator::Server, "gone"));
        assert!(!core.close(CloseInitiator::Client, "again"));
        assert!(!core.is_open());

        // Dropped after close
        core.deliver_frame(&[MC_BUSMON_IND, 0x00, 0xCC]);
        wait_closed(&core);
    }

    #[test]
    fn test_frames_before_first_listener_are_held() {
        let core = LinkCore::start("test", MediumSettings::Tp1).unwrap();
        for status in 0..3u8 {
            core.deliver_frame(&[MC_BUSMON_IND, 0x03, 0x03, 0x01, status, 0xCC]);
        }
        // Let the delivery thread see the frames with no listener registered
        std::thread::sleep(Duration::from_millis(50));

        let mut listener = MockLinkListener::new();
        let mut seq = mockall::Sequence::new();
        for expected in 0..4u8 {
            listener
                .expect_frame_received()
                .withf(move |e| e.frame.sequence == expected)
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }
        listener
            .expect_link_closed()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        core.set_decode_raw_frames(true);
        core.add_listener(Arc::new(listener));

        core.deliver_frame(&[MC_BUSMON_IND, 0x03, 0x03, 0x01, 0x03, 0xCC]);
        core.close(CloseInitiator::Server, "gone");
        wait_closed(&core);
    }

    #[test]
    fn test_held_frames_are_bounded() {
        let core = LinkCore::start("test", MediumSettings::Tp1).unwrap();
        for _ in 0..HELD_FRAMES_LIMIT + 10 {
            core.deliver_frame(&[MC_BUSMON_IND, 0x00, 0xCC]);
        }
        for _ in 0..200 {
            if core.inner.tx.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut listener = MockLinkListener::new();
        listener
            .expect_frame_received()
            .times(HELD_FRAMES_LIMIT)
            .return_const(());
        listener.expect_link_closed().times(1).return_const(());
        core.add_listener(Arc::new(listener));
        core.close(CloseInitiator::Client, "done");
        wait_closed(&core);
    }

    #[test]
    fn test_malformed_message_is_skipped() {
        let core = LinkCore::start("test", MediumSettings::Tp1).unwrap();
        let mut listener = MockLinkListener::new();
        listener.expect_frame_received().times(1).return_const(());
        listener.expect_link_closed().times(1).return_const(());
        core.add_listener(Arc::new(listener));

        core.deliver_frame(&[0x29, 0x00]);
        core.deliver_frame(&[MC_BUSMON_IND, 0x00, 0xCC]);
        core.close(CloseInitiator::Client, "done");
        wait_closed(&core);
    }

    #[test]
    fn test_local_address_defaults() {
        let remote: SocketAddr = "127.0.0.1:3671".parse().unwrap();
        assert_eq!(
            local_address(None, remote).unwrap(),
            "0.0.0.0:0".parse::<SocketAddr>().unwrap()
        );

        let local = local_address(Some(&LocalBind::Port(4000)), remote).unwrap();
        assert_eq!(local.port(), 4000);
        assert!(local.ip().is_loopback());
    }

    #[test]
    fn test_serial_open_failure_is_classified() {
        let config = Configuration::serial(crate::config::SerialTarget::Device(
            "/nonexistent/busmon-tty".to_string(),
        ));
        assert!(create_link(&config).is_err());
    }
}
