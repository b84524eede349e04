//! Configuration module
//!
//! Turns command line tokens into an immutable [`Configuration`] for one
//! monitoring session.

mod args;
mod medium;

pub use args::{parse_args, Options};
pub use medium::{MediumProfile, MediumSettings};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use thiserror::Error;

/// Registered KNXnet/IP port
pub const DEFAULT_KNXNETIP_PORT: u16 = 3671;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Option not recognized
    #[error("unknown option {0}")]
    UnknownOption(String),

    /// More than one positional argument
    #[error("unexpected argument '{0}', only one target is accepted")]
    UnexpectedArgument(String),

    /// No host or serial port given
    #[error("no host or serial port specified")]
    MissingTarget,

    /// Option given without its value
    #[error("option {0} requires a value")]
    MissingValue(String),

    /// Not a valid port number
    #[error("invalid number for {option}: '{value}'")]
    InvalidNumber {
        /// Option name
        option: String,
        /// Offending value
        value: String,
    },

    /// Medium identifier outside the supported profiles
    #[error("unknown medium '{0}' (expected tp1, p110, p132 or rf)")]
    InvalidMedium(String),

    /// Host name could not be resolved
    #[error("cannot resolve host {host}: {reason}")]
    HostResolution {
        /// Host as given
        host: String,
        /// Resolver failure
        reason: String,
    },

    /// Any other malformed command line
    #[error("{0}")]
    Usage(String),
}

/// Transport used to reach the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// KNXnet/IP tunneling
    Ip,
    /// Serial FT1.2
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => write!(f, "KNXnet/IP"),
            Self::Serial => write!(f, "Serial"),
        }
    }
}

/// Serial port addressing; both forms are equally valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialTarget {
    /// Port number, mapped to the platform's n-th serial device
    Index(u32),
    /// Device name or path
    Device(String),
}

impl SerialTarget {
    /// Classify a target token
    pub fn from_token(token: &str) -> Self {
        match token.parse::<u32>() {
            Ok(index) => Self::Index(index),
            Err(_) => Self::Device(token.to_string()),
        }
    }

    /// Device name the serial link opens
    pub fn device_name(&self) -> String {
        match self {
            Self::Index(index) if cfg!(windows) => format!("COM{index}"),
            Self::Index(index) => format!("/dev/ttyS{index}"),
            Self::Device(name) => name.clone(),
        }
    }
}

impl fmt::Display for SerialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "port {index}"),
            Self::Device(name) => f.write_str(name),
        }
    }
}

/// Host name and port, resolved on demand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address literal
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// Resolve to a socket address, preferring IPv4
    pub fn resolve(&self) -> Result<SocketAddr, ConfigError> {
        let resolution = |reason: String| ConfigError::HostResolution {
            host: self.host.clone(),
            reason,
        };
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| resolution(e.to_string()))?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| resolution("no address found".to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Monitoring target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// KNXnet/IP server
    Ip(Endpoint),
    /// Serial interface
    Serial(SerialTarget),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(endpoint) => endpoint.fmt(f),
            Self::Serial(target) => target.fmt(f),
        }
    }
}

/// Local binding for the IP transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalBind {
    /// Explicit local host, with the port (0 if not given)
    Endpoint(Endpoint),
    /// Only a local port; the host's own address is used
    Port(u16),
}

/// Resolved configuration of one monitoring session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Monitoring target; implies the transport
    pub target: Target,
    /// Local binding (IP only)
    pub local: Option<LocalBind>,
    /// Medium profile
    pub medium: MediumProfile,
    /// Maximum console log detail
    pub verbose: bool,
    /// Compact frame rendering
    pub compact: bool,
    /// NAT aware tunneling
    pub nat: bool,
}

impl Configuration {
    /// Monitor a KNXnet/IP server at `host:port`
    pub fn ip(host: &str, port: u16) -> Self {
        Self {
            target: Target::Ip(Endpoint::new(host, port)),
            local: None,
            medium: MediumProfile::default(),
            verbose: false,
            compact: false,
            nat: false,
        }
    }

    /// Monitor a serial interface
    pub fn serial(target: SerialTarget) -> Self {
        Self {
            target: Target::Serial(target),
            ..Self::ip("", DEFAULT_KNXNETIP_PORT)
        }
    }

    /// Set medium profile
    #[must_use]
    pub fn medium(mut self, medium: MediumProfile) -> Self {
        self.medium = medium;
        self
    }

    /// Enable compact rendering
    #[must_use]
    pub fn compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Transport kind
    pub fn transport(&self) -> TransportKind {
        match self.target {
            Target::Ip(_) => TransportKind::Ip,
            Target::Serial(_) => TransportKind::Serial,
        }
    }

    /// Medium settings for the link
    pub fn medium_settings(&self) -> MediumSettings {
        self.medium.settings()
    }

    /// Resolve every host name in the configuration.
    ///
    /// Called before a session starts so that resolution failures surface as
    /// configuration errors.
    pub fn check_hosts(&self) -> Result<(), ConfigError> {
        if let Target::Ip(remote) = &self.target {
            remote.resolve()?;
        }
        if let Some(LocalBind::Endpoint(local)) = &self.local {
            local.resolve()?;
        }
        Ok(())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} medium {}", self.transport(), self.target, self.medium)?;
        if self.nat {
            write!(f, " (NAT)")?;
        }
        Ok(())
    }
}
