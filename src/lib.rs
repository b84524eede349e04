//! # Busmon Core Library
//!
//! Passive KNX bus monitor. Opens a monitoring link to a KNX network, either
//! a KNXnet/IP tunnel in bus monitor layer or a serial FT1.2 interface in bus
//! monitor mode, and renders every monitored frame as one timestamped line.
//!
//! ## Example
//!
//! ```rust,no_run
//! use busmon_core::{parse_args, MonitorSession, Options};
//!
//! fn main() -> anyhow::Result<()> {
//!     let Options::Monitor(config) = parse_args(["-compact", "192.168.1.10"])? else {
//!         return Ok(());
//!     };
//!     config.check_hosts()?;
//!
//!     let session = MonitorSession::new(config);
//!     session.start()?;
//!     let outcome = session.run()?;
//!     println!("{outcome}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{
    parse_args, ConfigError, Configuration, MediumProfile, MediumSettings, Options, SerialTarget,
    Target, TransportKind,
};
pub use crate::core::format::{format_event, format_line, FormatError};
pub use crate::core::frame::{BusmonFrame, MonitorFrameEvent, RawFrame};
pub use crate::core::session::{
    FrameSink, MonitorSession, SessionError, SessionHandle, SessionOutcome, SessionStats,
};
pub use crate::core::signal::{Registration, TerminationTrigger};
pub use crate::core::state_machine::MonitorState;
pub use crate::core::transport::{
    create_link, CloseEvent, CloseInitiator, DefaultLinkFactory, LinkCore, LinkError, LinkFactory,
    LinkListener, MonitorLink,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
