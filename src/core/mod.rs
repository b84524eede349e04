//! Core module containing the monitoring functionality
//!
//! This module provides:
//! - Frame decoding of bus monitor indications
//! - Transport layer for the monitoring links (KNXnet/IP, FT1.2)
//! - Session management with state machine
//! - Frame line formatting
//! - Termination trigger and logging setup

pub mod apdu;
pub mod format;
pub mod frame;
pub mod logging;
pub mod session;
pub mod signal;
pub mod state_machine;
pub mod transport;
