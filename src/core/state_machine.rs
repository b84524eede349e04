//! Monitor session state machine
//!
//! Validates lifecycle transitions and keeps a short transition history for
//! diagnostics.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Monitor session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorState {
    /// Created, not started
    Idle,
    /// Link construction in progress
    Starting,
    /// Link open, frames are delivered
    Open,
    /// Teardown in progress
    Closing,
    /// Terminal
    Closed,
}

impl MonitorState {
    /// Check if state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Check if frames are accepted in this state
    pub fn can_receive(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state
    pub from: MonitorState,
    /// New state
    pub to: MonitorState,
    /// Timestamp
    pub timestamp: DateTime<Local>,
    /// Reason for transition
    pub reason: Option<String>,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// Current state
    pub from: MonitorState,
    /// Requested state
    pub to: MonitorState,
}

/// Monitor session state machine
#[derive(Debug)]
pub struct MonitorStateMachine {
    state: MonitorState,
    history: Vec<StateTransition>,
    max_history: usize,
    last_transition: Option<Instant>,
}

impl Default for MonitorStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorStateMachine {
    /// Create a new state machine in [`MonitorState::Idle`]
    pub fn new() -> Self {
        Self {
            state: MonitorState::Idle,
            history: Vec::new(),
            max_history: 16,
            last_transition: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Get state history
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Get time in current state
    pub fn time_in_state(&self) -> Option<Duration> {
        self.last_transition.map(|t| t.elapsed())
    }

    /// Transition to a new state
    pub fn transition(
        &mut self,
        new_state: MonitorState,
        reason: Option<&str>,
    ) -> Result<(), InvalidTransition> {
        if !Self::is_valid_transition(self.state, new_state) {
            return Err(InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.history.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Local::now(),
            reason: reason.map(String::from),
        });
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }

        tracing::trace!("session {} -> {new_state}", self.state);
        self.state = new_state;
        self.last_transition = Some(Instant::now());
        Ok(())
    }

    fn is_valid_transition(from: MonitorState, to: MonitorState) -> bool {
        use MonitorState::*;

        matches!(
            (from, to),
            (Idle, Starting)
                | (Starting, Open)
                | (Starting, Closed)
                | (Open, Closing)
                | (Closing, Closed)
        )
    }
}
