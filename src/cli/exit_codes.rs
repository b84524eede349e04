//! CLI Exit Codes
//!
//! Process exit status of the monitor binary.

use crate::config::ConfigError;
use crate::core::session::{SessionError, SessionOutcome};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success, including help, version, normal close and cancellation
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Link construction failed
    pub const CONNECTION_FAILED: u8 = 3;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a closing message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with exit code and message
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
        }
    }

    /// Line for stderr when the process ends, if there is anything to report
    pub fn status_line(&self) -> Option<String> {
        self.message().map(|msg| format!("{}: {msg}", crate::NAME))
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::INVALID_ARGS, err.to_string())
    }
}

impl From<SessionError> for CliResult {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Link(e) => Self::Error(ExitCodes::CONNECTION_FAILED, e.to_string()),
            other => Self::Error(ExitCodes::ERROR, other.to_string()),
        }
    }
}

impl From<SessionOutcome> for CliResult {
    fn from(outcome: SessionOutcome) -> Self {
        match outcome {
            SessionOutcome::Cancelled => Self::success_with_message("stopped"),
            closed => Self::success_with_message(closed.to_string()),
        }
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Link construction failed",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{CloseInitiator, LinkError};

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(CliResult::from(ConfigError::MissingTarget).code(), ExitCodes::INVALID_ARGS);
        assert_eq!(
            CliResult::from(SessionError::Link(LinkError::Timeout(10))).code(),
            ExitCodes::CONNECTION_FAILED
        );
        assert_eq!(CliResult::from(SessionError::NotStarted).code(), ExitCodes::ERROR);
    }

    #[test]
    fn test_outcomes_are_success() {
        let cancelled = CliResult::from(SessionOutcome::Cancelled);
        assert!(cancelled.is_success());
        assert_eq!(cancelled.message(), Some("stopped"));

        let closed = CliResult::from(SessionOutcome::Closed {
            initiator: CloseInitiator::Server,
            reason: "server request".into(),
        });
        assert!(closed.is_success());
        assert_eq!(exit_code_description(closed.code()), "Success");
    }

    #[test]
    fn test_status_line() {
        let closed = CliResult::from(SessionOutcome::Closed {
            initiator: CloseInitiator::Server,
            reason: "server request".into(),
        });
        assert_eq!(
            closed.status_line(),
            Some(format!("{}: closed by server (server request)", crate::NAME))
        );
        assert_eq!(
            CliResult::from(SessionOutcome::Cancelled).status_line(),
            Some(format!("{}: stopped", crate::NAME))
        );
        assert_eq!(
            CliResult::from(ConfigError::MissingTarget).status_line(),
            Some(format!("{}: no host or serial port specified", crate::NAME))
        );
        assert_eq!(CliResult::success().status_line(), None);
    }
}
