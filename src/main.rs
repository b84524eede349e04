//! Busmon - passive KNX bus monitor
//!
//! Monitors a KNX network through:
//! - KNXnet/IP tunneling (bus monitor layer)
//! - Serial FT1.2 interfaces

use anyhow::Context;
use busmon_core::cli::{self, CliResult, ExitCodes};
use busmon_core::core::logging;
use busmon_core::{
    parse_args, Configuration, MonitorSession, Options, SessionError, SessionOutcome,
    TerminationTrigger,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    let result = run(std::env::args().skip(1));
    if let Some(line) = result.status_line() {
        eprintln!("{line}");
    }
    result.to_exit_code()
}

fn run(args: impl Iterator<Item = String>) -> CliResult {
    let config = match parse_args(args) {
        Ok(Options::Help) => {
            println!("{}", cli::usage());
            return CliResult::success();
        }
        Ok(Options::Version) => {
            println!("{}", cli::version_banner());
            return CliResult::success();
        }
        Ok(Options::Monitor(config)) => config,
        Err(e) => {
            eprintln!("use -help for a list of options");
            return e.into();
        }
    };

    logging::init(config.verbose);
    if let Err(e) = config.check_hosts() {
        return e.into();
    }

    match monitor(config) {
        Ok(outcome) => outcome.into(),
        Err(e) => match e.downcast::<SessionError>() {
            Ok(session_error) => session_error.into(),
            Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
        },
    }
}

fn monitor(config: Configuration) -> anyhow::Result<SessionOutcome> {
    let trigger = TerminationTrigger::install().context("cannot watch for Ctrl+C")?;
    tracing::info!("{} {}", busmon_core::NAME, busmon_core::VERSION);

    let session = MonitorSession::new(config);
    let registration = trigger.register(session.handle());
    session.start()?;
    let outcome = session.run()?;
    registration.deregister();
    Ok(outcome)
}
