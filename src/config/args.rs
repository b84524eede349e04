//! Command line token resolution
//!
//! Options use single-dash long names (`-medium rf`) with optional short
//! aliases. Tokens are normalized to clap's double-dash form before parsing.
//! `-help` and `-version` end option processing: anything after them is
//! ignored, anything before them is still validated.

use super::{
    ConfigError, Configuration, Endpoint, LocalBind, MediumProfile, SerialTarget, Target,
    DEFAULT_KNXNETIP_PORT,
};
use clap::error::{ContextKind, ErrorKind};
use clap::Parser;

/// Result of resolving the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Options {
    /// Print usage and exit
    Help,
    /// Print the version banner and exit
    Version,
    /// Start monitoring
    Monitor(Configuration),
}

#[derive(Parser, Debug)]
#[command(
    name = "busmon",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true,
    args_override_self = true
)]
struct RawArgs {
    /// Maximum console log detail
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Compact frame rendering
    #[arg(short = 'c', long)]
    compact: bool,

    /// Local host name or address
    #[arg(long = "localhost", value_name = "ID", allow_hyphen_values = true)]
    local_host: Option<String>,

    /// Local UDP port
    #[arg(long = "localport", value_name = "N", allow_hyphen_values = true)]
    local_port: Option<u16>,

    /// Remote UDP port
    #[arg(short = 'p', long, value_name = "N", allow_hyphen_values = true)]
    port: Option<u16>,

    /// NAT aware tunneling
    #[arg(short = 'n', long)]
    nat: bool,

    /// Use a serial interface
    #[arg(short = 's', long)]
    serial: bool,

    /// Medium profile
    #[arg(
        short = 'm',
        long,
        value_enum,
        default_value_t = MediumProfile::Tp1,
        value_name = "ID",
        allow_hyphen_values = true
    )]
    medium: MediumProfile,

    /// Host, or serial port number / device
    target: Option<String>,
}

const LONG_OPTIONS: &[&str] = &[
    "help", "version", "verbose", "compact", "localhost", "localport", "port", "nat", "serial",
    "medium",
];

const SHORT_OPTIONS: &[&str] = &["-h", "-v", "-c", "-p", "-n", "-s", "-m"];

const TAKES_VALUE: &[&str] = &["--localhost", "--localport", "--port", "-p", "--medium", "-m"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Help,
    Version,
}

fn normalize(token: &str) -> String {
    match token.strip_prefix('-') {
        Some(name) if !name.starts_with('-') && LONG_OPTIONS.contains(&name) => format!("--{name}"),
        _ => token.to_string(),
    }
}

/// Find the first help/version request, skipping option values.
fn find_stop(tokens: &[String]) -> Option<(usize, Stop)> {
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "--help" | "-h" => return Some((i, Stop::Help)),
            "--version" => return Some((i, Stop::Version)),
            t if TAKES_VALUE.contains(&t) => i += 2,
            _ => i += 1,
        }
    }
    None
}

fn is_known_option(token: &str) -> bool {
    match token.strip_prefix("--") {
        Some(name) => LONG_OPTIONS.contains(&name),
        None => SHORT_OPTIONS.contains(&token),
    }
}

/// Reject any option spelling outside the recognized set.
///
/// Bundled short flags, attached values (`-p1234`, `--port=1234`) and the
/// `--` separator are unknown options. Option values are not checked.
fn check_options(tokens: &[String]) -> Result<(), ConfigError> {
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i].as_str();
        if token.starts_with('-') && !is_known_option(token) {
            return Err(ConfigError::UnknownOption(token.to_string()));
        }
        i += if TAKES_VALUE.contains(&token) { 2 } else { 1 };
    }
    Ok(())
}

fn context(err: &clap::Error, kind: ContextKind) -> String {
    err.get(kind).map(ToString::to_string).unwrap_or_default()
}

fn classify(err: &clap::Error) -> ConfigError {
    let option = context(err, ContextKind::InvalidArg);
    let value = context(err, ContextKind::InvalidValue);
    match err.kind() {
        ErrorKind::UnknownArgument if option.starts_with('-') => ConfigError::UnknownOption(option),
        ErrorKind::UnknownArgument => ConfigError::UnexpectedArgument(option),
        ErrorKind::InvalidValue if value.is_empty() => ConfigError::MissingValue(option),
        ErrorKind::InvalidValue | ErrorKind::ValueValidation if option.contains("medium") => {
            ConfigError::InvalidMedium(value)
        }
        ErrorKind::InvalidValue | ErrorKind::ValueValidation => {
            ConfigError::InvalidNumber { option, value }
        }
        _ => ConfigError::Usage(err.to_string()),
    }
}

/// Resolve command line tokens (without the program name) into [`Options`].
///
/// Host names are not resolved here; see [`Configuration::check_hosts`].
pub fn parse_args<I, S>(tokens: I) -> Result<Options, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let tokens: Vec<String> = tokens.into_iter().map(|t| normalize(t.as_ref())).collect();
    let stop = find_stop(&tokens);
    let end = stop.map_or(tokens.len(), |(index, _)| index);

    check_options(&tokens[..end])?;
    let raw = RawArgs::try_parse_from(&tokens[..end]).map_err(|e| classify(&e))?;

    match stop {
        Some((_, Stop::Help)) => return Ok(Options::Help),
        Some((_, Stop::Version)) => return Ok(Options::Version),
        None => {}
    }

    let token = raw.target.ok_or(ConfigError::MissingTarget)?;
    let target = if raw.serial {
        Target::Serial(SerialTarget::from_token(&token))
    } else {
        Target::Ip(Endpoint::new(&token, raw.port.unwrap_or(DEFAULT_KNXNETIP_PORT)))
    };
    let local = match (raw.local_host, raw.local_port) {
        (Some(host), port) => Some(LocalBind::Endpoint(Endpoint::new(&host, port.unwrap_or(0)))),
        (None, Some(port)) => Some(LocalBind::Port(port)),
        (None, None) => None,
    };

    Ok(Options::Monitor(Configuration {
        target,
        local,
        medium: raw.medium,
        verbose: raw.verbose,
        compact: raw.compact,
        nat: raw.nat,
    }))
}
