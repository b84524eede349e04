//! CLI Module
//!
//! Exit codes and the usage text of the monitor binary.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, CliResult, ExitCodes};

/// Usage text printed for `-help`
pub fn usage() -> String {
    format!(
        "Usage: {name} [options] <host|port>
Options:
  -help -h                show this help message
  -version                show tool/library version and exit
  -verbose -v             enable verbose status output
  -compact -c             show incoming busmonitor indications in compact format
  -localhost <id>         local IP/host name
  -localport <number>     local UDP port (default system assigned)
  -port -p <number>       UDP port on <host> (default {port})
  -nat -n                 enable Network Address Translation
  -serial -s              use FT1.2 serial communication
  -medium -m <id>         KNX medium [tp1|p110|p132|rf] (default tp1)

Exit codes:
  0  {ok}
  1  {err}
  2  {args}
  3  {link}",
        name = crate::NAME,
        port = crate::config::DEFAULT_KNXNETIP_PORT,
        ok = exit_code_description(ExitCodes::SUCCESS),
        err = exit_code_description(ExitCodes::ERROR),
        args = exit_code_description(ExitCodes::INVALID_ARGS),
        link = exit_code_description(ExitCodes::CONNECTION_FAILED),
    )
}

/// Version banner printed for `-version`
pub fn version_banner() -> String {
    format!("{} {}", crate::NAME, crate::VERSION)
}
