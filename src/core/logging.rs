//! Console diagnostics
//!
//! One `tracing` subscriber per process, writing to stderr so that frame
//! lines on stdout stay clean. `RUST_LOG` overrides the computed level.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Level used for the crate's own targets
pub fn level(verbose: bool) -> Level {
    if verbose {
        Level::TRACE
    } else {
        Level::INFO
    }
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level(verbose).into())
        .from_env_lossy()
}

/// Install the process-wide subscriber.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(verbose: bool) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_thread_names(verbose)
        .try_init()
        .is_ok()
}
