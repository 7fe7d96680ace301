//! Tracing subscriber setup for the `ffindex` binary.
//!
//! Filter priority, highest first: `FFINDEX_LOG`, `RUST_LOG`, then the
//! `-v` / `-q` flags, then `info`.  Output goes to stderr so that record
//! bytes written to stdout stay clean.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FFINDEX_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// `verbose` wins when both flags are given.
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Verbosity::Verbose
        } else if quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }

    pub fn level(self) -> Level {
        match self {
            Verbosity::Quiet   => Level::ERROR,
            Verbosity::Normal  => Level::INFO,
            Verbosity::Verbose => Level::DEBUG,
        }
    }
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(verbosity.level().as_str().to_lowercase()))
}

/// Install the global subscriber.  A second call is a no-op.
pub fn init(verbosity: Verbosity, no_color: bool) {
    let ansi = !no_color && std::io::stderr().is_terminal();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .try_init();
}
