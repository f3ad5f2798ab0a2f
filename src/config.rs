//! Configuration (ambient stack): a `clap`-derived CLI, generalizing the
//! teacher's `Cli` struct in `main.rs` with the §5 timing constants
//! exposed as overridable flags rather than hardcoded.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// A TFTP (RFC 1350) server.
#[derive(Parser, Debug, Clone)]
#[command(name = "tftpd", version, about)]
pub struct Cli {
    /// UDP port to listen on.
    #[arg(short, long, default_value_t = 69)]
    pub port: u16,

    /// Directory to serve / receive files.
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Seconds to wait for an ACK/DATA before retransmitting (T_RETRY).
    #[arg(long, default_value_t = 4)]
    pub retry_timeout_secs: u64,

    /// Maximum retransmission attempts before a session is aborted.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Event-loop timeout-sweep tick, in seconds.
    #[arg(long, default_value_t = 1)]
    pub tick_secs: u64,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all logging below warnings.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Resolved runtime configuration, derived from [`Cli`].
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub dir: PathBuf,
    pub retry_timeout: Duration,
    pub max_retries: u32,
    pub tick: Duration,
}

impl From<&Cli> for Config {
    fn from(cli: &Cli) -> Self {
        Self {
            port: cli.port,
            dir: cli.dir.clone(),
            retry_timeout: Duration::from_secs(cli.retry_timeout_secs),
            max_retries: cli.max_retries,
            tick: Duration::from_secs(cli.tick_secs),
        }
    }
}

impl Cli {
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}
