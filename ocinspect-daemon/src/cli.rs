//! Command-line arguments for ocinspect-daemon.

use std::path::PathBuf;

use clap::Parser;

/// API inspection bridge daemon.
///
/// Reads captured HTTP transactions (and optionally their spans) as
/// newline-delimited JSON, inspects them against the configured rule
/// bundle, and writes correlated records as newline-delimited JSON.
#[derive(Parser, Debug)]
#[command(name = "ocinspect-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to ocinspect.toml configuration file.
    #[arg(short, long, default_value = "/etc/ocinspect/ocinspect.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,

    /// Read inbound records from this file instead of stdin.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Write correlated records to this file instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Validate the configuration and rule bundle, then exit.
    #[arg(long)]
    pub validate: bool,
}
