//! CLI definitions for portfwd.

use clap::{builder::PossibleValuesParser, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::admin::DEFAULT_ADMIN_LISTEN;
use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::config::DEFAULT_CONFIG_PATH;

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Multi-mapping TCP port forwarder.
#[derive(Debug, Parser)]
#[command(name = "portfwd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, global = true, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run every configured mapping and the admin endpoint
    Serve(ServeArgs),

    /// Validate a configuration file and print its mappings
    Check(CheckArgs),

    /// Show version information
    Version,
}

/// Arguments for the serve subcommand.
#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Configuration file (.yaml, .json or .toml)
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Admin HTTP listen address (e.g., 127.0.0.1:8080 or :8080)
    #[arg(long, default_value = DEFAULT_ADMIN_LISTEN)]
    pub admin_listen: String,

    /// Do not start the admin HTTP endpoint
    #[arg(long, default_value_t = false)]
    pub no_admin: bool,

    /// Grace period for live connections when a mapping stops
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub drain_timeout: Duration,

    /// Remote dial timeout (platform default when unset)
    #[arg(long, value_parser = parse_duration)]
    pub connect_timeout: Option<Duration>,

    /// Relay buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
}

/// Arguments for the check subcommand.
#[derive(Debug, Parser)]
pub struct CheckArgs {
    /// Configuration file (.yaml, .json or .toml)
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Build information for version command.
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub built: &'static str,
}

impl BuildInfo {
    /// Returns build information from environment variables or defaults.
    pub fn get() -> Self {
        Self {
            version: option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"),
            commit: option_env!("PORTFWD_COMMIT").unwrap_or("unknown"),
            built: option_env!("PORTFWD_BUILD_DATE").unwrap_or("unknown"),
        }
    }

    /// Format version output.
    pub fn format(&self) -> String {
        format!(
            "portfwd version {}\n  commit: {}\n  built:  {}",
            self.version, self.commit, self.built
        )
    }
}
