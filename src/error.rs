//! Error types for portfwd.

use std::io;
use thiserror::Error;

/// Process exit codes for the `serve` and `check` subcommands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Unclassified failure
    Failure = 1,
    /// Configuration could not be read or is invalid
    ConfigInvalid = 2,
    /// Listen failed
    ListenFailed = 10,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for portfwd.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("listen failed on {addr}: {source}")]
    ListenFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to persist configuration: {0}")]
    Persist(String),

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::Config(_) | Error::InvalidMapping(_) => ExitCode::ConfigInvalid,
            Error::ListenFailed { .. } => ExitCode::ListenFailed,
            Error::ShuttingDown => ExitCode::Success,
            Error::Persist(_) | Error::Io(_) => ExitCode::Failure,
        }
    }

    /// Returns true when the error was caused by bad user input rather than the environment.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::Config(_) | Error::InvalidMapping(_))
    }
}

/// Result type alias for portfwd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns true if `err` means the socket was already closed on our side.
///
/// These show up while a listener or a connection pair is being torn down and
/// are not worth reporting.
pub fn is_closed_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}
