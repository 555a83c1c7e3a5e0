//! Error handling for the AP supervisory service

use common::error::Error as CommonError;
use thiserror::Error;

/// AP supervisory service error type
#[derive(Error, Debug, Clone)]
pub enum ApSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    Io(String),

    /// A backend-level operation returned a non-success status code;
    /// the result may be partial or absent
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Operation timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Protocol-level errors (malformed or unexpected peer responses)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Requested capability is not provided by this backend
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Data parsing and conversion errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Backend transport errors (socket setup, send/receive)
    #[error("Backend error: {0}")]
    Backend(String),

    /// State errors (engine started twice, monitor registered too late)
    #[error("State error: {0}")]
    State(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the AP supervisory service
pub type Result<T> = std::result::Result<T, ApSrvError>;

impl From<CommonError> for ApSrvError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Config(msg) => ApSrvError::Config(msg),
            CommonError::Io(e) => ApSrvError::Io(e.to_string()),
            CommonError::Parse(msg) => ApSrvError::Parse(msg),
            CommonError::Timeout(msg) => ApSrvError::Timeout(msg),
            CommonError::Generic(msg) => ApSrvError::Internal(msg),
        }
    }
}

impl From<std::io::Error> for ApSrvError {
    fn from(err: std::io::Error) -> Self {
        ApSrvError::Io(err.to_string())
    }
}

impl From<nix::errno::Errno> for ApSrvError {
    fn from(err: nix::errno::Errno) -> Self {
        ApSrvError::Backend(err.to_string())
    }
}

impl From<figment::Error> for ApSrvError {
    fn from(err: figment::Error) -> Self {
        ApSrvError::Config(err.to_string())
    }
}

impl From<csv::Error> for ApSrvError {
    fn from(err: csv::Error) -> Self {
        ApSrvError::Io(err.to_string())
    }
}
