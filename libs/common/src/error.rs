use thiserror::Error;

/// Basic library error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Timeout error
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

/// Error result type
pub type Result<T> = std::result::Result<T, Error>;
