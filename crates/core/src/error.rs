//! Error types shared across the renderer core.

use thiserror::Error;

/// Main error type for the renderer core.
#[derive(Error, Debug)]
pub enum Error {
    /// GPU-level failures surfaced from a backend
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Configuration file parse errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values that parse but are unusable
    #[error("Config error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
