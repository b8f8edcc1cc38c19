//! Error types for `sshfleet` core library.

use thiserror::Error;

/// Result type alias using `sshfleet` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `sshfleet` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Manifest failed validation
    #[error("Invalid manifest: {0}")]
    Manifest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML deserialization error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
