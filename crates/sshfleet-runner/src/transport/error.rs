//! Transport error types.

/// Errors that can occur while talking to a remote host.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Host key rejected: {0}")]
    HostKey(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Proxy command error: {0}")]
    Proxy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for TransportError {
    fn from(e: russh::Error) -> Self {
        Self::Channel(e.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for TransportError {
    fn from(e: russh_sftp::client::error::Error) -> Self {
        Self::Sftp(e.to_string())
    }
}
