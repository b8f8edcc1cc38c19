//! Remote-shell transport seams.
//!
//! The orchestration layer only talks to these traits:
//!
//! - [`Connector`]: opens an authenticated session to one host.
//! - [`RemoteShell`]: one live session; runs commands and opens transfer
//!   channels.
//! - [`TransferChannel`]: file push/pull over a session (SFTP for SSH).
//!
//! [`ssh::SshConnector`] is the production implementation.

use std::path::Path;

use async_trait::async_trait;

use sshfleet_core::model::HostDescriptor;

pub mod error;
pub mod proxy;
pub mod ssh;

pub use error::TransportError;
pub use ssh::{HostKeyPolicy, SshConnector, SshOptions};

/// Captured output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the remote side closed without reporting a status.
    pub exit_code: Option<u32>,
}

/// Opens sessions to hosts. Shared by every connection of a pool so that a
/// connection can reconnect without outside help.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Shell: RemoteShell;

    async fn connect(&self, host: &HostDescriptor) -> Result<Self::Shell, TransportError>;
}

/// One live, authenticated session to a host.
#[async_trait]
pub trait RemoteShell: Send + 'static {
    type Transfer: TransferChannel;

    /// Run `command` and wait for it to finish.
    ///
    /// Both output streams are drained to EOF before the exit status is
    /// taken, so a chatty command cannot stall on a full transport window.
    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError>;

    /// Open a file-transfer channel over this session.
    async fn open_transfer(&mut self) -> Result<Self::Transfer, TransportError>;

    /// Politely close the session. Errors are ignored.
    async fn disconnect(&mut self) {}
}

/// File transfer over an open session. Remote paths are absolute POSIX paths.
#[async_trait]
pub trait TransferChannel: Send + 'static {
    async fn create_dir(&mut self, path: &str) -> Result<(), TransportError>;

    /// Copy a local file to `remote`, returning the number of bytes sent.
    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError>;

    /// Copy `remote` to a local file, returning the number of bytes received.
    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
