//! `sshfleet` Runner Library
//!
//! Runs independent shell-command jobs across a fixed fleet of SSH hosts:
//! - Transport traits and the `russh`/SFTP implementation
//! - Worker pool with one live connection per declared CPU slot
//! - Per-job remote sessions in unique scratch directories
//! - Greedy, submission-ordered job dispatch with progress reporting

pub mod orchestration;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use orchestration::{
    JobDispatcher, PoolError, PooledConnection, Progress, ProgressCounter, ProgressObserver,
    RemoteExecutionSession, ScratchLayout, WorkerConnection, WorkerPool,
};
pub use transport::{Connector, ExecOutput, RemoteShell, TransferChannel, TransportError};
