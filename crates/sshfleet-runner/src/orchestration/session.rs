//! One job, end to end, on one worker connection.
//!
//! A session runs these steps in order:
//!
//! 1. Derive a fresh scratch directory from a random token.
//! 2. Create it on the remote host.
//! 3. Upload every required file into it.
//! 4. Run the job command with the scratch directory as working directory.
//! 5. Capture stdout, stderr and the exit code.
//! 6. Download every return file.
//! 7. Remove the scratch directory.
//! 8. Hand back a [`JobResult`].
//!
//! One transfer channel is opened for the job and closed once, after the last
//! download. A failed download triggers one reconnect of the connection; the
//! channel that belonged to the old session is dropped and a new one is opened
//! for the files that remain.

use std::path::Path;

use tracing::{debug, info, warn};

use sshfleet_core::config::DEFAULT_SCRATCH_ROOT;
use sshfleet_core::model::{JobDescriptor, JobResult, TransferFailure, TransferSpec};

use super::pool::WorkerConnection;
use crate::transport::{Connector, RemoteShell, TransferChannel, TransportError};

/// Default prefix of scratch directory names.
pub const DEFAULT_SCRATCH_PREFIX: &str = "cluster_instance_";

/// Where scratch directories are created on remote hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    root: String,
    prefix: String,
}

impl Default for ScratchLayout {
    fn default() -> Self {
        Self::new(DEFAULT_SCRATCH_ROOT)
    }
}

impl ScratchLayout {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: DEFAULT_SCRATCH_PREFIX.to_string(),
        }
    }

    /// A directory path nobody has used before.
    pub fn fresh_dir(&self) -> String {
        let token = uuid::Uuid::new_v4().simple();
        format!("{}/{}{token}", self.root.trim_end_matches('/'), self.prefix)
    }
}

/// Quote `word` for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// The single shell invocation that runs `command` inside `dir`.
pub fn job_command(dir: &str, command: &str) -> String {
    format!("cd {} ; sh -c {}", shell_quote(dir), shell_quote(command))
}

pub fn remove_dir_command(dir: &str) -> String {
    format!("rm -rf {}", shell_quote(dir))
}

/// Steps that stop a job before its command completes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to open transfer channel: {0}")]
    OpenTransfer(#[source] TransportError),

    #[error("Failed to create scratch directory {dir}: {source}")]
    CreateDir {
        dir: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to upload {local} to {remote}: {source}")]
    Upload {
        local: String,
        remote: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to run command: {0}")]
    Exec(#[source] TransportError),
}

type TransferOf<C> = <<C as Connector>::Shell as RemoteShell>::Transfer;

/// Runs one job on a connection the caller has exclusive use of.
pub struct RemoteExecutionSession<'a, C: Connector> {
    conn: &'a mut WorkerConnection<C>,
    job: &'a JobDescriptor,
    scratch_dir: String,
    result: JobResult,
    transfer: Option<TransferOf<C>>,
    created: bool,
}

impl<'a, C: Connector> RemoteExecutionSession<'a, C> {
    pub fn new(
        conn: &'a mut WorkerConnection<C>,
        job: &'a JobDescriptor,
        layout: &ScratchLayout,
    ) -> Self {
        let scratch_dir = layout.fresh_dir();
        let result = JobResult::new(job.id.clone(), conn.host().label(), scratch_dir.clone());
        Self {
            conn,
            job,
            scratch_dir,
            result,
            transfer: None,
            created: false,
        }
    }

    pub fn scratch_dir(&self) -> &str {
        &self.scratch_dir
    }

    /// Run every step. Never fails: problems are reported in the result.
    pub async fn run(mut self) -> JobResult {
        info!(
            job = self.job.display_id(),
            host = %self.result.host,
            slot = self.conn.slot(),
            scratch_dir = %self.scratch_dir,
            "Starting job"
        );

        match self.stage_and_execute().await {
            Ok(()) => self.retrieve().await,
            Err(e) => {
                warn!(job = self.job.display_id(), error = %e, "Job did not complete");
                self.result.error = Some(e.to_string());
            }
        }

        self.close_transfer().await;
        self.cleanup().await;

        info!(
            job = self.job.display_id(),
            exit_code = ?self.result.exit_code,
            failed_downloads = self.result.failed_downloads.len(),
            "Job finished"
        );
        self.result
    }

    async fn transfer_channel(&mut self) -> Result<&mut TransferOf<C>, TransportError> {
        if let Some(transfer) = self.transfer.take() {
            return Ok(self.transfer.insert(transfer));
        }
        let transfer = self.conn.shell_mut().open_transfer().await?;
        Ok(self.transfer.insert(transfer))
    }

    async fn stage_and_execute(&mut self) -> Result<(), SessionError> {
        let job = self.job;
        let dir = self.scratch_dir.clone();
        let transfer = self
            .transfer_channel()
            .await
            .map_err(SessionError::OpenTransfer)?;
        transfer
            .create_dir(&dir)
            .await
            .map_err(|source| SessionError::CreateDir {
                dir: dir.clone(),
                source,
            })?;
        self.created = true;

        for spec in &job.required_files {
            let remote = spec.resolve_remote(&dir);
            let transfer = self
                .transfer_channel()
                .await
                .map_err(SessionError::OpenTransfer)?;
            let bytes = transfer
                .upload(&spec.local, &remote)
                .await
                .map_err(|source| SessionError::Upload {
                    local: spec.local.display().to_string(),
                    remote: remote.clone(),
                    source,
                })?;
            debug!(local = %spec.local.display(), remote = %remote, bytes, "Uploaded");
        }

        let output = self
            .conn
            .shell_mut()
            .exec(&job_command(&dir, &job.command))
            .await
            .map_err(SessionError::Exec)?;
        self.result.exit_code = output.exit_code;
        self.result.stdout = output.stdout;
        self.result.stderr = output.stderr;
        Ok(())
    }

    async fn retrieve(&mut self) {
        let job = self.job;
        for spec in &job.return_files {
            let remote = spec.resolve_remote(&self.scratch_dir);
            match self.download(spec, &remote).await {
                Ok(bytes) => {
                    debug!(remote = %remote, local = %spec.local.display(), bytes, "Downloaded");
                }
                Err(e) => {
                    warn!(
                        job = job.display_id(),
                        remote = %remote,
                        local = %spec.local.display(),
                        error = %e,
                        "Failed to retrieve return file"
                    );
                    self.result.failed_downloads.push(TransferFailure {
                        local: spec.local.clone(),
                        remote,
                        reason: e.to_string(),
                    });
                    self.reconnect().await;
                }
            }
        }
    }

    async fn download(&mut self, spec: &TransferSpec, remote: &str) -> Result<u64, TransportError> {
        if let Some(parent) = spec.local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let local: &Path = &spec.local;
        self.transfer_channel().await?.download(remote, local).await
    }

    async fn reconnect(&mut self) {
        // The old channel dies with the old session.
        self.transfer = None;
        if let Err(e) = self.conn.reconnect().await {
            warn!(host = %self.result.host, error = %e, "Reconnect failed");
        }
    }

    async fn close_transfer(&mut self) {
        if let Some(mut transfer) = self.transfer.take()
            && let Err(e) = transfer.close().await
        {
            debug!(error = %e, "Failed to close transfer channel");
        }
    }

    async fn cleanup(&mut self) {
        if !self.created {
            return;
        }
        let command = remove_dir_command(&self.scratch_dir);
        match self.conn.shell_mut().exec(&command).await {
            Ok(output) if output.exit_code == Some(0) => {
                debug!(scratch_dir = %self.scratch_dir, "Removed scratch directory");
            }
            Ok(output) => warn!(
                scratch_dir = %self.scratch_dir,
                exit_code = ?output.exit_code,
                "Scratch directory cleanup failed"
            ),
            Err(e) => warn!(
                scratch_dir = %self.scratch_dir,
                error = %e,
                "Scratch directory cleanup failed"
            ),
        }
    }
}
