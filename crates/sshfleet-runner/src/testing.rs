//! In-memory transport for tests.
//!
//! [`MemoryConnector`] simulates a single remote filesystem shared by every
//! connection it opens. Commands built by the session layer
//! (`cd <dir> ; sh -c <cmd>` and `rm -rf <dir>`) are understood; the job
//! command itself is handed to a caller-supplied script. Failures can be
//! injected for connects, uploads, downloads and job commands, and every
//! interesting event is counted so tests can assert on it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use sshfleet_core::model::HostDescriptor;

use crate::transport::{Connector, ExecOutput, RemoteShell, TransferChannel, TransportError};

/// Job-command hook. Receives the scratch directory and the unwrapped command.
pub type Script = Arc<dyn Fn(&mut ScriptContext<'_>) -> ExecOutput + Send + Sync>;

/// What a [`Script`] sees while "running" a command.
pub struct ScriptContext<'a> {
    pub cwd: &'a str,
    pub command: &'a str,
    pub host: &'a str,
    files: &'a mut BTreeMap<String, Vec<u8>>,
}

impl ScriptContext<'_> {
    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{path}", self.cwd)
        }
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(&self.resolve(path)).cloned()
    }

    pub fn write(&mut self, path: &str, contents: impl Into<Vec<u8>>) {
        let path = self.resolve(path);
        self.files.insert(path, contents.into());
    }
}

fn succeed(_: &mut ScriptContext<'_>) -> ExecOutput {
    ExecOutput {
        exit_code: Some(0),
        ..ExecOutput::default()
    }
}

/// Start/finish marks for job commands, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Started(String),
    Finished(String),
}

#[derive(Default)]
struct RemoteState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    connects: usize,
    failing_connects: BTreeSet<usize>,
    failing_uploads: usize,
    failing_downloads: usize,
    failing_execs: usize,
    transfers_opened: usize,
    transfers_closed: usize,
    disconnects: usize,
    events: Vec<ExecEvent>,
    running: usize,
    max_running: usize,
}

/// Shared in-memory "remote host". Cloning shares state.
#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<RemoteState>>,
    script: Script,
    exec_delay: Duration,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Every job command succeeds silently.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
            script: Arc::new(succeed),
            exec_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_script<F>(mut self, script: F) -> Self
    where
        F: Fn(&mut ScriptContext<'_>) -> ExecOutput + Send + Sync + 'static,
    {
        self.script = Arc::new(script);
        self
    }

    /// Make every job command take `delay` of wall time.
    #[must_use]
    pub const fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the `attempt`-th connect (1-based, counted across all hosts).
    pub fn fail_connect_attempt(&self, attempt: usize) {
        self.state().failing_connects.insert(attempt);
    }

    pub fn fail_next_uploads(&self, count: usize) {
        self.state().failing_uploads = count;
    }

    pub fn fail_next_downloads(&self, count: usize) {
        self.state().failing_downloads = count;
    }

    /// Fail the next `count` job commands at the transport level. Cleanup
    /// commands are not affected.
    pub fn fail_next_execs(&self, count: usize) {
        self.state().failing_execs = count;
    }

    pub fn put_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.state().files.insert(path.to_string(), contents.into());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.state().dirs.contains(path)
    }

    pub fn dirs(&self) -> Vec<String> {
        self.state().dirs.iter().cloned().collect()
    }

    /// Paths of all files under `dir`.
    pub fn files_under(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.state()
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Total connect attempts, including failed ones and reconnects.
    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn transfers_opened(&self) -> usize {
        self.state().transfers_opened
    }

    pub fn transfers_closed(&self) -> usize {
        self.state().transfers_closed
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.state().events.clone()
    }

    /// Job commands in the order they started.
    pub fn started(&self) -> Vec<String> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                ExecEvent::Started(cmd) => Some(cmd.clone()),
                ExecEvent::Finished(_) => None,
            })
            .collect()
    }

    /// Highest number of job commands observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.state().max_running
    }

    async fn run_job_command(&self, host: &str, dir: &str, command: &str) -> ExecOutput {
        {
            let mut state = self.state();
            if !state.dirs.contains(dir) {
                return ExecOutput {
                    stderr: format!("sh: cd: {dir}: No such file or directory\n").into_bytes(),
                    exit_code: Some(2),
                    ..ExecOutput::default()
                };
            }
            state.events.push(ExecEvent::Started(command.to_string()));
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
        }

        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }

        let mut state = self.state();
        let output = {
            let mut ctx = ScriptContext {
                cwd: dir,
                command,
                host,
                files: &mut state.files,
            };
            (self.script)(&mut ctx)
        };
        state.running -= 1;
        state.events.push(ExecEvent::Finished(command.to_string()));
        output
    }

    fn remove_tree(&self, dir: &str) {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut state = self.state();
        state.dirs.retain(|d| d != dir && !d.starts_with(&prefix));
        state.files.retain(|f, _| !f.starts_with(&prefix));
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Shell = MemoryShell;

    async fn connect(&self, host: &HostDescriptor) -> Result<MemoryShell, TransportError> {
        let mut state = self.state();
        state.connects += 1;
        if state.failing_connects.contains(&state.connects) {
            return Err(TransportError::Connect(format!(
                "{}: connection refused",
                host.label()
            )));
        }
        Ok(MemoryShell {
            remote: self.clone(),
            host: host.hostname.clone(),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// One simulated session. Transfer channels die with it.
pub struct MemoryShell {
    remote: MemoryConnector,
    host: String,
    alive: Arc<AtomicBool>,
}

impl MemoryShell {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Channel("session is closed".to_string()))
        }
    }
}

#[async_trait]
impl RemoteShell for MemoryShell {
    type Transfer = MemoryTransfer;

    async fn exec(&mut self, command: &str) -> Result<ExecOutput, TransportError> {
        self.check_alive()?;

        if let Some(rest) = command.strip_prefix("rm -rf ") {
            let (dir, _) = take_quoted(rest)
                .ok_or_else(|| TransportError::Channel(format!("unparsable: {command}")))?;
            self.remote.remove_tree(&dir);
            return Ok(ExecOutput {
                exit_code: Some(0),
                ..ExecOutput::default()
            });
        }

        let (dir, job_command) = split_job_command(command)
            .ok_or_else(|| TransportError::Channel(format!("unparsable: {command}")))?;
        {
            let mut state = self.remote.state();
            if state.failing_execs > 0 {
                state.failing_execs -= 1;
                return Err(TransportError::Channel("exec: simulated failure".to_string()));
            }
        }
        Ok(self
            .remote
            .run_job_command(&self.host, &dir, &job_command)
            .await)
    }

    async fn open_transfer(&mut self) -> Result<MemoryTransfer, TransportError> {
        self.check_alive()?;
        self.remote.state().transfers_opened += 1;
        Ok(MemoryTransfer {
            remote: self.remote.clone(),
            alive: Arc::clone(&self.alive),
            closed: false,
        })
    }

    async fn disconnect(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.remote.state().disconnects += 1;
        }
    }
}

/// Simulated SFTP channel.
pub struct MemoryTransfer {
    remote: MemoryConnector,
    alive: Arc<AtomicBool>,
    closed: bool,
}

impl MemoryTransfer {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Sftp("channel already closed".to_string()));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Sftp("session is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferChannel for MemoryTransfer {
    async fn create_dir(&mut self, path: &str) -> Result<(), TransportError> {
        self.check_open()?;
        let mut state = self.remote.state();
        if !state.dirs.insert(path.to_string()) {
            return Err(TransportError::Sftp(format!("{path}: already exists")));
        }
        Ok(())
    }

    async fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, TransportError> {
        self.check_open()?;
        {
            let mut state = self.remote.state();
            if state.failing_uploads > 0 {
                state.failing_uploads -= 1;
                return Err(TransportError::Sftp(format!("{remote}: simulated failure")));
            }
        }
        let contents = tokio::fs::read(local).await?;
        let len = contents.len() as u64;
        self.remote.put_file(remote, contents);
        Ok(len)
    }

    async fn download(&mut self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        self.check_open()?;
        let contents = {
            let mut state = self.remote.state();
            if state.failing_downloads > 0 {
                state.failing_downloads -= 1;
                return Err(TransportError::Sftp(format!("{remote}: simulated failure")));
            }
            state
                .files
                .get(remote)
                .cloned()
                .ok_or_else(|| TransportError::Sftp(format!("{remote}: no such file")))?
        };
        let len = contents.len() as u64;
        tokio::fs::write(local, contents).await?;
        Ok(len)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Sftp("channel already closed".to_string()));
        }
        self.closed = true;
        self.remote.state().transfers_closed += 1;
        Ok(())
    }
}

/// Split `cd <dir> ; sh -c <cmd>` back into its parts.
fn split_job_command(command: &str) -> Option<(String, String)> {
    let rest = command.strip_prefix("cd ")?;
    let (dir, rest) = take_quoted(rest)?;
    let rest = rest.strip_prefix(" ; sh -c ")?;
    let (job, rest) = take_quoted(rest)?;
    rest.is_empty().then_some((dir, job))
}

/// Read one shell word made of `'...'` segments and `\'` escapes.
fn take_quoted(input: &str) -> Option<(String, &str)> {
    let mut word = String::new();
    let mut rest = input;
    let mut consumed = false;
    loop {
        if let Some(after) = rest.strip_prefix('\'') {
            let end = after.find('\'')?;
            word.push_str(&after[..end]);
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix("\\'") {
            word.push('\'');
            rest = after;
        } else {
            break;
        }
        consumed = true;
    }
    consumed.then_some((word, rest))
}
