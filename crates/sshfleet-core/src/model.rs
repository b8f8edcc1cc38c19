//! Data model shared by the runner and its drivers.
//!
//! Hosts and jobs are built once by the driver and never mutated afterwards;
//! a [`JobResult`] is produced per job and handed back to the caller.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Login name of the local user, used when neither the host nor
/// `~/.ssh/config` names one.
pub fn current_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

/// A remote machine and the number of concurrent connections to open to it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostDescriptor {
    /// Number of connections (CPU slots) to open to this host.
    #[serde(alias = "no_cpu")]
    pub cpu_slots: usize,
    /// Hostname, address, or `~/.ssh/config` alias.
    pub hostname: String,
    /// Unset falls back to `Port` in `~/.ssh/config`, then 22.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Unset falls back to `User` in `~/.ssh/config`, then the local user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password, also used as the passphrase for `key_file`.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl HostDescriptor {
    pub fn new(hostname: impl Into<String>, cpu_slots: usize) -> Self {
        Self {
            cpu_slots,
            hostname: hostname.into(),
            port: None,
            username: None,
            password: None,
            key_file: None,
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    /// `[user@]host[:port]`, for logs. Only the parts the descriptor sets.
    pub fn label(&self) -> String {
        let host = match &self.username {
            Some(user) => format!("{user}@{}", self.hostname),
            None => self.hostname.clone(),
        };
        match self.port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        }
    }
}

impl fmt::Debug for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDescriptor")
            .field("cpu_slots", &self.cpu_slots)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// A file copied between the local machine and a job's scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferSpec {
    #[serde(alias = "local_path")]
    pub local: PathBuf,
    /// POSIX path on the remote host. Relative paths live inside the job's
    /// scratch directory.
    #[serde(alias = "remote_path")]
    pub remote: String,
}

impl TransferSpec {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// Resolve the remote path against the job's scratch directory.
    pub fn resolve_remote(&self, scratch_dir: &str) -> String {
        if self.remote.starts_with('/') {
            return self.remote.clone();
        }
        let relative = self.remote.trim_start_matches("./");
        format!("{}/{relative}", scratch_dir.trim_end_matches('/'))
    }
}

/// An opaque shell command plus its staging and retrieval manifests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDescriptor {
    /// Caller-supplied identifier, echoed back in the [`JobResult`].
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    /// Files pushed into the scratch directory before the command runs.
    #[serde(default, alias = "required")]
    pub required_files: Vec<TransferSpec>,
    /// Files pulled back after the command exits.
    #[serde(default, alias = "returns")]
    pub return_files: Vec<TransferSpec>,
}

impl JobDescriptor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            required_files: Vec::new(),
            return_files: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Upload `local` to `remote` before running.
    #[must_use]
    pub fn require(mut self, local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        self.required_files.push(TransferSpec::new(local, remote));
        self
    }

    /// Download `remote` to `local` after running.
    #[must_use]
    pub fn retrieve(mut self, remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        self.return_files.push(TransferSpec::new(local, remote));
        self
    }

    pub fn display_id(&self) -> &str {
        self.id.as_deref().unwrap_or("<anonymous>")
    }
}

/// A return file that did not make it back to the local machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferFailure {
    pub local: PathBuf,
    pub remote: String,
    pub reason: String,
}

/// Outcome of one job.
///
/// A non-zero exit code is data, not an error. Download failures are listed
/// in `failed_downloads` and never change `exit_code`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    pub id: Option<String>,
    /// `None` when the command did not run or reported no exit status.
    pub exit_code: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Host label of the connection that ran the job.
    pub host: String,
    pub scratch_dir: String,
    #[serde(default)]
    pub failed_downloads: Vec<TransferFailure>,
    /// Staging or execution failure that kept the command from completing.
    #[serde(default)]
    pub error: Option<String>,
}

impl JobResult {
    pub fn new(id: Option<String>, host: impl Into<String>, scratch_dir: impl Into<String>) -> Self {
        Self {
            id,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            host: host.into(),
            scratch_dir: scratch_dir.into(),
            failed_downloads: Vec::new(),
            error: None,
        }
    }

    /// A result for a job that never reached a connection.
    pub fn not_run(id: Option<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(id, String::new(), String::new());
        result.error = Some(reason.into());
        result
    }

    /// Exit code 0, no staging error, every return file retrieved.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none() && self.failed_downloads.is_empty()
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn relative_remote_resolves_inside_scratch_dir() {
        let spec = TransferSpec::new("f.txt", "f.txt");
        assert_eq!(
            spec.resolve_remote("/tmp/cluster_instance_ab"),
            "/tmp/cluster_instance_ab/f.txt"
        );

        let nested = TransferSpec::new("f.txt", "./data/f.txt");
        assert_eq!(
            nested.resolve_remote("/tmp/cluster_instance_ab/"),
            "/tmp/cluster_instance_ab/data/f.txt"
        );
    }

    #[test]
    fn absolute_remote_ignores_scratch_dir() {
        let spec = TransferSpec::new("f.txt", "/var/log/out.log");
        assert_eq!(spec.resolve_remote("/tmp/cluster_instance_ab"), "/var/log/out.log");
    }

    #[test]
    fn debug_redacts_password() {
        let host = HostDescriptor::new("node1", 2).with_username("alice").with_password("hunter2");
        let rendered = format!("{host:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn password_is_never_serialized() {
        let host = HostDescriptor::new("node1", 2).with_username("alice").with_password("hunter2");
        let json = serde_json::to_string(&host).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn host_defaults_from_toml() {
        let host: HostDescriptor = toml::from_str(
            r#"
no_cpu = 4
hostname = "node1"
username = "bob"
"#,
        )
        .unwrap();
        assert_eq!(host.cpu_slots, 4);
        assert_eq!(host.username.as_deref(), Some("bob"));
        assert_eq!(host.port, None);
        assert!(host.password.is_none());
        assert!(host.key_file.is_none());
    }

    #[test]
    fn omitted_username_stays_unset() {
        let host: HostDescriptor = toml::from_str("cpu_slots = 1\nhostname = \"gpu\"\nport = 22\n").unwrap();
        assert_eq!(host.username, None);
        assert_eq!(host.port, Some(DEFAULT_SSH_PORT));
    }

    #[test]
    fn label_shows_only_set_parts() {
        assert_eq!(HostDescriptor::new("gpu", 1).label(), "gpu");
        let full = HostDescriptor::new("gpu", 1).with_username("bob").with_port(2200);
        assert_eq!(full.label(), "bob@gpu:2200");
    }

    #[test]
    fn job_builder_keeps_manifest_order() {
        let job = JobDescriptor::new("cat a b > c")
            .with_id("j1")
            .require("a", "a")
            .require("b", "/opt/b")
            .retrieve("c", "out/c");
        assert_eq!(job.display_id(), "j1");
        assert_eq!(job.required_files[0].remote, "a");
        assert_eq!(job.required_files[1].remote, "/opt/b");
        assert_eq!(job.return_files[0].local, PathBuf::from("out/c"));
    }

    #[test]
    fn anonymous_job_display_id() {
        assert_eq!(JobDescriptor::new("true").display_id(), "<anonymous>");
    }

    #[test]
    fn success_requires_zero_exit_and_all_downloads() {
        let mut result = JobResult::new(Some("j".into()), "h", "/tmp/x");
        assert!(!result.succeeded());

        result.exit_code = Some(0);
        assert!(result.succeeded());

        result.failed_downloads.push(TransferFailure {
            local: PathBuf::from("out"),
            remote: "out".into(),
            reason: "gone".into(),
        });
        assert!(!result.succeeded());
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn not_run_carries_reason() {
        let result = JobResult::not_run(None, "pool closed");
        assert_eq!(result.exit_code, None);
        assert_eq!(result.error.as_deref(), Some("pool closed"));
    }
}
