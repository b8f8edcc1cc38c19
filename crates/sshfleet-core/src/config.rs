//! Manifest loading for `sshfleet`.
//!
//! A manifest is a TOML file declaring the hosts of the fleet and the jobs to
//! run on them:
//!
//! ```toml
//! scratch_root = "/tmp"
//!
//! [[hosts]]
//! hostname = "node1"
//! cpu_slots = 4
//! username = "alice"
//! ask_password = true
//!
//! [[jobs]]
//! id = "match-1"
//! command = "python capture.py -r red -b blue > game.log"
//! required_files = [{ local = "teams/red.zip", remote = "red.zip" }]
//! return_files = [{ local = "results/match-1.log", remote = "game.log" }]
//! ```
//!
//! Relative local paths are resolved against the manifest's directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{HostDescriptor, JobDescriptor};

/// Remote directory under which per-job scratch directories are created.
pub const DEFAULT_SCRATCH_ROOT: &str = "/tmp";

fn default_scratch_root() -> String {
    DEFAULT_SCRATCH_ROOT.to_string()
}

/// A host as declared in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(flatten)]
    pub host: HostDescriptor,
    /// Prompt for this host's password before connecting.
    #[serde(default)]
    pub ask_password: bool,
}

/// Complete manifest: hosts, jobs and the remote scratch root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_scratch_root")]
    pub scratch_root: String,
    pub hosts: Vec<HostEntry>,
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
}

impl Manifest {
    /// Read, parse and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;
        let mut manifest = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            manifest.resolve_local_paths(base);
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest without validating it.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check the structural invariants the runner relies on.
    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::Manifest("at least one host is required".to_string()));
        }
        if !self.scratch_root.starts_with('/') {
            return Err(Error::Manifest(format!(
                "scratch_root must be an absolute path, got '{}'",
                self.scratch_root
            )));
        }
        for entry in &self.hosts {
            let host = &entry.host;
            if host.hostname.trim().is_empty() {
                return Err(Error::Manifest("host with empty hostname".to_string()));
            }
            if host.cpu_slots == 0 {
                return Err(Error::Manifest(format!(
                    "host '{}' must declare at least one cpu slot",
                    host.hostname
                )));
            }
        }

        let mut seen = HashSet::new();
        for (index, job) in self.jobs.iter().enumerate() {
            if job.command.trim().is_empty() {
                return Err(Error::Manifest(format!(
                    "job #{index} ({}) has an empty command",
                    job.display_id()
                )));
            }
            if let Some(id) = &job.id
                && !seen.insert(id.as_str())
            {
                return Err(Error::Manifest(format!("duplicate job id '{id}'")));
            }
        }
        Ok(())
    }

    /// Make relative local paths (transfers and key files) absolute against `base`.
    pub fn resolve_local_paths(&mut self, base: &Path) {
        for entry in &mut self.hosts {
            if let Some(key) = entry.host.key_file.take() {
                entry.host.key_file = Some(resolve_against(base, &key));
            }
        }
        for job in &mut self.jobs {
            for spec in job.required_files.iter_mut().chain(job.return_files.iter_mut()) {
                spec.local = resolve_against(base, &spec.local);
            }
        }
    }

    /// Host descriptors in declaration order.
    pub fn host_descriptors(&self) -> Vec<HostDescriptor> {
        self.hosts.iter().map(|e| e.host.clone()).collect()
    }

    /// Sum of cpu slots over all hosts.
    pub fn total_slots(&self) -> usize {
        self.hosts.iter().map(|e| e.host.cpu_slots).sum()
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest))
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() || base.as_os_str().is_empty() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[[hosts]]
hostname = "node1"
cpu_slots = 2
username = "alice"
ask_password = true

[[hosts]]
hostname = "node2"
no_cpu = 3
username = "alice"
key_file = "keys/id_ed25519"

[[jobs]]
id = "j1"
command = "cat f.txt > out.txt"
required_files = [{ local = "f.txt", remote = "f.txt" }]
return_files = [{ local = "results/out.txt", remote = "out.txt" }]

[[jobs]]
command = "true"
"#;

    #[test]
    fn parses_hosts_and_jobs() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.scratch_root, DEFAULT_SCRATCH_ROOT);
        assert_eq!(manifest.hosts.len(), 2);
        assert!(manifest.hosts[0].ask_password);
        assert!(!manifest.hosts[1].ask_password);
        assert_eq!(manifest.total_slots(), 5);
        assert_eq!(manifest.jobs.len(), 2);
        assert_eq!(manifest.jobs[1].id, None);
        manifest.validate().unwrap();
    }

    #[test]
    fn load_resolves_relative_local_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        let job = &manifest.jobs[0];
        assert_eq!(job.required_files[0].local, dir.path().join("f.txt"));
        assert_eq!(job.return_files[0].local, dir.path().join("results/out.txt"));
        assert_eq!(job.required_files[0].remote, "f.txt");
        assert_eq!(
            manifest.hosts[1].host.key_file.as_deref(),
            Some(dir.path().join("keys/id_ed25519").as_path())
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read manifest"));
    }

    #[test]
    fn rejects_empty_host_list() {
        let manifest = Manifest::parse("hosts = []").unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("at least one host"));
    }

    #[test]
    fn rejects_zero_slots() {
        let manifest = Manifest::parse(
            r#"
[[hosts]]
hostname = "node1"
cpu_slots = 0
"#,
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn rejects_relative_scratch_root() {
        let manifest = Manifest::parse(
            r#"
scratch_root = "scratch"
[[hosts]]
hostname = "node1"
cpu_slots = 1
"#,
        )
        .unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let manifest = Manifest::parse(
            r#"
[[hosts]]
hostname = "node1"
cpu_slots = 1

[[jobs]]
id = "same"
command = "true"

[[jobs]]
id = "same"
command = "false"
"#,
        )
        .unwrap();
        let err = manifest.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate job id"));
    }

    #[test]
    fn rejects_empty_command() {
        let manifest = Manifest::parse(
            r#"
[[hosts]]
hostname = "node1"
cpu_slots = 1

[[jobs]]
command = "  "
"#,
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn absolute_paths_are_kept() {
        let mut manifest = Manifest::parse(
            r#"
[[hosts]]
hostname = "node1"
cpu_slots = 1

[[jobs]]
command = "true"
return_files = [{ local = "/srv/out.txt", remote = "out.txt" }]
"#,
        )
        .unwrap();
        manifest.resolve_local_paths(Path::new("/home/alice"));
        assert_eq!(
            manifest.jobs[0].return_files[0].local,
            PathBuf::from("/srv/out.txt")
        );
    }
}
