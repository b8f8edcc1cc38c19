//! `sshfleet run`: execute a manifest.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use sshfleet_core::Manifest;
use sshfleet_core::model::{HostDescriptor, JobDescriptor, JobResult};
use sshfleet_runner::transport::{HostKeyPolicy, SshConnector, SshOptions};
use sshfleet_runner::{JobDispatcher, ProgressCounter, ScratchLayout, WorkerPool};

use crate::{prompt, render};

/// Host key checking, as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostKeyArg {
    /// Record unknown keys, reject changed ones
    AcceptNew,
    /// Only accept keys already in `known_hosts`
    Strict,
    /// Skip host key checking
    AcceptAny,
}

impl From<HostKeyArg> for HostKeyPolicy {
    fn from(arg: HostKeyArg) -> Self {
        match arg {
            HostKeyArg::AcceptNew => Self::AcceptNew,
            HostKeyArg::Strict => Self::Strict,
            HostKeyArg::AcceptAny => Self::AcceptAny,
        }
    }
}

/// SSH connection options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Seconds allowed for connecting and authenticating to a host
    #[arg(long, env = "SSHFLEET_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout: u64,

    /// Host key checking policy
    #[arg(
        long,
        env = "SSHFLEET_HOST_KEY_POLICY",
        value_enum,
        default_value_t = HostKeyArg::AcceptNew
    )]
    pub host_key_policy: HostKeyArg,
}

impl ConnectionArgs {
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            host_key_policy: self.host_key_policy.into(),
            ..SshOptions::default()
        }
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the TOML manifest
    #[arg(env = "SSHFLEET_MANIFEST")]
    pub manifest: PathBuf,

    /// Run jobs one at a time (still rotating through every connection)
    #[arg(long)]
    pub sequential: bool,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// Prompt for a password for every host
    #[arg(long, env = "SSHFLEET_ASK_PASSWORD")]
    pub ask_password: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Run a manifest. Returns whether every job succeeded.
pub async fn run(args: RunArgs) -> Result<bool> {
    let mut manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;
    prompt::fill_passwords(&mut manifest.hosts, args.ask_password, prompt::prompt_password)?;

    let hosts = manifest.host_descriptors();
    let layout = ScratchLayout::new(&manifest.scratch_root);
    let results = execute(
        &hosts,
        manifest.jobs,
        layout,
        args.connection.ssh_options(),
        args.sequential,
    )
    .await?;

    let mut stdout = io::stdout().lock();
    if args.json {
        render::write_json(&mut stdout, &results)?;
    } else {
        render::write_results(&mut stdout, &results)?;
    }
    stdout.flush()?;
    Ok(results.iter().all(JobResult::succeeded))
}

/// Connect the pool, run `jobs` over SSH and shut the pool down.
///
/// Fails only if the pool cannot be built.
pub async fn execute(
    hosts: &[HostDescriptor],
    jobs: Vec<JobDescriptor>,
    layout: ScratchLayout,
    options: SshOptions,
    sequential: bool,
) -> Result<Vec<JobResult>> {
    let slots: usize = hosts.iter().map(|h| h.cpu_slots).sum();
    info!(
        jobs = jobs.len(),
        hosts = hosts.len(),
        slots,
        "About to run {} jobs on {} hosts / {} slots",
        jobs.len(),
        hosts.len(),
        slots
    );

    let connector = Arc::new(SshConnector::new(options)?);
    let pool = Arc::new(
        WorkerPool::build(connector, hosts)
            .await
            .context("Failed to connect to all hosts")?,
    );
    let dispatcher = JobDispatcher::new(Arc::clone(&pool), layout);
    let progress = Arc::new(ProgressCounter::new());

    let results = if sequential {
        dispatcher.run_sequential(jobs, progress.as_ref()).await
    } else {
        dispatcher.run(jobs, progress.clone()).await
    };

    pool.shutdown().await;
    Ok(results)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn connection_args_map_to_ssh_options() {
        let args = ConnectionArgs {
            connect_timeout: 5,
            host_key_policy: HostKeyArg::Strict,
        };
        let options = args.ssh_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.host_key_policy, HostKeyPolicy::Strict);
        assert!(options.keepalive_interval.is_some());
    }

    #[tokio::test]
    async fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            manifest: dir.path().join("absent.toml"),
            sequential: false,
            json: false,
            ask_password: false,
            connection: ConnectionArgs {
                connect_timeout: 1,
                host_key_policy: HostKeyArg::AcceptAny,
            },
        };
        let err = run(args).await.unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }
}
