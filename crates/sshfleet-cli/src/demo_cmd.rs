//! `sshfleet demo`: a small self-contained run against one host.
//!
//! Each job uploads a seed file under a random name, sleeps a second, keeps
//! the first line, appends a directory listing and a marker line, and sends
//! the file back into the output directory.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use sshfleet_core::model::{HostDescriptor, JobDescriptor, JobResult};
use sshfleet_runner::ScratchLayout;

use crate::run_cmd::{self, ConnectionArgs};
use crate::{prompt, render};

const SEED_FILE: &str = "sshfleet_demo_seed.txt";

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Host to run the demo on
    #[arg(long, env = "SSHFLEET_DEMO_HOST", default_value = "localhost")]
    pub host: String,

    /// Login name (defaults to `User` in ~/.ssh/config, then the local user)
    #[arg(long, env = "SSHFLEET_DEMO_USER")]
    pub user: Option<String>,

    /// Parallel connections to open
    #[arg(long, default_value_t = 2)]
    pub slots: usize,

    /// Number of jobs to run
    #[arg(long, default_value_t = 10)]
    pub jobs: usize,

    /// Skip the password prompt (key authentication only)
    #[arg(long)]
    pub no_password: bool,

    /// Where the seed file is written and results are retrieved to
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// The demo job command operating on `file` inside the scratch directory.
pub fn demo_command(file: &str) -> String {
    format!(
        "sleep 1; cat {file} | head -1 > a.txt ; cat a.txt > {file} ; ls -l >> {file} ; echo ciao >> {file}"
    )
}

/// `count` demo jobs over `seed`, each returning into `out_dir`.
pub fn demo_jobs(count: usize, seed: &Path, out_dir: &Path) -> Vec<JobDescriptor> {
    (0..count)
        .map(|_| {
            let file = format!("{}.txt", uuid::Uuid::new_v4().simple());
            JobDescriptor::new(demo_command(&file))
                .require(seed, file.as_str())
                .retrieve(file.as_str(), out_dir.join(&file))
        })
        .collect()
}

fn write_seed(out_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let seed = out_dir.join(SEED_FILE);
    std::fs::write(
        &seed,
        "sshfleet demo seed\nthis line is dropped by the job\nand so is this one\n",
    )
    .with_context(|| format!("Failed to write {}", seed.display()))?;
    Ok(seed)
}

pub async fn run(args: DemoArgs) -> Result<bool> {
    if args.slots == 0 {
        anyhow::bail!("--slots must be at least 1");
    }
    let out_dir = std::path::absolute(&args.out_dir)
        .with_context(|| format!("Invalid output directory {}", args.out_dir.display()))?;
    let seed = write_seed(&out_dir)?;

    let mut host = HostDescriptor::new(&args.host, args.slots);
    host.username.clone_from(&args.user);
    if !args.no_password {
        host.password = Some(prompt::prompt_password(&host)?);
    }

    let jobs = demo_jobs(args.jobs, &seed, &out_dir);
    info!(jobs = jobs.len(), out_dir = %out_dir.display(), "Starting demo");

    let results = run_cmd::execute(
        &[host],
        jobs,
        ScratchLayout::default(),
        args.connection.ssh_options(),
        false,
    )
    .await?;

    let mut stdout = io::stdout().lock();
    render::write_results(&mut stdout, &results)?;
    stdout.flush()?;
    Ok(results.iter().all(JobResult::succeeded))
}
