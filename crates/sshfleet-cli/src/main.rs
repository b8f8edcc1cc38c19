//! sshfleet CLI
//!
//! Runs a manifest of independent shell jobs across a fleet of SSH hosts.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;

use sshfleet_cli::demo_cmd::{self, DemoArgs};
use sshfleet_cli::run_cmd::{self, RunArgs};
use sshfleet_core::tracing_init::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "sshfleet")]
#[command(version, about = "Distribute shell jobs across SSH hosts", long_about = None)]
struct Cli {
    /// Default log level when RUST_LOG is not set
    #[arg(long, global = true, env = "SSHFLEET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SSHFLEET_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every job in a manifest
    Run(RunArgs),
    /// Run the built-in demo against one host
    Demo(DemoArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = &cli.log_level;
    init_tracing(
        &format!("sshfleet={level},sshfleet_cli={level},sshfleet_core={level},sshfleet_runner={level}"),
        cli.log_json,
    );
    info!(version = env!("CARGO_PKG_VERSION"), "Starting sshfleet");

    let all_succeeded = match cli.command {
        Commands::Run(args) => run_cmd::run(args).await?,
        Commands::Demo(args) => demo_cmd::run(args).await?,
    };

    Ok(if all_succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "sshfleet",
            "run",
            "fleet.toml",
            "--sequential",
            "--json",
            "--host-key-policy",
            "strict",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert!(args.sequential);
                assert!(args.json);
                assert_eq!(args.manifest.to_str(), Some("fleet.toml"));
                assert_eq!(
                    args.connection.host_key_policy,
                    run_cmd::HostKeyArg::Strict
                );
            }
            Commands::Demo(_) => unreachable!(),
        }
    }

    #[test]
    fn demo_defaults() {
        let cli = Cli::try_parse_from(["sshfleet", "demo", "--no-password"]).unwrap();
        match cli.command {
            Commands::Demo(args) => {
                assert_eq!(args.slots, 2);
                assert_eq!(args.jobs, 10);
                assert!(args.no_password);
            }
            Commands::Run(_) => unreachable!(),
        }
    }
}
