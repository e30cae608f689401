//! minidcos: operator CLI for ephemeral DC/OS clusters.
//!
//! Every command takes `--backend` and works on one cluster id (or, for
//! `list` and `destroy-list`, on the backend's clusters).

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod ui;

use commands::cluster::{DestroyCommand, DestroyListCommand, InspectCommand, ListCommand};
use commands::create::CreateCommand;
use commands::lifecycle::{UpgradeCommand, WaitCommand};
use commands::node::{RunCommand, SendFileCommand};

/// Manage DC/OS clusters for testing.
#[derive(Parser)]
#[command(
    name = "minidcos",
    version,
    about = "Create and manage short-lived DC/OS clusters",
    long_about = "Create and manage short-lived DC/OS clusters.\n\n\
                  Clusters run on Docker containers or Vagrant VMs and are\n\
                  addressed by cluster id. Nodes are addressed by IP address,\n\
                  machine name or a reference such as master_0."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[allow(clippy::large_enum_variant)]
enum Commands {
    /// Provision a cluster and install DC/OS on it.
    Create(CreateCommand),

    /// List the clusters that exist in a backend.
    List(ListCommand),

    /// Show a cluster's nodes as JSON.
    Inspect(InspectCommand),

    /// Run a command on one or more nodes.
    ///
    /// Exits with the remote command's exit code.
    Run(RunCommand),

    /// Copy a file or directory onto one or more nodes.
    SendFile(SendFileCommand),

    /// Wait until DC/OS is healthy on a cluster.
    Wait(WaitCommand),

    /// Upgrade DC/OS in place on an existing cluster.
    Upgrade(UpgradeCommand),

    /// Destroy a cluster.
    Destroy(DestroyCommand),

    /// Destroy several clusters.
    DestroyList(DestroyListCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,dcos_e2e=debug,minidcos=debug")
    } else {
        EnvFilter::new("warn,dcos_e2e=info,minidcos=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Create(cmd) => cmd.run().await,
        Commands::List(cmd) => cmd.run().await,
        Commands::Inspect(cmd) => cmd.run().await,
        Commands::Run(cmd) => {
            let exit_code = cmd.run().await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::SendFile(cmd) => cmd.run().await,
        Commands::Wait(cmd) => cmd.run().await,
        Commands::Upgrade(cmd) => cmd.run().await,
        Commands::Destroy(cmd) => cmd.run().await,
        Commands::DestroyList(cmd) => cmd.run().await,
    }
}
