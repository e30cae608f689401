//! Node-level commands: run and send-file.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use dcos_e2e::transport::{RemoteCommand, RunOptions};
use dcos_e2e::ClusterId;

use super::{parse_env, BackendArgs, DEFAULT_CLUSTER_ID};
use crate::ui;

/// Run a command on nodes.
#[derive(Args)]
pub struct RunCommand {
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    /// Node to run on: IP address, machine name or reference like agent_0.
    #[arg(long = "node", default_value = "master_0")]
    nodes: Vec<String>,

    /// Environment variable for the command.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// User to run as instead of the node's default user.
    #[arg(long)]
    user: Option<String>,

    /// Run through sudo.
    #[arg(long)]
    sudo: bool,

    /// Command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    #[command(flatten)]
    backend: BackendArgs,
}

impl RunCommand {
    /// Run on each node in turn; returns the first non-zero exit code.
    pub async fn run(&self) -> Result<i32> {
        let lifecycle = self.backend.attach(&self.cluster_id).await?;

        let mut opts = RunOptions::new().sudo(self.sudo);
        if let Some(user) = &self.user {
            opts = opts.user(user);
        }
        for (key, value) in &self.env {
            opts = opts.env(key, value);
        }
        let command = RemoteCommand::argv(self.command.iter().map(String::as_str));

        let mut exit_code = 0;
        for reference in &self.nodes {
            let output = lifecycle.run(reference, &command, &opts).await?;
            std::io::stdout().write_all(output.stdout.as_bytes())?;
            std::io::stderr().write_all(output.stderr.as_bytes())?;
            if exit_code == 0 {
                exit_code = output.exit_code;
            }
        }
        Ok(exit_code)
    }
}

/// Copy a file or directory onto nodes.
#[derive(Args)]
pub struct SendFileCommand {
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    /// Node to copy to: IP address, machine name or reference like agent_0.
    #[arg(long = "node", default_value = "master_0")]
    nodes: Vec<String>,

    /// Use sudo on the node to place the file.
    #[arg(long)]
    sudo: bool,

    /// Local file or directory.
    source: PathBuf,

    /// Destination path on the node.
    destination: PathBuf,

    #[command(flatten)]
    backend: BackendArgs,
}

impl SendFileCommand {
    pub async fn run(&self) -> Result<()> {
        let lifecycle = self.backend.attach(&self.cluster_id).await?;
        let opts = RunOptions::new().sudo(self.sudo);
        for reference in &self.nodes {
            lifecycle
                .send_file(reference, &self.source, &self.destination, &opts)
                .await?;
            ui::print_success(&format!(
                "Copied {} to {reference}:{}",
                self.source.display(),
                self.destination.display()
            ));
        }
        Ok(())
    }
}
