use anyhow::{Context, Result};
use clap::Args;
use dcos_e2e::lifecycle::LifecycleSettings;
use dcos_e2e::{ClusterId, RoleCounts};
use tracing::info;

use super::{BackendArgs, InstallArgs, DEFAULT_CLUSTER_ID};
use crate::ui;

/// Create a cluster and install DC/OS on it.
#[derive(Args)]
pub struct CreateCommand {
    /// Id for the new cluster.
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    /// Number of masters.
    #[arg(long, default_value_t = 1)]
    masters: u32,

    /// Number of private agents.
    #[arg(long, default_value_t = 1)]
    agents: u32,

    /// Number of public agents.
    #[arg(long, default_value_t = 1)]
    public_agents: u32,

    /// Remove the cluster again if installing fails.
    #[arg(long)]
    destroy_on_error: bool,

    #[command(flatten)]
    install: InstallArgs,

    #[command(flatten)]
    backend: BackendArgs,
}

impl CreateCommand {
    pub async fn run(&self) -> Result<()> {
        let request = self.install.request()?;
        let deadline = self.install.deadline();
        let mut lifecycle = self.backend.lifecycle(LifecycleSettings::default())?;

        ui::print_step(&format!("Creating cluster \"{}\"", self.cluster_id));
        let counts = RoleCounts::new(self.masters, self.agents, self.public_agents);
        lifecycle.provision(self.cluster_id.clone(), counts).await?;

        ui::print_step("Installing DC/OS");
        let mut outcome = lifecycle.install(&request, Some(deadline)).await;
        if outcome.is_ok() && self.install.wait_for_dcos() {
            ui::print_step("Waiting for DC/OS to become healthy");
            outcome = lifecycle.wait_until_ready(Some(deadline)).await;
        }

        if let Err(error) = outcome {
            if self.destroy_on_error {
                info!(cluster_id = %self.cluster_id, "Destroying cluster after failure");
                lifecycle.destroy().await?;
            }
            return Err(error)
                .with_context(|| format!("Failed to create cluster \"{}\"", self.cluster_id));
        }

        ui::print_success(&format!("Cluster \"{}\" created", self.cluster_id));
        println!("{}", self.cluster_id);
        Ok(())
    }
}
