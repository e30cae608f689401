//! Commands on an installed cluster: wait and upgrade.

use anyhow::Result;
use clap::Args;
use dcos_e2e::ClusterId;

use super::{BackendArgs, InstallArgs, TimeoutArgs, DEFAULT_CLUSTER_ID};
use crate::ui;

/// Wait for DC/OS to become healthy.
#[derive(Args)]
pub struct WaitCommand {
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    #[command(flatten)]
    timeout: TimeoutArgs,

    #[command(flatten)]
    backend: BackendArgs,
}

impl WaitCommand {
    pub async fn run(&self) -> Result<()> {
        let mut lifecycle = self.backend.attach(&self.cluster_id).await?;
        ui::print_step(&format!("Waiting for cluster \"{}\"", self.cluster_id));
        lifecycle
            .wait_until_ready(Some(self.timeout.deadline()))
            .await?;
        ui::print_success("DC/OS is healthy");
        Ok(())
    }
}

/// Upgrade DC/OS in place.
#[derive(Args)]
pub struct UpgradeCommand {
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    #[command(flatten)]
    install: InstallArgs,

    #[command(flatten)]
    backend: BackendArgs,
}

impl UpgradeCommand {
    pub async fn run(&self) -> Result<()> {
        let request = self.install.request()?;
        let deadline = self.install.deadline();
        let mut lifecycle = self.backend.attach(&self.cluster_id).await?;

        ui::print_step(&format!("Upgrading cluster \"{}\"", self.cluster_id));
        lifecycle.upgrade(&request, Some(deadline)).await?;

        if self.install.wait_for_dcos() {
            ui::print_step("Waiting for DC/OS to become healthy");
            lifecycle.wait_until_ready(Some(deadline)).await?;
        }
        ui::print_success(&format!("Cluster \"{}\" upgraded", self.cluster_id));
        Ok(())
    }
}
