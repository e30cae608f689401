//! Cluster-level commands: list, inspect, destroy.

use anyhow::{bail, Result};
use clap::Args;
use dcos_e2e::backend::destroy_many;
use dcos_e2e::ClusterId;

use super::{BackendArgs, DEFAULT_CLUSTER_ID};
use crate::ui;

/// List clusters.
#[derive(Args)]
pub struct ListCommand {
    #[command(flatten)]
    backend: BackendArgs,
}

impl ListCommand {
    pub async fn run(&self) -> Result<()> {
        let backend = self.backend.backend()?;
        for cluster_id in backend.list_cluster_ids().await? {
            println!("{cluster_id}");
        }
        Ok(())
    }
}

/// Show a cluster's nodes.
#[derive(Args)]
pub struct InspectCommand {
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    #[command(flatten)]
    backend: BackendArgs,
}

impl InspectCommand {
    pub async fn run(&self) -> Result<()> {
        let backend = self.backend.backend()?;
        let handle = backend.attach(&self.cluster_id).await?;
        println!("{}", serde_json::to_string_pretty(&handle.inspect())?);
        Ok(())
    }
}

/// Destroy a cluster.
#[derive(Args)]
pub struct DestroyCommand {
    #[arg(long, short = 'c', default_value = DEFAULT_CLUSTER_ID)]
    cluster_id: ClusterId,

    #[command(flatten)]
    backend: BackendArgs,
}

impl DestroyCommand {
    pub async fn run(&self) -> Result<()> {
        destroy(&self.backend, vec![self.cluster_id.clone()]).await
    }
}

/// Destroy several clusters.
#[derive(Args)]
pub struct DestroyListCommand {
    /// Cluster ids to destroy.
    #[arg(value_name = "CLUSTER_ID", required = true)]
    cluster_ids: Vec<ClusterId>,

    #[command(flatten)]
    backend: BackendArgs,
}

impl DestroyListCommand {
    pub async fn run(&self) -> Result<()> {
        destroy(&self.backend, self.cluster_ids.clone()).await
    }
}

async fn destroy(args: &BackendArgs, cluster_ids: Vec<ClusterId>) -> Result<()> {
    let backend = args.backend()?;
    let report = destroy_many(backend.as_ref(), cluster_ids).await?;

    for cluster_id in &report.destroyed {
        ui::print_success(&format!("Destroyed cluster \"{cluster_id}\""));
    }
    for missing in &report.missing {
        ui::print_warning(&missing.to_string());
    }
    for (cluster_id, error) in &report.failed {
        ui::print_error(&format!("Failed to destroy cluster \"{cluster_id}\": {error}"));
    }

    if !report.failed.is_empty() {
        bail!("{} cluster(s) could not be destroyed", report.failed.len());
    }
    Ok(())
}
