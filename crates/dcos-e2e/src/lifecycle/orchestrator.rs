//! Cluster lifecycle state machine.
//!
//! [`ClusterLifecycle`] owns one cluster from provisioning to teardown and
//! refuses operations that do not make sense in its current [`Phase`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::install::{run_role, InstallError, InstallRequest, NodeInstaller};
use super::state::{FailedStep, Phase};
use super::wait::{
    wait_for_checks, HttpHealthCheck, NodePoststartCheck, PollPolicy, ReadinessCheck,
    DEFAULT_HEALTH_PATH,
};
use crate::backend::Backend;
use crate::cluster::{ClusterHandle, ClusterId, RoleCounts};
use crate::error::{Error, Result};
use crate::manifest::{build_config, ConfigInputs, Manifest};
use crate::node::Role;
use crate::resolve::resolve_node;
use crate::transport::{CommandOutput, RemoteCommand, RunOptions, Transport};
use crate::variant::resolve_variant;

/// Settings for install, upgrade and readiness polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Scratch space for variant detection and generated config files.
    pub workspace_dir: PathBuf,
    /// Nodes of one role worked on at the same time.
    pub install_concurrency: usize,
    pub poll: PollPolicy,
    pub health_check_port: u16,
    pub health_check_path: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir().join("dcos-e2e"),
            install_concurrency: 8,
            poll: PollPolicy::default(),
            health_check_port: 80,
            health_check_path: DEFAULT_HEALTH_PATH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeOperation {
    Install,
    Upgrade,
}

impl NodeOperation {
    fn failed_step(self) -> FailedStep {
        match self {
            Self::Install => FailedStep::Install,
            Self::Upgrade => FailedStep::Upgrade,
        }
    }
}

/// Drives one cluster through its lifecycle.
pub struct ClusterLifecycle {
    backend: Arc<dyn Backend>,
    transport: Arc<dyn Transport>,
    settings: LifecycleSettings,
    phase: Phase,
    handle: Option<ClusterHandle>,
    /// Bound to a cluster created elsewhere, whose install state is unknown.
    attached: bool,
    checks: Option<Vec<Arc<dyn ReadinessCheck>>>,
}

impl ClusterLifecycle {
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            backend,
            transport,
            settings,
            phase: Phase::Unprovisioned,
            handle: None,
            attached: false,
            checks: None,
        }
    }

    /// Replace the default readiness checks.
    #[must_use]
    pub fn with_checks(mut self, checks: Vec<Arc<dyn ReadinessCheck>>) -> Self {
        self.checks = Some(checks);
        self
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The cluster, once provisioned or attached.
    #[must_use]
    pub fn handle(&self) -> Option<&ClusterHandle> {
        self.handle.as_ref()
    }

    #[must_use]
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidPhase {
            operation,
            phase: self.phase,
        }
    }

    fn require_handle(&self, operation: &'static str) -> Result<&ClusterHandle> {
        self.handle.as_ref().ok_or_else(|| self.invalid(operation))
    }

    /// Create a new cluster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] if this lifecycle already has a
    /// cluster, or the backend's provisioning error.
    pub async fn provision(
        &mut self,
        cluster_id: ClusterId,
        counts: RoleCounts,
    ) -> Result<&ClusterHandle> {
        if self.phase != Phase::Unprovisioned {
            return Err(self.invalid("provision"));
        }
        info!(
            cluster_id = %cluster_id,
            backend = self.backend.name(),
            masters = counts.masters,
            agents = counts.agents,
            public_agents = counts.public_agents,
            "Provisioning cluster"
        );
        let handle = self.backend.provision(&cluster_id, counts).await?;
        self.attached = false;
        self.phase = self.phase.next();
        Ok(&*self.handle.insert(handle))
    }

    /// Bind to an existing cluster.
    ///
    /// An attached cluster may already be installed, so it can be waited on
    /// or upgraded straight away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] if this lifecycle already has a
    /// cluster, or [`Error::NotFound`] if the id does not exist.
    pub async fn attach(&mut self, cluster_id: &ClusterId) -> Result<&ClusterHandle> {
        if self.phase != Phase::Unprovisioned {
            return Err(self.invalid("attach"));
        }
        let handle = self.backend.attach(cluster_id).await?;
        info!(cluster_id = %cluster_id, nodes = handle.cluster().len(), "Attached to cluster");
        self.attached = true;
        self.phase = Phase::Provisioned;
        Ok(&*self.handle.insert(handle))
    }

    /// Install the platform on every node, role by role.
    ///
    /// Each node gets one attempt. A role's nodes all finish before the next
    /// role starts; if any of them failed, install stops there and the
    /// cluster is left in [`Phase::Failed`] so install can be retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] unless the cluster is provisioned (or
    /// a previous install failed), [`Error::VariantDetection`] if the variant
    /// cannot be determined, or [`Error::Install`] listing every failed node
    /// of the first failing role.
    pub async fn install(
        &mut self,
        request: &InstallRequest,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if !matches!(
            self.phase,
            Phase::Provisioned | Phase::Failed(FailedStep::Install)
        ) {
            return Err(self.invalid("install"));
        }
        self.run_nodes(NodeOperation::Install, request, deadline).await
    }

    /// Upgrade every node in place to the request's installer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] unless the cluster is ready, attached,
    /// or a previous upgrade failed; otherwise the same errors as
    /// [`ClusterLifecycle::install`].
    pub async fn upgrade(
        &mut self,
        request: &InstallRequest,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let allowed = match self.phase {
            Phase::Ready | Phase::Failed(FailedStep::Upgrade) => true,
            Phase::Provisioned => self.attached,
            _ => false,
        };
        if !allowed {
            return Err(self.invalid("upgrade"));
        }
        self.run_nodes(NodeOperation::Upgrade, request, deadline).await
    }

    async fn run_nodes(
        &mut self,
        operation: NodeOperation,
        request: &InstallRequest,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let handle = self.require_handle("install")?;
        let cluster_id = handle.cluster_id().clone();
        let cluster = handle.cluster().clone();
        let backend = Arc::clone(&self.backend);
        let transport = Arc::clone(&self.transport);

        let workspace = self.settings.workspace_dir.clone();
        std::fs::create_dir_all(&workspace).map_err(|e| Error::io(&workspace, e))?;

        let variant = resolve_variant(request.variant, &request.installer, &workspace).await?;
        let base_config = backend.base_config();
        let manifest = build_config(&ConfigInputs {
            backend_defaults: &base_config,
            cluster: &cluster,
            ip_detect_script: backend.ip_detect_script(),
            extra_config: request.extra_config.as_ref(),
            variant,
            security_mode: request.security_mode,
            license_key: request.license_key.as_deref(),
        });
        let config_file = write_config(&manifest, &workspace)?;
        self.phase = Phase::Configured;
        info!(cluster_id = %cluster_id, variant = %variant, "Install configuration assembled");

        let installer = NodeInstaller {
            transport: transport.as_ref(),
            config_file: config_file.path(),
            ip_detect_script: backend.ip_detect_script(),
            request,
            deadline,
        };

        for role in Role::INSTALL_ORDER {
            self.phase = Phase::Installing(role);
            let nodes = cluster.nodes(role);
            if nodes.is_empty() {
                continue;
            }
            info!(cluster_id = %cluster_id, role = %role, nodes = nodes.len(), "Starting role");

            let concurrency = self.settings.install_concurrency;
            let failures = match operation {
                NodeOperation::Install => {
                    run_role(nodes, concurrency, |node| installer.install_node(node, role)).await
                }
                NodeOperation::Upgrade => {
                    run_role(nodes, concurrency, |node| installer.upgrade_node(node, role)).await
                }
            };

            if !failures.is_empty() {
                error!(cluster_id = %cluster_id, role = %role, failed = failures.len(), "Role failed");
                self.phase = Phase::Failed(operation.failed_step());
                return Err(InstallError {
                    cluster_id: cluster_id.to_string(),
                    role,
                    failures,
                }
                .into());
            }
        }

        self.phase = Phase::Installed;
        self.attached = false;
        info!(cluster_id = %cluster_id, "All roles installed");
        Ok(())
    }

    fn default_checks(&self) -> Result<Vec<Arc<dyn ReadinessCheck>>> {
        let mut checks: Vec<Arc<dyn ReadinessCheck>> = vec![Arc::new(NodePoststartCheck::new(
            self.settings.install_concurrency,
        ))];
        if self.transport.kind().implies_routability() {
            checks.push(Arc::new(HttpHealthCheck::new(
                self.settings.health_check_port,
                self.settings.health_check_path.clone(),
            )?));
        } else {
            warn!(
                transport = %self.transport.kind(),
                "Skipping HTTP health checks, nodes may not be routable"
            );
        }
        Ok(checks)
    }

    /// Poll health checks until the cluster is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPhase`] if nothing is installed yet, or
    /// [`Error::NotReady`] with the last check failures once the poll budget
    /// or `deadline` runs out. [`Error::Config`] if the default HTTP check
    /// cannot build its client.
    pub async fn wait_until_ready(&mut self, deadline: Option<Instant>) -> Result<()> {
        let allowed = match self.phase {
            Phase::Installed | Phase::Ready | Phase::Failed(FailedStep::Wait) => true,
            Phase::Provisioned => self.attached,
            _ => false,
        };
        if !allowed {
            return Err(self.invalid("wait for"));
        }
        let handle = self.require_handle("wait for")?;
        let cluster_id = handle.cluster_id().to_string();
        let cluster = handle.cluster().clone();
        let checks = match &self.checks {
            Some(checks) => checks.clone(),
            None => self.default_checks()?,
        };

        self.phase = Phase::WaitingReady;
        info!(cluster_id = %cluster_id, checks = checks.len(), "Waiting for cluster to become ready");
        match wait_for_checks(
            &cluster_id,
            &checks,
            &cluster,
            self.transport.as_ref(),
            &self.settings.poll,
            deadline,
        )
        .await
        {
            Ok(_) => {
                self.phase = Phase::Ready;
                self.attached = false;
                Ok(())
            }
            Err(e) => {
                self.phase = Phase::Failed(FailedStep::Wait);
                Err(e.into())
            }
        }
    }

    /// Remove the cluster's resources. Does nothing without a cluster.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if a resource cannot be removed.
    pub async fn destroy(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Err(e) = self.backend.destroy(handle.cluster_id()).await {
            self.handle = Some(handle);
            return Err(e);
        }
        info!(cluster_id = %handle.cluster_id(), "Cluster destroyed");
        self.phase = Phase::Unprovisioned;
        self.attached = false;
        Ok(())
    }

    /// Run a command on the node `reference` resolves to.
    ///
    /// A non-zero exit is returned in the output, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchNode`] if the reference matches nothing, or
    /// [`Error::Transport`] if the node cannot be reached.
    pub async fn run(
        &self,
        reference: &str,
        command: &RemoteCommand,
        opts: &RunOptions,
    ) -> Result<CommandOutput> {
        let node = resolve_node(self.require_handle("run a command on")?, reference)?;
        Ok(self.transport.run(&node, command, opts).await?)
    }

    /// Copy a local file or directory onto the node `reference` resolves to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchNode`] if the reference matches nothing, or
    /// [`Error::Transport`] if the copy fails.
    pub async fn send_file(
        &self,
        reference: &str,
        local: &Path,
        remote: &Path,
        opts: &RunOptions,
    ) -> Result<()> {
        let node = resolve_node(self.require_handle("send a file to")?, reference)?;
        Ok(self.transport.copy(&node, local, remote, opts).await?)
    }
}

/// Write the manifest to a scratch file that lives as long as the handle.
fn write_config(manifest: &Manifest, workspace: &Path) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("config-")
        .suffix(".yaml")
        .tempfile_in(workspace)
        .map_err(|e| Error::io(workspace, e))?;
    std::fs::write(file.path(), manifest.to_yaml()?).map_err(|e| Error::io(file.path(), e))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: LifecycleSettings =
            serde_json::from_str(r#"{"install_concurrency": 2}"#).unwrap();
        assert_eq!(settings.install_concurrency, 2);
        assert_eq!(settings.health_check_port, 80);
        assert_eq!(settings.health_check_path, DEFAULT_HEALTH_PATH);
        assert_eq!(settings.poll, PollPolicy::default());
    }

    #[test]
    fn test_config_file_contains_manifest() {
        let workspace = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::new();
        manifest.insert("cluster_name", "e2e");
        let file = write_config(&manifest, workspace.path()).unwrap();

        let written = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(Manifest::from_yaml_str(&written).unwrap(), manifest);
        assert!(file.path().starts_with(workspace.path()));
    }
}
