//! Infrastructure backends.
//!
//! A [`Backend`] creates, finds and removes the machines of a cluster. The
//! concrete backend is chosen once, from configuration, via
//! [`BackendConfig::build`]; the rest of the crate only sees the trait.

pub mod docker;
pub mod vagrant;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::cluster::{ClusterHandle, ClusterId, RoleCounts};
use crate::error::{Error, NotFoundError, ProvisionError, Result};
use crate::manifest::Manifest;
use crate::node::Role;
use crate::transport::TransportKind;

pub use docker::{Docker, DockerConfig};
pub use vagrant::{Vagrant, VagrantConfig};

/// Capability contract every infrastructure provider satisfies.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name (`docker`, `vagrant`).
    fn name(&self) -> &'static str;

    /// Create the machines of a new cluster.
    ///
    /// On failure no resource tagged with `cluster_id` is left behind, or
    /// the returned [`ProvisionError`] says the rollback was incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Provision`] if the id is taken, the topology is
    /// invalid, or any machine cannot be created.
    async fn provision(&self, cluster_id: &ClusterId, counts: RoleCounts) -> Result<ClusterHandle>;

    /// Bind to the machines of an existing cluster.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing is tagged with `cluster_id`.
    async fn attach(&self, cluster_id: &ClusterId) -> Result<ClusterHandle>;

    /// Remove every resource tagged with `cluster_id`. Absent clusters are
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource exists but cannot be removed.
    async fn destroy(&self, cluster_id: &ClusterId) -> Result<()>;

    /// Cluster ids that currently have resources, read from the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be queried.
    async fn list_cluster_ids(&self) -> Result<BTreeSet<ClusterId>>;

    /// Script the installer runs on each node to report its address.
    fn ip_detect_script(&self) -> &Path;

    /// Transport recommended for this backend's nodes.
    fn default_transport(&self) -> TransportKind;

    /// Install configuration defaults for this backend.
    fn base_config(&self) -> Manifest;
}

/// Selectable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Docker,
    Vagrant,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Vagrant => write!(f, "vagrant"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "vagrant" => Ok(Self::Vagrant),
            _ => Err(Error::config(format!(
                "Unknown backend: {s}. Supported: docker, vagrant"
            ))),
        }
    }
}

/// Backend selection plus its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Docker(DockerConfig),
    Vagrant(VagrantConfig),
}

impl BackendConfig {
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Docker(_) => BackendKind::Docker,
            Self::Vagrant(_) => BackendKind::Vagrant,
        }
    }

    /// Construct the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend's workspace cannot be prepared.
    pub fn build(self) -> Result<Arc<dyn Backend>> {
        Ok(match self {
            Self::Docker(config) => Arc::new(Docker::new(config)?),
            Self::Vagrant(config) => Arc::new(Vagrant::new(config)?),
        })
    }
}

/// Outcome of [`destroy_many`].
#[derive(Debug, Default)]
pub struct DestroyReport {
    pub destroyed: Vec<ClusterId>,
    pub missing: Vec<NotFoundError>,
    pub failed: Vec<(ClusterId, Error)>,
}

impl DestroyReport {
    /// True when every requested cluster was destroyed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Destroy several clusters. Each id is handled independently; one missing
/// or failing cluster does not stop the others.
///
/// # Errors
///
/// Returns an error only if the backend cannot list its clusters.
pub async fn destroy_many<I>(backend: &dyn Backend, ids: I) -> Result<DestroyReport>
where
    I: IntoIterator<Item = ClusterId>,
{
    let existing = backend.list_cluster_ids().await?;
    let mut report = DestroyReport::default();

    for cluster_id in ids {
        if !existing.contains(&cluster_id) {
            warn!(cluster_id = %cluster_id, "Cluster does not exist");
            report.missing.push(NotFoundError {
                cluster_id: cluster_id.to_string(),
            });
            continue;
        }
        match backend.destroy(&cluster_id).await {
            Ok(()) => {
                info!(cluster_id = %cluster_id, "Cluster destroyed");
                report.destroyed.push(cluster_id);
            }
            Err(e) => {
                error!(cluster_id = %cluster_id, error = %e, "Failed to destroy cluster");
                report.failed.push((cluster_id, e));
            }
        }
    }

    Ok(report)
}

/// Reject a provision request before anything is created.
pub(crate) async fn check_new_cluster<B>(
    backend: &B,
    cluster_id: &ClusterId,
    counts: RoleCounts,
) -> Result<()>
where
    B: Backend + ?Sized,
{
    counts.validate(cluster_id)?;
    if backend.list_cluster_ids().await?.contains(cluster_id) {
        return Err(ProvisionError::before_create(
            cluster_id.as_str(),
            format!("Cluster \"{cluster_id}\" already exists"),
        )
        .into());
    }
    Ok(())
}

/// Undo a partial provision and describe what happened.
pub(crate) async fn rollback<B>(backend: &B, cluster_id: &ClusterId, cause: &Error) -> Error
where
    B: Backend + ?Sized,
{
    warn!(cluster_id = %cluster_id, error = %cause, "Provisioning failed, rolling back");
    let rolled_back = match backend.destroy(cluster_id).await {
        Ok(()) => true,
        Err(e) => {
            error!(cluster_id = %cluster_id, error = %e, "Rollback failed");
            false
        }
    };
    ProvisionError {
        cluster_id: cluster_id.to_string(),
        reason: cause.to_string(),
        rolled_back,
    }
    .into()
}

/// Display name of a machine: `dcos-e2e-<cluster_id>-<role>-<index>`.
#[must_use]
pub fn machine_name(cluster_id: &ClusterId, role: Role, index: u32) -> String {
    format!(
        "dcos-e2e-{cluster_id}-{}-{index}",
        role.as_str().replace('_', "-")
    )
}

/// Defaults shared by every backend.
fn common_base_config(ssh_user: &str) -> Manifest {
    let mut manifest = Manifest::new();
    manifest.insert("bootstrap_url", "file:///opt/dcos_install_tmp");
    manifest.insert("cluster_name", "DCOS");
    manifest.insert("exhibitor_storage_backend", "static");
    manifest.insert("master_discovery", "static");
    manifest.insert("resolvers", vec!["8.8.8.8".to_string()]);
    manifest.insert("ssh_port", 22);
    manifest.insert("ssh_user", ssh_user);
    manifest.insert("process_timeout", 10000);
    manifest
}

/// Node-local script printing the first IPv4 address of `interface`.
fn ip_detect_contents(interface: &str) -> String {
    format!(
        "#!/usr/bin/env bash\n\
         set -o nounset -o errexit\n\
         export PATH=/usr/sbin:/usr/bin:$PATH\n\
         echo $(ip addr show {interface} | grep -Eo '[0-9]{{1,3}}\\.[0-9]{{1,3}}\\.[0-9]{{1,3}}\\.[0-9]{{1,3}}' | head -1)\n"
    )
}

/// Write an executable script.
fn write_script(path: &Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, contents).map_err(|e| Error::io(path, e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_names() {
        let id = ClusterId::new("abc").unwrap();
        assert_eq!(machine_name(&id, Role::Master, 0), "dcos-e2e-abc-master-0");
        assert_eq!(
            machine_name(&id, Role::PublicAgent, 2),
            "dcos-e2e-abc-public-agent-2"
        );
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert!("aws".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_ip_detect_script_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip-detect");
        write_script(&path, &ip_detect_contents("eth0")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("#!/usr/bin/env bash"));
        assert!(contents.contains("ip addr show eth0"));
        assert!(contents.contains("[0-9]{1,3}"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_common_base_config() {
        let manifest = common_base_config("vagrant");
        assert_eq!(
            manifest.get("ssh_user").and_then(serde_yaml::Value::as_str),
            Some("vagrant")
        );
        assert_eq!(
            manifest.get("bootstrap_url").and_then(serde_yaml::Value::as_str),
            Some("file:///opt/dcos_install_tmp")
        );
    }
}
