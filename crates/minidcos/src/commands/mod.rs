//! Subcommands and the arguments they share.

pub mod cluster;
pub mod create;
pub mod lifecycle;
pub mod node;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Args;
use dcos_e2e::backend::{
    Backend, BackendConfig, BackendKind, DockerConfig, VagrantConfig,
};
use dcos_e2e::lifecycle::{ClusterLifecycle, InstallRequest, LifecycleSettings, PathPair};
use dcos_e2e::transport::{transport_for, TracingSink, TransportKind};
use dcos_e2e::{ClusterId, Manifest, SecurityMode, VariantChoice};
use tokio::time::Instant;

/// Cluster id used when none is given.
pub const DEFAULT_CLUSTER_ID: &str = "default";

/// Backend selection and settings.
#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Infrastructure backend (docker, vagrant).
    #[arg(long, env = "MINIDCOS_BACKEND", default_value = "docker")]
    backend: BackendKind,

    /// Directory for backend state and scratch files.
    #[arg(long, env = "MINIDCOS_WORKSPACE_DIR", value_name = "DIR")]
    workspace_dir: Option<PathBuf>,

    /// How to reach nodes (ssh, docker-exec). Defaults to the backend's choice.
    #[arg(long, env = "MINIDCOS_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Node image for the docker backend.
    #[arg(long, env = "MINIDCOS_DOCKER_IMAGE")]
    docker_image: Option<String>,

    /// Box for the vagrant backend.
    #[arg(long, env = "MINIDCOS_VAGRANT_BOX")]
    vagrant_box: Option<String>,
}

impl BackendArgs {
    fn workspace(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("dcos-e2e"))
    }

    fn config(&self) -> BackendConfig {
        let workspace = self.workspace();
        match self.backend {
            BackendKind::Docker => {
                let mut config = DockerConfig {
                    workspace_dir: workspace.join("docker"),
                    ..DockerConfig::default()
                };
                if let Some(image) = &self.docker_image {
                    config.image.clone_from(image);
                }
                BackendConfig::Docker(config)
            }
            BackendKind::Vagrant => {
                let mut config = VagrantConfig {
                    workspace_dir: workspace.join("vagrant"),
                    ..VagrantConfig::default()
                };
                if let Some(box_name) = &self.vagrant_box {
                    config.box_name.clone_from(box_name);
                }
                BackendConfig::Vagrant(config)
            }
        }
    }

    /// Build the selected backend.
    pub fn backend(&self) -> Result<Arc<dyn Backend>> {
        self.config()
            .build()
            .with_context(|| format!("Failed to set up the {} backend", self.backend))
    }

    /// Build a lifecycle over the selected backend and transport.
    pub fn lifecycle(&self, settings: LifecycleSettings) -> Result<ClusterLifecycle> {
        let backend = self.backend()?;
        let kind = self
            .transport
            .unwrap_or_else(|| backend.default_transport());
        let transport = transport_for(kind, Arc::new(TracingSink));
        Ok(ClusterLifecycle::new(
            backend,
            transport,
            LifecycleSettings {
                workspace_dir: self.workspace().join("scratch"),
                ..settings
            },
        ))
    }

    /// Build a lifecycle attached to an existing cluster.
    pub async fn attach(&self, cluster_id: &ClusterId) -> Result<ClusterLifecycle> {
        let mut lifecycle = self.lifecycle(LifecycleSettings::default())?;
        lifecycle.attach(cluster_id).await?;
        Ok(lifecycle)
    }
}

/// Options of commands that install DC/OS.
#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Path to the DC/OS installer.
    #[arg(value_name = "INSTALLER")]
    installer: PathBuf,

    /// DC/OS variant (auto, oss, enterprise). `auto` reads it from the installer.
    #[arg(long, default_value = "auto")]
    variant: VariantChoice,

    /// YAML file with extra DC/OS configuration. Later files override earlier ones.
    #[arg(long = "extra-config", value_name = "FILE")]
    extra_config: Vec<PathBuf>,

    /// Security mode (disabled, permissive, strict); Enterprise only.
    #[arg(long)]
    security_mode: Option<SecurityMode>,

    /// File containing a DC/OS Enterprise license key.
    #[arg(long, env = "DCOS_LICENSE_KEY_PATH", value_name = "FILE")]
    license_key_path: Option<PathBuf>,

    /// File or directory to copy onto every master before install.
    #[arg(long = "copy-to-master", value_name = "LOCAL:REMOTE")]
    copy_to_master: Vec<PathPair>,

    /// File or directory to stage in the genconf directory of every node.
    #[arg(long = "genconf-file", value_name = "LOCAL:REMOTE")]
    genconf_file: Vec<PathPair>,

    /// Wait for DC/OS to be healthy after installing.
    #[arg(long)]
    wait_for_dcos: bool,

    #[command(flatten)]
    timeout: TimeoutArgs,
}

impl InstallArgs {
    /// Assemble the install request from files and flags.
    pub fn request(&self) -> Result<InstallRequest> {
        ensure!(
            self.installer.exists(),
            "Installer \"{}\" does not exist",
            self.installer.display()
        );

        let mut extra_config: Option<Manifest> = None;
        for path in &self.extra_config {
            let layer = Manifest::from_yaml_file(path)?;
            extra_config.get_or_insert_with(Manifest::new).merge(&layer);
        }

        let license_key = self
            .license_key_path
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path).with_context(|| {
                    format!("Failed to read license key from {}", path.display())
                })
            })
            .transpose()?;

        Ok(InstallRequest {
            installer: self.installer.clone(),
            variant: self.variant,
            extra_config,
            security_mode: self.security_mode,
            license_key: license_key.map(|key| key.trim().to_string()),
            files_to_copy_to_masters: self.copy_to_master.clone(),
            files_to_copy_to_genconf_dir: self.genconf_file.clone(),
        })
    }

    pub fn wait_for_dcos(&self) -> bool {
        self.wait_for_dcos
    }

    pub fn deadline(&self) -> Instant {
        self.timeout.deadline()
    }
}

/// Overall time limit of a command.
#[derive(Args, Debug, Clone)]
pub struct TimeoutArgs {
    /// Give up after this many seconds.
    #[arg(long = "timeout", value_name = "SECONDS", default_value_t = 3600)]
    timeout_secs: u64,
}

impl TimeoutArgs {
    pub fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.timeout_secs)
    }
}

/// Parse `KEY=VALUE`.
pub fn parse_env(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("\"{value}\" is not in the format KEY=VALUE"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_env("novalue").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn test_backend_workspaces_are_per_backend() {
        let args = BackendArgs {
            backend: BackendKind::Vagrant,
            workspace_dir: Some(PathBuf::from("/var/tmp/e2e")),
            transport: None,
            docker_image: None,
            vagrant_box: Some("generic/centos7".to_string()),
        };
        match args.config() {
            BackendConfig::Vagrant(config) => {
                assert_eq!(config.workspace_dir, PathBuf::from("/var/tmp/e2e/vagrant"));
                assert_eq!(config.box_name, "generic/centos7");
            }
            BackendConfig::Docker(_) => panic!("expected the vagrant backend"),
        }
    }
}
