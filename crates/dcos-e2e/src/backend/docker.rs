//! Container backend driven by the `docker` CLI.
//!
//! Every node is a privileged container labelled with its cluster id and
//! role; the labels are the only persisted state. A per-cluster SSH keypair
//! lives under `<workspace>/<cluster_id>/` so the SSH transport can reach
//! containers as well as `docker exec`.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    check_new_cluster, common_base_config, ip_detect_contents, machine_name, rollback,
    write_script, Backend,
};
use crate::cluster::{ClusterHandle, ClusterId, RoleCounts};
use crate::error::{Error, NotFoundError, Result};
use crate::manifest::Manifest;
use crate::node::{Node, Role};
use crate::tool::run_tool;
use crate::transport::TransportKind;

/// Label carrying the cluster id.
pub const CLUSTER_ID_LABEL: &str = "dcos_e2e.cluster_id";

/// Label carrying the node role.
pub const NODE_ROLE_LABEL: &str = "dcos_e2e.node_role";

const DEFAULT_IMAGE: &str = "dcos-e2e-node:latest";

const KEY_FILE_NAME: &str = "id_rsa";

/// Settings for the Docker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Directory for scripts and per-cluster keys.
    pub workspace_dir: PathBuf,
    /// Node image. It must run systemd and sshd.
    pub image: String,
    /// Docker network to attach nodes to; the default bridge if unset.
    pub network: Option<String>,
    /// Extra arguments passed to `docker run` before the image name.
    pub docker_run_args: Vec<String>,
    /// Containers started at the same time while provisioning.
    pub provision_concurrency: usize,
    /// `docker` executable.
    pub docker_program: String,
    /// `ssh-keygen` executable.
    pub ssh_keygen_program: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir().join("dcos-e2e").join("docker"),
            image: DEFAULT_IMAGE.to_string(),
            network: None,
            docker_run_args: Vec::new(),
            provision_concurrency: 8,
            docker_program: "docker".to_string(),
            ssh_keygen_program: "ssh-keygen".to_string(),
        }
    }
}

/// Docker backend.
#[derive(Debug, Clone)]
pub struct Docker {
    config: DockerConfig,
    ip_detect_script: PathBuf,
}

impl Docker {
    /// Prepare the workspace and ip-detect script.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the workspace cannot be written.
    pub fn new(config: DockerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_dir)
            .map_err(|e| Error::io(&config.workspace_dir, e))?;
        let ip_detect_script = config.workspace_dir.join("ip-detect");
        write_script(&ip_detect_script, &ip_detect_contents("eth0"))?;
        Ok(Self {
            config,
            ip_detect_script,
        })
    }

    fn cluster_dir(&self, cluster_id: &ClusterId) -> PathBuf {
        self.config.workspace_dir.join(cluster_id.as_str())
    }

    fn run_args(&self, cluster_id: &ClusterId, role: Role, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--privileged".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--hostname".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("{CLUSTER_ID_LABEL}={cluster_id}"),
            "--label".to_string(),
            format!("{NODE_ROLE_LABEL}={role}"),
            "--tmpfs".to_string(),
            "/run".to_string(),
            "--volume".to_string(),
            "/sys/fs/cgroup:/sys/fs/cgroup:ro".to_string(),
        ];
        if let Some(network) = &self.config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args.extend(self.config.docker_run_args.iter().cloned());
        args.push(self.config.image.clone());
        args
    }

    fn docker(&self) -> &str {
        &self.config.docker_program
    }

    async fn container_ids(&self, cluster_id: &ClusterId) -> Result<Vec<String>> {
        let out = run_tool(
            self.docker(),
            [
                "ps".to_string(),
                "--all".to_string(),
                "--quiet".to_string(),
                "--filter".to_string(),
                format!("label={CLUSTER_ID_LABEL}={cluster_id}"),
            ],
            None,
        )
        .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    async fn create_node(
        &self,
        cluster_id: &ClusterId,
        role: Role,
        name: String,
        public_key: &str,
    ) -> Result<()> {
        debug!(cluster_id = %cluster_id, container = %name, role = %role, "Starting container");
        run_tool(self.docker(), self.run_args(cluster_id, role, &name), None).await?;
        run_tool(
            self.docker(),
            [
                "exec".to_string(),
                "--env".to_string(),
                format!("AUTHORIZED_KEY={}", public_key.trim()),
                name,
                "/bin/sh".to_string(),
                "-c".to_string(),
                "mkdir -p /root/.ssh && echo \"$AUTHORIZED_KEY\" >> /root/.ssh/authorized_keys \
                 && chmod 700 /root/.ssh && chmod 600 /root/.ssh/authorized_keys"
                    .to_string(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn create_all(&self, cluster_id: &ClusterId, counts: RoleCounts) -> Result<ClusterHandle> {
        let dir = self.cluster_dir(cluster_id);
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let key_path = dir.join(KEY_FILE_NAME);
        run_tool(
            &self.config.ssh_keygen_program,
            [
                "-t".to_string(),
                "rsa".to_string(),
                "-b".to_string(),
                "2048".to_string(),
                "-N".to_string(),
                String::new(),
                "-q".to_string(),
                "-f".to_string(),
                key_path.to_string_lossy().into_owned(),
            ],
            None,
        )
        .await?;
        let public_key_path = key_path.with_extension("pub");
        let public_key = std::fs::read_to_string(&public_key_path)
            .map_err(|e| Error::io(&public_key_path, e))?;

        // Every started `docker run` is awaited, even after a failure, so that
        // rollback sees each container the daemon created.
        let failed = AtomicBool::new(false);
        let creations: Vec<BoxFuture<'_, Result<()>>> = Role::INSTALL_ORDER
            .into_iter()
            .flat_map(|role| (0..counts.count(role)).map(move |index| (role, index)))
            .map(|(role, index)| {
                let name = machine_name(cluster_id, role, index);
                let failed = &failed;
                let public_key = public_key.as_str();
                async move {
                    if failed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    let created = self.create_node(cluster_id, role, name, public_key).await;
                    if created.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    created
                }
                .boxed()
            })
            .collect();
        let results: Vec<Result<()>> = stream::iter(creations)
            .buffer_unordered(self.config.provision_concurrency.max(1))
            .collect()
            .await;
        for result in results {
            result?;
        }

        self.attach(cluster_id).await
    }
}

/// Parse `docker inspect` output in the `name<TAB>role<TAB>ips` format.
fn parse_inspect(
    output: &str,
    key_path: &Path,
) -> Result<Vec<(String, Role, Node)>> {
    let mut resources = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split('\t');
        let (Some(name), Some(role), Some(ips)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(Error::config(format!(
                "Unexpected docker inspect output: {line}"
            )));
        };
        let name = name.trim_start_matches('/').to_string();
        let role: Role = role.parse()?;
        let ip: IpAddr = ips
            .split_whitespace()
            .next()
            .and_then(|ip| ip.parse().ok())
            .ok_or_else(|| Error::config(format!("Container {name} has no IP address")))?;
        let node = Node::new(ip, ip, "root")
            .with_ssh_key(key_path)
            .with_exec_target(name.clone());
        resources.push((name, role, node));
    }
    Ok(resources)
}

#[async_trait]
impl Backend for Docker {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, cluster_id: &ClusterId, counts: RoleCounts) -> Result<ClusterHandle> {
        check_new_cluster(self, cluster_id, counts).await?;
        info!(
            cluster_id = %cluster_id,
            masters = counts.masters,
            agents = counts.agents,
            public_agents = counts.public_agents,
            "Provisioning Docker cluster"
        );

        match self.create_all(cluster_id, counts).await {
            Ok(handle) => Ok(handle),
            Err(e) => Err(rollback(self, cluster_id, &e).await),
        }
    }

    async fn attach(&self, cluster_id: &ClusterId) -> Result<ClusterHandle> {
        let ids = self.container_ids(cluster_id).await?;
        if ids.is_empty() {
            return Err(NotFoundError {
                cluster_id: cluster_id.to_string(),
            }
            .into());
        }

        let mut args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            format!(
                "{{{{.Name}}}}\t{{{{index .Config.Labels \"{NODE_ROLE_LABEL}\"}}}}\t\
                 {{{{range .NetworkSettings.Networks}}}}{{{{.IPAddress}}}} {{{{end}}}}"
            ),
        ];
        args.extend(ids);
        let out = run_tool(self.docker(), args, None).await?;

        let key_path = self.cluster_dir(cluster_id).join(KEY_FILE_NAME);
        ClusterHandle::new(cluster_id.clone(), self.name(), parse_inspect(&out, &key_path)?)
    }

    async fn destroy(&self, cluster_id: &ClusterId) -> Result<()> {
        let ids = self.container_ids(cluster_id).await?;
        if !ids.is_empty() {
            info!(cluster_id = %cluster_id, containers = ids.len(), "Removing containers");
            let mut args = vec!["rm".to_string(), "--force".to_string(), "--volumes".to_string()];
            args.extend(ids);
            run_tool(self.docker(), args, None).await?;
        }

        let dir = self.cluster_dir(cluster_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(dir, e)),
        }
    }

    async fn list_cluster_ids(&self) -> Result<BTreeSet<ClusterId>> {
        let out = run_tool(
            self.docker(),
            [
                "ps".to_string(),
                "--all".to_string(),
                "--filter".to_string(),
                format!("label={CLUSTER_ID_LABEL}"),
                "--format".to_string(),
                format!("{{{{.Label \"{CLUSTER_ID_LABEL}\"}}}}"),
            ],
            None,
        )
        .await?;
        Ok(out
            .lines()
            .filter_map(|line| ClusterId::new(line.trim()).ok())
            .collect())
    }

    fn ip_detect_script(&self) -> &Path {
        &self.ip_detect_script
    }

    fn default_transport(&self) -> TransportKind {
        TransportKind::DockerExec
    }

    fn base_config(&self) -> Manifest {
        let mut manifest = common_base_config("root");
        // Containers share the host clock.
        manifest.insert("check_time", "false");
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> Docker {
        Docker::new(DockerConfig {
            workspace_dir: dir.to_path_buf(),
            network: Some("dcos".to_string()),
            docker_run_args: vec!["--memory=4g".to_string()],
            ..DockerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_new_writes_ip_detect_script() {
        let dir = tempfile::tempdir().unwrap();
        let docker = backend(dir.path());
        assert_eq!(docker.ip_detect_script(), dir.path().join("ip-detect"));
        assert!(docker.ip_detect_script().exists());
        assert_eq!(docker.default_transport(), TransportKind::DockerExec);
    }

    #[test]
    fn test_run_args_label_container() {
        let dir = tempfile::tempdir().unwrap();
        let docker = backend(dir.path());
        let id = ClusterId::new("c1").unwrap();
        let args = docker.run_args(&id, Role::PublicAgent, "dcos-e2e-c1-public-agent-0");

        assert!(args
            .windows(2)
            .any(|w| w == ["--label", "dcos_e2e.cluster_id=c1"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--label", "dcos_e2e.node_role=public_agent"]));
        assert!(args.windows(2).any(|w| w == ["--network", "dcos"]));
        let n = args.len();
        assert_eq!(args[n - 2], "--memory=4g");
        assert_eq!(args[n - 1], DEFAULT_IMAGE);
    }

    #[test]
    fn test_parse_inspect() {
        let out = "/dcos-e2e-c1-master-0\tmaster\t172.17.0.2 \n\
                   /dcos-e2e-c1-agent-0\tagent\t172.17.0.3 \n";
        let resources = parse_inspect(out, Path::new("/ws/c1/id_rsa")).unwrap();
        assert_eq!(resources.len(), 2);
        let (name, role, node) = &resources[0];
        assert_eq!(name, "dcos-e2e-c1-master-0");
        assert_eq!(*role, Role::Master);
        assert_eq!(node.private_ip().to_string(), "172.17.0.2");
        assert_eq!(node.exec_target(), Some("dcos-e2e-c1-master-0"));
        assert_eq!(node.ssh_key_path(), Some(Path::new("/ws/c1/id_rsa")));
    }

    #[test]
    fn test_parse_inspect_rejects_stopped_containers() {
        let out = "/dcos-e2e-c1-master-0\tmaster\t\n";
        assert!(parse_inspect(out, Path::new("/k")).is_err());
    }

    #[test]
    fn test_base_config_disables_time_check() {
        let dir = tempfile::tempdir().unwrap();
        let config = backend(dir.path()).base_config();
        assert_eq!(
            config.get("check_time").and_then(serde_yaml::Value::as_str),
            Some("false")
        );
        assert_eq!(
            config.get("ssh_user").and_then(serde_yaml::Value::as_str),
            Some("root")
        );
    }
}
