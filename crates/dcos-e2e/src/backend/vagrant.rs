//! VM backend driven by the `vagrant` CLI.
//!
//! Each cluster owns a directory `<workspace>/<cluster_id>/` holding the
//! rendered `Vagrantfile` and `cluster.json`, the resource map written once
//! the VMs are up. A cluster exists once its `cluster.json` does.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

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

const RESOURCE_FILE: &str = "cluster.json";

/// First host octet handed out within the private network.
const FIRST_HOST_OCTET: u8 = 101;
const LAST_HOST_OCTET: u8 = 254;

/// Settings for the Vagrant backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VagrantConfig {
    /// Directory holding one subdirectory per cluster.
    pub workspace_dir: PathBuf,
    /// Vagrant box to boot.
    pub box_name: String,
    pub memory_mb: u32,
    pub cpus: u32,
    /// A /24 host-only network; the last octet is ignored.
    pub network: Ipv4Addr,
    /// OS user Vagrant logs in as.
    pub default_user: String,
    /// `vagrant` executable.
    pub vagrant_program: String,
}

impl Default for VagrantConfig {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir().join("dcos-e2e").join("vagrant"),
            box_name: "centos/7".to_string(),
            memory_mb: 4096,
            cpus: 2,
            network: Ipv4Addr::new(192, 168, 65, 0),
            default_user: "vagrant".to_string(),
            vagrant_program: "vagrant".to_string(),
        }
    }
}

/// One VM as persisted in `cluster.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VmRecord {
    name: String,
    role: Role,
    ip: Ipv4Addr,
    #[serde(default)]
    identity_file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceMap {
    cluster_id: ClusterId,
    vms: Vec<VmRecord>,
}

/// Vagrant backend.
#[derive(Debug, Clone)]
pub struct Vagrant {
    config: VagrantConfig,
    ip_detect_script: PathBuf,
}

impl Vagrant {
    /// Prepare the workspace and ip-detect script.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the workspace cannot be written.
    pub fn new(config: VagrantConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_dir)
            .map_err(|e| Error::io(&config.workspace_dir, e))?;
        let ip_detect_script = config.workspace_dir.join("ip-detect");
        // eth0 is the NAT interface; the private network is eth1.
        write_script(&ip_detect_script, &ip_detect_contents("eth1"))?;
        Ok(Self {
            config,
            ip_detect_script,
        })
    }

    fn cluster_dir(&self, cluster_id: &ClusterId) -> PathBuf {
        self.config.workspace_dir.join(cluster_id.as_str())
    }

    async fn bring_up(&self, cluster_id: &ClusterId, counts: RoleCounts) -> Result<ClusterHandle> {
        let dir = self.cluster_dir(cluster_id);
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let mut vms = plan_vms(cluster_id, counts, self.config.network)?;
        let vagrantfile = dir.join("Vagrantfile");
        std::fs::write(&vagrantfile, render_vagrantfile(&self.config, &vms))
            .map_err(|e| Error::io(&vagrantfile, e))?;

        let vagrant = self.config.vagrant_program.as_str();
        run_tool(vagrant, ["up"], Some(&dir)).await?;

        let ssh_config = run_tool(vagrant, ["ssh-config"], Some(&dir)).await?;
        let identities = parse_identity_files(&ssh_config);
        for vm in &mut vms {
            vm.identity_file = identities.get(&vm.name).cloned();
        }

        let map = ResourceMap {
            cluster_id: cluster_id.clone(),
            vms,
        };
        let resource_path = dir.join(RESOURCE_FILE);
        let json = serde_json::to_string_pretty(&map)
            .map_err(|e| Error::config(format!("Failed to serialize {RESOURCE_FILE}: {e}")))?;
        std::fs::write(&resource_path, json).map_err(|e| Error::io(&resource_path, e))?;

        self.attach(cluster_id).await
    }

    fn read_resource_map(&self, cluster_id: &ClusterId) -> Result<Option<ResourceMap>> {
        let path = self.cluster_dir(cluster_id).join(RESOURCE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::config(format!("Corrupt {}: {e}", path.display())))
    }
}

/// Assign names and deterministic addresses, masters first.
fn plan_vms(cluster_id: &ClusterId, counts: RoleCounts, network: Ipv4Addr) -> Result<Vec<VmRecord>> {
    let [a, b, c, _] = network.octets();
    let capacity = u32::from(LAST_HOST_OCTET - FIRST_HOST_OCTET) + 1;
    if counts.total()? > capacity {
        return Err(Error::config(format!(
            "A Vagrant cluster can have at most {capacity} nodes"
        )));
    }

    let mut host = FIRST_HOST_OCTET;
    let mut vms = Vec::new();
    for role in Role::INSTALL_ORDER {
        for index in 0..counts.count(role) {
            vms.push(VmRecord {
                name: machine_name(cluster_id, role, index),
                role,
                ip: Ipv4Addr::new(a, b, c, host),
                identity_file: None,
            });
            host = host.saturating_add(1);
        }
    }
    Ok(vms)
}

fn render_vagrantfile(config: &VagrantConfig, vms: &[VmRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by dcos-e2e. Changes are overwritten.");
    let _ = writeln!(out, "Vagrant.configure(\"2\") do |config|");
    let _ = writeln!(out, "  config.vm.box = \"{}\"", config.box_name);
    let _ = writeln!(out, "  config.vm.synced_folder \".\", \"/vagrant\", disabled: true");
    let _ = writeln!(out, "  config.vm.provider \"virtualbox\" do |vb|");
    let _ = writeln!(out, "    vb.memory = {}", config.memory_mb);
    let _ = writeln!(out, "    vb.cpus = {}", config.cpus);
    let _ = writeln!(out, "  end");
    for vm in vms {
        let hostname = format!("{}-{}", vm.role.as_str().replace('_', "-"), vm.ip.octets()[3]);
        let _ = writeln!(out, "  config.vm.define \"{}\" do |node|", vm.name);
        let _ = writeln!(out, "    node.vm.hostname = \"{hostname}\"");
        let _ = writeln!(out, "    node.vm.network \"private_network\", ip: \"{}\"", vm.ip);
        let _ = writeln!(out, "  end");
    }
    let _ = writeln!(out, "end");
    out
}

/// Map `Host` entries of `vagrant ssh-config` to their `IdentityFile`.
fn parse_identity_files(ssh_config: &str) -> BTreeMap<String, PathBuf> {
    let mut identities = BTreeMap::new();
    let mut host: Option<&str> = None;
    for line in ssh_config.lines() {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("Host"), Some(name)) => host = Some(name),
            (Some("IdentityFile"), Some(path)) => {
                if let Some(name) = host {
                    identities
                        .entry(name.to_string())
                        .or_insert_with(|| PathBuf::from(path.trim_matches('"')));
                }
            }
            _ => {}
        }
    }
    identities
}

#[async_trait]
impl Backend for Vagrant {
    fn name(&self) -> &'static str {
        "vagrant"
    }

    async fn provision(&self, cluster_id: &ClusterId, counts: RoleCounts) -> Result<ClusterHandle> {
        check_new_cluster(self, cluster_id, counts).await?;
        info!(
            cluster_id = %cluster_id,
            masters = counts.masters,
            agents = counts.agents,
            public_agents = counts.public_agents,
            "Provisioning Vagrant cluster"
        );

        match self.bring_up(cluster_id, counts).await {
            Ok(handle) => Ok(handle),
            Err(e) => Err(rollback(self, cluster_id, &e).await),
        }
    }

    async fn attach(&self, cluster_id: &ClusterId) -> Result<ClusterHandle> {
        let map = self.read_resource_map(cluster_id)?.ok_or_else(|| NotFoundError {
            cluster_id: cluster_id.to_string(),
        })?;

        let user = &self.config.default_user;
        let resources = map.vms.into_iter().map(|vm| {
            let ip = IpAddr::V4(vm.ip);
            let mut node = Node::new(ip, ip, user.clone());
            if let Some(identity) = vm.identity_file {
                node = node.with_ssh_key(identity);
            }
            (vm.name, vm.role, node)
        });
        ClusterHandle::new(cluster_id.clone(), self.name(), resources)
    }

    async fn destroy(&self, cluster_id: &ClusterId) -> Result<()> {
        let dir = self.cluster_dir(cluster_id);
        if !dir.exists() {
            return Ok(());
        }
        if dir.join("Vagrantfile").exists() {
            info!(cluster_id = %cluster_id, "Destroying VMs");
            run_tool(&self.config.vagrant_program, ["destroy", "--force"], Some(&dir)).await?;
        }
        std::fs::remove_dir_all(&dir).map_err(|e| Error::io(dir, e))
    }

    async fn list_cluster_ids(&self) -> Result<BTreeSet<ClusterId>> {
        let workspace = &self.config.workspace_dir;
        let entries = std::fs::read_dir(workspace).map_err(|e| Error::io(workspace, e))?;
        let mut ids = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(workspace, e))?;
            if !entry.path().join(RESOURCE_FILE).is_file() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| ClusterId::new(name).ok())
            {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    fn ip_detect_script(&self) -> &Path {
        &self.ip_detect_script
    }

    fn default_transport(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn base_config(&self) -> Manifest {
        common_base_config(&self.config.default_user)
    }
}
