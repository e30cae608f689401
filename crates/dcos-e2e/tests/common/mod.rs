//! Shared fakes for the integration tests.
//!
//! `FakeBackend` keeps its machines in memory; `RecordingTransport` answers
//! the installer and health commands and records every call it receives.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use dcos_e2e::backend::{machine_name, Backend};
use dcos_e2e::lifecycle::install::NODE_VERSION_FILE;
use dcos_e2e::transport::{
    CommandOutput, RemoteCommand, RunOptions, Transport, TransportError, TransportKind,
};
use dcos_e2e::{
    ClusterHandle, ClusterId, Error, Manifest, Node, NotFoundError, ProvisionError, Result, Role,
    RoleCounts,
};
use tempfile::TempDir;

// =============================================================================
// Fake backend
// =============================================================================

type Resources = Vec<(String, Role, Node)>;

/// In-memory backend with failure injection.
pub struct FakeBackend {
    clusters: Mutex<BTreeMap<ClusterId, Resources>>,
    /// Fail provisioning when creating the node with this position.
    fail_at_node: Option<usize>,
    loopback: bool,
    transport: TransportKind,
    next_subnet: AtomicU32,
    scripts: TempDir,
    ip_detect: PathBuf,
}

impl FakeBackend {
    pub fn new(transport: TransportKind) -> Self {
        let scripts = tempfile::tempdir().unwrap();
        let ip_detect = scripts.path().join("ip-detect");
        std::fs::write(&ip_detect, "#!/bin/sh\necho 10.0.0.1\n").unwrap();
        Self {
            clusters: Mutex::new(BTreeMap::new()),
            fail_at_node: None,
            loopback: false,
            transport,
            next_subnet: AtomicU32::new(1),
            scripts,
            ip_detect,
        }
    }

    /// Fail while creating the `position`th node (zero-based).
    #[must_use]
    pub fn failing_at_node(mut self, position: usize) -> Self {
        self.fail_at_node = Some(position);
        self
    }

    /// Give nodes loopback addresses (127.0.0.1 upwards).
    #[must_use]
    pub fn loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Resources currently tagged with `cluster_id`.
    pub fn resource_count(&self, cluster_id: &ClusterId) -> usize {
        self.clusters
            .lock()
            .unwrap()
            .get(cluster_id)
            .map_or(0, Vec::len)
    }

    fn address(&self, subnet: u32, position: usize) -> IpAddr {
        let host = u8::try_from(position + 1).unwrap();
        if self.loopback {
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, host))
        } else {
            let subnet = u8::try_from(subnet).unwrap();
            IpAddr::V4(Ipv4Addr::new(10, 0, subnet, host))
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, cluster_id: &ClusterId, counts: RoleCounts) -> Result<ClusterHandle> {
        counts.validate(cluster_id)?;
        if self.clusters.lock().unwrap().contains_key(cluster_id) {
            return Err(ProvisionError::before_create(
                cluster_id.as_str(),
                format!("Cluster \"{cluster_id}\" already exists"),
            )
            .into());
        }

        let subnet = self.next_subnet.fetch_add(1, Ordering::SeqCst);
        let mut position = 0;
        for role in Role::INSTALL_ORDER {
            for index in 0..counts.count(role) {
                if self.fail_at_node == Some(position) {
                    self.destroy(cluster_id).await?;
                    return Err(ProvisionError {
                        cluster_id: cluster_id.to_string(),
                        reason: format!("injected failure creating node {position}"),
                        rolled_back: true,
                    }
                    .into());
                }
                let ip = self.address(subnet, position);
                let node = Node::new(ip, ip, "root").with_exec_target(machine_name(
                    cluster_id, role, index,
                ));
                self.clusters
                    .lock()
                    .unwrap()
                    .entry(cluster_id.clone())
                    .or_default()
                    .push((machine_name(cluster_id, role, index), role, node));
                position += 1;
            }
        }

        self.attach(cluster_id).await
    }

    async fn attach(&self, cluster_id: &ClusterId) -> Result<ClusterHandle> {
        let resources = self
            .clusters
            .lock()
            .unwrap()
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| NotFoundError {
                cluster_id: cluster_id.to_string(),
            })?;
        ClusterHandle::new(cluster_id.clone(), self.name(), resources)
    }

    async fn destroy(&self, cluster_id: &ClusterId) -> Result<()> {
        self.clusters.lock().unwrap().remove(cluster_id);
        Ok(())
    }

    async fn list_cluster_ids(&self) -> Result<BTreeSet<ClusterId>> {
        Ok(self.clusters.lock().unwrap().keys().cloned().collect())
    }

    fn ip_detect_script(&self) -> &Path {
        &self.ip_detect
    }

    fn default_transport(&self) -> TransportKind {
        self.transport
    }

    fn base_config(&self) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert("cluster_name", "fake");
        manifest.insert("check_time", "false");
        manifest
    }
}

// =============================================================================
// Recording transport
// =============================================================================

/// Start or end of a command on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started { node: IpAddr, command: String },
    Finished { node: IpAddr, command: String },
    Copied { node: IpAddr, remote: PathBuf },
}

/// Transport that simulates a node's answers.
pub struct RecordingTransport {
    kind: TransportKind,
    events: Mutex<Vec<Event>>,
    /// Nodes whose install script exits non-zero.
    failing_installs: Mutex<BTreeSet<IpAddr>>,
    /// Health command calls left that exit non-zero.
    poststart_failures: AtomicU32,
    /// Contents of every `config.yaml` sent to a node.
    configs: Mutex<Vec<String>>,
    /// Caller deadline of every `run` and `copy`, in call order.
    deadlines: Mutex<Vec<Option<Instant>>>,
}

impl RecordingTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            events: Mutex::new(Vec::new()),
            failing_installs: Mutex::new(BTreeSet::new()),
            poststart_failures: AtomicU32::new(0),
            configs: Mutex::new(Vec::new()),
            deadlines: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_install_on(&self, node: IpAddr) {
        self.failing_installs.lock().unwrap().insert(node);
    }

    pub fn heal_installs(&self) {
        self.failing_installs.lock().unwrap().clear();
    }

    pub fn fail_poststart(&self, times: u32) {
        self.poststart_failures.store(times, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn configs(&self) -> Vec<String> {
        self.configs.lock().unwrap().clone()
    }

    pub fn deadlines(&self) -> Vec<Option<Instant>> {
        self.deadlines.lock().unwrap().clone()
    }

    /// Record the caller's deadline and, like a real transport, refuse to
    /// start once it has passed.
    fn check_deadline(
        &self,
        node: &Node,
        command: &str,
        opts: &RunOptions,
    ) -> std::result::Result<(), TransportError> {
        self.deadlines.lock().unwrap().push(opts.deadline);
        match opts.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(TransportError::Timeout {
                node: node.to_string(),
                command: command.to_string(),
                elapsed: Duration::ZERO,
            }),
            _ => Ok(()),
        }
    }

    /// Commands that ran on `node`, in order.
    pub fn commands_on(&self, node: IpAddr) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Started { node: n, command } if n == node => Some(command),
                _ => None,
            })
            .collect()
    }

    fn answer(&self, node: IpAddr, command: &str) -> CommandOutput {
        let ok = |stdout: &str| CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        };
        let failed = |stderr: &str| CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        };

        if command.contains("dcos_install.sh") || command.contains("dcos_node_upgrade.sh") {
            if self.failing_installs.lock().unwrap().contains(&node) {
                return failed("install script failed");
            }
            return ok("");
        }
        if command.contains("dcos-check-runner") {
            let left = self.poststart_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.poststart_failures.store(left - 1, Ordering::SeqCst);
                return failed("dcos-mesos-master.service is not healthy");
            }
            return ok("");
        }
        if command.contains(NODE_VERSION_FILE) {
            return ok(r#"{"version": "1.11.4"}"#);
        }
        if command.contains("--generate-node-upgrade-script") {
            return ok("Node upgrade script URL: http://0.0.0.0:80/upgrade/5e3a/dcos_node_upgrade.sh\n");
        }
        ok("")
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn run(
        &self,
        node: &Node,
        command: &RemoteCommand,
        opts: &RunOptions,
    ) -> std::result::Result<CommandOutput, TransportError> {
        let ip = node.public_ip();
        let command = command.to_string();
        self.check_deadline(node, &command, opts)?;
        self.events.lock().unwrap().push(Event::Started {
            node: ip,
            command: command.clone(),
        });

        // Stagger nodes so concurrent work interleaves.
        let stagger = match ip {
            IpAddr::V4(v4) => u64::from(v4.octets()[3] % 4),
            IpAddr::V6(_) => 0,
        };
        tokio::time::sleep(Duration::from_millis(stagger * 3)).await;

        let output = self.answer(ip, &command);
        self.events
            .lock()
            .unwrap()
            .push(Event::Finished { node: ip, command });
        Ok(output)
    }

    async fn copy(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        opts: &RunOptions,
    ) -> std::result::Result<(), TransportError> {
        self.check_deadline(node, "copy", opts)?;
        if remote.ends_with("config.yaml") {
            let content = std::fs::read_to_string(local).map_err(|e| TransportError::Io {
                node: node.to_string(),
                source: e,
            })?;
            self.configs.lock().unwrap().push(content);
        }
        self.events.lock().unwrap().push(Event::Copied {
            node: node.public_ip(),
            remote: remote.to_path_buf(),
        });
        Ok(())
    }
}

/// Assert that `err` reports `cluster_id` as missing.
pub fn assert_not_found(err: &Error, cluster_id: &str) {
    match err {
        Error::NotFound(e) => assert_eq!(e.cluster_id, cluster_id),
        other => panic!("expected NotFound, got {other:?}"),
    }
}
