//! Per-node installation and upgrade.
//!
//! Every node gets its own copy of the installer, generates its own
//! `genconf/serve` bundle offline and then runs the node install script for
//! its role. Nodes are independent; [`run_role`] runs one role's nodes
//! concurrently and returns only when all of them have finished.

use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::future::Future;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::Error;
use crate::manifest::{remote_ip_detect_path, Manifest, SecurityMode, GENCONF_DIR};
use crate::node::{Node, Role};
use crate::transport::{CommandOutput, RemoteCommand, RunOptions, Transport};
use crate::variant::VariantChoice;

/// Where the installer is placed on each node.
pub const REMOTE_INSTALLER_PATH: &str = "/dcos_install_tmp/dcos_generate_config.sh";

/// Installed platform version metadata on a node.
pub const NODE_VERSION_FILE: &str = "/opt/mesosphere/active/dcos-metadata/etc/dcos-version.json";

const SERVE_DIR: &str = "/genconf/serve";

/// A local file or directory and where it goes on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    pub local: PathBuf,
    pub remote: PathBuf,
}

impl std::str::FromStr for PathPair {
    type Err = Error;

    /// Parse `/absolute/local/path:/remote/path`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let not_a_pair = || {
            Error::InvalidPathPair(format!(
                "\"{value}\" is not in the format /absolute/local/path:/remote/path."
            ))
        };
        let (local, remote) = value.split_once(':').ok_or_else(not_a_pair)?;
        if local.is_empty() || remote.is_empty() {
            return Err(not_a_pair());
        }

        let local = PathBuf::from(local);
        if !local.is_absolute() {
            return Err(Error::InvalidPathPair(format!(
                "\"{}\" is not an absolute path.",
                local.display()
            )));
        }
        if !local.exists() {
            return Err(Error::InvalidPathPair(format!(
                "\"{}\" does not exist.",
                local.display()
            )));
        }

        Ok(Self {
            local,
            remote: PathBuf::from(remote),
        })
    }
}

/// Inputs to an install or upgrade.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Local installer artifact.
    pub installer: PathBuf,
    pub variant: VariantChoice,
    /// User configuration, already layered.
    pub extra_config: Option<Manifest>,
    pub security_mode: Option<SecurityMode>,
    /// License key contents; used for Enterprise only.
    pub license_key: Option<String>,
    /// Copied onto every master before it is installed.
    pub files_to_copy_to_masters: Vec<PathPair>,
    /// Copied into the genconf directory of every node. Remote paths are
    /// taken relative to that directory.
    pub files_to_copy_to_genconf_dir: Vec<PathPair>,
}

impl InstallRequest {
    #[must_use]
    pub fn new(installer: impl Into<PathBuf>) -> Self {
        Self {
            installer: installer.into(),
            variant: VariantChoice::Auto,
            extra_config: None,
            security_mode: None,
            license_key: None,
            files_to_copy_to_masters: Vec::new(),
            files_to_copy_to_genconf_dir: Vec::new(),
        }
    }
}

/// One node's install failure.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub node: Node,
    pub role: Role,
    /// Stage that failed, e.g. `genconf`.
    pub stage: &'static str,
    /// Error or command result detail.
    pub detail: String,
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}: {}", self.node, self.role, self.stage, self.detail)
    }
}

/// Every failing node of one role.
#[derive(Debug, Clone)]
pub struct InstallError {
    pub cluster_id: String,
    pub role: Role,
    pub failures: Vec<NodeFailure>,
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to install {} {} node(s) of cluster \"{}\": ",
            self.failures.len(),
            self.role,
            self.cluster_id
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for InstallError {}

fn describe_exit(command: &str, output: &CommandOutput) -> String {
    let mut detail = format!("`{command}` exited with code {}", output.exit_code);
    for (name, text) in [("stderr", &output.stderr), ("stdout", &output.stdout)] {
        let text = text.trim();
        if !text.is_empty() {
            let _ = write!(detail, "\n{name}:\n{text}");
        }
    }
    detail
}

/// Last token of the last line printed by
/// `--generate-node-upgrade-script`, as a path under the serve directory.
fn upgrade_script_path(stdout: &str) -> Option<String> {
    let url = stdout.lines().rev().find(|l| !l.trim().is_empty())?.split_whitespace().last()?;
    let url = url::Url::parse(url).ok()?;
    let path = url.path().trim_start_matches('/');
    (!path.is_empty()).then(|| path.to_string())
}

fn installed_version(stdout: &str) -> Option<String> {
    let metadata: serde_json::Value = serde_json::from_str(stdout).ok()?;
    metadata.get("version")?.as_str().map(str::to_string)
}

/// Installs or upgrades one node at a time.
pub(crate) struct NodeInstaller<'a> {
    pub transport: &'a dyn Transport,
    /// Local `config.yaml` for this run.
    pub config_file: &'a Path,
    pub ip_detect_script: &'a Path,
    pub request: &'a InstallRequest,
    pub deadline: Option<Instant>,
}

impl NodeInstaller<'_> {
    fn options(&self, node: &Node) -> RunOptions {
        let opts = RunOptions::new().log_and_capture().deadline(self.deadline);
        let sudo = opts.user_for(node) != "root";
        opts.sudo(sudo)
    }

    async fn copy(
        &self,
        node: &Node,
        role: Role,
        stage: &'static str,
        local: &Path,
        remote: &Path,
    ) -> Result<(), NodeFailure> {
        self.transport
            .copy(node, local, remote, &self.options(node))
            .await
            .map_err(|e| NodeFailure {
                node: node.clone(),
                role,
                stage,
                detail: e.to_string(),
            })
    }

    /// Run a command; a non-zero exit fails the node.
    async fn step(
        &self,
        node: &Node,
        role: Role,
        stage: &'static str,
        command: RemoteCommand,
    ) -> Result<CommandOutput, NodeFailure> {
        let failure = |detail: String| NodeFailure {
            node: node.clone(),
            role,
            stage,
            detail,
        };
        let output = self
            .transport
            .run(node, &command, &self.options(node))
            .await
            .map_err(|e| failure(e.to_string()))?;
        if !output.success() {
            return Err(failure(describe_exit(&command.to_string(), &output)));
        }
        Ok(output)
    }

    /// Place the installer and its inputs on a node.
    async fn stage_inputs(&self, node: &Node, role: Role) -> Result<(), NodeFailure> {
        let genconf = Path::new(GENCONF_DIR);
        self.copy(
            node,
            role,
            "copy installer",
            &self.request.installer,
            Path::new(REMOTE_INSTALLER_PATH),
        )
        .await?;
        self.copy(node, role, "copy config", self.config_file, &genconf.join("config.yaml"))
            .await?;
        self.copy(
            node,
            role,
            "copy ip-detect",
            self.ip_detect_script,
            &remote_ip_detect_path(self.ip_detect_script),
        )
        .await?;
        for pair in &self.request.files_to_copy_to_genconf_dir {
            let relative = pair.remote.strip_prefix("/").unwrap_or(&pair.remote);
            self.copy(node, role, "copy genconf file", &pair.local, &genconf.join(relative))
                .await?;
        }
        Ok(())
    }

    /// Install the platform on one node.
    pub async fn install_node(&self, node: Node, role: Role) -> Result<(), NodeFailure> {
        info!(node = %node, role = %role, "Installing node");
        self.stage_inputs(&node, role).await?;

        if role == Role::Master {
            for pair in &self.request.files_to_copy_to_masters {
                self.copy(&node, role, "copy master file", &pair.local, &pair.remote)
                    .await?;
            }
        }

        self.step(
            &node,
            role,
            "genconf",
            RemoteCommand::shell(format!(
                "cd / && bash {REMOTE_INSTALLER_PATH} --offline -v --genconf"
            )),
        )
        .await?;
        self.step(
            &node,
            role,
            "remove installer",
            RemoteCommand::argv(["rm", REMOTE_INSTALLER_PATH]),
        )
        .await?;
        self.step(
            &node,
            role,
            "install",
            RemoteCommand::shell(format!(
                "cd {SERVE_DIR} && bash dcos_install.sh --no-block-dcos-setup {}",
                role.install_script_role()
            )),
        )
        .await?;

        info!(node = %node, role = %role, "Node installed");
        Ok(())
    }

    /// Upgrade one node in place to the installer's version.
    pub async fn upgrade_node(&self, node: Node, role: Role) -> Result<(), NodeFailure> {
        info!(node = %node, role = %role, "Upgrading node");
        self.stage_inputs(&node, role).await?;

        let current = self
            .step(&node, role, "read version", RemoteCommand::argv(["cat", NODE_VERSION_FILE]))
            .await?;
        let version = installed_version(&current.stdout).ok_or_else(|| NodeFailure {
            node: node.clone(),
            role,
            stage: "read version",
            detail: format!("{NODE_VERSION_FILE} has no version: {}", current.stdout.trim()),
        })?;

        let generated = self
            .step(
                &node,
                role,
                "generate upgrade script",
                RemoteCommand::shell(format!(
                    "cd / && bash {REMOTE_INSTALLER_PATH} --generate-node-upgrade-script {version}"
                )),
            )
            .await?;
        let script = upgrade_script_path(&generated.stdout).ok_or_else(|| NodeFailure {
            node: node.clone(),
            role,
            stage: "generate upgrade script",
            detail: format!(
                "no upgrade script URL in installer output: {}",
                generated.stdout.trim()
            ),
        })?;

        self.step(
            &node,
            role,
            "remove installer",
            RemoteCommand::argv(["rm", REMOTE_INSTALLER_PATH]),
        )
        .await?;
        self.step(
            &node,
            role,
            "upgrade",
            RemoteCommand::shell(format!("cd {SERVE_DIR} && bash {script}")),
        )
        .await?;

        info!(node = %node, role = %role, from = %version, "Node upgraded");
        Ok(())
    }
}

/// Run `operation` on every node of a role, at most `concurrency` at a time.
///
/// A failing node does not cancel its siblings. Returns once every node has
/// finished, with the failures of all nodes that failed.
pub(crate) async fn run_role<F, Fut>(
    nodes: &BTreeSet<Node>,
    concurrency: usize,
    operation: F,
) -> Vec<NodeFailure>
where
    F: Fn(Node) -> Fut,
    Fut: Future<Output = Result<(), NodeFailure>>,
{
    stream::iter(nodes.iter().cloned())
        .map(operation)
        .buffer_unordered(concurrency.max(1))
        .filter_map(|result| async move {
            result.err().inspect(|failure| {
                error!(node = %failure.node, stage = failure.stage, "Node failed: {}", failure.detail);
            })
        })
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_path_pair_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("license.txt");
        std::fs::write(&local, "key").unwrap();

        let pair: PathPair = format!("{}:/opt/license.txt", local.display()).parse().unwrap();
        assert_eq!(pair.local, local);
        assert_eq!(pair.remote, PathBuf::from("/opt/license.txt"));
    }

    #[test]
    fn test_path_pair_errors() {
        let err = "no-colon".parse::<PathPair>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "\"no-colon\" is not in the format /absolute/local/path:/remote/path."
        );

        let err = "relative/file:/remote".parse::<PathPair>().unwrap_err();
        assert!(err.to_string().contains("is not an absolute path"));

        let err = "/definitely/not/here:/remote".parse::<PathPair>().unwrap_err();
        assert_eq!(err.to_string(), "\"/definitely/not/here\" does not exist.");
    }

    #[test]
    fn test_upgrade_script_path_from_last_line() {
        let stdout = "Generating upgrade script\n\
                      Node upgrade script URL: http://bootstrap:80/upgrade/0d3e/dcos_node_upgrade.sh\n\n";
        assert_eq!(
            upgrade_script_path(stdout).as_deref(),
            Some("upgrade/0d3e/dcos_node_upgrade.sh")
        );
        assert_eq!(upgrade_script_path("no url here"), None);
        assert_eq!(upgrade_script_path(""), None);
    }

    #[test]
    fn test_installed_version() {
        assert_eq!(
            installed_version(r#"{"version": "1.11.4", "dcos-image-commit": "abc"}"#).as_deref(),
            Some("1.11.4")
        );
        assert_eq!(installed_version("{}"), None);
    }

    #[test]
    fn test_install_error_lists_every_failure() {
        let ip = "10.0.0.1".parse().unwrap();
        let failure = |stage| NodeFailure {
            node: Node::new(ip, ip, "root"),
            role: Role::Agent,
            stage,
            detail: "boom".to_string(),
        };
        let err = InstallError {
            cluster_id: "c".to_string(),
            role: Role::Agent,
            failures: vec![failure("genconf"), failure("install")],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to install 2 agent node(s) of cluster \"c\""));
        assert!(msg.contains("at genconf: boom"));
        assert!(msg.contains("at install: boom"));
    }

    #[tokio::test]
    async fn test_run_role_collects_all_failures_and_bounds_concurrency() {
        let nodes: BTreeSet<Node> = (1..=6)
            .map(|i| {
                let ip = format!("10.0.0.{i}").parse().unwrap();
                Node::new(ip, ip, "root")
            })
            .collect();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let failures = run_role(&nodes, 2, |node| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                if node.public_ip().to_string().ends_with(['2', '5']) {
                    return Err(NodeFailure {
                        node,
                        role: Role::Agent,
                        stage: "install",
                        detail: "exit 1".to_string(),
                    });
                }
                Ok(())
            }
        })
        .await;

        assert_eq!(failures.len(), 2);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }
}
