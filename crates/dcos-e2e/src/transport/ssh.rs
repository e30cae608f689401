//! Remote shell transport using the OpenSSH client.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::exec::run_client;
use super::{
    mkdir_parent, privileged, CommandOutput, OutputPolicy, OutputSink, RemoteCommand, RunOptions,
    Transport, TransportError, TransportKind,
};
use crate::node::Node;

/// `ssh` reserves this exit code for its own errors.
const SSH_ERROR_EXIT_CODE: i32 = 255;

/// Fragments of the errors the `ssh` client prints for its own failures.
/// A remote command may exit 255 too; without one of these it is treated as
/// the command's result.
const SSH_CLIENT_ERRORS: [&str; 8] = [
    "ssh: ",
    "Permission denied (",
    "Host key verification failed",
    "Connection closed by",
    "Connection reset by",
    "Connection timed out during banner exchange",
    "kex_exchange_identification",
    "Received disconnect from",
];

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs commands over `ssh` and copies with `scp`.
#[derive(Clone)]
pub struct Ssh {
    sink: Arc<dyn OutputSink>,
    connect_timeout: Duration,
}

impl Ssh {
    #[must_use]
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn common_options(&self, node: &Node) -> Vec<String> {
        let mut args = Vec::new();
        for option in [
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }
        if let Some(key) = node.ssh_key_path() {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args
    }

    fn ssh_args(
        &self,
        node: &Node,
        command: &RemoteCommand,
        opts: &RunOptions,
    ) -> Result<Vec<String>, TransportError> {
        let mut args = self.common_options(node);
        if opts.tty {
            args.push("-t".to_string());
        }
        args.push(format!("{}@{}", opts.user_for(node), node.public_ip()));
        args.push(remote_command_line(node, &privileged(command, opts), opts)?);
        Ok(args)
    }

    fn scp_args(&self, node: &Node, local: &Path, remote: &Path, opts: &RunOptions) -> Vec<String> {
        let mut args = vec!["-r".to_string(), "-p".to_string()];
        args.extend(self.common_options(node));
        args.push(local.to_string_lossy().into_owned());
        args.push(format!(
            "{}@{}:{}",
            opts.user_for(node),
            scp_host(node.public_ip()),
            remote.display()
        ));
        args
    }
}

fn scp_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}

/// The single string the remote shell receives.
fn remote_command_line(
    node: &Node,
    command: &RemoteCommand,
    opts: &RunOptions,
) -> Result<String, TransportError> {
    let invalid = |e: shlex::QuoteError| TransportError::InvalidCommand {
        node: node.to_string(),
        detail: e.to_string(),
    };

    let body = match command {
        RemoteCommand::Shell(script) => script.clone(),
        RemoteCommand::Argv(args) => {
            shlex::try_join(args.iter().map(String::as_str)).map_err(invalid)?
        }
    };

    if opts.env.is_empty() {
        return Ok(body);
    }

    let mut assignments = Vec::with_capacity(opts.env.len());
    for (key, value) in &opts.env {
        let value = shlex::try_quote(value).map_err(invalid)?;
        assignments.push(format!("{key}={value}"));
    }
    Ok(format!("export {}; {body}", assignments.join(" ")))
}

fn is_connection_failure(output: &CommandOutput) -> bool {
    output.exit_code == SSH_ERROR_EXIT_CODE
        && SSH_CLIENT_ERRORS
            .iter()
            .any(|fragment| output.stderr.contains(fragment))
}

#[async_trait]
impl Transport for Ssh {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    async fn run(
        &self,
        node: &Node,
        command: &RemoteCommand,
        opts: &RunOptions,
    ) -> Result<CommandOutput, TransportError> {
        let args = self.ssh_args(node, command, opts)?;
        debug!(node = %node, command = %command, "Running command over ssh");

        let mut cmd = Command::new("ssh");
        cmd.args(&args);
        let output = run_client(cmd, "ssh", node, &command.to_string(), &self.sink, opts).await?;

        if is_connection_failure(&output) {
            return Err(TransportError::Unreachable {
                node: node.to_string(),
                transport: TransportKind::Ssh,
                detail: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn copy(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        opts: &RunOptions,
    ) -> Result<(), TransportError> {
        let copy_error = |detail: String| TransportError::Copy {
            node: node.to_string(),
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
            detail,
        };

        if let Some(mkdir) = mkdir_parent(remote) {
            let created = self.run(node, &mkdir, opts).await?;
            if !created.success() {
                return Err(copy_error(created.stderr.trim().to_string()));
            }
        }

        // scp cannot escalate, so privileged copies land in a staging path
        // owned by the login user first.
        let staging = opts
            .sudo
            .then(|| PathBuf::from(format!("/tmp/dcos-e2e-{}", Uuid::new_v4().simple())));
        let target = staging.as_deref().unwrap_or(remote);

        debug!(node = %node, local = %local.display(), remote = %remote.display(), "Copying over scp");
        let mut cmd = Command::new("scp");
        cmd.args(self.scp_args(node, local, target, opts));
        let capture = RunOptions {
            output: OutputPolicy::Capture,
            ..opts.clone()
        };
        let output = run_client(cmd, "scp", node, "scp", &self.sink, &capture).await?;
        if !output.success() {
            return Err(copy_error(output.stderr.trim().to_string()));
        }

        if let Some(staging) = staging {
            let staging = staging.to_string_lossy().into_owned();
            let remote = remote.to_string_lossy().into_owned();
            let place = RemoteCommand::Argv(vec![
                "cp".to_string(),
                "-rp".to_string(),
                staging.clone(),
                remote,
            ]);
            let placed = self.run(node, &place, &capture).await?;
            let cleanup = RemoteCommand::Argv(vec!["rm".to_string(), "-rf".to_string(), staging]);
            self.run(node, &cleanup, &capture).await?;
            if !placed.success() {
                return Err(copy_error(placed.stderr.trim().to_string()));
            }
        }
        Ok(())
    }
}
