//! Native exec transport for container nodes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::exec::run_client;
use super::{
    mkdir_parent, privileged, CommandOutput, OutputPolicy, OutputSink, RemoteCommand, RunOptions,
    Transport, TransportError, TransportKind,
};
use crate::node::Node;

/// Messages the docker client prints when the container, not the command,
/// may be the problem. A remote command can print them too, so a match is
/// confirmed with `docker inspect` before the node is declared unreachable.
const DAEMON_FAILURE_MARKERS: [&str; 3] = [
    "Error response from daemon",
    "Cannot connect to the Docker daemon",
    "No such container",
];

/// Runs commands with `docker exec` and copies with `docker cp`.
#[derive(Clone)]
pub struct DockerExec {
    sink: Arc<dyn OutputSink>,
    program: String,
}

impl DockerExec {
    #[must_use]
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            program: "docker".to_string(),
        }
    }

    /// Use another `docker` executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Whether `target` exists and is running, as far as the daemon says.
    async fn container_running(&self, node: &Node, target: &str, opts: &RunOptions) -> bool {
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "inspect",
            "--type",
            "container",
            "--format",
            "{{.State.Running}}",
            target,
        ]);
        let capture = RunOptions {
            output: OutputPolicy::Capture,
            ..opts.clone()
        };
        matches!(
            run_client(cmd, &self.program, node, "docker inspect", &self.sink, &capture).await,
            Ok(output) if output.success() && output.stdout.trim() == "true"
        )
    }
}

fn container<'a>(node: &'a Node) -> Result<&'a str, TransportError> {
    node.exec_target()
        .ok_or_else(|| TransportError::Unreachable {
            node: node.to_string(),
            transport: TransportKind::DockerExec,
            detail: "node has no container to exec into".to_string(),
        })
}

fn exec_args(target: &str, node: &Node, command: &RemoteCommand, opts: &RunOptions) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if opts.tty {
        args.push("--tty".to_string());
    }
    args.push("--user".to_string());
    args.push(opts.user_for(node).to_string());
    for (key, value) in &opts.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(target.to_string());
    match command {
        RemoteCommand::Shell(script) => {
            args.extend(["/bin/sh".to_string(), "-c".to_string(), script.clone()]);
        }
        RemoteCommand::Argv(argv) => args.extend(argv.iter().cloned()),
    }
    args
}

fn is_daemon_failure(output: &CommandOutput) -> bool {
    !output.success()
        && DAEMON_FAILURE_MARKERS
            .iter()
            .any(|marker| output.stderr.contains(marker))
}

#[async_trait]
impl Transport for DockerExec {
    fn kind(&self) -> TransportKind {
        TransportKind::DockerExec
    }

    async fn run(
        &self,
        node: &Node,
        command: &RemoteCommand,
        opts: &RunOptions,
    ) -> Result<CommandOutput, TransportError> {
        let target = container(node)?;
        debug!(node = %node, container = %target, command = %command, "Running command with docker exec");

        let mut cmd = Command::new(&self.program);
        cmd.args(exec_args(target, node, &privileged(command, opts), opts));
        let output =
            run_client(cmd, &self.program, node, &command.to_string(), &self.sink, opts).await?;

        if is_daemon_failure(&output) && !self.container_running(node, target, opts).await {
            return Err(TransportError::Unreachable {
                node: node.to_string(),
                transport: TransportKind::DockerExec,
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
        let target = container(node)?;
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

        debug!(node = %node, local = %local.display(), remote = %remote.display(), "Copying with docker cp");
        let mut cmd = Command::new(&self.program);
        cmd.arg("cp")
            .arg(local)
            .arg(format!("{target}:{}", remote.display()));
        let capture = RunOptions {
            output: OutputPolicy::Capture,
            ..opts.clone()
        };
        let output = run_client(cmd, &self.program, node, "docker cp", &self.sink, &capture).await?;
        if !output.success() {
            return Err(copy_error(output.stderr.trim().to_string()));
        }
        Ok(())
    }
}
