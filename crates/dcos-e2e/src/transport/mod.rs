//! Command execution and file copy onto nodes.
//!
//! Two mechanisms implement the same [`Transport`] contract:
//!
//! - [`Ssh`]: a remote shell over the node's public address.
//! - [`DockerExec`]: `docker exec` into the node's container.
//!
//! A non-zero remote exit code is returned as data in [`CommandOutput`];
//! only failures of the channel itself are a [`TransportError`].

mod docker_exec;
mod exec;
mod ssh;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::node::Node;

pub use docker_exec::DockerExec;
pub use ssh::Ssh;

/// Which mechanism reaches a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Remote shell over the network.
    Ssh,
    /// Backend-native process exec (`docker exec`).
    DockerExec,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::DockerExec => "docker-exec",
        }
    }

    /// Whether commands sent this way imply the node is routable from here.
    #[must_use]
    pub fn implies_routability(self) -> bool {
        matches!(self, Self::Ssh)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "docker-exec" | "docker_exec" => Ok(Self::DockerExec),
            _ => Err(crate::Error::config(format!(
                "Unknown transport: {s}. Supported: ssh, docker-exec"
            ))),
        }
    }
}

/// A command to run on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Interpreted by a shell on the node.
    Shell(String),
    /// Argument vector; never passed through a local shell, and quoted
    /// word by word when the transport needs a remote shell.
    Argv(Vec<String>),
}

impl RemoteCommand {
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::Shell(script.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(args.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(script) => f.write_str(script),
            Self::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

/// What to do with remote output while the command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputPolicy {
    /// Capture only.
    #[default]
    Capture,
    /// Stream each line to the [`OutputSink`] and capture it.
    LogAndCapture,
}

/// Output stream of a remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// OS user on the node. Defaults to the node's default user.
    pub user: Option<String>,
    /// Run with `sudo`, for login users that are not root.
    pub sudo: bool,
    /// Extra environment variables for the command.
    pub env: BTreeMap<String, String>,
    pub output: OutputPolicy,
    /// Allocate a terminal.
    pub tty: bool,
    /// Per-call limit.
    pub timeout: Option<Duration>,
    /// Caller-wide deadline; whichever of this and `timeout` ends first wins.
    pub deadline: Option<Instant>,
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn log_and_capture(mut self) -> Self {
        self.output = OutputPolicy::LogAndCapture;
        self
    }

    #[must_use]
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// The user commands run as on `node`.
    #[must_use]
    pub fn user_for<'a>(&'a self, node: &'a Node) -> &'a str {
        self.user.as_deref().unwrap_or_else(|| node.default_user())
    }

    /// Earliest of the per-call timeout and the caller deadline.
    #[must_use]
    pub fn effective_deadline(&self, started: Instant) -> Option<Instant> {
        let from_timeout = self.timeout.map(|t| started + t);
        match (from_timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Remote exit code; `-1` if the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Receives remote output lines under [`OutputPolicy::LogAndCapture`].
pub trait OutputSink: Send + Sync {
    fn line(&self, node: &Node, stream: Stream, line: &str);
}

/// Sink that emits each line as a tracing event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, node: &Node, stream: Stream, line: &str) {
        info!(node = %node, stream = %stream, "{line}");
    }
}

/// Failure of the execution channel, distinct from a remote non-zero exit.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The local client program could not be started.
    #[error("Failed to start `{program}` for node {node}: {source}")]
    Spawn {
        node: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The node could not be reached.
    #[error("Node {node} is unreachable over {transport}: {detail}")]
    Unreachable {
        node: String,
        transport: TransportKind,
        detail: String,
    },

    /// The command did not finish before its deadline.
    #[error("Command on node {node} timed out after {elapsed:?}: {command}")]
    Timeout {
        node: String,
        command: String,
        elapsed: Duration,
    },

    /// A file copy failed.
    #[error("Failed to copy {} to {node}:{}: {detail}", .local.display(), .remote.display())]
    Copy {
        node: String,
        local: PathBuf,
        remote: PathBuf,
        detail: String,
    },

    /// The command cannot be expressed for this transport.
    #[error("Cannot send command to node {node}: {detail}")]
    InvalidCommand { node: String, detail: String },

    /// Reading process output failed.
    #[error("I/O error while running a command on node {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs commands and copies files onto nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Run a command on a node.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the channel fails. A remote non-zero
    /// exit is reported in the returned [`CommandOutput`].
    async fn run(
        &self,
        node: &Node,
        command: &RemoteCommand,
        opts: &RunOptions,
    ) -> Result<CommandOutput, TransportError>;

    /// Recursively copy a local file or directory to `remote` on a node,
    /// creating missing parent directories and preserving file modes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the copy does not complete.
    async fn copy(
        &self,
        node: &Node,
        local: &Path,
        remote: &Path,
        opts: &RunOptions,
    ) -> Result<(), TransportError>;
}

/// Build the transport for a kind.
#[must_use]
pub fn transport_for(kind: TransportKind, sink: Arc<dyn OutputSink>) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Ssh => Arc::new(Ssh::new(sink)),
        TransportKind::DockerExec => Arc::new(DockerExec::new(sink)),
    }
}

/// Wrap a command in `sudo` when the options ask for it.
fn privileged(command: &RemoteCommand, opts: &RunOptions) -> RemoteCommand {
    if !opts.sudo {
        return command.clone();
    }
    let mut argv = vec!["sudo".to_string(), "--preserve-env".to_string()];
    match command {
        RemoteCommand::Shell(script) => {
            argv.extend(["/bin/sh".to_string(), "-c".to_string(), script.clone()]);
        }
        RemoteCommand::Argv(args) => argv.extend(args.iter().cloned()),
    }
    RemoteCommand::Argv(argv)
}

/// `mkdir -p` for the parent of a remote path, as an argument vector.
fn mkdir_parent(remote: &Path) -> Option<RemoteCommand> {
    remote
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .map(|p| {
            RemoteCommand::Argv(vec![
                "mkdir".to_string(),
                "-p".to_string(),
                p.to_string_lossy().into_owned(),
            ])
        })
}
