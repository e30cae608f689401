//! Error types for cluster lifecycle operations.
//!
//! Each failure category of the lifecycle has its own type so callers can
//! match on what went wrong; [`Error`] aggregates them for `?` propagation.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::{InstallError, NotReadyError, Phase};
use crate::transport::TransportError;
use crate::variant::VariantDetectionError;

/// Result type alias for lifecycle operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend could not create the requested topology.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// A cluster id does not exist in the backend.
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    /// The execution channel to a node failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The installer variant could not be determined.
    #[error(transparent)]
    VariantDetection(#[from] VariantDetectionError),

    /// The cluster did not become healthy in time.
    #[error(transparent)]
    NotReady(#[from] NotReadyError),

    /// A node reference did not match any node.
    #[error(transparent)]
    NoSuchNode(#[from] NoSuchNodeError),

    /// One or more nodes of a role failed to install.
    #[error(transparent)]
    Install(#[from] InstallError),

    /// A local helper program exited unsuccessfully.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Cluster id does not match the allowed pattern.
    #[error(
        "Invalid cluster id \"{0}\", only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed and the cluster ID cannot be empty."
    )]
    InvalidClusterId(String),

    /// A `local:remote` path pair is malformed.
    #[error("{0}")]
    InvalidPathPair(String),

    /// A node set violates the cluster invariants.
    #[error("invalid cluster topology: {0}")]
    InvalidTopology(String),

    /// The lifecycle refused a transition from its current phase.
    #[error("cannot {operation} a cluster in phase '{phase}'")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Local filesystem failure.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an I/O error bound to the path being accessed.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Provisioning failed; the backend has attempted to remove every resource
/// it created under the cluster id.
#[derive(Debug, Clone)]
pub struct ProvisionError {
    /// Cluster that was being provisioned.
    pub cluster_id: String,
    /// What went wrong.
    pub reason: String,
    /// Whether the rollback removed all created resources.
    pub rolled_back: bool,
}

impl ProvisionError {
    /// Create a provisioning error for a failure that happened before any
    /// resource was created.
    pub fn before_create(cluster_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            reason: reason.into(),
            rolled_back: true,
        }
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to provision cluster \"{}\": {}",
            self.cluster_id, self.reason
        )?;
        if !self.rolled_back {
            write!(f, " (rollback incomplete, run destroy)")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProvisionError {}

/// No resources exist under a cluster id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cluster \"{cluster_id}\" does not exist")]
pub struct NotFoundError {
    /// The id that was looked up.
    pub cluster_id: String,
}

/// A node reference did not resolve to any node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "No such node in cluster \"{cluster_id}\" with IP address, name or node reference \"{reference}\""
)]
pub struct NoSuchNodeError {
    /// Cluster that was searched.
    pub cluster_id: String,
    /// The unmatched reference.
    pub reference: String,
}

/// A local helper program (`docker`, `vagrant`, `ssh-keygen`) failed.
#[derive(Debug, Clone)]
pub struct ToolError {
    /// Full command line that was run.
    pub command: String,
    /// Exit code, if the process ran at all.
    pub exit_code: Option<i32>,
    /// Captured standard error (or the spawn failure).
    pub stderr: String,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(
                f,
                "`{}` exited with code {code}: {}",
                self.command,
                self.stderr.trim()
            ),
            None => write!(f, "`{}` could not be run: {}", self.command, self.stderr.trim()),
        }
    }
}

impl std::error::Error for ToolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_cluster() {
        let err = Error::from(NotFoundError {
            cluster_id: "abc".into(),
        });
        assert_eq!(err.to_string(), "Cluster \"abc\" does not exist");
    }

    #[test]
    fn test_provision_error_mentions_incomplete_rollback() {
        let err = ProvisionError {
            cluster_id: "c1".into(),
            reason: "docker run failed".into(),
            rolled_back: false,
        };
        let msg = err.to_string();
        assert!(msg.contains("\"c1\""));
        assert!(msg.contains("rollback incomplete"));

        let clean = ProvisionError::before_create("c1", "already exists");
        assert!(!clean.to_string().contains("rollback"));
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError {
            command: "docker ps".into(),
            exit_code: Some(1),
            stderr: "Cannot connect\n".into(),
        };
        assert_eq!(err.to_string(), "`docker ps` exited with code 1: Cannot connect");

        let err = ToolError {
            command: "vagrant up".into(),
            exit_code: None,
            stderr: "No such file or directory".into(),
        };
        assert!(err.to_string().contains("could not be run"));
    }
}
