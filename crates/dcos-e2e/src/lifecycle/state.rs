//! Lifecycle phases.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::Role;

/// Step that left a cluster in [`Phase::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedStep {
    Install,
    Upgrade,
    Wait,
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Upgrade => write!(f, "upgrade"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

/// Where a cluster is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No machines.
    Unprovisioned,
    /// Machines exist, nothing installed.
    Provisioned,
    /// Install manifest assembled.
    Configured,
    /// Installing (or upgrading) the nodes of one role.
    Installing(Role),
    /// Every role installed.
    Installed,
    /// Polling health checks.
    WaitingReady,
    /// All health checks passed.
    Ready,
    /// A step failed; it can be retried.
    Failed(FailedStep),
}

impl Phase {
    /// The phase that follows on success.
    #[must_use]
    pub fn next(&self) -> Self {
        match self {
            Self::Unprovisioned => Self::Provisioned,
            Self::Provisioned => Self::Configured,
            Self::Configured => Self::Installing(Role::Master),
            Self::Installing(Role::Master) => Self::Installing(Role::Agent),
            Self::Installing(Role::Agent) => Self::Installing(Role::PublicAgent),
            Self::Installing(Role::PublicAgent) => Self::Installed,
            Self::Installed => Self::WaitingReady,
            Self::WaitingReady | Self::Ready => Self::Ready,
            Self::Failed(step) => Self::Failed(*step),
        }
    }

    /// Human-readable description of the phase.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Unprovisioned => "unprovisioned".to_string(),
            Self::Provisioned => "provisioned".to_string(),
            Self::Configured => "configured".to_string(),
            Self::Installing(role) => format!("installing {role} nodes"),
            Self::Installed => "installed".to_string(),
            Self::WaitingReady => "waiting for readiness".to_string(),
            Self::Ready => "ready".to_string(),
            Self::Failed(step) => format!("failed during {step}"),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}
