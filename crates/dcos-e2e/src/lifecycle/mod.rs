//! Install, upgrade and readiness.
//!
//! - [`state`]: the phases a cluster moves through
//! - [`install`]: per-node install and upgrade steps
//! - [`wait`]: readiness checks and bounded polling
//! - [`orchestrator`]: the state machine tying them to a backend

pub mod install;
pub mod orchestrator;
pub mod state;
pub mod wait;

pub use install::{InstallError, InstallRequest, NodeFailure, PathPair};
pub use orchestrator::{ClusterLifecycle, LifecycleSettings};
pub use state::{FailedStep, Phase};
pub use wait::{
    wait_for_checks, CheckContext, CheckFailure, HttpHealthCheck, NodePoststartCheck,
    NotReadyError, PollPolicy, ReadinessCheck,
};
