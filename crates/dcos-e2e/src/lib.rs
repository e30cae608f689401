//! Lifecycle orchestration for short-lived DC/OS test clusters.
//!
//! This crate models a cluster as a set of addressable nodes spread across
//! interchangeable infrastructure backends (Docker containers, Vagrant VMs),
//! runs commands and copies files onto those nodes through a transport, and
//! drives a freshly provisioned cluster to a verified-healthy installation.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use dcos_e2e::backend::{Backend, Docker, DockerConfig};
//! use dcos_e2e::lifecycle::{ClusterLifecycle, InstallRequest, LifecycleSettings};
//! use dcos_e2e::transport::{transport_for, TracingSink};
//! use dcos_e2e::{ClusterId, RoleCounts};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend: Arc<dyn Backend> = Arc::new(Docker::new(DockerConfig::default())?);
//!     let transport = transport_for(backend.default_transport(), Arc::new(TracingSink));
//!     let mut lifecycle = ClusterLifecycle::new(backend, transport, LifecycleSettings::default());
//!
//!     lifecycle.provision(ClusterId::generate(), RoleCounts::default()).await?;
//!     lifecycle.install(&InstallRequest::new("/tmp/dcos_generate_config.sh"), None).await?;
//!     lifecycle.wait_until_ready(None).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

pub mod backend;
pub mod cluster;
pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod node;
pub mod resolve;
pub mod transport;
pub mod variant;

mod tool;

pub use cluster::{Cluster, ClusterHandle, ClusterId, NodeEntry, RoleCounts};
pub use error::{Error, NoSuchNodeError, NotFoundError, ProvisionError, Result, ToolError};
pub use manifest::{build_config, ConfigInputs, Manifest, SecurityMode};
pub use node::{Node, Role};
pub use resolve::{resolve_node, resolve_nodes};
pub use variant::{InstallerDetails, Variant, VariantChoice, VariantDetectionError};
