//! Mapping user-supplied node references to nodes.
//!
//! A reference matches a node when it equals the node's public address, its
//! private address, its backend display name, or its `<role>_<index>`
//! reference (compared case-insensitively).

use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::cluster::{ClusterHandle, NodeEntry};
use crate::error::NoSuchNodeError;
use crate::node::Node;

fn matches(entry: &NodeEntry, reference: &str) -> bool {
    if entry.name == reference || entry.reference().eq_ignore_ascii_case(reference) {
        return true;
    }
    reference
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip == entry.node.public_ip() || ip == entry.node.private_ip())
}

/// Find the node a reference points at.
///
/// # Errors
///
/// Returns [`NoSuchNodeError`] naming the reference if nothing matches.
pub fn resolve_node(handle: &ClusterHandle, reference: &str) -> Result<Node, NoSuchNodeError> {
    handle
        .entries()
        .iter()
        .find(|entry| matches(entry, reference))
        .map(|entry| entry.node.clone())
        .ok_or_else(|| NoSuchNodeError {
            cluster_id: handle.cluster_id().to_string(),
            reference: reference.to_string(),
        })
}

/// Resolve several references; fails on the first one that matches nothing.
///
/// # Errors
///
/// Returns [`NoSuchNodeError`] for the first unmatched reference.
pub fn resolve_nodes<'a>(
    handle: &ClusterHandle,
    references: impl IntoIterator<Item = &'a str>,
) -> Result<BTreeSet<Node>, NoSuchNodeError> {
    references
        .into_iter()
        .map(|reference| resolve_node(handle, reference))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterId;
    use crate::node::Role;

    fn handle() -> ClusterHandle {
        let m0 = Node::new(
            "10.0.0.1".parse().unwrap(),
            "172.17.0.2".parse().unwrap(),
            "root",
        );
        let a0 = Node::new(
            "10.0.0.2".parse().unwrap(),
            "172.17.0.3".parse().unwrap(),
            "root",
        );
        let p0 = Node::new(
            "10.0.0.3".parse().unwrap(),
            "172.17.0.4".parse().unwrap(),
            "root",
        );
        ClusterHandle::new(
            ClusterId::new("resolve").unwrap(),
            "test",
            vec![
                ("dcos-e2e-resolve-master-0".to_string(), Role::Master, m0),
                ("dcos-e2e-resolve-agent-0".to_string(), Role::Agent, a0),
                ("dcos-e2e-resolve-public_agent-0".to_string(), Role::PublicAgent, p0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_every_reference_form_resolves() {
        let handle = handle();
        let agent = handle.cluster().agents().iter().next().unwrap().clone();

        for reference in [
            "10.0.0.2",
            "172.17.0.3",
            "dcos-e2e-resolve-agent-0",
            "agent_0",
            "AGENT_0",
            "Agent_0",
        ] {
            assert_eq!(resolve_node(&handle, reference).unwrap(), agent, "{reference}");
        }
    }

    #[test]
    fn test_public_agent_reference() {
        let handle = handle();
        let node = resolve_node(&handle, "public_agent_0").unwrap();
        assert_eq!(node.public_ip().to_string(), "10.0.0.3");
    }

    #[test]
    fn test_unknown_reference_is_typed_error() {
        let handle = handle();
        for reference in ["agent_1", "10.0.0.9", "", "DCOS-E2E-RESOLVE-AGENT-0", "master"] {
            let err = resolve_node(&handle, reference).unwrap_err();
            assert_eq!(err.reference, reference);
            assert_eq!(err.cluster_id, "resolve");
        }
    }

    #[test]
    fn test_resolve_many_deduplicates() {
        let handle = handle();
        let nodes = resolve_nodes(&handle, ["master_0", "10.0.0.1", "agent_0"]).unwrap();
        assert_eq!(nodes.len(), 2);

        let err = resolve_nodes(&handle, ["master_0", "nope"]).unwrap_err();
        assert_eq!(err.reference, "nope");
    }
}
