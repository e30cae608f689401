//! Cluster identity and topology.
//!
//! A [`ClusterHandle`] is the live binding between a cluster id and the
//! backend resources provisioned for it. It is only ever built by a backend
//! (provision or attach) and is immutable afterwards; [`Cluster`] is the
//! role-grouped snapshot of its nodes.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ProvisionError, Result};
use crate::node::{Node, Role};

static CLUSTER_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("cluster id pattern is valid")
});

/// Identifier under which a cluster's resources are tagged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
    /// Validate and wrap a cluster id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidClusterId`] if the id is empty or contains
    /// characters outside `[a-zA-Z0-9_.-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if CLUSTER_ID_PATTERN.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(Error::InvalidClusterId(id))
        }
    }

    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ClusterId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ClusterId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ClusterId> for String {
    fn from(id: ClusterId) -> Self {
        id.0
    }
}

/// Number of nodes to provision per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub masters: u32,
    pub agents: u32,
    pub public_agents: u32,
}

impl Default for RoleCounts {
    fn default() -> Self {
        Self {
            masters: 1,
            agents: 1,
            public_agents: 1,
        }
    }
}

impl RoleCounts {
    #[must_use]
    pub fn new(masters: u32, agents: u32, public_agents: u32) -> Self {
        Self {
            masters,
            agents,
            public_agents,
        }
    }

    /// Count for a single role.
    #[must_use]
    pub fn count(&self, role: Role) -> u32 {
        match role {
            Role::Master => self.masters,
            Role::Agent => self.agents,
            Role::PublicAgent => self.public_agents,
        }
    }

    /// Number of nodes across all roles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the sum does not fit in a `u32`.
    pub fn total(&self) -> Result<u32> {
        self.masters
            .checked_add(self.agents)
            .and_then(|sum| sum.checked_add(self.public_agents))
            .ok_or_else(|| {
                Error::config(format!(
                    "Too many nodes requested: {} masters, {} agents, {} public agents",
                    self.masters, self.agents, self.public_agents
                ))
            })
    }

    /// Reject topologies that cannot form a cluster.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisionError`] when there is no master.
    pub fn validate(&self, cluster_id: &ClusterId) -> std::result::Result<(), ProvisionError> {
        if self.masters == 0 {
            return Err(ProvisionError::before_create(
                cluster_id.as_str(),
                "a cluster needs at least one master",
            ));
        }
        Ok(())
    }
}

/// Role-grouped snapshot of a cluster's nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    masters: BTreeSet<Node>,
    agents: BTreeSet<Node>,
    public_agents: BTreeSet<Node>,
}

impl Cluster {
    /// Build a cluster view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if there are no masters or a node
    /// address appears in more than one role.
    pub fn new(
        masters: BTreeSet<Node>,
        agents: BTreeSet<Node>,
        public_agents: BTreeSet<Node>,
    ) -> Result<Self> {
        if masters.is_empty() {
            return Err(Error::InvalidTopology("cluster has no masters".into()));
        }
        let shared = masters
            .intersection(&agents)
            .chain(masters.intersection(&public_agents))
            .chain(agents.intersection(&public_agents))
            .next();
        if let Some(node) = shared {
            return Err(Error::InvalidTopology(format!(
                "node {node} belongs to more than one role"
            )));
        }
        Ok(Self {
            masters,
            agents,
            public_agents,
        })
    }

    #[must_use]
    pub fn masters(&self) -> &BTreeSet<Node> {
        &self.masters
    }

    #[must_use]
    pub fn agents(&self) -> &BTreeSet<Node> {
        &self.agents
    }

    #[must_use]
    pub fn public_agents(&self) -> &BTreeSet<Node> {
        &self.public_agents
    }

    /// Nodes of a single role.
    #[must_use]
    pub fn nodes(&self, role: Role) -> &BTreeSet<Node> {
        match role {
            Role::Master => &self.masters,
            Role::Agent => &self.agents,
            Role::PublicAgent => &self.public_agents,
        }
    }

    /// All nodes, masters first.
    pub fn all_nodes(&self) -> impl Iterator<Item = (Role, &Node)> {
        Role::INSTALL_ORDER
            .into_iter()
            .flat_map(move |role| self.nodes(role).iter().map(move |node| (role, node)))
    }

    /// Total number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masters.len() + self.agents.len() + self.public_agents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One backend resource and the node it represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    /// Backend display name (container or VM name).
    pub name: String,
    pub role: Role,
    /// Position within the role, ordered by display name with numeric
    /// suffixes compared as numbers.
    pub index: usize,
    pub node: Node,
}

impl NodeEntry {
    /// Symbolic reference in the `<role>_<index>` form.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}_{}", self.role, self.index)
    }
}

/// Orders names by their numeric suffix, so `agent-2` sorts before `agent-10`.
fn name_key(name: &str) -> (&str, Option<u64>, &str) {
    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    (stem, name[stem.len()..].parse().ok(), name)
}

/// Live binding between a cluster id and its provisioned resources.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    cluster_id: ClusterId,
    backend: &'static str,
    entries: Vec<NodeEntry>,
    cluster: Cluster,
}

impl ClusterHandle {
    /// Build a handle from a backend's resource map.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the resources do not form a valid
    /// cluster (no masters, or two resources share an address).
    pub fn new(
        cluster_id: ClusterId,
        backend: &'static str,
        resources: impl IntoIterator<Item = (String, Role, Node)>,
    ) -> Result<Self> {
        let mut resources: Vec<(String, Role, Node)> = resources.into_iter().collect();
        resources.sort_by(|a, b| (a.1, name_key(&a.0)).cmp(&(b.1, name_key(&b.0))));

        let mut entries = Vec::with_capacity(resources.len());
        let mut sets: [BTreeSet<Node>; 3] = Default::default();
        for (name, role, node) in resources {
            let slot = match role {
                Role::Master => 0,
                Role::Agent => 1,
                Role::PublicAgent => 2,
            };
            let index = sets[slot].len();
            if !sets[slot].insert(node.clone()) {
                return Err(Error::InvalidTopology(format!(
                    "{name} shares address {node} with another {role}"
                )));
            }
            entries.push(NodeEntry {
                name,
                role,
                index,
                node,
            });
        }

        let [masters, agents, public_agents] = sets;
        let cluster = Cluster::new(masters, agents, public_agents)?;
        Ok(Self {
            cluster_id,
            backend,
            entries,
            cluster,
        })
    }

    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    /// Name of the backend that owns the resources.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    #[must_use]
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Resources ordered by role, then display name.
    #[must_use]
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    /// Serializable inspection view.
    #[must_use]
    pub fn inspect(&self) -> ClusterInspect {
        let view = |role: Role| {
            self.entries
                .iter()
                .filter(|entry| entry.role == role)
                .map(NodeInspect::from)
                .collect()
        };
        ClusterInspect {
            cluster_id: self.cluster_id.to_string(),
            backend: self.backend.to_string(),
            masters: view(Role::Master),
            agents: view(Role::Agent),
            public_agents: view(Role::PublicAgent),
        }
    }
}

/// Inspection view of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInspect {
    pub cluster_id: String,
    pub backend: String,
    pub masters: Vec<NodeInspect>,
    pub agents: Vec<NodeInspect>,
    pub public_agents: Vec<NodeInspect>,
}

/// Inspection view of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInspect {
    pub name: String,
    pub reference: String,
    pub public_ip: IpAddr,
    pub private_ip: IpAddr,
    pub default_user: String,
    pub ssh_key_path: Option<PathBuf>,
}

impl From<&NodeEntry> for NodeInspect {
    fn from(entry: &NodeEntry) -> Self {
        Self {
            name: entry.name.clone(),
            reference: entry.reference(),
            public_ip: entry.node.public_ip(),
            private_ip: entry.node.private_ip(),
            default_user: entry.node.default_user().to_string(),
            ssh_key_path: entry.node.ssh_key_path().map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(last: u8) -> Node {
        let ip: IpAddr = format!("172.17.0.{last}").parse().unwrap();
        Node::new(ip, ip, "root")
    }

    #[test]
    fn test_cluster_id_validation() {
        assert!(ClusterId::new("default").is_ok());
        assert!(ClusterId::new("a.b-c_1").is_ok());
        for invalid in ["", "@", "-leading", "has space"] {
            let err = ClusterId::new(invalid).unwrap_err();
            assert!(err.to_string().contains(&format!("\"{invalid}\"")));
        }
    }

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = ClusterId::generate();
        let b = ClusterId::generate();
        assert_ne!(a, b);
        assert!(ClusterId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_cluster_id_deserialize_validates() {
        let ok: ClusterId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<ClusterId>("\"@\"").is_err());
    }

    #[test]
    fn test_role_counts_require_master() {
        let id = ClusterId::new("c").unwrap();
        assert!(RoleCounts::new(0, 2, 0).validate(&id).is_err());
        assert!(RoleCounts::new(1, 0, 0).validate(&id).is_ok());
        assert_eq!(RoleCounts::default().total().unwrap(), 3);
    }

    #[test]
    fn test_role_counts_total_overflow_is_an_error() {
        let err = RoleCounts::new(u32::MAX, 1, 0).total().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(RoleCounts::new(1, u32::MAX - 1, 1).total().is_err());
        assert_eq!(RoleCounts::new(1, u32::MAX - 1, 0).total().unwrap(), u32::MAX);
    }

    #[test]
    fn test_handle_assigns_indexes_by_name_within_role() {
        let handle = ClusterHandle::new(
            ClusterId::new("c").unwrap(),
            "test",
            vec![
                ("c-agent-1".to_string(), Role::Agent, node(4)),
                ("c-master-0".to_string(), Role::Master, node(2)),
                ("c-agent-0".to_string(), Role::Agent, node(3)),
            ],
        )
        .unwrap();

        let refs: Vec<_> = handle
            .entries()
            .iter()
            .map(|e| (e.name.as_str(), e.reference()))
            .collect();
        assert_eq!(
            refs,
            vec![
                ("c-master-0", "master_0".to_string()),
                ("c-agent-0", "agent_0".to_string()),
                ("c-agent-1", "agent_1".to_string()),
            ]
        );
        assert_eq!(handle.cluster().len(), 3);
    }

    #[test]
    fn test_handle_indexes_follow_numeric_suffix() {
        let mut resources = vec![("c-master-0".to_string(), Role::Master, node(2))];
        for index in (0..12u8).rev() {
            resources.push((format!("c-agent-{index}"), Role::Agent, node(10 + index)));
        }
        let handle = ClusterHandle::new(ClusterId::new("c").unwrap(), "test", resources).unwrap();

        let name_of = |reference: &str| {
            handle
                .entries()
                .iter()
                .find(|e| e.reference() == reference)
                .map(|e| e.name.clone())
                .unwrap()
        };
        assert_eq!(name_of("agent_2"), "c-agent-2");
        assert_eq!(name_of("agent_10"), "c-agent-10");
        assert_eq!(name_of("agent_11"), "c-agent-11");
    }

    #[test]
    fn test_handle_rejects_missing_masters_and_shared_addresses() {
        let id = ClusterId::new("c").unwrap();
        let no_master = ClusterHandle::new(
            id.clone(),
            "test",
            vec![("a".to_string(), Role::Agent, node(3))],
        );
        assert!(matches!(no_master, Err(Error::InvalidTopology(_))));

        let shared = ClusterHandle::new(
            id,
            "test",
            vec![
                ("m".to_string(), Role::Master, node(2)),
                ("a".to_string(), Role::Agent, node(2)),
            ],
        );
        assert!(matches!(shared, Err(Error::InvalidTopology(_))));
    }

    #[test]
    fn test_inspect_groups_by_role() {
        let handle = ClusterHandle::new(
            ClusterId::new("c").unwrap(),
            "test",
            vec![
                ("m0".to_string(), Role::Master, node(2)),
                ("p0".to_string(), Role::PublicAgent, node(5)),
            ],
        )
        .unwrap();
        let view = handle.inspect();
        assert_eq!(view.masters.len(), 1);
        assert!(view.agents.is_empty());
        assert_eq!(view.public_agents[0].reference, "public_agent_0");
    }
}
