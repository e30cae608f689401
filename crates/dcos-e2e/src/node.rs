//! Node and role model.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A node's function within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Control plane node.
    Master,
    /// Private agent.
    Agent,
    /// Public agent.
    PublicAgent,
}

impl Role {
    /// Bootstrap order: agents must be able to reach configured masters.
    pub const INSTALL_ORDER: [Role; 3] = [Role::Master, Role::Agent, Role::PublicAgent];

    /// Symbolic name used in node references (`master_0`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Agent => "agent",
            Self::PublicAgent => "public_agent",
        }
    }

    /// Role argument understood by the node install script.
    #[must_use]
    pub fn install_script_role(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Agent => "slave",
            Self::PublicAgent => "slave_public",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "agent" => Ok(Self::Agent),
            "public_agent" => Ok(Self::PublicAgent),
            _ => Err(Error::config(format!(
                "Unknown role: {s}. Supported: master, agent, public_agent"
            ))),
        }
    }
}

/// A view over one provisioned machine.
///
/// Nodes do not own a connection. Identity is the address pair only: two
/// nodes are equal iff their public and private addresses match, whatever
/// their default execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    public_ip: IpAddr,
    private_ip: IpAddr,
    default_user: String,
    ssh_key_path: Option<PathBuf>,
    exec_target: Option<String>,
}

impl Node {
    /// Create a node with the given addresses and default OS user.
    #[must_use]
    pub fn new(public_ip: IpAddr, private_ip: IpAddr, default_user: impl Into<String>) -> Self {
        Self {
            public_ip,
            private_ip,
            default_user: default_user.into(),
            ssh_key_path: None,
            exec_target: None,
        }
    }

    /// Set the private key used by the SSH transport.
    #[must_use]
    pub fn with_ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_path = Some(path.into());
        self
    }

    /// Set the backend-native handle used by the native exec transport
    /// (the container name for Docker).
    #[must_use]
    pub fn with_exec_target(mut self, target: impl Into<String>) -> Self {
        self.exec_target = Some(target.into());
        self
    }

    #[must_use]
    pub fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    #[must_use]
    pub fn private_ip(&self) -> IpAddr {
        self.private_ip
    }

    #[must_use]
    pub fn default_user(&self) -> &str {
        &self.default_user
    }

    #[must_use]
    pub fn ssh_key_path(&self) -> Option<&Path> {
        self.ssh_key_path.as_deref()
    }

    #[must_use]
    pub fn exec_target(&self) -> Option<&str> {
        self.exec_target.as_deref()
    }

    fn address_key(&self) -> (IpAddr, IpAddr) {
        (self.public_ip, self.private_ip)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address_key() == other.address_key()
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address_key().hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address_key().cmp(&other.address_key())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.public_ip == self.private_ip {
            write!(f, "{}", self.public_ip)
        } else {
            write!(f, "{} ({})", self.public_ip, self.private_ip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_equality_ignores_execution_context() {
        let a = Node::new(ip("10.0.0.1"), ip("172.17.0.2"), "root").with_ssh_key("/tmp/id_rsa");
        let b = Node::new(ip("10.0.0.1"), ip("172.17.0.2"), "centos").with_exec_target("c1");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_different_private_address_is_different_node() {
        let a = Node::new(ip("10.0.0.1"), ip("172.17.0.2"), "root");
        let b = Node::new(ip("10.0.0.1"), ip("172.17.0.3"), "root");
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_parsing_is_case_insensitive() {
        assert_eq!("MASTER".parse::<Role>().unwrap(), Role::Master);
        assert_eq!("public_agent".parse::<Role>().unwrap(), Role::PublicAgent);
        assert!("worker".parse::<Role>().is_err());
    }

    #[test]
    fn test_install_order_starts_with_masters() {
        assert_eq!(Role::INSTALL_ORDER[0], Role::Master);
        assert_eq!(Role::PublicAgent.install_script_role(), "slave_public");
    }

    #[test]
    fn test_display() {
        let same = Node::new(ip("10.0.0.1"), ip("10.0.0.1"), "root");
        assert_eq!(same.to_string(), "10.0.0.1");
        let split = Node::new(ip("1.2.3.4"), ip("10.0.0.1"), "root");
        assert_eq!(split.to_string(), "1.2.3.4 (10.0.0.1)");
    }
}
