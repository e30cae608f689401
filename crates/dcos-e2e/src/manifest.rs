//! Install manifest assembly.
//!
//! The manifest is the `config.yaml` handed to the DC/OS installer. It is
//! assembled by layering, lowest precedence first:
//!
//! 1. backend defaults
//! 2. values derived from the cluster topology
//! 3. variant-specific generated defaults (Enterprise superuser, ...)
//! 4. user `extra_config`
//! 5. explicit options (`security_mode`, license key)

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::node::Role;
use crate::variant::Variant;

/// Directory on each node where the installer reads its inputs.
pub const GENCONF_DIR: &str = "/genconf";

/// Default superuser for Enterprise clusters.
pub const DEFAULT_SUPERUSER_USERNAME: &str = "admin";

/// SHA-512 crypt hash of the default superuser password (`admin`).
///
/// Precomputed with a fixed salt so that assembly stays deterministic.
pub const DEFAULT_SUPERUSER_PASSWORD_HASH: &str = "$6$dcose2e$mDRlWIfCRZr9zi1PyDlauZX1C7ZMrFGduH25jueikvAVQUuTzZHOXFe78kTmujaJCMAtQSjSbPKnVP5jzc3yw0";

/// A string-keyed install configuration mapping.
///
/// Keys are kept sorted so that serialization is byte-for-byte stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<String, Value>);

impl Manifest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML mapping. An empty document is an empty manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the content is not YAML or not a mapping
    /// with string keys.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|_| Error::config(format!("\"{content}\" is not valid YAML")))?;
        match value {
            Value::Null => Ok(Self::new()),
            Value::Mapping(_) => serde_yaml::from_value(value).map_err(|_| {
                Error::config(format!("\"{content}\" is not a valid DC/OS configuration"))
            }),
            _ => Err(Error::config(format!(
                "\"{content}\" is not a valid DC/OS configuration"
            ))),
        }
    }

    /// Read and parse a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a mapping.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml_str(&content)
    }

    /// Serialize to the installer's native format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value cannot be represented as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.0)
            .map_err(|e| Error::config(format!("Failed to serialize manifest: {e}")))
    }

    /// Set a key, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Overlay another manifest; its keys win.
    pub fn merge(&mut self, other: &Manifest) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Enterprise security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Disabled,
    Permissive,
    Strict,
}

impl SecurityMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Permissive => "permissive",
            Self::Strict => "strict",
        }
    }
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "permissive" => Ok(Self::Permissive),
            "strict" => Ok(Self::Strict),
            _ => Err(Error::config(format!(
                "Unknown security mode: {s}. Supported: disabled, permissive, strict"
            ))),
        }
    }
}

/// Where the installer expects the ip-detect script on each node.
#[must_use]
pub fn remote_ip_detect_path(ip_detect_script: &Path) -> PathBuf {
    let name = ip_detect_script
        .file_name()
        .map_or_else(|| "ip-detect".into(), |n| n.to_string_lossy().into_owned());
    Path::new(GENCONF_DIR).join(name)
}

/// Inputs to [`build_config`].
#[derive(Debug, Clone, Copy)]
pub struct ConfigInputs<'a> {
    /// Backend-provided defaults.
    pub backend_defaults: &'a Manifest,
    /// Topology at the time of the call.
    pub cluster: &'a Cluster,
    /// Local ip-detect script supplied by the backend.
    pub ip_detect_script: &'a Path,
    /// User configuration, already layered (base file, then overrides).
    pub extra_config: Option<&'a Manifest>,
    pub variant: Variant,
    pub security_mode: Option<SecurityMode>,
    /// License key contents. Ignored for OSS.
    pub license_key: Option<&'a str>,
}

fn address_list(cluster: &Cluster, role: Role) -> Value {
    Value::Sequence(
        cluster
            .nodes(role)
            .iter()
            .map(|node| Value::String(node.private_ip().to_string()))
            .collect(),
    )
}

/// Assemble the install manifest.
///
/// This is a pure function of its inputs: identical inputs produce identical
/// manifests. Node address lists are read from `cluster` at call time, so
/// build the manifest immediately before installing.
#[must_use]
pub fn build_config(inputs: &ConfigInputs<'_>) -> Manifest {
    let mut manifest = inputs.backend_defaults.clone();

    manifest.insert("master_list", address_list(inputs.cluster, Role::Master));
    manifest.insert("agent_list", address_list(inputs.cluster, Role::Agent));
    manifest.insert(
        "public_agent_list",
        address_list(inputs.cluster, Role::PublicAgent),
    );
    manifest.insert(
        "ip_detect_filename",
        remote_ip_detect_path(inputs.ip_detect_script)
            .to_string_lossy()
            .into_owned(),
    );

    if inputs.variant == Variant::Enterprise {
        manifest.insert("superuser_username", DEFAULT_SUPERUSER_USERNAME);
        manifest.insert("superuser_password_hash", DEFAULT_SUPERUSER_PASSWORD_HASH);
        manifest.insert("fault_domain_enabled", false);
    }

    if let Some(extra) = inputs.extra_config {
        manifest.merge(extra);
    }

    if let Some(mode) = inputs.security_mode {
        manifest.insert("security", mode.as_str());
    }

    if inputs.variant == Variant::Enterprise {
        if let Some(key) = inputs.license_key {
            manifest.insert("license_key_contents", key);
        }
    }

    manifest
}
