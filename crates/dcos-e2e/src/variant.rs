//! Installer variant detection.
//!
//! The installer is a self-extracting shell script. Asking it for
//! `--version` unpacks just enough of the bundle to print a small JSON
//! document with the version string and the variant (`"ee"` for
//! Enterprise, `""` for OSS).

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Edition of the platform an installer installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Oss,
    Enterprise,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oss => write!(f, "oss"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// User-facing variant selection. `Auto` means "detect from the installer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantChoice {
    #[default]
    Auto,
    Oss,
    Enterprise,
}

impl std::str::FromStr for VariantChoice {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "oss" => Ok(Self::Oss),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(crate::Error::config(format!(
                "Unknown variant: {s}. Supported: auto, oss, enterprise"
            ))),
        }
    }
}

/// Version and variant reported by an installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerDetails {
    pub version: String,
    pub variant: Variant,
}

/// The installer's metadata could not be determined.
#[derive(Debug, Error)]
pub enum VariantDetectionError {
    /// The scratch directory could not be created.
    #[error("Failed to create a scratch directory in {}: {source}", .workspace_dir.display())]
    Workspace {
        workspace_dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Running the installer failed.
    #[error(
        "Failed to unpack installer {}{}: {stderr}",
        .installer.display(),
        .exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default()
    )]
    Unpack {
        installer: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The installer printed something that is not version metadata.
    #[error("Unable to read version metadata of installer {}: {detail}", .installer.display())]
    Unreadable { installer: PathBuf, detail: String },

    /// The metadata named a variant this library does not know.
    #[error("Installer {} reports unknown variant \"{variant}\"", .installer.display())]
    UnknownVariant { installer: PathBuf, variant: String },
}

#[derive(Debug, Deserialize)]
struct VersionMetadata {
    version: String,
    variant: String,
}

fn is_unpack_noise(line: &str) -> bool {
    line.starts_with("Extracting image") || line.starts_with("Loaded image") || line.contains(".tar")
}

/// Parse the output of `installer --version`.
fn parse_version_output(
    installer: &Path,
    output: &str,
) -> Result<InstallerDetails, VariantDetectionError> {
    let json: String = output
        .lines()
        .filter(|line| !is_unpack_noise(line))
        .collect::<Vec<_>>()
        .join("\n");

    let metadata: VersionMetadata =
        serde_json::from_str(&json).map_err(|e| VariantDetectionError::Unreadable {
            installer: installer.to_path_buf(),
            detail: format!("{e}: {}", json.trim()),
        })?;

    let variant = match metadata.variant.as_str() {
        "ee" => Variant::Enterprise,
        "" => Variant::Oss,
        other => {
            return Err(VariantDetectionError::UnknownVariant {
                installer: installer.to_path_buf(),
                variant: other.to_string(),
            })
        }
    };

    Ok(InstallerDetails {
        version: metadata.version,
        variant,
    })
}

/// Read an installer's version and variant.
///
/// Runs the installer inside a fresh scratch directory under
/// `workspace_dir`. The scratch directory is removed when this returns,
/// whether detection succeeded or not, so concurrent calls never share
/// state.
///
/// # Errors
///
/// Returns [`VariantDetectionError`] if the installer cannot be run, exits
/// non-zero, or prints unreadable metadata.
pub async fn installer_details(
    installer: &Path,
    workspace_dir: &Path,
) -> Result<InstallerDetails, VariantDetectionError> {
    let scratch = tempfile::Builder::new()
        .prefix("dcos-e2e-variant-")
        .tempdir_in(workspace_dir)
        .map_err(|source| VariantDetectionError::Workspace {
            workspace_dir: workspace_dir.to_path_buf(),
            source,
        })?;

    debug!(
        installer = %installer.display(),
        scratch = %scratch.path().display(),
        "Reading installer metadata"
    );

    let output = Command::new("bash")
        .arg(installer)
        .arg("--version")
        .current_dir(scratch.path())
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| VariantDetectionError::Unpack {
            installer: installer.to_path_buf(),
            exit_code: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(VariantDetectionError::Unpack {
            installer: installer.to_path_buf(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let details = parse_version_output(installer, &String::from_utf8_lossy(&output.stdout))?;
    info!(
        installer = %installer.display(),
        version = %details.version,
        variant = %details.variant,
        "Detected installer variant"
    );
    Ok(details)
}

/// Turn a user choice into a concrete variant.
///
/// Explicit choices are returned as-is without touching the installer.
///
/// # Errors
///
/// Returns [`VariantDetectionError`] if `choice` is `Auto` and detection
/// fails.
pub async fn resolve_variant(
    choice: VariantChoice,
    installer: &Path,
    workspace_dir: &Path,
) -> Result<Variant, VariantDetectionError> {
    match choice {
        VariantChoice::Oss => Ok(Variant::Oss),
        VariantChoice::Enterprise => Ok(Variant::Enterprise),
        VariantChoice::Auto => Ok(installer_details(installer, workspace_dir).await?.variant),
    }
}
