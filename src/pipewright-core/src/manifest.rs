use crate::models::{PluginDescriptor, PluginSpec, StepsFile};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The host manifest: every plugin the host may launch, with the
/// executable to launch it from.
///
/// Plugin discovery and installation are out of scope, so the manifest
/// names each executable path explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub plugins: Vec<ManifestEntry>,
}

/// One manifest row: descriptor fields plus launch information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub repo_url: String,
    pub version: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub plugin: PluginSpec,
}

impl ManifestEntry {
    /// The descriptor passed by value into contract calls.
    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            id: self.id.clone(),
            repo_url: self.repo_url.clone(),
            version: self.version.clone(),
            plugin: self.plugin.clone(),
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Manifest =
            serde_yaml::from_str(&contents).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(manifest)
    }

    pub fn find(&self, plugin_id: &str) -> Result<&ManifestEntry, ManifestError> {
        self.plugins
            .iter()
            .find(|entry| entry.id == plugin_id)
            .ok_or_else(|| ManifestError::UnknownPlugin {
                id: plugin_id.to_owned(),
            })
    }
}

/// Load a steps file (YAML) from disk.
pub fn load_steps_file(path: &Path) -> Result<StepsFile, ManifestError> {
    let contents = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("no plugin with id '{id}' in manifest")]
    UnknownPlugin { id: String },
}
