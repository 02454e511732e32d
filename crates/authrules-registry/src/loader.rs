//! YAML rule manifests
//!
//! A manifest file holds one rule or a list of rules:
//!
//! ```yaml
//! name: add-roles
//! order: 2
//! enabled: true
//! script_file: add-roles.lua
//! ```
use crate::registry::RuleRegistry;
use crate::RegistryError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleManifest {
    pub name: String,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub script: Option<String>,
    /// Path relative to the manifest's directory.
    #[serde(default)]
    pub script_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Many(Vec<RuleManifest>),
    One(RuleManifest),
}

impl RuleManifest {
    fn resolve_script(&self, base: &Path) -> Result<String, RegistryError> {
        match (&self.script, &self.script_file) {
            (Some(script), None) => Ok(script.clone()),
            (None, Some(file)) => {
                let path = base.join(file);
                fs::read_to_string(&path).map_err(|e| RegistryError::Load {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
            (Some(_), Some(_)) => Err(RegistryError::Validation(format!(
                "rule '{}' sets both script and script_file",
                self.name
            ))),
            (None, None) => Err(RegistryError::Validation(format!(
                "rule '{}' has no script",
                self.name
            ))),
        }
    }
}

pub fn parse_manifests(yaml: &str, origin: &Path) -> Result<Vec<RuleManifest>, RegistryError> {
    let parsed: ManifestFile = serde_yaml::from_str(yaml).map_err(|e| RegistryError::Load {
        path: origin.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(match parsed {
        ManifestFile::Many(list) => list,
        ManifestFile::One(one) => vec![one],
    })
}

impl RuleRegistry {
    /// Loads every `*.yaml` / `*.yml` manifest in `dir`, in file-name order.
    /// Returns the number of rules created.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize, RegistryError> {
        let dir = dir.as_ref();
        let load_err = |e: std::io::Error| RegistryError::Load {
            path: dir.display().to_string(),
            reason: e.to_string(),
        };

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(load_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();

        let mut created = 0;
        for file in files {
            let yaml = fs::read_to_string(&file).map_err(|e| RegistryError::Load {
                path: file.display().to_string(),
                reason: e.to_string(),
            })?;
            let base = file.parent().unwrap_or(dir);
            for manifest in parse_manifests(&yaml, &file)? {
                let script = manifest.resolve_script(base)?;
                self.create(manifest.name, script, manifest.order, manifest.enabled)?;
                created += 1;
            }
        }

        tracing::info!(dir = %dir.display(), rules = created, "loaded rule manifests");
        Ok(created)
    }
}
