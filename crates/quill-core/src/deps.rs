//! The root dependency manifest
//!
//! A single JSON document at `<root>/package.json` records which extensions
//! are managed by the runtime: `{"dependencies": {"<id>": "<rangeOrUrl>"}}`.
//! It is the source of truth for global (managed) versus locally discovered
//! extensions, mutated only by install/uninstall, and always rewritten with
//! sorted keys so successive writes are diff-stable.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Managed-extension manifest (`<root>/package.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyManifest {
    /// Extension id to version range or URL pin; BTreeMap keeps keys sorted
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl DependencyManifest {
    /// Load the manifest from the managed root, tolerating a missing file
    /// and trailing commas in a hand-edited one
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("package.json");
        if !path.exists() {
            debug!("No dependency manifest at {:?}, starting empty", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        json5::from_str(&content).map_err(|e| Error::invalid_manifest(&path, e.to_string()))
    }

    /// Write the manifest back to the managed root atomically
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join("package.json");
        std::fs::create_dir_all(root)?;
        let data = serde_json::to_string_pretty(self)?;

        let tmp = tempfile::NamedTempFile::new_in(root)?;
        std::fs::write(tmp.path(), data)?;
        tmp.into_temp_path()
            .persist(&path)
            .map_err(|e| Error::Io(e.error))?;
        debug!(
            "Saved dependency manifest with {} entries",
            self.dependencies.len()
        );
        Ok(())
    }

    /// Record or replace an extension pin
    pub fn add(&mut self, id: &str, pin: &str) {
        self.dependencies.insert(id.to_string(), pin.to_string());
    }

    /// Drop an extension entry; returns whether it was present
    pub fn remove(&mut self, id: &str) -> bool {
        self.dependencies.remove(id).is_some()
    }

    /// Whether the id is managed by this manifest
    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    /// Pin recorded for an id
    pub fn get(&self, id: &str) -> Option<&str> {
        self.dependencies.get(id).map(String::as_str)
    }

    /// All managed ids, in sorted order
    pub fn ids(&self) -> Vec<&str> {
        self.dependencies.keys().map(String::as_str).collect()
    }

    /// Managed ids whose install directory is missing on disk
    pub fn missing(&self, root: &Path) -> Vec<String> {
        self.dependencies
            .keys()
            .filter(|id| !root.join(id).is_dir())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let manifest = DependencyManifest::load(dir.path()).unwrap();
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn test_round_trip_sorted_keys() {
        let dir = TempDir::new().unwrap();
        let mut manifest = DependencyManifest::default();
        manifest.add("zeta-ext", ">=2.0.0");
        manifest.add("alpha-ext", ">=1.0.0");
        manifest.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("package.json")).unwrap();
        let alpha = raw.find("alpha-ext").unwrap();
        let zeta = raw.find("zeta-ext").unwrap();
        assert!(alpha < zeta, "keys must serialize in sorted order");

        let reloaded = DependencyManifest::load(dir.path()).unwrap();
        assert_eq!(reloaded, manifest);
    }

    #[test]
    fn test_remove_and_contains() {
        let mut manifest = DependencyManifest::default();
        manifest.add("demo-ext", ">=1.2.0");
        assert!(manifest.contains("demo-ext"));
        assert!(manifest.remove("demo-ext"));
        assert!(!manifest.remove("demo-ext"));
        assert!(!manifest.contains("demo-ext"));
    }

    #[test]
    fn test_missing_lists_absent_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("present-ext")).unwrap();

        let mut manifest = DependencyManifest::default();
        manifest.add("present-ext", ">=1.0.0");
        manifest.add("absent-ext", ">=1.0.0");

        assert_eq!(manifest.missing(dir.path()), vec!["absent-ext".to_string()]);
    }

    #[test]
    fn test_tolerant_parse() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"dependencies": {"demo-ext": ">=1.0.0",},}"#,
        )
        .unwrap();
        let manifest = DependencyManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.get("demo-ext"), Some(">=1.0.0"));
    }
}
