//! Package manifest parsing and validation
//!
//! Every extension carries a `package.json` at its root. The manifest is the
//! extension's descriptor: name, version, engine compatibility, entry file,
//! activation events, and contributions (configuration defaults, root
//! patterns, commands).
//!
//! Reads are tolerant of trailing commas (json5), since manifests are often
//! hand-edited.

use crate::error::{Error, Result};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Key under `engines` declaring the host compatibility range
pub const ENGINE_KEY: &str = "quill";

/// Entry file used when the manifest has no `main` field
pub const DEFAULT_ENTRY: &str = "index.js";

/// Extension manifest (`<extensionDir>/package.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    /// Unique extension id
    pub name: String,

    /// Semantic version
    #[serde(default)]
    pub version: Option<String>,

    /// Short description
    #[serde(default)]
    pub description: Option<String>,

    /// Entry file relative to the extension root (defaults to index.js)
    #[serde(default)]
    pub main: Option<String>,

    /// Engine compatibility map; must contain the host key
    #[serde(default)]
    pub engines: HashMap<String, String>,

    /// Declarative activation triggers
    #[serde(default)]
    pub activation_events: Vec<String>,

    /// Runtime dependencies installed by the package-manager subprocess
    #[serde(default)]
    pub dependencies: HashMap<String, String>,

    /// Contributed configuration, root patterns, and commands
    #[serde(default)]
    pub contributes: Option<Contributions>,
}

/// Contribution points declared by an extension
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributions {
    /// Configuration section with default values
    #[serde(default)]
    pub configuration: Option<ConfigurationContribution>,

    /// Per-filetype project-root glob patterns
    #[serde(default)]
    pub root_patterns: Vec<RootPattern>,

    /// Commands exposed to the host's command palette
    #[serde(default)]
    pub commands: Vec<CommandContribution>,
}

/// Contributed configuration properties
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationContribution {
    #[serde(default)]
    pub properties: HashMap<String, ConfigProperty>,
}

/// A single configuration property with its default value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigProperty {
    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

/// Project-root patterns for a filetype
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootPattern {
    pub filetype: String,

    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Command id and palette title
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandContribution {
    pub command: String,

    #[serde(default)]
    pub title: String,
}

impl PackageManifest {
    /// Parse a manifest from a string, tolerating trailing commas
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        let manifest: PackageManifest = json5::from_str(content)
            .map_err(|e| Error::invalid_manifest(origin, e.to_string()))?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    /// Load and validate the manifest at `<dir>/package.json`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("package.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::invalid_manifest(&path, e.to_string()))?;
        Self::parse(&content, &path)
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_manifest(origin, "missing name field"));
        }
        if self.engines.is_empty() {
            return Err(Error::invalid_manifest(origin, "missing engines field"));
        }
        Ok(())
    }

    /// Extract the host engine requirement, failing when absent
    pub fn engine_requirement(&self) -> Result<VersionReq> {
        let range = self.engines.get(ENGINE_KEY).ok_or(Error::MissingEngine {
            id: self.name.clone(),
        })?;
        VersionReq::parse(range).map_err(|_| Error::MissingEngine {
            id: self.name.clone(),
        })
    }

    /// Raw engine range string, if declared
    pub fn engine_range(&self) -> Option<&str> {
        self.engines.get(ENGINE_KEY).map(String::as_str)
    }

    /// Resolve the entry file path relative to the extension root
    pub fn entry_file(&self, root: &Path) -> PathBuf {
        root.join(self.main.as_deref().unwrap_or(DEFAULT_ENTRY))
    }

    /// Runtime dependencies that the secondary installer must fetch
    ///
    /// Excludes the host package itself, common bundlers, and type-declaration
    /// packages, which are never needed at runtime.
    pub fn install_dependencies(&self) -> Vec<&str> {
        const BUNDLERS: [&str; 2] = ["webpack", "esbuild"];
        self.dependencies
            .keys()
            .map(String::as_str)
            .filter(|name| *name != ENGINE_KEY)
            .filter(|name| !BUNDLERS.contains(name))
            .filter(|name| !name.starts_with("@types/"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<PackageManifest> {
        PackageManifest::parse(content, Path::new("package.json"))
    }

    #[test]
    fn test_minimal_manifest() {
        let manifest = parse(r#"{"name": "demo", "engines": {"quill": "^0.0.1"}}"#).unwrap();
        assert_eq!(manifest.name, "demo");
        assert_eq!(manifest.engine_range(), Some("^0.0.1"));
        assert_eq!(
            manifest.entry_file(Path::new("/ext")),
            PathBuf::from("/ext/index.js")
        );
    }

    #[test]
    fn test_trailing_comma_tolerated() {
        let manifest = parse(
            r#"{
                "name": "demo",
                "engines": {"quill": ">=0.0.1"},
                "activationEvents": ["onLanguage:rust",],
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.activation_events, vec!["onLanguage:rust"]);
    }

    #[test]
    fn test_missing_name_rejected() {
        let err = parse(r#"{"name": "", "engines": {"quill": "*"}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { .. }));
    }

    #[test]
    fn test_missing_engines_rejected() {
        let err = parse(r#"{"name": "demo"}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidManifest { .. }));
    }

    #[test]
    fn test_engine_requirement_absent_key() {
        let manifest = parse(r#"{"name": "demo", "engines": {"node": ">=18"}}"#).unwrap();
        let err = manifest.engine_requirement().unwrap_err();
        assert!(matches!(err, Error::MissingEngine { .. }));
    }

    #[test]
    fn test_install_dependencies_filtered() {
        let manifest = parse(
            r#"{
                "name": "demo",
                "engines": {"quill": "*"},
                "dependencies": {
                    "quill": "*",
                    "webpack": "^5.0.0",
                    "@types/node": "^20.0.0",
                    "lodash": "^4.17.0"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.install_dependencies(), vec!["lodash"]);
    }

    #[test]
    fn test_contributions_parsed() {
        let manifest = parse(
            r#"{
                "name": "demo",
                "engines": {"quill": "*"},
                "contributes": {
                    "configuration": {
                        "properties": {
                            "demo.enable": {"default": true, "description": "Enable demo"}
                        }
                    },
                    "rootPatterns": [{"filetype": "go", "patterns": ["go.mod"]}],
                    "commands": [{"command": "demo.run", "title": "Run demo"}]
                }
            }"#,
        )
        .unwrap();
        let contributes = manifest.contributes.unwrap();
        let config = contributes.configuration.unwrap();
        assert_eq!(
            config.properties["demo.enable"].default,
            Some(Value::Bool(true))
        );
        assert_eq!(contributes.root_patterns[0].filetype, "go");
        assert_eq!(contributes.commands[0].command, "demo.run");
    }
}
