//! Extension type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where an extension came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    /// Installed under the managed root and recorded in the dependency manifest
    Global,

    /// Discovered on the host's search path outside the managed root
    Local,

    /// A single-file extension from the plugins directory
    SingleFile,

    /// Registered programmatically by the host itself
    Internal,
}

/// Lifecycle state of a loaded extension
///
/// Disabled is tracked separately as membership in the persisted disabled
/// set, not as a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    Loaded,
    Activating,
    Active,
}

/// A document open in the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentInfo {
    /// Language/filetype identifier (e.g. "rust", "go")
    pub language: String,

    /// URI scheme (e.g. "file", "fugitive")
    pub scheme: String,

    /// Filesystem path, when the scheme has one
    pub path: Option<PathBuf>,
}

impl DocumentInfo {
    pub fn file(language: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            language: language.into(),
            scheme: "file".to_string(),
            path: Some(path.into()),
        }
    }
}

/// Snapshot of one registry entry for introspection
#[derive(Debug, Clone)]
pub struct ExtensionInfo {
    pub id: String,
    pub kind: ExtensionKind,
    pub state: ExtensionState,
    pub directory: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExtensionState::Active).unwrap(),
            r#""active""#
        );
        assert_eq!(
            serde_json::to_string(&ExtensionKind::SingleFile).unwrap(),
            r#""single_file""#
        );
    }
}
