//! Runtime environment resolution
//!
//! Resolves the managed root directory and startup toggles with explicit
//! override → environment → default precedence:
//! - `QUILL_HOME`: managed root holding installed extensions and the
//!   dependency manifest (default `~/.quill/extensions`)
//! - `QUILL_NO_PLUGINS`: skip loading any extensions
//! - `QUILL_PLUGINS_DIR`: directory of single-file extensions to auto-load

use semver::Version;
use std::path::PathBuf;
use tracing::debug;

/// Environment variable naming the managed root
pub const ENV_HOME: &str = "QUILL_HOME";

/// Environment variable disabling extension loading entirely
pub const ENV_NO_PLUGINS: &str = "QUILL_NO_PLUGINS";

/// Environment variable naming a directory of single-file extensions
pub const ENV_PLUGINS_DIR: &str = "QUILL_PLUGINS_DIR";

/// Resolved runtime environment
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    /// Managed root: installed extensions plus the dependency manifest
    pub root: PathBuf,

    /// Version of the host application, checked against engine ranges
    pub host_version: Version,

    /// Package-manager executable used for secondary dependency installs
    pub package_manager: String,

    /// When set, no extensions are loaded at startup
    pub no_plugins: bool,

    /// Optional directory of single-file extensions auto-loaded at startup
    pub plugins_dir: Option<PathBuf>,
}

impl RuntimeEnv {
    /// Resolve from process environment variables
    pub fn from_env(host_version: Version) -> Self {
        let root = std::env::var(ENV_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_root());
        let no_plugins = std::env::var(ENV_NO_PLUGINS)
            .map(|v| !v.trim().is_empty() && v.trim() != "0")
            .unwrap_or(false);
        let plugins_dir = std::env::var(ENV_PLUGINS_DIR)
            .ok()
            .map(PathBuf::from)
            .filter(|p| p.is_dir());

        debug!("Managed root resolved to {:?}", root);
        Self {
            root,
            host_version,
            package_manager: "npm".to_string(),
            no_plugins,
            plugins_dir,
        }
    }

    /// Build an environment with an explicit root, for embedding and tests
    pub fn with_root(root: PathBuf, host_version: Version) -> Self {
        Self {
            root,
            host_version,
            package_manager: "npm".to_string(),
            no_plugins: false,
            plugins_dir: None,
        }
    }

    /// Override the package-manager executable
    pub fn with_package_manager(mut self, program: impl Into<String>) -> Self {
        self.package_manager = program.into();
        self
    }

    fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".quill")
            .join("extensions")
    }

    /// Directory holding installed extension directories
    ///
    /// Extensions live directly under the managed root; an extension whose
    /// parent directory differs from this one is a locally discovered
    /// (non-managed) install.
    pub fn modules_dir(&self) -> &PathBuf {
        &self.root
    }

    /// Path of the persistent key-value store file
    pub fn store_path(&self) -> PathBuf {
        self.root.join("store.json")
    }

    /// Path of the memento store file
    pub fn memento_path(&self) -> PathBuf {
        self.root.join("memos.json")
    }
}
