//! Registry protocol and source resolution
//!
//! Package metadata comes from one of two places:
//! - An npm-style registry: `GET <base>/<name>` returns a document carrying
//!   `dist-tags.latest` and per-version entries with `dist.tarball` and the
//!   engine compatibility map.
//! - A GitHub repository URL: the manifest is fetched through the
//!   raw-content mirror for the requested branch, and the tarball URL points
//!   at the branch archive.
//!
//! The registry base is configurable through `~/.quillrc` with a scoped or
//! global override; the default is the public registry.

use crate::installer::InstallJob;
use quill_core::manifest::{PackageManifest, ENGINE_KEY};
use quill_core::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Well-known public registry base URL
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";

/// Registry-config file name, searched in the home directory
const RC_FILE: &str = ".quillrc";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry document for one package
#[derive(Debug, Deserialize)]
struct RegistryDoc {
    #[serde(rename = "dist-tags", default)]
    dist_tags: HashMap<String, String>,

    #[serde(default)]
    versions: HashMap<String, RegistryVersion>,
}

#[derive(Debug, Deserialize)]
struct RegistryVersion {
    #[serde(default)]
    engines: HashMap<String, String>,

    dist: RegistryDist,
}

#[derive(Debug, Deserialize)]
struct RegistryDist {
    tarball: String,
}

/// Resolve the registry base from the config file, scoped key first
///
/// Recognized lines: `quill:registry=<url>` (scoped) and `registry=<url>`
/// (global); `#`-prefixed lines are comments.
pub fn registry_base_from(rc_path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(rc_path) else {
        return DEFAULT_REGISTRY.to_string();
    };
    let mut global = None;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(url) = line.strip_prefix("quill:registry=") {
            return url.trim().trim_end_matches('/').to_string();
        }
        if let Some(url) = line.strip_prefix("registry=") {
            global = Some(url.trim().trim_end_matches('/').to_string());
        }
    }
    global.unwrap_or_else(|| DEFAULT_REGISTRY.to_string())
}

/// Resolve the registry base from `~/.quillrc`
pub fn registry_base() -> String {
    match dirs::home_dir() {
        Some(home) => registry_base_from(&home.join(RC_FILE)),
        None => DEFAULT_REGISTRY.to_string(),
    }
}

/// Client for the npm-style registry protocol
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base: String,
}

impl RegistryClient {
    /// Create a client against an explicit registry base
    pub fn new(base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create a client against the configured registry
    pub fn from_config() -> Self {
        Self::new(registry_base())
    }

    /// Registry base URL in use
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Resolve a package name (and optional pinned version) to install
    /// metadata; `None` resolves the `latest` dist-tag
    pub async fn resolve(&self, name: &str, version: Option<&str>) -> Result<InstallJob> {
        let url = format!("{}/{}", self.base, name);
        debug!("Fetching registry metadata from {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::other(format!("Registry request failed: {e}")))?;

        if response.status().as_u16() == 404 {
            return Err(Error::not_found(name));
        }
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                code: response.status().as_u16(),
                url,
            });
        }

        let doc: RegistryDoc = response
            .json()
            .await
            .map_err(|e| Error::other(format!("Invalid registry document for {name}: {e}")))?;

        let resolved = match version {
            Some(v) => v.to_string(),
            None => doc
                .dist_tags
                .get("latest")
                .cloned()
                .ok_or_else(|| Error::not_found(format!("{name} has no latest tag")))?,
        };

        let entry = doc
            .versions
            .get(&resolved)
            .ok_or_else(|| Error::not_found(format!("{name}@{resolved}")))?;

        let required_engine = entry
            .engines
            .get(ENGINE_KEY)
            .cloned()
            .ok_or_else(|| Error::MissingEngine {
                id: name.to_string(),
            })?;

        Ok(InstallJob {
            name: name.to_string(),
            version: resolved,
            tarball_url: entry.dist.tarball.clone(),
            required_engine,
        })
    }
}

/// Resolver for direct GitHub repository sources
#[derive(Debug, Clone)]
pub struct GithubResolver {
    client: reqwest::Client,
    raw_base: String,
    archive_base: String,
}

impl Default for GithubResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl GithubResolver {
    /// Create a resolver against the public GitHub endpoints
    pub fn new() -> Self {
        Self::with_bases("https://raw.githubusercontent.com", "https://codeload.github.com")
    }

    /// Create a resolver with explicit endpoints (test seam)
    pub fn with_bases(raw_base: impl Into<String>, archive_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("quill/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            raw_base: raw_base.into().trim_end_matches('/').to_string(),
            archive_base: archive_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a `github.com` repository URL to install metadata
    ///
    /// A `@branch` suffix selects the branch, defaulting to `master`.
    pub async fn resolve(&self, url: &str) -> Result<InstallJob> {
        let (owner, repo, branch) = parse_github_url(url)?;
        let manifest_url = format!(
            "{}/{owner}/{repo}/{branch}/package.json",
            self.raw_base
        );
        debug!("Fetching manifest from {manifest_url}");

        let response = self
            .client
            .get(&manifest_url)
            .send()
            .await
            .map_err(|e| Error::other(format!("Request to {manifest_url} failed: {e}")))?;
        if !response.status().is_success() {
            warn!(
                "No manifest at {manifest_url} (HTTP {})",
                response.status()
            );
            return Err(Error::not_found(url));
        }
        let content = response
            .text()
            .await
            .map_err(|e| Error::other(format!("Failed to read manifest body: {e}")))?;

        let manifest = PackageManifest::parse(&content, Path::new(&manifest_url))?;
        let required_engine = manifest
            .engine_range()
            .map(str::to_string)
            .ok_or_else(|| Error::MissingEngine {
                id: manifest.name.clone(),
            })?;

        Ok(InstallJob {
            name: manifest.name.clone(),
            version: manifest.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
            tarball_url: format!("{}/{owner}/{repo}/tar.gz/{branch}", self.archive_base),
            required_engine,
        })
    }
}

/// Split a GitHub URL into owner, repository, and branch
pub fn parse_github_url(url: &str) -> Result<(String, String, String)> {
    let trimmed = url.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .ok_or_else(|| Error::UnsupportedSource {
            url: url.to_string(),
        })?;

    let (path, branch) = match rest.split_once('@') {
        Some((path, branch)) if !branch.is_empty() => (path, branch.to_string()),
        Some((path, _)) => (path, "master".to_string()),
        None => (rest, "master".to_string()),
    };

    let mut segments = path.split('/');
    let owner = segments.next().unwrap_or_default();
    let repo = segments
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    if owner.is_empty() || repo.is_empty() {
        return Err(Error::UnsupportedSource {
            url: url.to_string(),
        });
    }
    Ok((owner.to_string(), repo.to_string(), branch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_url_defaults_to_master() {
        let (owner, repo, branch) = parse_github_url("https://github.com/acme/demo-ext").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "demo-ext");
        assert_eq!(branch, "master");
    }

    #[test]
    fn test_parse_github_url_with_branch_and_git_suffix() {
        let (_, repo, branch) =
            parse_github_url("https://github.com/acme/demo-ext.git@release").unwrap();
        assert_eq!(repo, "demo-ext");
        assert_eq!(branch, "release");
    }

    #[test]
    fn test_parse_github_url_rejects_other_hosts() {
        let err = parse_github_url("https://gitlab.com/acme/demo-ext").unwrap_err();
        assert!(matches!(err, Error::UnsupportedSource { .. }));
    }

    #[test]
    fn test_registry_base_scoped_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".quillrc");
        std::fs::write(
            &rc,
            "# local registry\nregistry=https://mirror.example.com/\nquill:registry=https://quill.example.com\n",
        )
        .unwrap();
        assert_eq!(registry_base_from(&rc), "https://quill.example.com");
    }

    #[test]
    fn test_registry_base_global_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".quillrc");
        std::fs::write(&rc, "registry=https://mirror.example.com/\n").unwrap();
        assert_eq!(registry_base_from(&rc), "https://mirror.example.com");
    }

    #[test]
    fn test_registry_base_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            registry_base_from(&dir.path().join(".quillrc")),
            DEFAULT_REGISTRY
        );
    }
}
