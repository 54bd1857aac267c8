//! Extension installation and update
//!
//! The installer resolves an identifier (`name`, `name@version`, or a GitHub
//! URL) to concrete metadata, downloads the tarball into a staging directory
//! under the managed root, delegates runtime-dependency installation to the
//! configured package manager, and atomically swaps the staged tree into
//! place before pinning the result in the root dependency manifest.
//!
//! Long-running steps emit `(message, is_progress)` pairs through the
//! `on_message` callback so a progress tracker can render them.

use crate::download::{DownloadOptions, Downloader, ExtractMode};
use crate::registry::{GithubResolver, RegistryClient};
use quill_core::{DependencyManifest, Error, PackageManifest, Result, RuntimeEnv};
use semver::{Version, VersionReq};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message callback: `(text, is_progress)`
pub type MessageFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Resolved install metadata, produced by [`Installer::get_info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallJob {
    /// Extension id from the manifest
    pub name: String,

    /// Concrete version being installed
    pub version: String,

    /// Tarball download URL
    pub tarball_url: String,

    /// Required host-engine range (raw, as declared)
    pub required_engine: String,
}

/// Installer for a single extension identifier
pub struct Installer {
    env: RuntimeEnv,
    identifier: String,
    registry: RegistryClient,
    github: GithubResolver,
    downloader: Downloader,
    cancel: CancellationToken,
    on_message: Option<MessageFn>,
}

impl Installer {
    /// Create an installer for `identifier` rooted at the managed directory
    pub fn new(env: RuntimeEnv, identifier: impl Into<String>) -> Result<Self> {
        Ok(Self {
            env,
            identifier: identifier.into(),
            registry: RegistryClient::from_config(),
            github: GithubResolver::new(),
            downloader: Downloader::new()?,
            cancel: CancellationToken::new(),
            on_message: None,
        })
    }

    /// Replace the registry client (test seam, mirrors an rc override)
    pub fn with_registry(mut self, registry: RegistryClient) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the GitHub resolver (test seam)
    pub fn with_github(mut self, github: GithubResolver) -> Self {
        self.github = github;
        self
    }

    /// Attach a message callback
    pub fn on_message(mut self, f: impl Fn(&str, bool) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    /// Token cancelling any in-flight download
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, message: &str, is_progress: bool) {
        if let Some(f) = &self.on_message {
            f(message, is_progress);
        }
    }

    fn is_url(&self) -> bool {
        self.identifier.starts_with("http://") || self.identifier.starts_with("https://")
    }

    /// Resolve the identifier to concrete install metadata
    pub async fn get_info(&self) -> Result<InstallJob> {
        if self.is_url() {
            return self.github.resolve(&self.identifier).await;
        }
        let (name, version) = split_identifier(&self.identifier);
        self.registry.resolve(name, version).await
    }

    fn check_engine(&self, job: &InstallJob) -> Result<()> {
        let req = engine_requirement(&job.required_engine).ok_or_else(|| Error::MissingEngine {
            id: job.name.clone(),
        })?;
        if !req.matches(&self.env.host_version) {
            return Err(Error::IncompatibleHost {
                id: job.name.clone(),
                required: job.required_engine.clone(),
                host: self.env.host_version.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve, verify engine compatibility, and install; returns the id
    pub async fn install(&self) -> Result<String> {
        let job = self.get_info().await?;
        self.check_engine(&job)?;
        self.do_install(&job).await?;
        Ok(job.name)
    }

    /// Update to the latest resolved version
    ///
    /// Returns `None` without touching the filesystem when the install
    /// directory is a symbolic link (a developer-managed checkout) or when
    /// the installed version is already current.
    pub async fn update(&self, url_override: Option<&str>) -> Result<Option<PathBuf>> {
        if !self.is_url() {
            let (name, _) = split_identifier(&self.identifier);
            if is_symlink(&self.env.root.join(name)) {
                debug!("{name} is a development symlink, skipping update");
                return Ok(None);
            }
        }

        let job = match url_override {
            Some(url) => self.github.resolve(url).await?,
            None => self.get_info().await?,
        };
        let target = self.env.root.join(&job.name);
        if is_symlink(&target) {
            debug!("{} is a development symlink, skipping update", job.name);
            return Ok(None);
        }

        if let Some(installed) = installed_version(&target) {
            if let Ok(latest) = Version::parse(&job.version) {
                if installed >= latest {
                    info!("{} {installed} is already current", job.name);
                    return Ok(None);
                }
            }
        }

        self.check_engine(&job)?;
        self.do_install(&job).await?;
        Ok(Some(target))
    }

    /// Download, stage, install dependencies, and swap into place
    pub async fn do_install(&self, job: &InstallJob) -> Result<()> {
        let target = self.env.root.join(&job.name);
        if is_symlink(&target) {
            return Err(Error::other(format!(
                "{} is a symlinked developer install, refusing to overwrite",
                job.name
            )));
        }

        self.emit(
            &format!("Downloading {} from {}", job.name, job.tarball_url),
            false,
        );

        // Staged under the managed root so the final rename never crosses a
        // filesystem boundary.
        std::fs::create_dir_all(&self.env.root)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.env.root)?;

        let on_message = self.on_message.clone();
        let options = DownloadOptions {
            extract: ExtractMode::Untar,
            strip: Some(1),
            timeout: None,
            on_progress: on_message.map(|f| {
                Arc::new(move |percent: f64| {
                    f(&format!("Downloading {percent:.1}%"), true);
                }) as Arc<dyn Fn(f64) + Send + Sync>
            }),
        };
        self.downloader
            .download(&job.tarball_url, staging.path(), options, self.cancel.clone())
            .await?;

        let manifest = PackageManifest::load(staging.path())?;
        let dependencies = manifest.install_dependencies();
        if !dependencies.is_empty() {
            self.emit(
                &format!("Installing {} dependencies", dependencies.len()),
                false,
            );
            self.run_dependency_install(staging.path()).await?;
        }

        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target)?,
            Ok(_) => std::fs::remove_file(&target)?,
            Err(_) => {}
        }
        let staged = staging.keep();
        std::fs::rename(&staged, &target)?;

        let pin = if self.is_url() {
            self.identifier.clone()
        } else {
            format!(">={}", job.version)
        };
        let mut deps = DependencyManifest::load(&self.env.root)?;
        deps.add(&job.name, &pin);
        deps.save(&self.env.root)?;

        self.emit(
            &format!("Installed extension {}@{}", job.name, job.version),
            false,
        );
        info!("Installed {}@{} at {:?}", job.name, job.version, target);
        Ok(())
    }

    /// Run the package manager in the staging directory
    ///
    /// Arguments skip lifecycle scripts and lockfile generation, install only
    /// production dependencies, and relax peer/engine strictness for
    /// npm-compatible managers.
    async fn run_dependency_install(&self, cwd: &Path) -> Result<()> {
        let program = self.env.package_manager.clone();
        let args = package_manager_args(&program);
        debug!("Running {program} {:?} in {:?}", args, cwd);

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::other(format!("Failed to spawn {program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::other("Child stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::other("Child stderr not captured"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim_end();
            if !line.is_empty() {
                self.emit(line, false);
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            warn!("{program} failed in {:?}", cwd);
            return Err(Error::Subprocess {
                program,
                code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Parse an engine range, widening a leading caret to a plain lower bound.
/// Published manifests routinely declare `^0.0.x` while hosts move past the
/// patch range; the caret is a minimum, not a pin.
fn engine_requirement(range: &str) -> Option<VersionReq> {
    let range = range.trim();
    let widened = range.strip_prefix('^').map(|rest| format!(">={rest}"));
    VersionReq::parse(widened.as_deref().unwrap_or(range)).ok()
}

/// Split `name@version` into its parts, preserving scoped names
fn split_identifier(identifier: &str) -> (&str, Option<&str>) {
    let identifier = identifier.trim();
    let search_from = if identifier.starts_with('@') { 1 } else { 0 };
    match identifier[search_from..].find('@') {
        Some(idx) => {
            let at = search_from + idx;
            let version = &identifier[at + 1..];
            if version.is_empty() {
                (&identifier[..at], None)
            } else {
                (&identifier[..at], Some(version))
            }
        }
        None => (identifier, None),
    }
}

fn package_manager_args(program: &str) -> Vec<&'static str> {
    let base = Path::new(program)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(program);
    match base {
        "yarn" | "yarnpkg" => vec![
            "install",
            "--ignore-scripts",
            "--no-lockfile",
            "--production",
            "--ignore-engines",
        ],
        "pnpm" => vec![
            "install",
            "--ignore-scripts",
            "--prod",
            "--config.strict-peer-dependencies=false",
        ],
        _ => vec![
            "install",
            "--ignore-scripts",
            "--no-lockfile",
            "--production",
            "--legacy-peer-deps",
            "--no-global",
        ],
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

fn installed_version(dir: &Path) -> Option<Version> {
    PackageManifest::load(dir)
        .ok()
        .and_then(|m| m.version)
        .and_then(|v| Version::parse(&v).ok())
}
