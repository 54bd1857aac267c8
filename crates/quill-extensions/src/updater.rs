//! Batch auto-update orchestration
//!
//! Ties the installer and the registry together: every managed extension is
//! updated through a bounded worker pool, locked ids and symlinked developer
//! installs are skipped, and completed updates feed back into the registry
//! via `load` so the new code is picked up without a restart.

use crate::registry::ExtensionRegistry;
use quill_core::{DependencyManifest, Result};
use quill_installer::registry::GithubResolver;
use quill_installer::{BatchResult, InstallQueue, Installer, RegistryClient};
use std::collections::HashMap;
use tracing::{debug, info};

/// Batch updater for managed extensions
pub struct AutoUpdater {
    registry: ExtensionRegistry,
    queue: InstallQueue,
    registry_client: Option<RegistryClient>,
    github: Option<GithubResolver>,
}

impl AutoUpdater {
    pub fn new(registry: ExtensionRegistry, queue: InstallQueue) -> Self {
        Self {
            registry,
            queue,
            registry_client: None,
            github: None,
        }
    }

    /// Override the registry client (test seam, mirrors an rc override)
    pub fn with_registry_client(mut self, client: RegistryClient) -> Self {
        self.registry_client = Some(client);
        self
    }

    /// Override the GitHub resolver (test seam)
    pub fn with_github(mut self, github: GithubResolver) -> Self {
        self.github = Some(github);
        self
    }

    /// Update every managed extension, excluding locked ids and symlinked
    /// developer installs; records the run in the persistent store
    pub async fn update_all(&self) -> Result<BatchResult> {
        let env = self.registry.env().clone();
        let manifest = DependencyManifest::load(&env.root)?;
        let locked = self.registry.locked_ids();
        let pins: HashMap<String, String> = manifest.dependencies.clone().into_iter().collect();

        let ids: Vec<String> = manifest
            .ids()
            .into_iter()
            .filter(|id| {
                if locked.contains(*id) {
                    debug!("{id} is locked, excluded from auto-update");
                    return false;
                }
                true
            })
            .map(str::to_string)
            .collect();
        info!("Auto-updating {} extensions", ids.len());

        let result = self
            .queue
            .run_batch(ids, self.queue.concurrency(), |id| {
                let env = env.clone();
                let queue = self.queue.clone();
                let registry = self.registry.clone();
                let registry_client = self.registry_client.clone();
                let github = self.github.clone();
                let pin = pins.get(&id).cloned();
                async move {
                    let mut installer = Installer::new(env, &id)?;
                    if let Some(client) = registry_client {
                        installer = installer.with_registry(client);
                    }
                    if let Some(github) = github {
                        installer = installer.with_github(github);
                    }
                    let sink = queue.clone();
                    let sink_id = id.clone();
                    let installer = installer.on_message(move |text, is_progress| {
                        sink.add_message(&sink_id, text, is_progress);
                    });

                    // URL-pinned entries update from their pinned source
                    let url_override = pin.filter(|p| p.starts_with("http"));
                    if let Some(dir) = installer.update(url_override.as_deref()).await? {
                        registry.load(&dir).await;
                    }
                    Ok(())
                }
            })
            .await;

        self.registry.store().touch_last_update()?;
        Ok(result)
    }
}
