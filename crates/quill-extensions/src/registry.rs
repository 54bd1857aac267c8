//! The extension registry
//!
//! Central in-memory table of loaded extensions keyed by id. Owns creation,
//! activation, deactivation, and unloading, and persists the disabled/locked
//! sets across restarts.
//!
//! State machine per id: `Unregistered -> Loaded -> Activating -> Active`,
//! with disabled as an orthogonal persisted flag checked before any
//! transition. Activation is single-flight: concurrent `activate` calls for
//! one id share a single execution of the entry point and resolve to the
//! same outcome.

use crate::activation::{ActivationRouter, TriggerFn};
use crate::events::LifecycleEvent;
use crate::host::{
    Activatable, ActivationContext, ExtensionExports, ExtensionLoader, MessageLevel,
    WorkspaceHost,
};
use crate::types::{ExtensionInfo, ExtensionKind, ExtensionState};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use quill_core::manifest::ENGINE_KEY;
use quill_core::{
    DependencyManifest, Disposable, Emitter, Error, KvStore, Memento, PackageManifest, Result,
    RuntimeEnv,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

type ActivationOutcome = std::result::Result<(), Arc<anyhow::Error>>;
type SharedActivation = Shared<BoxFuture<'static, ActivationOutcome>>;

struct ExtensionRecord {
    id: String,
    kind: ExtensionKind,
    directory: Option<PathBuf>,
    entry: Option<PathBuf>,
    manifest: PackageManifest,
    activatable: Arc<dyn Activatable>,
    state: ExtensionState,
    activation: Option<SharedActivation>,
    exports: Arc<Mutex<Option<Arc<dyn ExtensionExports>>>>,
    subscriptions: Vec<Disposable>,
}

struct RegistryInner {
    env: RuntimeEnv,
    host: Arc<dyn WorkspaceHost>,
    loader: Arc<dyn ExtensionLoader>,
    store: KvStore,
    memento_store: KvStore,
    records: Mutex<HashMap<String, ExtensionRecord>>,
    disabled: Mutex<HashSet<String>>,
    locked: Mutex<HashSet<String>>,
    /// Last-known directory per id, kept across unload so a re-enable can
    /// find locally discovered extensions again
    known_dirs: Mutex<HashMap<String, PathBuf>>,
    config: Mutex<HashMap<String, Value>>,
    root_patterns: Mutex<HashMap<String, Vec<String>>>,
    events: Emitter<LifecycleEvent>,
    router: ActivationRouter,
}

/// Extension registry handle; clones share one table
pub struct ExtensionRegistry {
    inner: Arc<RegistryInner>,
}

impl Clone for ExtensionRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn make_trigger(weak: Weak<RegistryInner>) -> TriggerFn {
    Arc::new(move |id: String| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let registry = ExtensionRegistry { inner };
            if let Err(e) = registry.activate(&id).await {
                warn!("Deferred activation of {id} failed: {e}");
            }
        }
        .boxed()
    })
}

impl ExtensionRegistry {
    /// Create a registry, loading the persisted disabled/locked sets
    pub fn new(
        env: RuntimeEnv,
        host: Arc<dyn WorkspaceHost>,
        loader: Arc<dyn ExtensionLoader>,
    ) -> Result<Self> {
        let store = KvStore::new(env.store_path());
        let memento_store = KvStore::new(env.memento_path());
        let disabled: HashSet<String> = store.disabled_ids()?.into_iter().collect();
        let locked: HashSet<String> = store.locked_ids()?.into_iter().collect();
        debug!(
            "Registry starting with {} disabled, {} locked ids",
            disabled.len(),
            locked.len()
        );

        let inner = Arc::new_cyclic(|weak: &Weak<RegistryInner>| RegistryInner {
            router: ActivationRouter::new(Arc::clone(&host), make_trigger(weak.clone())),
            env,
            host,
            loader,
            store,
            memento_store,
            records: Mutex::new(HashMap::new()),
            disabled: Mutex::new(disabled),
            locked: Mutex::new(locked),
            known_dirs: Mutex::new(HashMap::new()),
            config: Mutex::new(HashMap::new()),
            root_patterns: Mutex::new(HashMap::new()),
            events: Emitter::new(),
        });
        Ok(Self { inner })
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<String, ExtensionRecord>> {
        self.inner.records.lock().expect("registry lock poisoned")
    }

    /// Runtime environment this registry was built with
    pub fn env(&self) -> &RuntimeEnv {
        &self.inner.env
    }

    /// Persistent store holding disabled/locked flags and `lastUpdate`
    pub fn store(&self) -> &KvStore {
        &self.inner.store
    }

    /// Lifecycle event channel
    pub fn events(&self) -> Emitter<LifecycleEvent> {
        self.inner.events.clone()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load the extension at `directory`
    ///
    /// Reads and validates `package.json`, derives the kind from the parent
    /// directory, and replaces any prior record with the same id (hot
    /// reload). Concurrent loads racing on one id resolve last-writer-wins.
    /// Manifest and filesystem errors are reported to the host and logged;
    /// they never propagate past this boundary.
    pub async fn load(&self, directory: &Path) -> bool {
        if self.inner.env.no_plugins {
            debug!("Extension loading is disabled, skipping {:?}", directory);
            return false;
        }
        match self.try_load(directory).await {
            Ok(Some(id)) => {
                info!("Loaded extension {id} from {:?}", directory);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to load extension from {:?}: {e}", directory);
                self.inner.host.show_message(
                    MessageLevel::Error,
                    &format!("Failed to load extension at {}: {e}", directory.display()),
                );
                false
            }
        }
    }

    async fn try_load(&self, directory: &Path) -> Result<Option<String>> {
        let manifest = PackageManifest::load(directory)?;
        let id = manifest.name.clone();
        if self.is_disabled(&id) {
            debug!("{id} is disabled, not loading");
            return Ok(None);
        }

        let entry = manifest.entry_file(directory);
        if manifest.main.is_some() && !entry.exists() {
            return Err(Error::invalid_manifest(
                directory.join("package.json"),
                format!("entry file {} does not exist", entry.display()),
            ));
        }

        let kind = if directory.parent() == Some(self.inner.env.modules_dir().as_path()) {
            ExtensionKind::Global
        } else {
            ExtensionKind::Local
        };
        let activatable = self.inner.loader.load(&id, &entry)?;
        self.insert_record(
            id.clone(),
            kind,
            Some(directory.to_path_buf()),
            Some(entry),
            manifest,
            activatable,
        )
        .await;
        Ok(Some(id))
    }

    /// Load a single-file extension; the file stem becomes the id
    pub async fn load_single_file(&self, path: &Path) -> bool {
        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
        else {
            warn!("Not a loadable single-file extension: {:?}", path);
            return false;
        };
        if self.is_disabled(&id) {
            debug!("{id} is disabled, not loading");
            return false;
        }
        let activatable = match self.inner.loader.load(&id, path) {
            Ok(a) => a,
            Err(e) => {
                error!("Failed to load single-file extension {:?}: {e}", path);
                self.inner.host.show_message(
                    MessageLevel::Error,
                    &format!("Failed to load extension {}: {e}", path.display()),
                );
                return false;
            }
        };
        let manifest = synthesized_manifest(&id);
        self.insert_record(
            id,
            ExtensionKind::SingleFile,
            None,
            Some(path.to_path_buf()),
            manifest,
            activatable,
        )
        .await;
        true
    }

    /// Register an extension provided by the host itself
    pub async fn register_internal(
        &self,
        id: &str,
        activatable: Arc<dyn Activatable>,
        activation_events: Vec<String>,
    ) {
        let mut manifest = synthesized_manifest(id);
        manifest.activation_events = activation_events;
        self.insert_record(
            id.to_string(),
            ExtensionKind::Internal,
            None,
            None,
            manifest,
            activatable,
        )
        .await;
    }

    async fn insert_record(
        &self,
        id: String,
        kind: ExtensionKind,
        directory: Option<PathBuf>,
        entry: Option<PathBuf>,
        manifest: PackageManifest,
        activatable: Arc<dyn Activatable>,
    ) {
        // At most one record per id: tear down any prior one first. The last
        // load to run wins; callers that need ordering serialize their own
        // loads.
        self.unload(&id).await;

        if let Some(dir) = &directory {
            self.inner
                .known_dirs
                .lock()
                .expect("registry lock poisoned")
                .insert(id.clone(), dir.clone());
        }
        self.merge_contributions(&manifest);

        let record = ExtensionRecord {
            id: id.clone(),
            kind,
            directory,
            entry,
            manifest: manifest.clone(),
            activatable,
            state: ExtensionState::Loaded,
            activation: None,
            exports: Arc::new(Mutex::new(None)),
            subscriptions: Vec::new(),
        };
        self.lock_records().insert(id.clone(), record);

        // Wire triggers after the record exists so a firing trigger finds it
        let (subscriptions, immediate) = self
            .inner
            .router
            .wire(&id, &manifest.activation_events);
        match self.lock_records().get_mut(&id) {
            Some(record) => record.subscriptions = subscriptions,
            None => {
                for mut sub in subscriptions {
                    sub.dispose();
                }
            }
        }

        self.inner.events.fire(&LifecycleEvent::Loaded { id: id.clone() });

        if immediate {
            if let Err(e) = self.activate(&id).await {
                warn!("Immediate activation of {id} failed: {e}");
            }
        }
    }

    fn merge_contributions(&self, manifest: &PackageManifest) {
        let Some(contributes) = &manifest.contributes else {
            return;
        };
        if let Some(configuration) = &contributes.configuration {
            let mut config = self.inner.config.lock().expect("registry lock poisoned");
            for (key, property) in &configuration.properties {
                if let Some(default) = &property.default {
                    config.entry(key.clone()).or_insert_with(|| default.clone());
                }
            }
        }
        if !contributes.root_patterns.is_empty() {
            let mut patterns = self
                .inner
                .root_patterns
                .lock()
                .expect("registry lock poisoned");
            for entry in &contributes.root_patterns {
                patterns
                    .entry(entry.filetype.clone())
                    .or_default()
                    .extend(entry.patterns.iter().cloned());
            }
        }
        for command in &contributes.commands {
            self.inner.host.register_command(&command.command);
        }
    }

    /// Load every managed extension plus any single-file extensions from the
    /// configured plugins directory; returns the loaded ids
    pub async fn load_all(&self) -> Vec<String> {
        if self.inner.env.no_plugins {
            info!("Extension loading disabled by environment");
            return Vec::new();
        }

        let mut loaded = Vec::new();
        match DependencyManifest::load(&self.inner.env.root) {
            Ok(manifest) => {
                for id in manifest.ids() {
                    let dir = self.inner.env.root.join(id);
                    if dir.is_dir() && self.load(&dir).await {
                        loaded.push(id.to_string());
                    }
                }
            }
            Err(e) => error!("Failed to read dependency manifest: {e}"),
        }

        if let Some(plugins_dir) = self.inner.env.plugins_dir.clone() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&plugins_dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.is_file())
                        .collect()
                })
                .unwrap_or_default();
            files.sort();
            for file in files {
                if self.load_single_file(&file).await {
                    if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                        loaded.push(stem.to_string());
                    }
                }
            }
        }
        loaded
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Activate an extension; idempotent and single-flight per id
    pub async fn activate(&self, id: &str) -> Result<()> {
        if self.is_disabled(id) {
            return Err(Error::disabled(id));
        }

        let shared = {
            let mut records = self.lock_records();
            let record = records
                .get_mut(id)
                .ok_or_else(|| Error::not_registered(id))?;
            if record.state == ExtensionState::Active {
                return Ok(());
            }
            if let Some(existing) = &record.activation {
                existing.clone()
            } else {
                record.state = ExtensionState::Activating;
                let ctx = ActivationContext {
                    id: record.id.clone(),
                    root: record
                        .directory
                        .clone()
                        .or_else(|| {
                            record
                                .entry
                                .as_ref()
                                .and_then(|e| e.parent().map(Path::to_path_buf))
                        })
                        .unwrap_or_default(),
                    memento: Memento::new(self.inner.memento_store.clone(), &record.id),
                };
                let activatable = Arc::clone(&record.activatable);
                let exports = Arc::clone(&record.exports);
                let fut: BoxFuture<'static, ActivationOutcome> = async move {
                    let value = activatable.activate(ctx).await.map_err(Arc::new)?;
                    *exports.lock().expect("exports lock poisoned") = Some(value);
                    Ok(())
                }
                .boxed();
                let shared = fut.shared();
                record.activation = Some(shared.clone());
                shared
            }
        };

        let outcome = shared.await;
        self.finish_activation(id, &outcome);
        outcome.map_err(|e| Error::other(format!("Activation of {id} failed: {e:#}")))
    }

    /// Settle the record after the shared activation future resolves.
    /// Only the first caller to observe the outcome performs the transition;
    /// the rest see the settled state and return.
    fn finish_activation(&self, id: &str, outcome: &ActivationOutcome) {
        {
            let mut records = self.lock_records();
            let Some(record) = records.get_mut(id) else {
                return;
            };
            if record.state != ExtensionState::Activating {
                return;
            }
            match outcome {
                Ok(()) => record.state = ExtensionState::Active,
                Err(_) => {
                    record.state = ExtensionState::Loaded;
                    record.activation = None;
                }
            }
        }
        match outcome {
            Ok(()) => {
                info!("Activated {id}");
                self.inner.events.fire(&LifecycleEvent::Activated {
                    id: id.to_string(),
                });
            }
            Err(e) => {
                error!("Activation of {id} failed: {e:#}");
                self.inner.host.show_message(
                    MessageLevel::Error,
                    &format!("Failed to activate extension {id}: {e}"),
                );
                self.inner.events.fire(&LifecycleEvent::ActivationFailed {
                    id: id.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Deactivate an extension, releasing its owned subscriptions
    ///
    /// No-ops (returning false) when the id is unknown or not active. The
    /// activation cell and cached exports are cleared so a later `activate`
    /// re-runs the entry point from scratch.
    pub async fn deactivate(&self, id: &str) -> bool {
        let (activatable, subscriptions) = {
            let mut records = self.lock_records();
            let Some(record) = records.get_mut(id) else {
                return false;
            };
            if record.state != ExtensionState::Active {
                return false;
            }
            record.state = ExtensionState::Loaded;
            record.activation = None;
            *record.exports.lock().expect("exports lock poisoned") = None;
            (
                Arc::clone(&record.activatable),
                std::mem::take(&mut record.subscriptions),
            )
        };
        for mut sub in subscriptions {
            sub.dispose();
        }
        activatable.deactivate().await;
        info!("Deactivated {id}");
        self.inner.events.fire(&LifecycleEvent::Deactivated {
            id: id.to_string(),
        });
        true
    }

    /// Remove the record entirely, deactivating first if needed
    pub async fn unload(&self, id: &str) -> bool {
        self.deactivate(id).await;
        let record = self.lock_records().remove(id);
        let Some(mut record) = record else {
            return false;
        };
        for mut sub in record.subscriptions.drain(..) {
            sub.dispose();
        }
        debug!("Unloaded {id}");
        self.inner.events.fire(&LifecycleEvent::Unloaded {
            id: id.to_string(),
        });
        true
    }

    /// Reload from the record's known location
    ///
    /// Internally registered and directory-less records are rejected with a
    /// warning.
    pub async fn reload(&self, id: &str) -> Result<bool> {
        let (kind, directory, entry) = {
            let records = self.lock_records();
            let record = records.get(id).ok_or_else(|| Error::not_registered(id))?;
            (record.kind, record.directory.clone(), record.entry.clone())
        };
        match kind {
            ExtensionKind::Internal => {
                warn!("Cannot reload internally registered extension {id}");
                self.inner.host.show_message(
                    MessageLevel::Warning,
                    &format!("Extension {id} is registered by the host and cannot be reloaded"),
                );
                Ok(false)
            }
            ExtensionKind::SingleFile => match entry {
                Some(path) => Ok(self.load_single_file(&path).await),
                None => Ok(false),
            },
            _ => match directory {
                Some(dir) => Ok(self.load(&dir).await),
                None => {
                    warn!("Extension {id} has no directory to reload from");
                    Ok(false)
                }
            },
        }
    }

    /// Flip the persisted disabled flag; returns the new disabled state
    ///
    /// Disabling deactivates and unloads; enabling loads again when the
    /// extension's directory still exists.
    pub async fn toggle(&self, id: &str) -> Result<bool> {
        if self.is_disabled(id) {
            self.inner.store.set_disabled(id, false)?;
            self.inner
                .disabled
                .lock()
                .expect("registry lock poisoned")
                .remove(id);
            self.inner.events.fire(&LifecycleEvent::Toggled {
                id: id.to_string(),
                disabled: false,
            });
            let dir = {
                let known = self
                    .inner
                    .known_dirs
                    .lock()
                    .expect("registry lock poisoned");
                known
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| self.inner.env.root.join(id))
            };
            if dir.is_dir() {
                self.load(&dir).await;
            }
            Ok(false)
        } else {
            self.inner.store.set_disabled(id, true)?;
            self.inner
                .disabled
                .lock()
                .expect("registry lock poisoned")
                .insert(id.to_string());
            self.unload(id).await;
            self.inner.events.fire(&LifecycleEvent::Toggled {
                id: id.to_string(),
                disabled: true,
            });
            Ok(true)
        }
    }

    /// Ensure activation, then invoke a named export as a method
    pub async fn call(&self, id: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        if !self.lock_records().contains_key(id) {
            return Err(Error::not_registered(id));
        }
        self.activate(id).await?;
        let exports = self.exports(id)?;
        exports.invoke(method, args)
    }

    /// Read the exports of an active extension
    ///
    /// Reading exports while inactive is a hard error.
    pub fn exports(&self, id: &str) -> Result<Arc<dyn ExtensionExports>> {
        let records = self.lock_records();
        let record = records.get(id).ok_or_else(|| Error::not_registered(id))?;
        if record.state != ExtensionState::Active {
            return Err(Error::other(format!(
                "Extension {id} is not activated; exports are not readable"
            )));
        }
        let result = record
            .exports
            .lock()
            .expect("exports lock poisoned")
            .clone()
            .ok_or_else(|| Error::other(format!("Extension {id} exposes no exports")));
        result
    }

    // ------------------------------------------------------------------
    // Managed-root maintenance
    // ------------------------------------------------------------------

    /// Uninstall managed extensions
    ///
    /// Ids absent from the dependency manifest are reported and skipped. For
    /// each valid id the record is unloaded, its directory deleted, and its
    /// manifest entry removed; the manifest is rewritten once, keys sorted.
    pub async fn uninstall(&self, ids: &[String]) -> Result<Vec<String>> {
        let root = self.inner.env.root.clone();
        let mut manifest = DependencyManifest::load(&root)?;
        let mut removed = Vec::new();

        for id in ids {
            if !manifest.contains(id) {
                self.inner.host.show_message(
                    MessageLevel::Warning,
                    &format!("{id} is not a managed extension, skipping"),
                );
                continue;
            }
            self.unload(id).await;

            let dir = root.join(id);
            match std::fs::symlink_metadata(&dir) {
                Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(&dir)?,
                Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&dir)?,
                Ok(_) => std::fs::remove_file(&dir)?,
                Err(_) => {}
            }
            manifest.remove(id);
            removed.push(id.clone());
            info!("Uninstalled {id}");
        }

        manifest.save(&root)?;
        Ok(removed)
    }

    /// Delete every managed install whose directory is a real directory,
    /// preserving symlinked developer installs; returns the removed ids
    ///
    /// Manifest entries stay in place so a following install pass can
    /// reinstall everything.
    pub async fn clean(&self) -> Result<Vec<String>> {
        let root = self.inner.env.root.clone();
        let manifest = DependencyManifest::load(&root)?;
        let mut removed = Vec::new();

        for id in manifest.ids() {
            let dir = root.join(id);
            let Ok(meta) = std::fs::symlink_metadata(&dir) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                debug!("Preserving symlinked development install {id}");
                continue;
            }
            if !meta.is_dir() {
                continue;
            }
            self.unload(id).await;
            std::fs::remove_dir_all(&dir)?;
            removed.push(id.to_string());
        }
        Ok(removed)
    }

    /// Managed ids whose install directory is missing on disk
    pub fn get_missing_extensions(&self) -> Result<Vec<String>> {
        let manifest = DependencyManifest::load(&self.inner.env.root)?;
        Ok(manifest.missing(&self.inner.env.root))
    }

    // ------------------------------------------------------------------
    // Flags and introspection
    // ------------------------------------------------------------------

    pub fn is_disabled(&self, id: &str) -> bool {
        self.inner
            .disabled
            .lock()
            .expect("registry lock poisoned")
            .contains(id)
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.inner
            .locked
            .lock()
            .expect("registry lock poisoned")
            .contains(id)
    }

    /// Persist the locked flag; locked ids are excluded from batch updates
    pub fn set_locked(&self, id: &str, locked: bool) -> Result<()> {
        self.inner.store.set_locked(id, locked)?;
        let mut set = self.inner.locked.lock().expect("registry lock poisoned");
        if locked {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
        Ok(())
    }

    /// Currently locked ids
    pub fn locked_ids(&self) -> HashSet<String> {
        self.inner
            .locked
            .lock()
            .expect("registry lock poisoned")
            .clone()
    }

    /// Whether a record exists for the id
    pub fn has(&self, id: &str) -> bool {
        self.lock_records().contains_key(id)
    }

    /// Current state of a record, if one exists
    pub fn state(&self, id: &str) -> Option<ExtensionState> {
        self.lock_records().get(id).map(|r| r.state)
    }

    /// Snapshot of all records
    pub fn list(&self) -> Vec<ExtensionInfo> {
        let mut list: Vec<ExtensionInfo> = self
            .lock_records()
            .values()
            .map(|record| ExtensionInfo {
                id: record.id.clone(),
                kind: record.kind,
                state: record.state,
                directory: record.directory.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Manifest of a loaded extension
    pub fn manifest(&self, id: &str) -> Option<PackageManifest> {
        self.lock_records().get(id).map(|r| r.manifest.clone())
    }

    /// Configuration value merged from contributed defaults
    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.inner
            .config
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    /// Contributed project-root patterns for a filetype
    pub fn root_patterns(&self, filetype: &str) -> Vec<String> {
        self.inner
            .root_patterns
            .lock()
            .expect("registry lock poisoned")
            .get(filetype)
            .cloned()
            .unwrap_or_default()
    }
}

fn synthesized_manifest(id: &str) -> PackageManifest {
    PackageManifest {
        name: id.to_string(),
        version: None,
        description: None,
        main: None,
        engines: HashMap::from([(ENGINE_KEY.to_string(), "*".to_string())]),
        activation_events: Vec::new(),
        dependencies: HashMap::new(),
        contributes: None,
    }
}
