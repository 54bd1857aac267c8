//! Shared fixtures for extension runtime tests
//!
//! Provides an in-memory workspace host, a counting test extension, and a
//! loader that hands out registered activatables.

#![allow(dead_code)]

use async_trait::async_trait;
use quill_core::{Disposable, Emitter, Error, Result, RuntimeEnv};
use quill_extensions::host::{
    Activatable, ActivationContext, CommandListener, DocumentListener, ExtensionExports,
    ExtensionLoader, MessageLevel, WorkspaceHost, WorkspaceListener,
};
use quill_extensions::{DocumentInfo, ExtensionRegistry, ExtensionState};
use semver::Version;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory workspace host driving the activation router
pub struct MockHost {
    documents: Mutex<Vec<DocumentInfo>>,
    roots: Mutex<Vec<PathBuf>>,
    document_events: Emitter<DocumentInfo>,
    workspace_events: Emitter<Vec<PathBuf>>,
    command_events: Emitter<String>,
    registered: Mutex<Vec<String>>,
    messages: Mutex<Vec<(MessageLevel, String)>>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            documents: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            document_events: Emitter::new(),
            workspace_events: Emitter::new(),
            command_events: Emitter::new(),
            registered: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
        })
    }

    /// Simulate opening a document
    pub fn open_document(&self, doc: DocumentInfo) {
        self.documents.lock().unwrap().push(doc.clone());
        self.document_events.fire(&doc);
    }

    /// Replace the workspace roots and notify listeners
    pub fn set_roots(&self, roots: Vec<PathBuf>) {
        *self.roots.lock().unwrap() = roots.clone();
        self.workspace_events.fire(&roots);
    }

    /// Simulate a command invocation
    pub fn invoke_command(&self, name: &str) {
        self.command_events.fire(&name.to_string());
    }

    pub fn registered_commands(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn document_listener_count(&self) -> usize {
        self.document_events.listener_count()
    }

    pub fn command_listener_count(&self) -> usize {
        self.command_events.listener_count()
    }
}

impl WorkspaceHost for MockHost {
    fn open_documents(&self) -> Vec<DocumentInfo> {
        self.documents.lock().unwrap().clone()
    }

    fn workspace_roots(&self) -> Vec<PathBuf> {
        self.roots.lock().unwrap().clone()
    }

    fn on_document_open(&self, listener: DocumentListener) -> Disposable {
        self.document_events.on(move |doc| listener(doc))
    }

    fn on_workspace_change(&self, listener: WorkspaceListener) -> Disposable {
        self.workspace_events.on(move |roots| listener(roots.as_slice()))
    }

    fn register_command(&self, name: &str) {
        self.registered.lock().unwrap().push(name.to_string());
    }

    fn on_command(&self, listener: CommandListener) -> Disposable {
        self.command_events.on(move |name| listener(name))
    }

    fn show_message(&self, level: MessageLevel, text: &str) {
        self.messages.lock().unwrap().push((level, text.to_string()));
    }
}

/// Test extension counting entry-point runs
#[derive(Default)]
pub struct CountingExtension {
    pub activations: Arc<AtomicUsize>,
    pub deactivations: Arc<AtomicUsize>,
    pub delay: Option<Duration>,
    pub fail: bool,
}

pub struct CountingExports {
    id: String,
    generation: usize,
}

impl ExtensionExports for CountingExports {
    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match method {
            "generation" => Ok(json!(self.generation)),
            "echo" => Ok(Value::Array(args)),
            _ => Err(Error::MethodNotFound {
                id: self.id.clone(),
                method: method.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Activatable for CountingExtension {
    async fn activate(&self, ctx: ActivationContext) -> anyhow::Result<Arc<dyn ExtensionExports>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("entry point exploded");
        }
        let generation = self.activations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(CountingExports {
            id: ctx.id,
            generation,
        }))
    }

    async fn deactivate(&self) {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader handing out pre-registered activatables, or fresh counters
#[derive(Default)]
pub struct TestLoader {
    registered: Mutex<HashMap<String, Arc<dyn Activatable>>>,
}

impl TestLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: &str, activatable: Arc<dyn Activatable>) {
        self.registered
            .lock()
            .unwrap()
            .insert(id.to_string(), activatable);
    }
}

impl ExtensionLoader for TestLoader {
    fn load(&self, id: &str, _entry: &Path) -> Result<Arc<dyn Activatable>> {
        Ok(self
            .registered
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Arc::new(CountingExtension::default())))
    }
}

/// Test fixture bundling the registry with its collaborators
pub struct Fixture {
    pub root: TempDir,
    pub host: Arc<MockHost>,
    pub loader: Arc<TestLoader>,
    pub registry: ExtensionRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let host = MockHost::new();
        let loader = TestLoader::new();
        let env = RuntimeEnv::with_root(root.path().to_path_buf(), Version::new(0, 0, 5));
        let registry = ExtensionRegistry::new(
            env,
            host.clone() as Arc<dyn WorkspaceHost>,
            loader.clone() as Arc<dyn ExtensionLoader>,
        )
        .unwrap();
        Self {
            root,
            host,
            loader,
            registry,
        }
    }

    /// Re-open a registry over the same root, as after a host restart
    pub fn reopen(&self) -> ExtensionRegistry {
        let env = RuntimeEnv::with_root(self.root.path().to_path_buf(), Version::new(0, 0, 5));
        ExtensionRegistry::new(
            env,
            self.host.clone() as Arc<dyn WorkspaceHost>,
            self.loader.clone() as Arc<dyn ExtensionLoader>,
        )
        .unwrap()
    }

    /// Write an extension directory under the managed root
    pub fn write_extension(&self, name: &str, version: &str, events: &[&str]) -> PathBuf {
        write_extension_at(self.root.path(), name, version, events)
    }
}

/// Write an extension directory with a manifest
pub fn write_extension_at(parent: &Path, name: &str, version: &str, events: &[&str]) -> PathBuf {
    let dir = parent.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let manifest = json!({
        "name": name,
        "version": version,
        "engines": { "quill": "*" },
        "activationEvents": events,
    });
    std::fs::write(dir.join("package.json"), manifest.to_string()).unwrap();
    dir
}

/// Poll until the record reaches the wanted state
pub async fn wait_for_state(registry: &ExtensionRegistry, id: &str, state: ExtensionState) {
    for _ in 0..100 {
        if registry.state(id) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{id} never reached {state:?}, currently {:?}",
        registry.state(id)
    );
}
