//! Activation event routing
//!
//! Each extension declares trigger conditions in its manifest; the router
//! wires one-shot listeners against the host so activation stays lazy:
//! - `onLanguage:<id>` / `onFileSystem:<scheme>`: fire when a matching
//!   document is already open or on the first matching open
//! - `onCommand:<name>`: fire on first invocation, with a short settle delay
//!   so the extension can register its handlers before the host re-dispatches
//! - `workspaceContains:<globs>`: fire when any root contains a match, now or
//!   after a workspace change
//! - an empty list or `*`: fire immediately at registration
//!
//! Every trigger disposes itself once it fires; the registry owns the
//! returned handles and disposes them together when the extension is
//! unloaded or disabled.

use crate::host::WorkspaceHost;
use crate::types::DocumentInfo;
use futures::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use quill_core::Disposable;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Settle delay after command-triggered activation
const COMMAND_SETTLE: Duration = Duration::from_millis(300);

/// Depth limit when scanning workspace roots for `workspaceContains` globs
const SCAN_DEPTH: usize = 5;

/// Deferred activation callback; the router spawns the returned future
pub type TriggerFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Parsed activation trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationEvent {
    /// Literal `*`: activate at registration time
    Immediate,

    /// `onLanguage:<id>`
    Language(String),

    /// `onCommand:<name>`
    Command(String),

    /// `workspaceContains:<space-separated glob list>`
    WorkspaceContains(Vec<String>),

    /// `onFileSystem:<scheme>`
    FileSystem(String),
}

/// Parse one declared event; unknown kinds yield `None`
pub fn parse_event(raw: &str) -> Option<ActivationEvent> {
    let raw = raw.trim();
    if raw == "*" {
        return Some(ActivationEvent::Immediate);
    }
    let (kind, value) = raw.split_once(':')?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match kind {
        "onLanguage" => Some(ActivationEvent::Language(value.to_string())),
        "onCommand" => Some(ActivationEvent::Command(value.to_string())),
        "onFileSystem" => Some(ActivationEvent::FileSystem(value.to_string())),
        "workspaceContains" => Some(ActivationEvent::WorkspaceContains(
            value.split_whitespace().map(str::to_string).collect(),
        )),
        _ => None,
    }
}

/// Routes declared activation events to one-shot host subscriptions
pub struct ActivationRouter {
    host: Arc<dyn WorkspaceHost>,
    trigger: TriggerFn,
}

impl ActivationRouter {
    pub fn new(host: Arc<dyn WorkspaceHost>, trigger: TriggerFn) -> Self {
        Self { host, trigger }
    }

    /// Wire triggers for an extension's declared events
    ///
    /// Returns the subscriptions to own plus whether the extension must be
    /// activated immediately (empty list, `*`, or an already-true condition).
    pub fn wire(&self, id: &str, declared: &[String]) -> (Vec<Disposable>, bool) {
        if declared.is_empty() {
            return (Vec::new(), true);
        }

        let mut subscriptions = Vec::new();
        let mut immediate = false;

        for raw in declared {
            let Some(event) = parse_event(raw) else {
                warn!("Unknown activation event {raw:?} declared by {id}");
                continue;
            };
            match event {
                ActivationEvent::Immediate => immediate = true,
                ActivationEvent::Language(language) => {
                    if self
                        .host
                        .open_documents()
                        .iter()
                        .any(|doc| doc.language == language)
                    {
                        immediate = true;
                    } else {
                        subscriptions.push(self.on_matching_document(id, move |doc| {
                            doc.language == language
                        }));
                    }
                }
                ActivationEvent::FileSystem(scheme) => {
                    if self
                        .host
                        .open_documents()
                        .iter()
                        .any(|doc| doc.scheme == scheme)
                    {
                        immediate = true;
                    } else {
                        subscriptions.push(
                            self.on_matching_document(id, move |doc| doc.scheme == scheme),
                        );
                    }
                }
                ActivationEvent::Command(name) => {
                    self.host.register_command(&name);
                    subscriptions.push(self.on_command(id, name));
                }
                ActivationEvent::WorkspaceContains(patterns) => {
                    match build_globset(&patterns) {
                        Ok(set) => {
                            let roots = self.host.workspace_roots();
                            if roots.iter().any(|root| root_contains(root, &set)) {
                                immediate = true;
                            } else {
                                subscriptions.push(self.on_workspace_match(id, set));
                            }
                        }
                        Err(e) => {
                            warn!("Invalid workspaceContains patterns for {id}: {e}");
                        }
                    }
                }
            }
        }

        (subscriptions, immediate)
    }

    /// One-shot document listener: stays subscribed until the first match,
    /// then activates and disposes itself
    fn on_matching_document(
        &self,
        id: &str,
        matches: impl Fn(&DocumentInfo) -> bool + Send + Sync + 'static,
    ) -> Disposable {
        let id = id.to_string();
        let trigger = Arc::clone(&self.trigger);
        let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));

        let slot_inner = Arc::clone(&slot);
        let subscription = self.host.on_document_open(Arc::new(move |doc| {
            if !matches(doc) {
                return;
            }
            debug!("Document trigger fired for {id}");
            tokio::spawn(trigger(id.clone()));
            if let Some(mut sub) = slot_inner.lock().expect("trigger slot poisoned").take() {
                sub.dispose();
            }
        }));
        *slot.lock().expect("trigger slot poisoned") = Some(subscription);

        Disposable::new(move || {
            if let Some(mut sub) = slot.lock().expect("trigger slot poisoned").take() {
                sub.dispose();
            }
        })
    }

    fn on_command(&self, id: &str, name: String) -> Disposable {
        let id = id.to_string();
        let trigger = Arc::clone(&self.trigger);
        let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));

        let slot_inner = Arc::clone(&slot);
        let subscription = self.host.on_command(Arc::new(move |invoked| {
            if invoked != name {
                return;
            }
            debug!("Command trigger fired for {id}");
            let activation = trigger(id.clone());
            tokio::spawn(async move {
                activation.await;
                tokio::time::sleep(COMMAND_SETTLE).await;
            });
            if let Some(mut sub) = slot_inner.lock().expect("trigger slot poisoned").take() {
                sub.dispose();
            }
        }));
        *slot.lock().expect("trigger slot poisoned") = Some(subscription);

        Disposable::new(move || {
            if let Some(mut sub) = slot.lock().expect("trigger slot poisoned").take() {
                sub.dispose();
            }
        })
    }

    fn on_workspace_match(&self, id: &str, set: GlobSet) -> Disposable {
        let id = id.to_string();
        let trigger = Arc::clone(&self.trigger);
        let slot: Arc<Mutex<Option<Disposable>>> = Arc::new(Mutex::new(None));

        let slot_inner = Arc::clone(&slot);
        let subscription = self.host.on_workspace_change(Arc::new(move |roots| {
            if !roots.iter().any(|root| root_contains(root, &set)) {
                return;
            }
            debug!("Workspace trigger fired for {id}");
            tokio::spawn(trigger(id.clone()));
            if let Some(mut sub) = slot_inner.lock().expect("trigger slot poisoned").take() {
                sub.dispose();
            }
        }));
        *slot.lock().expect("trigger slot poisoned") = Some(subscription);

        Disposable::new(move || {
            if let Some(mut sub) = slot.lock().expect("trigger slot poisoned").take() {
                sub.dispose();
            }
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

/// Whether any entry under `root` (bounded depth) matches the glob set,
/// by relative path or bare file name
fn root_contains(root: &Path, set: &GlobSet) -> bool {
    WalkDir::new(root)
        .max_depth(SCAN_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            set.is_match(rel) || set.is_match(entry.file_name())
        })
}
