//! Host collaborator interfaces and the activatable capability seam
//!
//! The registry never depends on how extension code is materialized or how
//! the host renders anything. Extensions are [`Activatable`] values produced
//! by a pluggable [`ExtensionLoader`] (a dynamic-library loader, a
//! subprocess-per-extension host, an embedded interpreter), and every
//! outward-facing concern goes through the narrow [`WorkspaceHost`] trait.

use crate::types::DocumentInfo;
use async_trait::async_trait;
use quill_core::{Disposable, Memento, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Message severity for host notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Context handed to an extension's activation entry point
#[derive(Clone)]
pub struct ActivationContext {
    /// Extension id
    pub id: String,

    /// Extension root directory (the entry file's directory for single-file
    /// extensions)
    pub root: PathBuf,

    /// Durable extension-scoped state
    pub memento: Memento,
}

/// Capability object exposed by an active extension
pub trait ExtensionExports: Send + Sync {
    /// Invoke a named export as a method
    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value>;
}

/// An extension's activation entry point
#[async_trait]
pub trait Activatable: Send + Sync {
    /// Run the entry point; the returned capability object becomes readable
    /// through the registry once activation completes
    async fn activate(&self, ctx: ActivationContext) -> anyhow::Result<Arc<dyn ExtensionExports>>;

    /// Optional teardown, invoked on deactivation
    async fn deactivate(&self) {}
}

/// Materializes an [`Activatable`] from an entry file
pub trait ExtensionLoader: Send + Sync {
    fn load(&self, id: &str, entry: &Path) -> Result<Arc<dyn Activatable>>;
}

/// Listener callback types used by [`WorkspaceHost`]
pub type DocumentListener = Arc<dyn Fn(&DocumentInfo) + Send + Sync>;
pub type WorkspaceListener = Arc<dyn Fn(&[PathBuf]) + Send + Sync>;
pub type CommandListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Narrow interface to the host application
///
/// Covers exactly what the runtime consumes: the current documents and
/// workspace roots, change notifications, command registration, and message
/// display. Everything else the host does is invisible here.
pub trait WorkspaceHost: Send + Sync {
    /// Documents currently open in the host
    fn open_documents(&self) -> Vec<DocumentInfo>;

    /// Current workspace root directories
    fn workspace_roots(&self) -> Vec<PathBuf>;

    /// Subscribe to document-open notifications
    fn on_document_open(&self, listener: DocumentListener) -> Disposable;

    /// Subscribe to workspace-root changes
    fn on_workspace_change(&self, listener: WorkspaceListener) -> Disposable;

    /// Make a command name known to the host's palette
    fn register_command(&self, name: &str);

    /// Subscribe to command invocations
    fn on_command(&self, listener: CommandListener) -> Disposable;

    /// Display a message to the user
    fn show_message(&self, level: MessageLevel, text: &str);
}
