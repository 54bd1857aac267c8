//! Extension lifecycle runtime for Quill
//!
//! This crate handles:
//! - The extension registry: load, activate (single-flight), deactivate,
//!   reload, toggle, uninstall, clean
//! - Declarative activation-event routing with one-shot triggers
//! - Persisted disabled/locked state
//! - Lifecycle event notifications
//! - Batch auto-update orchestration feeding back into the registry

pub mod activation;
pub mod events;
pub mod host;
pub mod registry;
pub mod types;
pub mod updater;

pub use activation::{parse_event, ActivationEvent, ActivationRouter};
pub use events::LifecycleEvent;
pub use host::{
    Activatable, ActivationContext, ExtensionExports, ExtensionLoader, MessageLevel,
    WorkspaceHost,
};
pub use registry::ExtensionRegistry;
pub use types::{DocumentInfo, ExtensionInfo, ExtensionKind, ExtensionState};
pub use updater::AutoUpdater;
