//! # quill-core
//!
//! Core library for the Quill extension runtime providing:
//! - Package manifest parsing (package.json) and validation
//! - The root dependency manifest (the source of truth for managed extensions)
//! - Persistent key-value state (disabled/locked flags, mementos)
//! - Runtime environment resolution (managed root, toggles, host version)
//! - Typed event emitters with disposable subscriptions

pub mod deps;
pub mod env;
pub mod error;
pub mod event;
pub mod manifest;
pub mod store;

pub use deps::DependencyManifest;
pub use env::RuntimeEnv;
pub use error::{Error, Result};
pub use event::{Disposable, Emitter};
pub use manifest::{PackageManifest, ENGINE_KEY};
pub use store::{KvStore, Memento};
