//! Package installer for the Quill extension runtime
//!
//! This crate handles:
//! - Streaming HTTP downloads with tar/zip extraction and percent progress
//! - The registry metadata protocol and GitHub source resolution
//! - Extension installation, update, and the delegated dependency install
//! - Batch installs with bounded concurrency and per-item progress tracking

pub mod download;
pub mod installer;
pub mod queue;
pub mod registry;

pub use download::{DownloadOptions, Downloader, ExtractMode};
pub use installer::{InstallJob, Installer};
pub use queue::{BatchResult, InstallQueue, ItemStatus, ProgressEntry, ProgressSurface};
pub use registry::{GithubResolver, RegistryClient, DEFAULT_REGISTRY};
