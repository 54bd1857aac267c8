//! Error types for the Quill extension runtime

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using quill-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared across the runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Manifest is unreadable or missing required fields
    #[error("Invalid manifest at {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    /// Host version does not satisfy the extension's engine range
    #[error("{id} requires engine range {required}, host version is {host}")]
    IncompatibleHost {
        id: String,
        required: String,
        host: String,
    },

    /// Manifest declares no host-engine compatibility at all
    #[error("{id} is not a valid extension: no \"quill\" key under engines")]
    MissingEngine { id: String },

    /// URL install source other than github.com
    #[error("Unsupported source url: {url}, only github.com links are supported")]
    UnsupportedSource { url: String },

    /// Registry lookup miss (unknown package or version)
    #[error("Extension not found: {spec}")]
    NotFound { spec: String },

    /// Non-success HTTP status from a remote endpoint
    #[error("HTTP {code} from {url}")]
    HttpStatus { code: u16, url: String },

    /// Response is neither a gzipped tarball nor a zip archive
    #[error("Unsupported archive format: {hint}")]
    UnsupportedArchive { hint: String },

    /// Secondary dependency install exited non-zero
    #[error("{program} exited with {code}: {stderr}")]
    Subprocess {
        program: String,
        code: i32,
        stderr: String,
    },

    /// Extension is disabled; activation refused
    #[error("Extension {id} is disabled")]
    Disabled { id: String },

    /// No record exists for this id
    #[error("Extension {id} is not registered")]
    NotRegistered { id: String },

    /// Exports object has no such method
    #[error("Extension {id} exports no method named {method}")]
    MethodNotFound { id: String, method: String },

    /// Download destination exists and is not a directory
    #[error("Invalid download destination: {path}")]
    InvalidDestination { path: PathBuf },

    /// Operation was cancelled via its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid semantic version or range
    #[error("Invalid version format: {0}")]
    Semver(#[from] semver::Error),

    /// Anything without a dedicated variant
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid manifest error
    pub fn invalid_manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a registry lookup miss
    pub fn not_found(spec: impl Into<String>) -> Self {
        Self::NotFound { spec: spec.into() }
    }

    /// Create a disabled-extension error
    pub fn disabled(id: impl Into<String>) -> Self {
        Self::Disabled { id: id.into() }
    }

    /// Create a not-registered error
    pub fn not_registered(id: impl Into<String>) -> Self {
        Self::NotRegistered { id: id.into() }
    }

    /// Create a generic error from a message
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}
