//! Error types for img.
//!
//! Each builder layer has its own `thiserror` enum; [`ImgError`] wraps them
//! for callers that drive a whole build.

use crate::builder::cache::CacheError;
use crate::builder::executor::ExecutionError;
use crate::builder::export::ExportError;
use crate::builder::graph::BuildError;
use crate::builder::matrix::MatrixError;
use crate::builder::mounts::MountError;
use crate::builder::options::OptionError;
use crate::builder::parser::ParseError;
use crate::builder::platform::PlatformParseError;
use crate::builder::sandbox::SandboxError;
use crate::builder::store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for img operations.
pub type Result<T> = std::result::Result<T, ImgError>;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Main error type for img.
#[derive(Error, Debug)]
pub enum ImgError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Graph(#[from] BuildError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Option(#[from] OptionError),

    #[error(transparent)]
    Platform(#[from] PlatformParseError),

    #[error("File read error: {path}: {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImgError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}
