//! Image building system for img.
//!
//! This module provides script normalization, operation graph construction,
//! cache-aware execution, multi-platform builds and output sinks.

pub mod build;
pub mod cache;
pub mod cas;
pub mod executor;
pub mod export;
pub mod graph;
pub mod image;
pub mod layer;
pub mod matrix;
pub mod mounts;
pub mod options;
pub mod parser;
pub mod platform;
pub mod sandbox;
pub mod store;

pub use build::{BuildOptions, BuildReport, Builder, PruneStats, ScriptSource};
pub use cache::{CacheError, CacheKey, CacheLookupResult, CacheManager};
pub use cas::{BlobStore, CasStore};
pub use executor::{BuildStats, ExecutionError, Executor, ExecutorOptions, FinalResult, StepError};
pub use export::{ExportError, ExportedArtifact, Exporter, SharedWriter};
pub use graph::{BuildError, NodeId, OperationGraph, OperationNode};
pub use matrix::{MatrixError, MatrixOutcome};
pub use mounts::{MountError, MountManager, ScopedMounts};
pub use options::{OutputKind, OutputSpec, SecretSpec, SshSpec};
pub use parser::{normalize, ParseError, Stage};
pub use platform::Platform;
pub use sandbox::{ProcessSandbox, RunOutcome, RunRequest, Sandbox, SandboxError};
pub use store::{BaseImageSource, ImageStore, StoreError};
