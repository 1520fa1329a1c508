//! End-to-end build API used by the CLI.
//!
//! Wires the stores, sandbox and mount manager together and runs a build
//! from script to exported artifact.

use crate::builder::cache::CacheManager;
use crate::builder::cas::CasStore;
use crate::builder::executor::{Executor, ExecutorOptions, FinalResult};
use crate::builder::export::{self, ExportedArtifact, Exporter, SharedWriter};
use crate::builder::graph::OperationGraph;
use crate::builder::matrix;
use crate::builder::mounts::MountManager;
use crate::builder::options::{OutputSpec, SecretSpec, SshSpec};
use crate::builder::parser;
use crate::builder::platform::Platform;
use crate::builder::sandbox::{ProcessSandbox, Sandbox};
use crate::builder::store::{BaseImageSource, ImageStore};
use crate::config::Config;
use crate::error::{ImgError, Result};
use crate::paths;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Where the build script comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptSource {
    /// `Dockerfile` at the root of the context.
    ContextDefault,
    /// A file; relative paths resolve against the current directory.
    File(PathBuf),
    /// Script text, e.g. read from stdin.
    Inline(String),
}

/// Options for building an image.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Path to the build context directory
    pub context_path: PathBuf,

    pub script: ScriptSource,

    /// Build arguments (ARG values)
    pub build_args: BTreeMap<String, String>,

    /// Target build stage for multi-stage builds
    pub target: Option<String>,

    /// Platforms to build; empty builds for the host
    pub platforms: Vec<Platform>,

    pub secrets: Vec<SecretSpec>,
    pub ssh: Vec<SshSpec>,

    /// Labels for the final image only
    pub labels: BTreeMap<String, String>,

    pub output: OutputSpec,

    /// Skip cache lookups
    pub no_cache: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            context_path: PathBuf::from("."),
            script: ScriptSource::ContextDefault,
            build_args: BTreeMap::new(),
            target: None,
            platforms: Vec::new(),
            secrets: Vec::new(),
            ssh: Vec::new(),
            labels: BTreeMap::new(),
            output: OutputSpec::image(Vec::new()),
            no_cache: false,
        }
    }
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildReport {
    pub artifact: ExportedArtifact,
    /// One result per platform, in request order.
    pub results: Vec<FinalResult>,
    pub duration_secs: f64,
}

impl BuildReport {
    pub fn cached_layers(&self) -> usize {
        self.results.iter().map(|r| r.stats.cached_layers).sum()
    }

    pub fn executed_steps(&self) -> usize {
        self.results.iter().map(|r| r.stats.executed_steps).sum()
    }
}

/// Outcome of `img prune`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub cache_entries: usize,
    pub blobs: usize,
}

/// Builder bound to a state directory.
pub struct Builder {
    config: Config,
    blobs: Arc<CasStore>,
    cache: Arc<CacheManager>,
    images: Arc<ImageStore>,
    sandbox: Arc<dyn Sandbox>,
    base_images: Arc<dyn BaseImageSource>,
    stdout: Option<SharedWriter>,
}

impl Builder {
    /// Opens the stores under the configured state directory.
    pub fn open(config: Config) -> Result<Self> {
        let state = config.state_path();
        let io_err = |source| ImgError::IoError { path: state.clone(), source };

        let blobs = Arc::new(CasStore::new(&state).map_err(io_err)?);
        let cache = Arc::new(CacheManager::new(paths::cache_dir(&state), config.cache_size_limit_bytes)?);
        let images = Arc::new(ImageStore::open(&state, blobs.clone()).map_err(io_err)?);
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox_runner.clone()));

        debug!(state = %state.display(), "Opened builder state");
        Ok(Self { config, blobs, cache, base_images: images.clone(), images, sandbox, stdout: None })
    }

    /// Replaces the sandbox RUN steps execute in.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Replaces where `FROM <image>` is resolved.
    pub fn with_base_images(mut self, source: Arc<dyn BaseImageSource>) -> Self {
        self.base_images = source;
        self
    }

    /// Replaces where `dest=-` archives go.
    pub fn with_stdout(mut self, writer: SharedWriter) -> Self {
        self.stdout = Some(writer);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Builds and exports an image.
    ///
    /// 1. Normalizes the script and builds the operation graph
    /// 2. Validates the output against the platform set
    /// 3. Runs the graph for every platform
    /// 4. Exports the results
    #[instrument(skip_all, fields(build_id = %uuid::Uuid::new_v4(), output = %options.output.kind))]
    pub async fn build(&self, options: BuildOptions) -> Result<BuildReport> {
        let start = Instant::now();
        info!(context = %options.context_path.display(), "Starting build");

        let context_path = options
            .context_path
            .canonicalize()
            .map_err(|source| ImgError::FileReadError { path: options.context_path.display().to_string(), source })?;

        // Phase 1: script and graph
        let script = read_script(&context_path, &options.script)?;
        let stages = parser::normalize(&script, &options.build_args)?;
        let graph = OperationGraph::build(&stages)?;
        let target = graph.target_stage(options.target.as_deref())?.index;
        info!(stages = stages.len(), nodes = graph.nodes.len(), target, "Build graph ready");

        // Phase 2: validate the output before doing any work
        let platforms = if options.platforms.is_empty() { vec![Platform::host()] } else { options.platforms.clone() };
        export::validate(&options.output, platforms.len())?;

        // Phase 3: execute per platform
        let agent_socket = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from);
        let state = self.config.state_path();
        let mounts = Arc::new(
            MountManager::new(&options.secrets, &options.ssh, agent_socket.as_deref())?
                .with_temp_dir(paths::scratch_dir(&state)),
        );

        let executor = Executor::new(
            self.blobs.clone(),
            self.cache.clone(),
            self.sandbox.clone(),
            mounts,
            self.base_images.clone(),
            ExecutorOptions {
                max_workers: self.config.max_workers,
                no_cache: options.no_cache,
                context_dir: context_path.clone(),
                scratch_dir: paths::scratch_dir(&state),
                labels: options.labels.clone(),
            },
        );

        let outcome = matrix::run(&executor, Arc::new(graph), target, &platforms).await;
        let results = outcome.into_results().map_err(|e| {
            for done in &e.completed {
                warn!(platform = %done.platform, layers = done.stats.layer_count, "Platform built but not exported");
            }
            ImgError::Matrix(e)
        })?;

        // Phase 4: export
        let mut exporter = Exporter::new(self.blobs.clone(), self.images.clone(), paths::scratch_dir(&state));
        if let Some(writer) = &self.stdout {
            exporter = exporter.with_stdout(writer.clone());
        }
        let output = options.output.clone();
        let (artifact, results) = tokio::task::spawn_blocking(move || {
            let artifact = exporter.export(&results, &output);
            (artifact, results)
        })
        .await
        .map_err(ImgError::internal)?;
        let artifact = artifact?;

        let duration_secs = start.elapsed().as_secs_f64();
        info!(artifact = %artifact, duration_secs, "Build complete");
        Ok(BuildReport { artifact, results, duration_secs })
    }

    /// Clears the build cache and removes blobs no named image references.
    pub fn prune(&self) -> Result<PruneStats> {
        let cache_entries = self.cache.clear()?;
        let referenced = self.images.referenced_blobs()?;
        let blobs = self
            .blobs
            .gc(&referenced)
            .map_err(|source| ImgError::IoError { path: self.config.state_path(), source })?;

        info!(cache_entries, blobs, "Pruned build state");
        Ok(PruneStats { cache_entries, blobs })
    }
}

fn read_script(context: &Path, source: &ScriptSource) -> Result<String> {
    let path = match source {
        ScriptSource::Inline(text) => return Ok(text.clone()),
        ScriptSource::ContextDefault => context.join("Dockerfile"),
        ScriptSource::File(path) if path.is_absolute() => path.clone(),
        ScriptSource::File(path) => std::env::current_dir()
            .map_err(|source| ImgError::FileReadError { path: path.display().to_string(), source })?
            .join(path),
    };
    std::fs::read_to_string(&path).map_err(|source| ImgError::FileReadError { path: path.display().to_string(), source })
}
