//! Cache-aware execution of an operation graph for one platform.
//!
//! Nodes run as soon as their inputs are done, bounded by a worker
//! semaphore. Each RUN and COPY node first consults the layer cache; misses
//! are executed and their layer stored and recorded. The first failure
//! cancels everything still in flight.

use crate::builder::cache::{CacheError, CacheKey, CacheLookupResult, CacheManager};
use crate::builder::cas::BlobStore;
use crate::builder::graph::{BaseSource, CopyOrigin, NodeId, NodeKind, NodeOrigin, OperationGraph, OperationNode};
use crate::builder::image::{ImageConfig, LayerRef, RootFs};
use crate::builder::layer::{self, Owner};
use crate::builder::mounts::{MountError, MountManager};
use crate::builder::platform::Platform;
use crate::builder::sandbox::{self, RunRequest, Sandbox, SandboxError};
use crate::builder::store::{BaseImageSource, StoreError};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Failure of a single node.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Command `{command}` exited with code {exit_code}\n{output}")]
    CommandFailed { command: String, exit_code: i32, output: String },

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Base image error: {0}")]
    BaseImage(#[from] StoreError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Layer {0} is missing from the blob store")]
    MissingBlob(String),

    #[error("Build task failed: {0}")]
    Task(String),
}

/// A failed build for one platform, located at the node that failed.
#[derive(Debug, thiserror::Error)]
pub struct ExecutionError {
    pub platform: Platform,
    /// Stage, instruction and line of the failing node; `None` for failures outside any node.
    pub origin: Option<NodeOrigin>,
    #[source]
    pub source: StepError,
}

impl ExecutionError {
    fn new(platform: &Platform, origin: Option<NodeOrigin>, source: StepError) -> Self {
        Self { platform: platform.clone(), origin, source }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "[{}] {}: {}", self.platform, origin, self.source),
            None => write!(f, "[{}] {}", self.platform, self.source),
        }
    }
}

/// Lifecycle of a node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    CacheHit,
    Done,
    Failed,
}

/// Build statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStats {
    /// Total build time (seconds)
    pub duration_secs: f64,
    /// Number of layers in the final filesystem
    pub layer_count: usize,
    /// Steps served from the cache
    pub cached_layers: usize,
    /// Steps actually executed
    pub executed_steps: usize,
    /// Total size of all layers (bytes)
    pub total_size: u64,
}

/// Filesystem and config of the target stage for one platform.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub platform: Platform,
    pub rootfs: RootFs,
    pub config: ImageConfig,
    pub stats: BuildStats,
}

/// Settings for an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Upper bound on concurrently running nodes.
    pub max_workers: usize,
    /// Skip cache lookups. Results are still recorded.
    pub no_cache: bool,
    /// Directory COPY reads from.
    pub context_dir: PathBuf,
    /// Where root filesystems are materialized.
    pub scratch_dir: PathBuf,
    /// `--label` values, applied to the target stage's config only.
    pub labels: BTreeMap<String, String>,
}

/// How a node's result came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Resolved,
    Cached,
    Executed,
}

/// Result of a finished node.
#[derive(Debug)]
struct NodeResult {
    key: CacheKey,
    rootfs: RootFs,
    /// Config of the stage's base image; carried along primary inputs.
    base_config: Arc<ImageConfig>,
    outcome: Outcome,
}

/// Executes operation graphs against shared stores.
#[derive(Clone)]
pub struct Executor {
    blobs: Arc<dyn BlobStore>,
    cache: Arc<CacheManager>,
    sandbox: Arc<dyn Sandbox>,
    mounts: Arc<MountManager>,
    images: Arc<dyn BaseImageSource>,
    options: Arc<ExecutorOptions>,
}

impl Executor {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        cache: Arc<CacheManager>,
        sandbox: Arc<dyn Sandbox>,
        mounts: Arc<MountManager>,
        images: Arc<dyn BaseImageSource>,
        options: ExecutorOptions,
    ) -> Self {
        Self { blobs, cache, sandbox, mounts, images, options: Arc::new(options) }
    }

    /// Builds the stage `target_stage` for `platform`.
    ///
    /// Only the nodes the target depends on are executed.
    #[instrument(skip_all, fields(platform = %platform, stage = target_stage))]
    pub async fn execute(
        &self,
        graph: Arc<OperationGraph>,
        target_stage: usize,
        platform: Platform,
    ) -> Result<FinalResult, ExecutionError> {
        let start = Instant::now();
        let stage = graph.stages.get(target_stage).ok_or_else(|| {
            ExecutionError::new(&platform, None, StepError::Task(format!("no stage with index {}", target_stage)))
        })?;
        let target = stage.output;
        let needed = graph.ancestors_of(target);

        let mut states: HashMap<NodeId, NodeState> = needed.iter().map(|id| (*id, NodeState::Pending)).collect();
        let mut waiting: HashMap<NodeId, usize> = HashMap::new();
        let mut ready = VecDeque::new();
        for id in &needed {
            let inputs: BTreeSet<NodeId> = graph.dependencies(*id).iter().copied().collect();
            if inputs.is_empty() {
                ready.push_back(*id);
            } else {
                waiting.insert(*id, inputs.len());
            }
        }

        info!(nodes = needed.len(), target = %target, "Executing build graph");

        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut results: HashMap<NodeId, Arc<NodeResult>> = HashMap::new();
        let mut tasks: JoinSet<(NodeId, Result<NodeResult, StepError>)> = JoinSet::new();
        let mut stats = BuildStats::default();

        loop {
            while let Some(id) = ready.pop_front() {
                transition(&mut states, id, NodeState::Ready, &platform);

                let node = graph.node(id);
                let mut inputs = Vec::with_capacity(node.inputs.len());
                for input in &node.inputs {
                    match results.get(input) {
                        Some(result) => inputs.push(result.clone()),
                        None => {
                            let err = StepError::Task(format!("input {} of {} has no result", input, id));
                            return Err(self.abort(&mut tasks, &graph, id, &platform, err).await);
                        }
                    }
                }

                let executor = self.clone();
                let graph = graph.clone();
                let platform = platform.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => return (id, Err(StepError::Task(e.to_string()))),
                    };
                    let result = executor.run_node(graph.node(id), &inputs, &platform).await;
                    (id, result)
                });
            }

            let Some(joined) = tasks.join_next().await else { break };
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(ExecutionError::new(&platform, None, StepError::Task(e.to_string())));
                }
            };

            let result = match result {
                Ok(result) => result,
                Err(err) => return Err(self.abort(&mut tasks, &graph, id, &platform, err).await),
            };

            match result.outcome {
                Outcome::Cached => {
                    stats.cached_layers += 1;
                    transition(&mut states, id, NodeState::CacheHit, &platform);
                }
                Outcome::Executed => {
                    stats.executed_steps += 1;
                    transition(&mut states, id, NodeState::Done, &platform);
                }
                Outcome::Resolved => transition(&mut states, id, NodeState::Done, &platform),
            }
            results.insert(id, Arc::new(result));

            let dependents: BTreeSet<NodeId> = graph.dependents(id).iter().copied().collect();
            for dependent in dependents {
                if let Some(count) = waiting.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        waiting.remove(&dependent);
                        ready.push_back(dependent);
                    }
                }
            }
        }

        let final_node = results.get(&target).ok_or_else(|| {
            let stuck: Vec<String> = waiting.keys().map(|id| id.to_string()).collect();
            ExecutionError::new(
                &platform,
                Some(graph.node(target).origin.clone()),
                StepError::Task(format!("nodes never became ready: {}", stuck.join(", "))),
            )
        })?;

        stats.layer_count = final_node.rootfs.layers.len();
        stats.total_size = final_node.rootfs.size();
        stats.duration_secs = start.elapsed().as_secs_f64();

        info!(
            layers = stats.layer_count,
            cached = stats.cached_layers,
            executed = stats.executed_steps,
            duration_secs = stats.duration_secs,
            "Build graph complete"
        );

        let mut config = ImageConfig::from_stage(&final_node.base_config, &stage.config);
        config.labels.extend(self.options.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        Ok(FinalResult { platform: platform.clone(), rootfs: final_node.rootfs.clone(), config, stats })
    }

    /// Cancels in-flight nodes and wraps the failure of `id`.
    async fn abort(
        &self,
        tasks: &mut JoinSet<(NodeId, Result<NodeResult, StepError>)>,
        graph: &OperationGraph,
        id: NodeId,
        platform: &Platform,
        err: StepError,
    ) -> ExecutionError {
        let origin = graph.node(id).origin.clone();
        warn!(platform = %platform, node = %id, state = ?NodeState::Failed, origin = %origin, error = %err, "Step failed");

        let in_flight = tasks.len();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        if in_flight > 0 {
            debug!(cancelled = in_flight, "Cancelled in-flight steps");
        }

        ExecutionError::new(platform, Some(origin), err)
    }

    async fn run_node(
        &self,
        node: &OperationNode,
        inputs: &[Arc<NodeResult>],
        platform: &Platform,
    ) -> Result<NodeResult, StepError> {
        let platform_key = node.platform_dependent.then(|| platform.to_string());
        let input_keys: Vec<&CacheKey> = inputs.iter().map(|r| &r.key).collect();

        let primary = match &node.kind {
            NodeKind::Base { source: BaseSource::Scratch } => {
                return Ok(NodeResult {
                    key: CacheKey::compute(&node.identity, platform_key.as_deref(), &[], None),
                    rootfs: RootFs::default(),
                    base_config: Arc::default(),
                    outcome: Outcome::Resolved,
                });
            }
            NodeKind::Base { source: BaseSource::Image { reference, platform: pinned } } => {
                let wanted = pinned.as_ref().unwrap_or(platform);
                let resolved = self.images.resolve(reference, wanted).await?;
                return Ok(NodeResult {
                    key: CacheKey::compute(&node.identity, platform_key.as_deref(), &[], Some(&resolved.digest)),
                    rootfs: resolved.rootfs,
                    base_config: Arc::new(resolved.config),
                    outcome: Outcome::Resolved,
                });
            }
            NodeKind::Run { .. } | NodeKind::Copy { .. } => inputs
                .first()
                .ok_or_else(|| StepError::Task(format!("{} has no input filesystem", node.id)))?,
        };

        let extra = match &node.kind {
            NodeKind::Copy { origin: CopyOrigin::Context, sources, .. } => {
                let context = self.options.context_dir.clone();
                let sources = sources.clone();
                Some(blocking(move || Ok(layer::content_digest(&context, &sources)?)).await?)
            }
            _ => None,
        };
        let key = CacheKey::compute(&node.identity, platform_key.as_deref(), &input_keys, extra.as_deref());

        if !self.options.no_cache {
            if let Some(layer) = self.cached_layer(&key)? {
                debug!(node = %node.id, key = %key.short(), "Cache hit");
                return Ok(NodeResult {
                    key,
                    rootfs: primary.rootfs.with_layer(layer),
                    base_config: primary.base_config.clone(),
                    outcome: Outcome::Cached,
                });
            }
        }

        debug!(node = %node.id, kind = node.kind.name(), state = ?NodeState::Running, origin = %node.origin, "Running step");
        let layer = match &node.kind {
            NodeKind::Copy { .. } => self.copy_step(node, inputs).await?,
            _ => self.run_step(node, primary, platform).await?,
        };

        self.cache.insert(&key, layer.clone(), describe(node), &platform.to_string())?;

        Ok(NodeResult {
            key,
            rootfs: primary.rootfs.with_layer(layer),
            base_config: primary.base_config.clone(),
            outcome: Outcome::Executed,
        })
    }

    /// Returns the cached layer for `key` if both the entry and its blob exist.
    fn cached_layer(&self, key: &CacheKey) -> Result<Option<LayerRef>, StepError> {
        match self.cache.lookup(key)? {
            CacheLookupResult::Hit(entry) if self.blobs.contains(&entry.layer.digest) => Ok(Some(entry.layer)),
            CacheLookupResult::Hit(entry) => {
                warn!(key = %key.short(), digest = %entry.layer.digest, "Cached layer blob is gone, rebuilding");
                Ok(None)
            }
            CacheLookupResult::Miss => Ok(None),
        }
    }

    async fn run_step(&self, node: &OperationNode, primary: &NodeResult, platform: &Platform) -> Result<LayerRef, StepError> {
        let NodeKind::Run { argv, env, user, workdir, mounts } = &node.kind else {
            return Err(StepError::Task(format!("{} is not a RUN step", node.id)));
        };

        let scoped = self.mounts.acquire(mounts).await?;

        let base = &primary.base_config;
        let mut environment = base.env.clone();
        environment.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut request = RunRequest {
            rootfs: PathBuf::new(),
            argv: argv.clone(),
            env: environment,
            user: user.clone().or_else(|| base.user.clone()),
            workdir: workdir.clone().or_else(|| base.workdir.clone()).unwrap_or_else(|| "/".to_string()),
            mounts: scoped.mounts().to_vec(),
            platform: platform.clone(),
        };

        // Mount targets never end up in the layer, whether or not the source was provided.
        let mut strip: Vec<String> = mounts.iter().map(|m| m.target.clone()).collect();
        strip.extend(request.mounts.iter().map(|m| m.target.clone()));

        let rootfs = primary.rootfs.clone();
        let blobs = self.blobs.clone();
        let sandbox = self.sandbox.clone();
        let scratch = self.options.scratch_dir.clone();
        let outcome = blocking(move || {
            let dir = scratch_dir(&scratch)?;
            materialize(blobs.as_ref(), &rootfs, dir.path())?;
            request.rootfs = dir.path().to_path_buf();
            Ok(sandbox.run(&request)?)
        })
        .await?;
        drop(scoped);

        if outcome.exit_code != 0 {
            return Err(StepError::CommandFailed {
                command: argv.join(" "),
                exit_code: outcome.exit_code,
                output: outcome.output,
            });
        }

        let blobs = self.blobs.clone();
        blocking(move || store_layer(blobs.as_ref(), &layer::strip_paths(&outcome.delta, &strip)?)).await
    }

    async fn copy_step(&self, node: &OperationNode, inputs: &[Arc<NodeResult>]) -> Result<LayerRef, StepError> {
        let NodeKind::Copy { origin, sources, destination, chown, workdir } = &node.kind else {
            return Err(StepError::Task(format!("{} is not a COPY step", node.id)));
        };

        let primary = &inputs[0];
        let workdir = workdir.clone().or_else(|| primary.base_config.workdir.clone()).unwrap_or_else(|| "/".into());
        let destination = resolve_destination(destination, &workdir);
        let source_rootfs = match origin {
            CopyOrigin::Context => None,
            CopyOrigin::Stage => Some(
                inputs
                    .get(1)
                    .ok_or_else(|| StepError::Task(format!("{} has no source stage", node.id)))?
                    .rootfs
                    .clone(),
            ),
        };

        let primary_rootfs = primary.rootfs.clone();
        let sources = sources.clone();
        let chown = chown.clone();
        let blobs = self.blobs.clone();
        let context = self.options.context_dir.clone();
        let scratch = self.options.scratch_dir.clone();

        blocking(move || {
            let owner = match &chown {
                Some(spec) => Some(resolve_chown(blobs.as_ref(), &primary_rootfs, spec, &scratch)?),
                None => None,
            };

            let delta = match source_rootfs {
                None => layer::copy_layer(&context, &sources, &destination, owner)?,
                Some(rootfs) => {
                    let dir = scratch_dir(&scratch)?;
                    materialize(blobs.as_ref(), &rootfs, dir.path())?;
                    layer::copy_layer(dir.path(), &sources, &destination, owner)?
                }
            };
            store_layer(blobs.as_ref(), &delta)
        })
        .await
    }
}

fn transition(states: &mut HashMap<NodeId, NodeState>, id: NodeId, state: NodeState, platform: &Platform) {
    let previous = states.insert(id, state).unwrap_or(NodeState::Pending);
    debug!(platform = %platform, node = %id, from = ?previous, to = ?state, "Node state changed");
}

/// Runs filesystem work off the async threads.
async fn blocking<T, F>(f: F) -> Result<T, StepError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StepError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| StepError::Task(e.to_string()))?
}

fn scratch_dir(parent: &Path) -> io::Result<tempfile::TempDir> {
    std::fs::create_dir_all(parent)?;
    tempfile::Builder::new().prefix("img-rootfs-").tempdir_in(parent)
}

/// Unpacks `rootfs` into `dir`.
fn materialize(blobs: &dyn BlobStore, rootfs: &RootFs, dir: &Path) -> Result<(), StepError> {
    for layer in &rootfs.layers {
        let data = blobs.get(&layer.digest)?.ok_or_else(|| StepError::MissingBlob(layer.digest.clone()))?;
        layer::apply_layer(dir, data.as_slice())?;
    }
    Ok(())
}

fn store_layer(blobs: &dyn BlobStore, delta: &[u8]) -> Result<LayerRef, StepError> {
    let digest = blobs.put(delta)?;
    Ok(LayerRef { digest, size: delta.len() as u64 })
}

/// Resolves `--chown`. Numeric ids need no lookup.
fn resolve_chown(blobs: &dyn BlobStore, rootfs: &RootFs, spec: &str, scratch: &Path) -> Result<Owner, StepError> {
    let numeric = |s: &str| s.parse::<u64>().ok();
    if let Some((user, group)) = spec.split_once(':') {
        if let (Some(uid), Some(gid)) = (numeric(user), numeric(group)) {
            return Ok(Owner { uid, gid });
        }
    }

    let dir = scratch_dir(scratch)?;
    materialize(blobs, rootfs, dir.path())?;
    Ok(sandbox::resolve_owner(dir.path(), spec)?)
}

/// Makes a COPY destination absolute against the working directory.
fn resolve_destination(destination: &str, workdir: &str) -> String {
    if destination.starts_with('/') {
        return destination.to_string();
    }
    let base = workdir.trim_end_matches('/');
    match destination {
        "." | "./" => format!("{}/", base),
        _ => format!("{}/{}", base, destination.trim_start_matches("./")),
    }
}

fn describe(node: &OperationNode) -> String {
    let step = match &node.kind {
        NodeKind::Base { .. } => "FROM".to_string(),
        NodeKind::Run { argv, .. } => format!("RUN {}", argv.last().map(String::as_str).unwrap_or_default()),
        NodeKind::Copy { sources, destination, .. } => format!("COPY {} {}", sources.join(" "), destination),
    };
    format!("{}: {}", node.origin, step)
}
