//! Operation graph for image builds.
//!
//! Converts normalized stages into a directed acyclic graph of
//! filesystem-producing operations (base fetch, RUN, COPY). Nodes live in an
//! arena and refer to each other by [`NodeId`].

use crate::builder::parser::{BaseRef, CopySource, Directive, ImageRef, RunMount, Stage, StageConfig};
use crate::builder::platform::Platform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Starting filesystem of a base node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseSource {
    Scratch,
    Image { reference: ImageRef, platform: Option<Platform> },
}

/// What a COPY reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyOrigin {
    /// The build context directory.
    Context,
    /// The filesystem of the node's second input.
    Stage,
}

/// Operation performed by a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Base {
        source: BaseSource,
    },
    Run {
        argv: Vec<String>,
        /// Stage environment; the base image environment is layered underneath at run time.
        env: BTreeMap<String, String>,
        user: Option<String>,
        /// Stage WORKDIR; `None` falls back to the base image's.
        workdir: Option<String>,
        mounts: Vec<RunMount>,
    },
    Copy {
        origin: CopyOrigin,
        sources: Vec<String>,
        destination: String,
        chown: Option<String>,
        workdir: Option<String>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Base { .. } => "base",
            NodeKind::Run { .. } => "run",
            NodeKind::Copy { .. } => "copy",
        }
    }
}

/// Script position a node came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeOrigin {
    pub stage: String,
    pub stage_index: usize,
    /// Index into the stage's instructions; `None` for the FROM of the stage.
    pub instruction: Option<usize>,
    pub line: usize,
}

impl fmt::Display for NodeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stage {}", stage_label(&self.stage, self.stage_index))?;
        match self.instruction {
            Some(i) => write!(f, ", instruction {} (line {})", i, self.line),
            None => write!(f, ", FROM (line {})", self.line),
        }
    }
}

fn stage_label(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("#{}", index)
    } else {
        name.to_string()
    }
}

/// A single operation of the build.
#[derive(Debug, Clone)]
pub struct OperationNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Primary input first; a cross-stage COPY has the source stage as second input.
    pub inputs: Vec<NodeId>,
    pub origin: NodeOrigin,
    /// sha256 over the operation, the metadata folded into it and the input identities.
    pub identity: String,
    /// True if the result depends on the target platform.
    pub platform_dependent: bool,
}

impl OperationNode {
    /// Mounts declared by a RUN node.
    pub fn mounts(&self) -> &[RunMount] {
        match &self.kind {
            NodeKind::Run { mounts, .. } => mounts,
            _ => &[],
        }
    }
}

/// Per-stage summary kept next to the node arena.
#[derive(Debug, Clone)]
pub struct StageInfo {
    pub name: String,
    pub index: usize,
    /// Node holding the stage's final filesystem.
    pub output: NodeId,
    /// Accumulated stage metadata.
    pub config: StageConfig,
}

/// Error type for graph construction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("Circular dependency between stages: {}", stages.join(" -> "))]
    CircularDependency { stages: Vec<String> },

    #[error("Unknown stage reference {name:?} on line {line}")]
    UnknownStage { name: String, line: usize },

    #[error("Target stage {0:?} not found")]
    UnknownTarget(String),

    #[error("Build script has no stages")]
    Empty,
}

/// Directed acyclic graph of build operations.
#[derive(Debug, Clone)]
pub struct OperationGraph {
    /// Node arena; inputs always precede the nodes that consume them.
    pub nodes: Vec<OperationNode>,
    /// Adjacency list: node -> nodes consuming it
    pub edges: HashMap<NodeId, Vec<NodeId>>,
    pub stages: Vec<StageInfo>,
}

impl OperationGraph {
    /// Builds the graph for normalized stages.
    pub fn build(stages: &[Stage]) -> Result<Self, BuildError> {
        GraphBuilder::new(stages).build()
    }

    pub fn node(&self, id: NodeId) -> &OperationNode {
        &self.nodes[id.0]
    }

    /// Returns nodes in topological order (execution order).
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, BuildError> {
        // Kahn's algorithm
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.inputs.len()).collect();
        let mut queue: VecDeque<NodeId> =
            self.nodes.iter().filter(|n| n.inputs.is_empty()).map(|n| n.id).collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            result.push(id);
            for &dependent in self.dependents(id) {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if result.len() != self.nodes.len() {
            let stages = self
                .nodes
                .iter()
                .filter(|n| !result.contains(&n.id))
                .map(|n| stage_label(&n.origin.stage, n.origin.stage_index))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            return Err(BuildError::CircularDependency { stages });
        }

        Ok(result)
    }

    /// Nodes this node consumes.
    pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].inputs
    }

    /// Nodes consuming this node.
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `target` and every node it transitively depends on.
    pub fn ancestors_of(&self, target: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.dependencies(id));
            }
        }
        seen
    }

    /// Final node of a named stage. Stages can also be addressed by index.
    pub fn stage_output(&self, name: &str) -> Option<NodeId> {
        self.stage(name).map(|s| s.output)
    }

    pub fn stage(&self, name: &str) -> Option<&StageInfo> {
        let lowered = name.to_ascii_lowercase();
        self.stages
            .iter()
            .find(|s| !s.name.is_empty() && s.name == lowered)
            .or_else(|| lowered.parse::<usize>().ok().and_then(|i| self.stages.get(i)))
    }

    /// Stage selected by `--target`, or the last stage.
    pub fn target_stage(&self, target: Option<&str>) -> Result<&StageInfo, BuildError> {
        match target {
            Some(name) => self.stage(name).ok_or_else(|| BuildError::UnknownTarget(name.to_string())),
            None => self.stages.last().ok_or(BuildError::Empty),
        }
    }
}

/// Internal builder for constructing the operation graph.
struct GraphBuilder<'a> {
    stages: &'a [Stage],
    nodes: Vec<OperationNode>,
    edges: HashMap<NodeId, Vec<NodeId>>,
    /// Output node per stage index, filled as stages are processed.
    outputs: Vec<Option<NodeId>>,
}

impl<'a> GraphBuilder<'a> {
    fn new(stages: &'a [Stage]) -> Self {
        Self { stages, nodes: Vec::new(), edges: HashMap::new(), outputs: vec![None; stages.len()] }
    }

    fn build(mut self) -> Result<OperationGraph, BuildError> {
        if self.stages.is_empty() {
            return Err(BuildError::Empty);
        }

        for index in self.stage_order()? {
            let output = self.process_stage(&self.stages[index])?;
            self.outputs[index] = Some(output);
        }

        let stages = self
            .stages
            .iter()
            .zip(&self.outputs)
            .map(|(stage, output)| StageInfo {
                name: stage.name.clone(),
                index: stage.index,
                // stage_order covers every stage
                output: output.unwrap_or(NodeId(0)),
                config: stage.config.clone(),
            })
            .collect();

        Ok(OperationGraph { nodes: self.nodes, edges: self.edges, stages })
    }

    /// Orders stages so that every stage follows the stages it reads from.
    fn stage_order(&self) -> Result<Vec<usize>, BuildError> {
        let count = self.stages.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];

        for stage in self.stages {
            let mut sources = BTreeSet::new();
            if let BaseRef::Stage { index, .. } = &stage.base {
                sources.insert(*index);
            }
            for instruction in &stage.instructions {
                match &instruction.directive {
                    Directive::Copy { from: Some(CopySource::Stage(index)), .. } => {
                        sources.insert(*index);
                    }
                    Directive::Copy { from: Some(CopySource::Unresolved(name)), .. } => {
                        return Err(BuildError::UnknownStage { name: name.clone(), line: instruction.line });
                    }
                    _ => {}
                }
            }
            for source in sources {
                dependents[source].push(stage.index);
                in_degree[stage.index] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(index) = queue.pop_front() {
            order.push(index);
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != count {
            let stages = (0..count)
                .filter(|i| !order.contains(i))
                .map(|i| stage_label(&self.stages[i].name, i))
                .collect();
            return Err(BuildError::CircularDependency { stages });
        }

        Ok(order)
    }

    fn process_stage(&mut self, stage: &Stage) -> Result<NodeId, BuildError> {
        let from_line = stage.line;
        let origin = |instruction: Option<usize>, line: usize| NodeOrigin {
            stage: stage.name.clone(),
            stage_index: stage.index,
            instruction,
            line,
        };

        let (mut current, mut config) = match &stage.base {
            BaseRef::Scratch => {
                let kind = NodeKind::Base { source: BaseSource::Scratch };
                (self.add_node(kind, Vec::new(), origin(None, from_line), &[]), StageConfig::default())
            }
            BaseRef::Image(reference) => {
                let kind = NodeKind::Base {
                    source: BaseSource::Image { reference: reference.clone(), platform: stage.platform.clone() },
                };
                (self.add_node(kind, Vec::new(), origin(None, from_line), &[]), StageConfig::default())
            }
            BaseRef::Stage { index, .. } => {
                // Already processed thanks to stage_order.
                let output = self.outputs[*index].ok_or_else(|| BuildError::CircularDependency {
                    stages: vec![stage_label(&stage.name, stage.index)],
                })?;
                (output, self.stages[*index].config.clone())
            }
        };

        // Metadata directives since the last filesystem node.
        let mut pending: Vec<String> = Vec::new();

        for (position, instruction) in stage.instructions.iter().enumerate() {
            let directive = &instruction.directive;
            let node_origin = origin(Some(position), instruction.line);

            match directive {
                Directive::Run { command, mounts } => {
                    let kind = NodeKind::Run {
                        argv: command.to_argv(&config.shell()),
                        env: config.env.clone(),
                        user: config.user.clone(),
                        workdir: config.workdir.clone(),
                        mounts: mounts.clone(),
                    };
                    current = self.add_node(kind, vec![current], node_origin, &pending);
                    pending.clear();
                }
                Directive::Copy { from, sources, destination, chown } => {
                    let (origin_kind, inputs) = match from {
                        None => (CopyOrigin::Context, vec![current]),
                        Some(CopySource::Stage(index)) => {
                            let source = self.outputs[*index].ok_or_else(|| BuildError::CircularDependency {
                                stages: vec![
                                    stage_label(&stage.name, stage.index),
                                    stage_label(&self.stages[*index].name, *index),
                                ],
                            })?;
                            (CopyOrigin::Stage, vec![current, source])
                        }
                        Some(CopySource::Unresolved(name)) => {
                            return Err(BuildError::UnknownStage { name: name.clone(), line: instruction.line });
                        }
                    };
                    let kind = NodeKind::Copy {
                        origin: origin_kind,
                        sources: sources.clone(),
                        destination: destination.clone(),
                        chown: chown.clone(),
                        workdir: config.workdir.clone(),
                    };
                    current = self.add_node(kind, inputs, node_origin, &pending);
                    pending.clear();
                }
                _ => pending.push(format!("{:?}", directive)),
            }

            config = config.apply(directive);
        }

        Ok(current)
    }

    fn add_node(&mut self, kind: NodeKind, inputs: Vec<NodeId>, origin: NodeOrigin, pending: &[String]) -> NodeId {
        let id = NodeId(self.nodes.len());

        let mut hasher = Sha256::new();
        for input in &inputs {
            hasher.update(self.nodes[input.0].identity.as_bytes());
            hasher.update(b"\n");
        }
        for metadata in pending {
            hasher.update(metadata.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(format!("{:?}", kind).as_bytes());
        let identity = format!("{:x}", hasher.finalize());

        let platform_dependent = match &kind {
            NodeKind::Base { source: BaseSource::Image { platform, .. } } => platform.is_none(),
            NodeKind::Base { source: BaseSource::Scratch } => false,
            _ => inputs.iter().any(|i| self.nodes[i.0].platform_dependent),
        };

        for input in &inputs {
            self.edges.entry(*input).or_default().push(id);
        }

        self.nodes.push(OperationNode { id, kind, inputs, origin, identity, platform_dependent });
        id
    }
}
