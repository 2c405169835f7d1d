use maestro_agent::{RetryPolicy, RunContext};
use maestro_core::{ErrorKind, MaestroError, MaestroResult};
use maestro_security::PermissionSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::checkpoint::CheckpointHandle;

/// A unit of work in an agent composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Leaf: governs re-running the leaf itself. Composite: governs re-running
    /// a failed child that has no policy of its own.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// The closed set of node variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Leaf(LeafSpec),
    Sequential { children: Vec<AgentNode> },
    Parallel(ParallelSpec),
    Loop(LoopSpec),
}

/// A leaf invokes one capability from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafSpec {
    /// Name of the executor in the capability catalog.
    pub capability: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub permissions: PermissionSet,
    /// Overrides the run's default leaf timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Executor calls per step; 0 uses the configured default.
    #[serde(default)]
    pub max_turns: u32,
    #[serde(default = "default_fail_on_tool_error")]
    pub fail_on_tool_error: bool,
}

fn default_fail_on_tool_error() -> bool {
    true
}

/// Children run concurrently from clones of the parent context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub children: Vec<AgentNode>,
    #[serde(default)]
    pub completion: CompletionPolicy,
    #[serde(default)]
    pub merge: MergePolicy,
    #[serde(default)]
    pub report: FailureReport,
    #[serde(default)]
    pub partial: PartialResults,
}

/// Re-runs `child` until `until` holds or `max_iterations` runs happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    pub child: Box<AgentNode>,
    #[serde(default)]
    pub until: TerminationPredicate,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every branch reaches a terminal or suspended state.
    #[default]
    WaitAll,
    /// The first branch to succeed or fail decides; the rest are dropped.
    Race,
    /// The first success decides; fails only when every branch fails.
    FirstSuccess,
}

/// How branch results combine at the barrier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Output of the last declared successful branch.
    #[default]
    LastWriterWins,
    /// `{ child_id: output }` for every successful branch.
    Collect,
    /// A named merger from the catalog.
    Custom(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReport {
    #[default]
    First,
    All,
}

/// What happens to successful siblings' outputs when a parallel node fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialResults {
    #[default]
    Discard,
    Retain,
}

/// Condition that ends a loop, checked after every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationPredicate {
    /// The session value at `key` is set and not `false`/`null`.
    SessionFlag { key: String },
    OutputContains { text: String },
    ContextContains { text: String },
    /// A named predicate from the catalog.
    Custom { name: String },
    /// Never true; the loop always runs to its cap.
    #[default]
    Never,
}

impl AgentNode {
    pub fn leaf(id: impl Into<String>, capability: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Leaf(LeafSpec {
                capability: capability.into(),
                task: task.into(),
                permissions: PermissionSet::default(),
                timeout_ms: None,
                max_turns: 0,
                fail_on_tool_error: default_fail_on_tool_error(),
            }),
            retry: RetryPolicy::default(),
        }
    }

    pub fn sequential(id: impl Into<String>, children: Vec<AgentNode>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Sequential { children },
            retry: RetryPolicy::default(),
        }
    }

    pub fn parallel(id: impl Into<String>, children: Vec<AgentNode>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Parallel(ParallelSpec {
                children,
                completion: CompletionPolicy::default(),
                merge: MergePolicy::default(),
                report: FailureReport::default(),
                partial: PartialResults::default(),
            }),
            retry: RetryPolicy::default(),
        }
    }

    pub fn looping(id: impl Into<String>, child: AgentNode, max_iterations: u32) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Loop(LoopSpec {
                child: Box::new(child),
                until: TerminationPredicate::Never,
                max_iterations,
            }),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Leaf only.
    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        if let NodeKind::Leaf(leaf) = &mut self.kind {
            leaf.permissions = permissions;
        }
        self
    }

    /// Leaf only.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let NodeKind::Leaf(leaf) = &mut self.kind {
            leaf.timeout_ms = Some(timeout_ms);
        }
        self
    }

    /// Leaf only.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        if let NodeKind::Leaf(leaf) = &mut self.kind {
            leaf.max_turns = max_turns;
        }
        self
    }

    /// Leaf only.
    pub fn tolerate_tool_errors(mut self) -> Self {
        if let NodeKind::Leaf(leaf) = &mut self.kind {
            leaf.fail_on_tool_error = false;
        }
        self
    }

    /// Parallel only.
    pub fn with_completion(mut self, policy: CompletionPolicy) -> Self {
        if let NodeKind::Parallel(spec) = &mut self.kind {
            spec.completion = policy;
        }
        self
    }

    /// Parallel only.
    pub fn with_merge(mut self, policy: MergePolicy) -> Self {
        if let NodeKind::Parallel(spec) = &mut self.kind {
            spec.merge = policy;
        }
        self
    }

    /// Parallel only.
    pub fn with_failure_report(mut self, policy: FailureReport) -> Self {
        if let NodeKind::Parallel(spec) = &mut self.kind {
            spec.report = policy;
        }
        self
    }

    /// Parallel only.
    pub fn with_partial_results(mut self, policy: PartialResults) -> Self {
        if let NodeKind::Parallel(spec) = &mut self.kind {
            spec.partial = policy;
        }
        self
    }

    /// Loop only.
    pub fn until(mut self, predicate: TerminationPredicate) -> Self {
        if let NodeKind::Loop(spec) = &mut self.kind {
            spec.until = predicate;
        }
        self
    }

    /// Children in declaration order.
    pub fn children(&self) -> Vec<&AgentNode> {
        match &self.kind {
            NodeKind::Leaf(_) => Vec::new(),
            NodeKind::Sequential { children } => children.iter().collect(),
            NodeKind::Parallel(spec) => spec.children.iter().collect(),
            NodeKind::Loop(spec) => vec![spec.child.as_ref()],
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Leaf(_) => "leaf",
            NodeKind::Sequential { .. } => "sequential",
            NodeKind::Parallel(_) => "parallel",
            NodeKind::Loop(_) => "loop",
        }
    }

    /// Structural checks: non-empty ids, unique sibling ids, non-empty
    /// composites, loop caps of at least one.
    pub fn validate(&self) -> MaestroResult<()> {
        self.validate_at(&NodePath::root(&self.id))
    }

    fn validate_at(&self, path: &NodePath) -> MaestroResult<()> {
        let invalid = |msg: String| Err(MaestroError::Config(format!("{path}: {msg}")));
        if self.id.trim().is_empty() {
            return invalid("node id must not be empty".into());
        }
        match &self.kind {
            NodeKind::Leaf(leaf) => {
                if leaf.capability.is_empty() {
                    return invalid("leaf has no capability".into());
                }
            }
            NodeKind::Sequential { children }
            | NodeKind::Parallel(ParallelSpec { children, .. }) => {
                if children.is_empty() {
                    return invalid(format!("{} node has no children", self.kind_name()));
                }
                let mut seen = HashSet::new();
                for child in children {
                    if !seen.insert(child.id.as_str()) {
                        return invalid(format!("duplicate child id '{}'", child.id));
                    }
                }
            }
            NodeKind::Loop(spec) => {
                if spec.max_iterations == 0 {
                    return invalid("max_iterations must be at least 1".into());
                }
            }
        }
        for (i, child) in self.children().into_iter().enumerate() {
            child.validate_at(&path.child(i, &child.id))?;
        }
        Ok(())
    }

    /// Every node in the tree, depth first.
    pub fn walk(&self) -> Vec<&AgentNode> {
        let mut out = vec![self];
        for child in self.children() {
            out.extend(child.walk());
        }
        out
    }
}

/// Location of a node: child indexes from the root plus a display form built
/// from node ids, e.g. `report/analysts/north`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePath {
    pub indexes: Vec<usize>,
    pub display: String,
}

impl NodePath {
    pub fn root(id: &str) -> Self {
        Self {
            indexes: Vec::new(),
            display: id.to_string(),
        }
    }

    pub fn child(&self, index: usize, id: &str) -> Self {
        let mut indexes = self.indexes.clone();
        indexes.push(index);
        Self {
            indexes,
            display: format!("{}/{}", self.display, id),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display)
    }
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Task description; recorded as the first user turn.
    pub task: String,
    /// Use this id instead of a fresh one.
    pub run_id: Option<Uuid>,
    /// Default leaf timeout, overriding the configured one.
    pub timeout_ms: Option<u64>,
}

impl RunOptions {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A failure with the node it happened at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Branch failures aggregated by a parallel node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Failure>,
    /// Outputs of successful sibling branches, when retained.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retained: BTreeMap<String, Value>,
}

impl Failure {
    pub fn new(path: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
            branches: Vec::new(),
            retained: BTreeMap::new(),
        }
    }

    pub fn from_error(path: &NodePath, err: &MaestroError) -> Self {
        Self::new(path.as_str(), err.kind(), err.to_string())
    }

    /// This failure and every nested branch failure.
    pub fn flatten(&self) -> Vec<&Failure> {
        let mut out = vec![self];
        for branch in &self.branches {
            out.extend(branch.flatten());
        }
        out
    }

    /// Whether this failure or any nested one has `kind`.
    pub fn involves(&self, kind: ErrorKind) -> bool {
        self.flatten().iter().any(|f| f.kind == kind)
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}: {}", self.kind, self.path, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub run_id: Uuid,
    pub output: Value,
    pub context: RunContext,
}

#[derive(Debug, Clone)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub failure: Failure,
}

/// Result of [`crate::Orchestrator::run`] and [`crate::Orchestrator::resume`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunCompletion),
    Suspended(CheckpointHandle),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunOutcome::Completed(c) => c.run_id,
            RunOutcome::Suspended(h) => h.run_id,
            RunOutcome::Failed(f) => f.run_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Suspended(_) => "suspended",
            RunOutcome::Failed(_) => "failed",
        }
    }
}
