use crate::types::{
    AgentNode, LoopSpec, MergePolicy, NodeKind, ParallelSpec, TerminationPredicate,
};
use maestro_agent::{CapabilityExecutor, RunContext};
use maestro_core::{MaestroError, MaestroResult};
use maestro_session::SessionHandle;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A user-defined loop termination check.
pub trait LoopPredicate: Send + Sync {
    fn should_stop(&self, output: &Value, ctx: &RunContext, session: &SessionHandle) -> bool;
}

impl<F> LoopPredicate for F
where
    F: Fn(&Value, &RunContext, &SessionHandle) -> bool + Send + Sync,
{
    fn should_stop(&self, output: &Value, ctx: &RunContext, session: &SessionHandle) -> bool {
        self(output, ctx, session)
    }
}

/// A user-defined merge of parallel branch outputs.
///
/// Receives `(child_id, output)` for every successful branch in declaration
/// order.
pub trait BranchMerger: Send + Sync {
    fn merge(&self, outputs: &[(String, Value)]) -> MaestroResult<Value>;
}

impl<F> BranchMerger for F
where
    F: Fn(&[(String, Value)]) -> MaestroResult<Value> + Send + Sync,
{
    fn merge(&self, outputs: &[(String, Value)]) -> MaestroResult<Value> {
        self(outputs)
    }
}

/// Named executors, predicates and mergers that compositions refer to.
#[derive(Default, Clone)]
pub struct Catalog {
    capabilities: HashMap<String, Arc<dyn CapabilityExecutor>>,
    predicates: HashMap<String, Arc<dyn LoopPredicate>>,
    mergers: HashMap<String, Arc<dyn BranchMerger>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capability(
        mut self,
        name: impl Into<String>,
        executor: Arc<dyn CapabilityExecutor>,
    ) -> Self {
        self.capabilities.insert(name.into(), executor);
        self
    }

    pub fn with_predicate(mut self, name: impl Into<String>, predicate: Arc<dyn LoopPredicate>) -> Self {
        self.predicates.insert(name.into(), predicate);
        self
    }

    pub fn with_merger(mut self, name: impl Into<String>, merger: Arc<dyn BranchMerger>) -> Self {
        self.mergers.insert(name.into(), merger);
        self
    }

    pub fn capability(&self, name: &str) -> Option<&Arc<dyn CapabilityExecutor>> {
        self.capabilities.get(name)
    }

    pub fn merger(&self, name: &str) -> Option<&Arc<dyn BranchMerger>> {
        self.mergers.get(name)
    }

    /// Sorted capability names.
    pub fn capability_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fails on the first capability, predicate or merger the tree names
    /// that is not registered.
    pub fn check(&self, root: &AgentNode) -> MaestroResult<()> {
        for node in root.walk() {
            let missing = match &node.kind {
                NodeKind::Leaf(leaf) if !self.capabilities.contains_key(&leaf.capability) => {
                    Some(format!("capability '{}'", leaf.capability))
                }
                NodeKind::Parallel(ParallelSpec {
                    merge: MergePolicy::Custom(name),
                    ..
                }) if !self.mergers.contains_key(name) => Some(format!("merger '{name}'")),
                NodeKind::Loop(LoopSpec {
                    until: TerminationPredicate::Custom { name },
                    ..
                }) if !self.predicates.contains_key(name) => Some(format!("predicate '{name}'")),
                _ => None,
            };
            if let Some(what) = missing {
                return Err(MaestroError::Config(format!(
                    "node '{}' refers to unregistered {what}",
                    node.id
                )));
            }
        }
        Ok(())
    }

    /// Evaluates a loop's termination predicate against the latest iteration.
    pub fn evaluate(
        &self,
        predicate: &TerminationPredicate,
        output: &Value,
        ctx: &RunContext,
        session: &SessionHandle,
    ) -> bool {
        match predicate {
            TerminationPredicate::SessionFlag { key } => {
                matches!(session.get(key), Some(v) if !v.is_null() && v != Value::Bool(false))
            }
            TerminationPredicate::OutputContains { text } => match output {
                Value::String(s) => s.contains(text.as_str()),
                other => other.to_string().contains(text.as_str()),
            },
            TerminationPredicate::ContextContains { text } => ctx.contains_text(text),
            TerminationPredicate::Custom { name } => self
                .predicates
                .get(name)
                .is_some_and(|p| p.should_stop(output, ctx, session)),
            TerminationPredicate::Never => false,
        }
    }
}
