//! Composition engine for Maestro.
//!
//! Executes trees of agent nodes (leaf, sequential, parallel, loop) with
//! per-node retry, leaf timeouts, cooperative cancellation, context
//! compaction and durable suspend/resume.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Drives runs; built with [`OrchestratorBuilder`].
//! - [`AgentNode`]: A composition node; plain data, loadable from TOML.
//! - [`Catalog`]: Named capability executors, loop predicates and mergers.
//! - [`OperationManager`]: Creates checkpoints and claims them once on resume.
//! - [`RunMonitor`]: Run status and metrics for polling.
//! - [`OrchestratorConfig`]: `maestro.toml` settings.

/// Named executors, predicates and mergers.
pub mod catalog;
/// Checkpoints, progress trees and checkpoint stores.
pub mod checkpoint;
/// TOML configuration and composition loading.
pub mod config;
/// Run execution.
pub mod engine;
/// Run status and metrics.
pub mod monitor;
/// Composition and outcome types.
pub mod types;

pub use catalog::{BranchMerger, Catalog, LoopPredicate};
pub use checkpoint::{
    BranchProgress, Checkpoint, CheckpointHandle, CheckpointRecord, CheckpointState,
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, OperationManager,
    PendingCheckpoint, Progress,
};
pub use config::{
    composition_from_toml, load_composition, ExecutionConfig, OrchestratorConfig, StorageConfig,
};
pub use engine::{Orchestrator, OrchestratorBuilder};
pub use monitor::{RunMetrics, RunMonitor, RunState, RunStatus};
pub use types::{
    AgentNode, CompletionPolicy, Failure, FailureReport, LeafSpec, LoopSpec, MergePolicy,
    NodeKind, NodePath, ParallelSpec, PartialResults, RunCompletion, RunFailure, RunOptions,
    RunOutcome, TerminationPredicate,
};
