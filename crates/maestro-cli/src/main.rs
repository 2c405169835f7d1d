//! `maestro` operator CLI: validate compositions, inspect checkpoints and
//! query the memory bank.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use maestro_core::logging::{self, LogFormat};
use maestro_memory::{FileMemoryBank, MemoryBank, MemoryQuery, PrunePolicy};
use maestro_orchestrator::{
    load_composition, AgentNode, CheckpointState, FileCheckpointStore, NodeKind,
    OperationManager, OrchestratorConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro: multi-agent orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a composition file and print its node tree
    Validate {
        /// Composition in TOML or JSON
        path: PathBuf,
    },
    /// Print the effective configuration
    Config,
    /// Inspect suspended runs
    Checkpoints {
        /// Checkpoint directory (overrides config)
        #[arg(long)]
        dir: Option<PathBuf>,
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Query and maintain the memory bank
    Memory {
        /// Memory log file (overrides config)
        #[arg(long)]
        path: Option<PathBuf>,
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints waiting to be resumed
    List,
    /// Show one checkpoint
    Show {
        id: Uuid,
        /// Print the whole checkpoint body
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Search one namespace
    Query {
        namespace: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        text: Option<String>,
        /// Required tag; repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Record counts per namespace
    Stats,
    /// Delete low-importance records
    Prune {
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        below_importance: f32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(format, "warn")?;

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Validate { path } => {
            let root = load_composition(&path)
                .await
                .with_context(|| format!("Invalid composition '{}'", path.display()))?;
            print_tree(&root, 0);
            let nodes = root.walk();
            let leaves = nodes
                .iter()
                .filter(|n| matches!(n.kind, NodeKind::Leaf(_)))
                .count();
            println!("\nOK: {} node(s), {leaves} leaf step(s)", nodes.len());
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Checkpoints { dir, action } => {
            let dir = checkpoint_dir(dir, &config)?;
            let store = FileCheckpointStore::open(&dir).await?;
            let operations = OperationManager::new(Arc::new(store));
            match action {
                CheckpointAction::List => {
                    let pending = operations.list_pending().await?;
                    if pending.is_empty() {
                        println!("No pending checkpoints in {}", dir.display());
                    }
                    for p in &pending {
                        println!(
                            "{}  run {}  {}  at {}: {}",
                            p.handle.id,
                            p.handle.run_id,
                            p.created_at.format("%Y-%m-%d %H:%M:%S"),
                            p.path,
                            p.reason
                        );
                    }
                }
                CheckpointAction::Show { id, full } => {
                    let (state, checkpoint) = operations.inspect(id).await?;
                    let status = match state {
                        CheckpointState::Pending => "pending".to_string(),
                        CheckpointState::Resumed { at } => format!("resumed at {at}"),
                    };
                    println!("checkpoint: {id}");
                    println!("run:        {}", checkpoint.run_id);
                    println!("status:     {status}");
                    println!("task:       {}", checkpoint.task);
                    println!("paused at:  {}", checkpoint.path);
                    println!("reason:     {}", checkpoint.reason);
                    println!("turns:      {}", checkpoint.context.len());
                    println!("session:    {} key(s)", checkpoint.session.len());
                    if full {
                        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
                    }
                }
            }
        }
        Commands::Memory { path, action } => {
            let path = memory_path(path, &config)?;
            let bank = FileMemoryBank::open(&path).await?;
            match action {
                MemoryAction::Query {
                    namespace,
                    key,
                    text,
                    tags,
                    limit,
                } => {
                    let query = MemoryQuery {
                        key,
                        text,
                        tags,
                        limit,
                        ..MemoryQuery::default()
                    };
                    let hits = bank.query(&namespace, &query).await?;
                    for hit in &hits {
                        println!(
                            "{:.3}  {}  {}",
                            hit.score, hit.record.key, hit.record.value
                        );
                    }
                    println!("{} record(s)", hits.len());
                }
                MemoryAction::Stats => {
                    let stats = bank.stats().await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                MemoryAction::Prune {
                    namespace,
                    below_importance,
                } => {
                    let removed = bank
                        .prune(&PrunePolicy {
                            namespace,
                            older_than: None,
                            below_importance: Some(below_importance),
                        })
                        .await?;
                    info!(removed, path = %path.display(), "Memory pruned");
                    println!("Removed {removed} record(s)");
                }
            }
        }
    }

    Ok(())
}

/// Reads `path` if it exists; otherwise the defaults apply.
async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "No config file, using defaults");
        return Ok(OrchestratorConfig::default());
    }
    OrchestratorConfig::load(path)
        .await
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

fn checkpoint_dir(flag: Option<PathBuf>, config: &OrchestratorConfig) -> anyhow::Result<PathBuf> {
    match flag.or_else(|| config.storage.checkpoint_dir.clone()) {
        Some(dir) => Ok(dir),
        None => bail!("No checkpoint directory: pass --dir or set storage.checkpoint_dir"),
    }
}

fn memory_path(flag: Option<PathBuf>, config: &OrchestratorConfig) -> anyhow::Result<PathBuf> {
    match flag.or_else(|| config.storage.memory_path.clone()) {
        Some(path) => Ok(path),
        None => bail!("No memory file: pass --path or set storage.memory_path"),
    }
}

fn print_tree(node: &AgentNode, depth: usize) {
    let indent = "  ".repeat(depth);
    let detail = match &node.kind {
        NodeKind::Leaf(leaf) => format!("capability={}", leaf.capability),
        NodeKind::Sequential { children } => format!("{} step(s)", children.len()),
        NodeKind::Parallel(spec) => format!(
            "completion={:?} merge={:?}",
            spec.completion, spec.merge
        ),
        NodeKind::Loop(spec) => format!("max_iterations={}", spec.max_iterations),
    };
    println!("{indent}{} [{}] {detail}", node.id, node.kind_name());
    for child in node.children() {
        print_tree(child, depth + 1);
    }
}
