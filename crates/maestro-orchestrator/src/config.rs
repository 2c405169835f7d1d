use crate::types::AgentNode;
use maestro_agent::CompactionConfig;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Orchestrator settings, usually read from `maestro.toml`.
///
/// ```toml
/// [compaction]
/// threshold = 16384
///
/// [execution]
/// default_timeout_ms = 120000
/// max_parallel_branches = 4
///
/// [storage]
/// checkpoint_dir = "./data/checkpoints"
/// memory_path = "./data/memory.jsonl"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Leaf timeout when neither the leaf nor the run sets one. `None` means
    /// unbounded.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: Option<u64>,
    /// Executor calls per leaf step when the leaf does not set `max_turns`.
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    /// Branches of one parallel node running at the same time.
    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,
    /// Ended runs the monitor keeps status and metrics for.
    #[serde(default = "default_monitor_retention")]
    pub monitor_retention: usize,
}

fn default_timeout_ms() -> Option<u64> {
    Some(300_000)
}

fn default_max_turns() -> u32 {
    8
}

fn default_max_parallel_branches() -> usize {
    5
}

fn default_monitor_retention() -> usize {
    crate::monitor::DEFAULT_RETENTION
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            default_max_turns: default_max_turns(),
            max_parallel_branches: default_max_parallel_branches(),
            monitor_retention: default_monitor_retention(),
        }
    }
}

/// Durable storage locations. Unset paths use in-memory stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub memory_path: Option<PathBuf>,
    /// Directory for the JSONL audit trail of run events.
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> MaestroResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| MaestroError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> MaestroResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MaestroError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> MaestroResult<()> {
        if self.execution.max_parallel_branches == 0 {
            return Err(MaestroError::Config(
                "execution.max_parallel_branches must be at least 1".into(),
            ));
        }
        if self.execution.default_max_turns == 0 {
            return Err(MaestroError::Config(
                "execution.default_max_turns must be at least 1".into(),
            ));
        }
        if self.compaction.threshold == 0 {
            return Err(MaestroError::Config("compaction.threshold must be positive".into()));
        }
        Ok(())
    }
}

/// Parses and validates a composition written in TOML.
pub fn composition_from_toml(s: &str) -> MaestroResult<AgentNode> {
    let root: AgentNode = toml::from_str(s).map_err(|e| MaestroError::Config(e.to_string()))?;
    root.validate()?;
    Ok(root)
}

/// Loads a composition from a `.toml` or `.json` file.
pub async fn load_composition(path: impl AsRef<Path>) -> MaestroResult<AgentNode> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MaestroError::Config(format!("{}: {e}", path.display())))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let root: AgentNode = serde_json::from_str(&text)
                .map_err(|e| MaestroError::Config(format!("{}: {e}", path.display())))?;
            root.validate()?;
            Ok(root)
        }
        _ => composition_from_toml(&text),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{CompletionPolicy, MergePolicy, NodeKind, TerminationPredicate};

    #[test]
    fn test_defaults_from_empty_file() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.execution.default_timeout_ms, Some(300_000));
        assert_eq!(config.execution.max_parallel_branches, 5);
        assert_eq!(config.compaction.keep_recent, 6);
    }

    #[test]
    fn test_partial_sections() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [compaction]
            threshold = 4000

            [execution]
            max_parallel_branches = 2

            [storage]
            checkpoint_dir = "/var/lib/maestro/checkpoints"
            "#,
        )
        .unwrap();
        assert_eq!(config.compaction.threshold, 4000);
        assert_eq!(config.compaction.summary_max_bytes, 2048);
        assert_eq!(config.execution.max_parallel_branches, 2);
        assert_eq!(config.execution.default_max_turns, 8);
        assert_eq!(
            config.storage.checkpoint_dir.as_deref(),
            Some(Path::new("/var/lib/maestro/checkpoints"))
        );
        assert!(config.storage.memory_path.is_none());
    }

    #[test]
    fn test_rejects_zero_branches() {
        let err = OrchestratorConfig::from_toml_str("[execution]\nmax_parallel_branches = 0")
            .unwrap_err();
        assert!(err.to_string().contains("max_parallel_branches"));
    }

    #[test]
    fn test_composition_from_toml() {
        let root = composition_from_toml(
            r#"
            id = "weekly"
            type = "sequential"

            [[children]]
            id = "fetch"
            type = "leaf"
            capability = "analyst"
            task = "Pull last week's sales"
            timeout_ms = 30000

            [children.permissions]
            tools = ["sales_db"]

            [[children]]
            id = "regions"
            type = "parallel"
            completion = "first_success"
            merge = "collect"

            [[children.children]]
            id = "north"
            type = "leaf"
            capability = "analyst"

            [[children.children]]
            id = "south"
            type = "leaf"
            capability = "analyst"

            [[children]]
            id = "polish"
            type = "loop"
            max_iterations = 3
            until = { kind = "output_contains", text = "FINAL" }

            [children.child]
            id = "edit"
            type = "leaf"
            capability = "editor"
            "#,
        )
        .unwrap();

        assert_eq!(root.walk().len(), 7);
        let NodeKind::Sequential { children } = &root.kind else {
            panic!("expected sequential root");
        };
        let NodeKind::Leaf(fetch) = &children[0].kind else {
            panic!("expected leaf");
        };
        assert_eq!(fetch.timeout_ms, Some(30_000));
        assert!(fetch.permissions.allows_tool("sales_db"));
        assert!(fetch.fail_on_tool_error);

        let NodeKind::Parallel(regions) = &children[1].kind else {
            panic!("expected parallel");
        };
        assert_eq!(regions.completion, CompletionPolicy::FirstSuccess);
        assert_eq!(regions.merge, MergePolicy::Collect);

        let NodeKind::Loop(polish) = &children[2].kind else {
            panic!("expected loop");
        };
        assert_eq!(
            polish.until,
            TerminationPredicate::OutputContains {
                text: "FINAL".into()
            }
        );
    }

    #[test]
    fn test_composition_validation_errors_surface() {
        let err = composition_from_toml(
            r#"
            id = "empty"
            type = "parallel"
            children = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no children"));
    }

    #[tokio::test]
    async fn test_load_json_composition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        let node = AgentNode::leaf("solo", "analyst", "summarise");
        tokio::fs::write(&path, serde_json::to_vec(&node).unwrap())
            .await
            .unwrap();
        assert_eq!(load_composition(&path).await.unwrap(), node);
    }
}
