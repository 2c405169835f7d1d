use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

/// Top-level error type for the Maestro engine.
///
/// The first group of variants is the orchestration taxonomy reported to
/// callers; the rest are infrastructure failures from stores and config.
#[derive(Error, Debug)]
pub enum MaestroError {
    /// A tool call named a tool that is not registered.
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A tool call fell outside the invoking node's declared permissions.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A registered tool failed while executing.
    #[error("Tool '{tool}' failed: {cause}")]
    ToolExecution {
        /// Name of the failing tool.
        tool: String,
        /// Failure reported by the tool.
        cause: String,
    },

    /// The opaque capability executor failed.
    #[error("Capability error: {0}")]
    Capability(String),

    /// A leaf invocation exceeded its time budget.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// A loop hit its iteration cap without its predicate becoming true.
    #[error("Loop reached its cap of {0} iterations")]
    IterationCapExceeded(u32),

    /// The run was cancelled by the caller.
    #[error("Run cancelled")]
    Cancelled,

    /// A checkpoint handle was resumed a second time.
    #[error("Checkpoint {0} was already resumed")]
    AlreadyResumed(Uuid),

    /// A checkpoint could not be decoded or failed its integrity check.
    #[error("Checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// No checkpoint exists for the handle.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    /// Session state store failure.
    #[error("Session error: {0}")]
    Session(String),

    /// Memory bank failure.
    #[error("Memory error: {0}")]
    Memory(String),

    /// Durable storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration or composition.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable discriminant of a [`MaestroError`], used in outcomes,
/// events, and tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    PermissionDenied,
    ToolExecutionError,
    CapabilityError,
    Timeout,
    IterationCapExceeded,
    Cancelled,
    AlreadyResumed,
    CheckpointCorrupt,
    CheckpointNotFound,
    Session,
    Memory,
    Storage,
    Config,
}

impl ErrorKind {
    /// Whether a composite node's retry policy may re-run a step that failed
    /// with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::CapabilityError | ErrorKind::ToolExecutionError
        )
    }

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ToolExecutionError => "tool_execution_error",
            ErrorKind::CapabilityError => "capability_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::IterationCapExceeded => "iteration_cap_exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::AlreadyResumed => "already_resumed",
            ErrorKind::CheckpointCorrupt => "checkpoint_corrupt",
            ErrorKind::CheckpointNotFound => "checkpoint_not_found",
            ErrorKind::Session => "session",
            ErrorKind::Memory => "memory",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MaestroError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MaestroError::UnknownTool(_) => ErrorKind::UnknownTool,
            MaestroError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MaestroError::ToolExecution { .. } => ErrorKind::ToolExecutionError,
            MaestroError::Capability(_) => ErrorKind::CapabilityError,
            MaestroError::Timeout(_) => ErrorKind::Timeout,
            MaestroError::IterationCapExceeded(_) => ErrorKind::IterationCapExceeded,
            MaestroError::Cancelled => ErrorKind::Cancelled,
            MaestroError::AlreadyResumed(_) => ErrorKind::AlreadyResumed,
            MaestroError::CheckpointCorrupt(_) => ErrorKind::CheckpointCorrupt,
            MaestroError::CheckpointNotFound(_) => ErrorKind::CheckpointNotFound,
            MaestroError::Session(_) => ErrorKind::Session,
            MaestroError::Memory(_) => ErrorKind::Memory,
            MaestroError::Storage(_) | MaestroError::Json(_) | MaestroError::Io(_) => {
                ErrorKind::Storage
            }
            MaestroError::Config(_) => ErrorKind::Config,
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Rebuild an error from a tool failure recorded in a [`crate::ToolResult`].
    pub fn from_tool_failure(tool: &str, kind: ErrorKind, message: &str) -> Self {
        match kind {
            ErrorKind::UnknownTool => MaestroError::UnknownTool(tool.to_string()),
            ErrorKind::PermissionDenied => MaestroError::PermissionDenied(message.to_string()),
            _ => MaestroError::ToolExecution {
                tool: tool.to_string(),
                cause: message.to_string(),
            },
        }
    }
}
