use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// A request from a capability executor to invoke a specific tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the executor for this call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments to pass to the tool.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    /// Creates a tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Why a tool invocation did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    /// One of `UnknownTool`, `PermissionDenied`, `ToolExecutionError`.
    pub kind: ErrorKind,
    /// Human-readable cause.
    pub message: String,
}

/// The resolved outcome of a [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The ID of the [`ToolCall`] this result corresponds to.
    pub call_id: String,
    /// The tool that was requested.
    pub tool: String,
    /// Structured output; `Null` on failure.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Set when the invocation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    /// Creates a successful tool result.
    pub fn success(call: &ToolCall, payload: serde_json::Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            payload,
            error: None,
        }
    }

    /// Creates a failed tool result.
    pub fn failure(call: &ToolCall, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            payload: serde_json::Value::Null,
            error: Some(ToolError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Whether the invocation failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text form fed back into the run context.
    pub fn content(&self) -> String {
        match (&self.error, &self.payload) {
            (Some(err), _) => format!("{}: {}", err.kind, err.message),
            (None, serde_json::Value::String(s)) => s.clone(),
            (None, other) => other.to_string(),
        }
    }
}
