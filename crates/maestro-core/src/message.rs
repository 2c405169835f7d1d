use crate::tool::{ToolCall, ToolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The role of the participant that authored a [`Turn`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The task submitter or an external input delivered on resume.
    User,
    /// A capability executor's completion.
    Assistant,
    /// A system-level instruction or a compaction summary.
    System,
    /// Output produced by a tool invocation.
    Tool,
}

/// A tool call together with the result it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    /// The request.
    pub call: ToolCall,
    /// The resolved outcome.
    pub result: ToolResult,
}

/// A single entry in a run's conversation/tool history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Who authored the turn.
    pub role: Role,
    /// Textual content.
    pub content: String,
    /// Tool call record for [`Role::Tool`] turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRecord>,
    /// True for turns produced by compaction rather than by a step.
    #[serde(default)]
    pub synthetic: bool,
    /// UTC timestamp of when the turn was created.
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Creates a new turn with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool: None,
            synthetic: false,
            timestamp: Utc::now(),
        }
    }

    /// Creates a new turn with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new turn with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new turn with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates a [`Role::Tool`] turn carrying the call and its result.
    pub fn tool(call: ToolCall, result: ToolResult) -> Self {
        let mut turn = Self::new(Role::Tool, result.content());
        turn.tool = Some(ToolRecord { call, result });
        turn
    }

    /// Creates a synthetic summary turn.
    pub fn summary(content: impl Into<String>) -> Self {
        let mut turn = Self::system(content);
        turn.synthetic = true;
        turn
    }

    /// Size of the turn in bytes: content plus the serialized tool record.
    pub fn estimated_size(&self) -> usize {
        let tool = self.tool.as_ref().map_or(0, |record| {
            record.call.name.len()
                + record.call.arguments.to_string().len()
                + record.result.payload.to_string().len()
                + record.result.error.as_ref().map_or(0, |e| e.message.len())
        });
        self.content.len() + tool
    }
}
