use async_trait::async_trait;
use maestro_core::{MaestroResult, ToolCall, Turn};
use maestro_session::SessionHandle;
use maestro_tools::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Everything an executor sees for one call.
pub struct StepRequest<'a> {
    pub run_id: Uuid,
    /// Display path of the leaf, e.g. `report/analysts/north`.
    pub path: &'a str,
    pub node_id: &'a str,
    /// The leaf's task description.
    pub task: &'a str,
    /// Output of the previous step, or the run input.
    pub input: &'a Value,
    pub history: &'a [Turn],
    /// Tools the leaf is permitted to call.
    pub tools: &'a [ToolDescriptor],
    pub session: &'a SessionHandle,
    /// 0-based executor call within this leaf step.
    pub turn: u32,
}

/// What an executor returns for one call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResponse {
    /// Text appended to the context as an assistant turn.
    pub completion: String,
    /// Structured output; the completion string is used when absent.
    #[serde(default)]
    pub output: Option<Value>,
    /// Tools to invoke before the executor is called again.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Request that the run pause after this step.
    #[serde(default)]
    pub suspend: Option<String>,
}

impl StepResponse {
    pub fn text(completion: impl Into<String>) -> Self {
        Self {
            completion: completion.into(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn suspend(mut self, reason: impl Into<String>) -> Self {
        self.suspend = Some(reason.into());
        self
    }

    /// The value passed on to the next step.
    pub fn output_value(&self) -> Value {
        self.output
            .clone()
            .unwrap_or_else(|| Value::String(self.completion.clone()))
    }
}

/// The opaque model or capability behind an agent leaf.
///
/// Errors are reported as capability failures and may be retried.
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(&self, request: StepRequest<'_>) -> MaestroResult<StepResponse>;
}
