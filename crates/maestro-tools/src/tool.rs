use async_trait::async_trait;
use maestro_core::MaestroResult;
use maestro_security::Capability;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a tool is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    BuiltIn,
    Custom,
    Api,
}

/// Metadata describing a tool's interface and required permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub kind: ToolKind,
    pub parameters_schema: serde_json::Value,
    pub required_capabilities: Vec<Capability>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
            parameters_schema: serde_json::json!({ "type": "object" }),
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.parameters_schema = schema;
        self
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }
}

/// Who is invoking a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub run_id: Uuid,
    /// Display path of the invoking node.
    pub path: String,
}

impl InvocationContext {
    pub fn new(run_id: Uuid, path: impl Into<String>) -> Self {
        Self {
            run_id,
            path: path.into(),
        }
    }
}

/// A named operation agents may request.
///
/// Returning `Err` (or panicking) is reported to the caller as a tool
/// execution failure; the registry never lets either escape.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &InvocationContext,
    ) -> MaestroResult<serde_json::Value>;
}
