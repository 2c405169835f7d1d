use crate::tool::{InvocationContext, Tool, ToolDescriptor, ToolKind};
use async_trait::async_trait;
use maestro_core::MaestroResult;
use maestro_security::Capability;
use serde_json::Value;

type Handler = dyn Fn(Value, &InvocationContext) -> MaestroResult<Value> + Send + Sync;

/// A custom tool backed by a closure.
pub struct FnTool {
    descriptor: ToolDescriptor,
    handler: Box<Handler>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, &InvocationContext) -> MaestroResult<Value> + Send + Sync + 'static,
    {
        Self {
            descriptor: ToolDescriptor::new(name, description, ToolKind::Custom),
            handler: Box::new(handler),
        }
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.descriptor = self.descriptor.requires(capability);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.descriptor = self.descriptor.with_schema(schema);
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, arguments: Value, ctx: &InvocationContext) -> MaestroResult<Value> {
        (self.handler)(arguments, ctx)
    }
}
