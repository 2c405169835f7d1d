use crate::tool::{InvocationContext, Tool, ToolDescriptor, ToolKind};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use maestro_memory::{MemoryBank, MemoryQuery, MemoryWrite, DEFAULT_IMPORTANCE};
use maestro_security::Capability;
use serde_json::{json, Value};
use std::sync::Arc;

fn required_str<'a>(tool: &str, args: &'a Value, field: &str) -> MaestroResult<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MaestroError::ToolExecution {
            tool: tool.to_string(),
            cause: format!("missing required argument '{field}'"),
        })
}

fn string_list(args: &Value, field: &str) -> Vec<String> {
    args.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Tool that writes a fact into the memory bank.
pub struct MemoryStoreTool {
    descriptor: ToolDescriptor,
    bank: Arc<dyn MemoryBank>,
}

impl MemoryStoreTool {
    pub fn new(bank: Arc<dyn MemoryBank>) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                "memory_store",
                "Store a fact in long-term memory under a namespace and key. \
                 Later writes to the same key replace earlier ones.",
                ToolKind::BuiltIn,
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "namespace": { "type": "string" },
                    "key": { "type": "string" },
                    "value": { "description": "Any JSON value" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "importance": { "type": "number", "minimum": 0, "maximum": 1 }
                },
                "required": ["namespace", "key", "value"]
            }))
            .requires(Capability::MemoryWrite),
            bank,
        }
    }
}

#[async_trait]
impl Tool for MemoryStoreTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value, ctx: &InvocationContext) -> MaestroResult<Value> {
        let namespace = required_str(&self.descriptor.name, &args, "namespace")?;
        let key = required_str(&self.descriptor.name, &args, "key")?;
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        let importance = args
            .get("importance")
            .and_then(Value::as_f64)
            .map(|f| f as f32)
            .unwrap_or(DEFAULT_IMPORTANCE);

        let write = MemoryWrite::new(key, value)
            .tagged(string_list(&args, "tags"))
            .importance(importance)
            .from_run(ctx.run_id);
        let record = self.bank.put(namespace, write).await?;

        Ok(json!({
            "stored": true,
            "namespace": record.namespace,
            "key": record.key,
            "updated_at": record.updated_at,
        }))
    }
}

/// Tool that searches the memory bank.
pub struct MemorySearchTool {
    descriptor: ToolDescriptor,
    bank: Arc<dyn MemoryBank>,
}

impl MemorySearchTool {
    pub fn new(bank: Arc<dyn MemoryBank>) -> Self {
        Self {
            descriptor: ToolDescriptor::new(
                "memory_search",
                "Search long-term memory in one namespace by key, tags or free text.",
                ToolKind::BuiltIn,
            )
            .with_schema(json!({
                "type": "object",
                "properties": {
                    "namespace": { "type": "string" },
                    "key": { "type": "string" },
                    "text": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "limit": { "type": "integer", "minimum": 1 }
                },
                "required": ["namespace"]
            }))
            .requires(Capability::MemoryRead),
            bank,
        }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, args: Value, _ctx: &InvocationContext) -> MaestroResult<Value> {
        let namespace = required_str(&self.descriptor.name, &args, "namespace")?;
        let query = MemoryQuery {
            key: args.get("key").and_then(Value::as_str).map(str::to_string),
            tags: string_list(&args, "tags"),
            text: args.get("text").and_then(Value::as_str).map(str::to_string),
            min_importance: None,
            limit: Some(
                args.get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize)
                    .unwrap_or(5),
            ),
        };
        let hits = self.bank.query(namespace, &query).await?;

        let results: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "key": hit.record.key,
                    "value": hit.record.value,
                    "tags": hit.record.tags,
                    "score": hit.score,
                })
            })
            .collect();
        Ok(json!({ "count": results.len(), "results": results }))
    }
}
