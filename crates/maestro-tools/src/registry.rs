use crate::tool::{InvocationContext, Tool, ToolDescriptor};
use futures_util::FutureExt;
use maestro_core::{ErrorKind, ToolCall, ToolResult};
use maestro_security::PermissionSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-tool invocation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolStats {
    /// Times the tool body actually ran.
    pub invocations: u64,
    pub failures: u64,
    /// Calls rejected before reaching the tool.
    pub denied: u64,
    pub total_duration_ms: u64,
}

/// Central registry for all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name.clone();
        info!(tool = %name, kind = ?tool.descriptor().kind, "Registered tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list_descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut descriptors: Vec<&ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Invokes a tool on behalf of a node holding `permissions`.
    ///
    /// Never returns `Err`: unknown tools, permission denials and tool
    /// failures (including panics) are all reported in the [`ToolResult`].
    pub async fn invoke(
        &self,
        call: &ToolCall,
        permissions: &PermissionSet,
        ctx: &InvocationContext,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, path = %ctx.path, "Unknown tool requested");
            return ToolResult::failure(
                call,
                ErrorKind::UnknownTool,
                format!("no tool named '{}'", call.name),
            );
        };

        if let Err(reason) = permissions.check(&call.name, &tool.descriptor().required_capabilities)
        {
            warn!(
                run_id = %ctx.run_id,
                path = %ctx.path,
                tool = %call.name,
                reason = %reason,
                "Permission denied for tool invocation"
            );
            self.stats.lock().entry(call.name.clone()).or_default().denied += 1;
            return ToolResult::failure(call, ErrorKind::PermissionDenied, reason);
        }

        debug!(run_id = %ctx.run_id, path = %ctx.path, tool = %call.name, "Invoking tool");
        let start = Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(call.arguments.clone(), ctx))
            .catch_unwind()
            .await;
        let elapsed = millis(start.elapsed());

        let result = match outcome {
            Ok(Ok(payload)) => ToolResult::success(call, payload),
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::failure(call, ErrorKind::ToolExecutionError, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(tool = %call.name, panic = %message, "Tool panicked");
                ToolResult::failure(
                    call,
                    ErrorKind::ToolExecutionError,
                    format!("tool panicked: {message}"),
                )
            }
        };

        let mut stats = self.stats.lock();
        let entry = stats.entry(call.name.clone()).or_default();
        entry.invocations += 1;
        entry.total_duration_ms += elapsed;
        if result.is_error() {
            entry.failures += 1;
        }
        result
    }

    pub fn stats(&self, name: &str) -> ToolStats {
        self.stats.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn all_stats(&self) -> HashMap<String, ToolStats> {
        self.stats.lock().clone()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
