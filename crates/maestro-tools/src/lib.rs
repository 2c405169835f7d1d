//! Tool registry and invocation layer.
//!
//! Every tool call an agent makes goes through [`ToolRegistry::invoke`], which
//! resolves the tool by name, enforces the calling node's permissions and
//! contains tool failures. Built-in memory tools, closure-backed custom tools
//! and HTTP API-backed tools are provided.

pub mod function;
pub mod http;
pub mod memory;
pub mod registry;
pub mod tool;

pub use function::FnTool;
pub use http::HttpApiTool;
pub use memory::{MemorySearchTool, MemoryStoreTool};
pub use registry::{ToolRegistry, ToolStats};
pub use tool::{InvocationContext, Tool, ToolDescriptor, ToolKind};

use maestro_memory::MemoryBank;
use std::sync::Arc;

/// Registers the built-in memory tools backed by `bank`.
pub fn register_builtins(registry: &mut ToolRegistry, bank: Arc<dyn MemoryBank>) {
    registry.register(Arc::new(MemoryStoreTool::new(bank.clone())));
    registry.register(Arc::new(MemorySearchTool::new(bank)));
}
