//! Core types and error definitions for the Maestro orchestration engine.
//!
//! This crate provides the foundational types shared across all Maestro crates,
//! including the error taxonomy, conversation turns, tool call abstractions and
//! the observability event contract.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for all Maestro subsystems.
//! - [`ErrorKind`]: Serializable discriminant reported in outcomes and events.
//! - [`Turn`]: A single entry of a run's conversation/tool history.
//! - [`ToolCall`] / [`ToolResult`]: Tool invocation request and outcome.
//! - [`EventSink`]: Fire-and-forget receiver of [`RunEvent`]s.

/// Error taxonomy.
pub mod error;
/// Orchestration events and sinks.
pub mod event;
/// Global `tracing` subscriber setup.
pub mod logging;
/// Conversation turns.
pub mod message;
/// Tool call and result types.
pub mod tool;

pub use error::{ErrorKind, MaestroError, MaestroResult};
pub use event::{EventSink, FanoutSink, RecordingSink, RunEvent, TracingSink};
pub use logging::LogFormat;
pub use message::{Role, ToolRecord, Turn};
pub use tool::{ToolCall, ToolError, ToolResult};
