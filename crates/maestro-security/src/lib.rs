//! Security primitives for the Maestro engine.
//!
//! Provides the tool permission model checked by the invocation layer and an
//! append-only audit trail for orchestration events.
//!
//! # Main types
//!
//! - [`Capability`]: A resource a tool needs (network, memory, database).
//! - [`PermissionSet`]: The tools and capabilities an agent node declares.
//! - [`AuditLog`]: Append-only audit trail persisted to disk.

/// Audit logging module.
pub mod audit;
/// Capability and permission definitions.
pub mod capability;

pub use audit::{AuditEntry, AuditLog};
pub use capability::{Capability, PermissionSet, ANY_TOOL};
