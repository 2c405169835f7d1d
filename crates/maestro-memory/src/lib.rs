//! Durable memory bank shared across runs.
//!
//! Records are namespaced key/value facts with tags, importance and access
//! counts. Conflicting writes resolve last-writer-wins by timestamp; text
//! queries score by token overlap.
//!
//! # Main types
//!
//! - [`MemoryBank`]: Trait implemented by every backend.
//! - [`InMemoryMemoryBank`]: Process-local backend.
//! - [`FileMemoryBank`]: JSONL-backed persistent backend.
//! - [`MemoryRecord`], [`MemoryWrite`], [`MemoryQuery`]: Data exchanged with a bank.

/// JSONL file backend.
pub mod file;
/// Records, writes, queries and stats.
pub mod record;
/// Token overlap scoring for text queries.
pub mod scoring;
/// The bank trait and in-memory backend.
pub mod store;

pub use file::FileMemoryBank;
pub use record::{
    MemoryHit, MemoryQuery, MemoryRecord, MemoryStats, MemoryWrite, PrunePolicy,
    DEFAULT_IMPORTANCE,
};
pub use store::{InMemoryMemoryBank, MemoryBank};
