//! Session state for Maestro runs.
//!
//! Session state is a key/value map scoped to exactly one run id. It is
//! opened when a run starts and discarded when the run terminates; nothing
//! here outlives a run. Executors receive a [`SessionHandle`] bound to their
//! own run, never the store itself.

pub mod session;
pub mod store;

pub use session::RunSession;
pub use store::{SessionHandle, SessionStore};
