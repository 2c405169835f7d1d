use crate::session::RunSession;
use maestro_core::{MaestroError, MaestroResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// In-process store of per-run session state.
///
/// Each run has its own lock, so runs never contend with each other. Writes to
/// one run are serialised by that run's write lock; reads clone the value out
/// under a short read lock.
#[derive(Default)]
pub struct SessionStore {
    runs: RwLock<HashMap<Uuid, Arc<RwLock<RunSession>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the session of a run. Opening an already open run is a no-op.
    pub fn open(&self, run_id: Uuid) {
        self.runs
            .write()
            .entry(run_id)
            .or_insert_with(|| Arc::new(RwLock::new(RunSession::new(run_id))));
        debug!(run_id = %run_id, "Session opened");
    }

    /// Opens a run's session pre-populated with `values`, replacing any
    /// existing state for that run.
    pub fn restore(&self, run_id: Uuid, values: BTreeMap<String, Value>) {
        let mut session = RunSession::new(run_id);
        session.values = values;
        self.runs
            .write()
            .insert(run_id, Arc::new(RwLock::new(session)));
        debug!(run_id = %run_id, "Session restored");
    }

    /// Destroys a run's session. Returns whether it existed.
    pub fn discard(&self, run_id: Uuid) -> bool {
        let existed = self.runs.write().remove(&run_id).is_some();
        if existed {
            debug!(run_id = %run_id, "Session discarded");
        }
        existed
    }

    pub fn is_open(&self, run_id: Uuid) -> bool {
        self.runs.read().contains_key(&run_id)
    }

    pub fn active_runs(&self) -> usize {
        self.runs.read().len()
    }

    fn session(&self, run_id: Uuid) -> MaestroResult<Arc<RwLock<RunSession>>> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| MaestroError::Session(format!("No active session for run {run_id}")))
    }

    /// Reads a value. Closed runs read as empty.
    pub fn get(&self, run_id: Uuid, key: &str) -> Option<Value> {
        let session = self.session(run_id).ok()?;
        let guard = session.read();
        guard.values.get(key).cloned()
    }

    pub fn set(&self, run_id: Uuid, key: impl Into<String>, value: Value) -> MaestroResult<()> {
        let session = self.session(run_id)?;
        session.write().set(key, value);
        Ok(())
    }

    pub fn delete(&self, run_id: Uuid, key: &str) -> MaestroResult<Option<Value>> {
        let session = self.session(run_id)?;
        let removed = session.write().remove(key);
        Ok(removed)
    }

    /// Read-modify-write of one key under the run's write lock.
    ///
    /// `f` receives the current value and returns the new one; returning
    /// `None` deletes the key. The new value is returned.
    pub fn update<F>(&self, run_id: Uuid, key: &str, f: F) -> MaestroResult<Option<Value>>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let session = self.session(run_id)?;
        let mut guard = session.write();
        match f(guard.values.get(key)) {
            Some(value) => {
                guard.set(key, value.clone());
                Ok(Some(value))
            }
            None => {
                guard.remove(key);
                Ok(None)
            }
        }
    }

    /// Copy of all values of a run.
    pub fn snapshot(&self, run_id: Uuid) -> Option<BTreeMap<String, Value>> {
        let session = self.session(run_id).ok()?;
        let guard = session.read();
        Some(guard.values.clone())
    }

    /// A handle scoped to one run.
    pub fn handle(self: &Arc<Self>, run_id: Uuid) -> SessionHandle {
        SessionHandle {
            run_id,
            store: Arc::clone(self),
        }
    }
}

/// Access to the session state of exactly one run.
#[derive(Clone)]
pub struct SessionHandle {
    run_id: Uuid,
    store: Arc<SessionStore>,
}

impl SessionHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(self.run_id, key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> MaestroResult<()> {
        self.store.set(self.run_id, key, value)
    }

    pub fn delete(&self, key: &str) -> MaestroResult<Option<Value>> {
        self.store.delete(self.run_id, key)
    }

    pub fn update<F>(&self, key: &str, f: F) -> MaestroResult<Option<Value>>
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        self.store.update(self.run_id, key, f)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.store.snapshot(self.run_id).unwrap_or_default()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("run_id", &self.run_id)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let store = SessionStore::new();
        let run = Uuid::new_v4();
        store.open(run);

        store.set(run, "region", json!("north")).unwrap();
        assert_eq!(store.get(run, "region"), Some(json!("north")));

        assert_eq!(store.delete(run, "region").unwrap(), Some(json!("north")));
        assert_eq!(store.get(run, "region"), None);
    }

    #[test]
    fn test_write_to_closed_run_fails() {
        let store = SessionStore::new();
        let run = Uuid::new_v4();
        assert!(store.set(run, "k", json!(1)).is_err());
        assert_eq!(store.get(run, "k"), None);
    }

    #[test]
    fn test_discard_destroys_state() {
        let store = SessionStore::new();
        let run = Uuid::new_v4();
        store.open(run);
        store.set(run, "k", json!(1)).unwrap();
        assert!(store.discard(run));
        assert!(!store.is_open(run));
        assert_eq!(store.get(run, "k"), None);
        assert!(!store.discard(run));
    }

    #[test]
    fn test_update_deletes_on_none() {
        let store = SessionStore::new();
        let run = Uuid::new_v4();
        store.open(run);
        store.set(run, "k", json!(1)).unwrap();
        assert_eq!(store.update(run, "k", |_| None).unwrap(), None);
        assert_eq!(store.get(run, "k"), None);
    }

    #[test]
    fn test_open_is_idempotent() {
        let store = SessionStore::new();
        let run = Uuid::new_v4();
        store.open(run);
        store.set(run, "k", json!(1)).unwrap();
        store.open(run);
        assert_eq!(store.get(run, "k"), Some(json!(1)));
    }
}
