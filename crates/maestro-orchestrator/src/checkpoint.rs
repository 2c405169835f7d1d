use crate::types::{AgentNode, Failure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_agent::RunContext;
use maestro_core::{MaestroError, MaestroResult, Turn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque reference to a suspended run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointHandle {
    pub id: Uuid,
    pub run_id: Uuid,
}

impl std::fmt::Display for CheckpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Where execution stopped inside a node, mirroring the node tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum Progress {
    /// The leaf finished its step and asked to pause.
    Leaf { output: Value },
    /// Child `index` is in progress; earlier children are done.
    Sequential { index: usize, child: Box<Progress> },
    /// `iteration` iterations finished before the one in progress.
    Loop { iteration: u32, child: Box<Progress> },
    Parallel {
        input: Value,
        branches: Vec<BranchProgress>,
    },
}

/// State of one parallel branch at suspension time. Deltas are the turns the
/// branch appended on top of the parallel node's base context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchProgress {
    NotStarted,
    Done { output: Value, delta: Vec<Turn> },
    Failed { failure: Failure },
    Suspended { progress: Progress, delta: Vec<Turn> },
}

/// Everything needed to continue a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub task: String,
    pub root: AgentNode,
    pub input: Value,
    pub progress: Progress,
    pub context: RunContext,
    pub session: BTreeMap<String, Value>,
    /// Node that requested the pause.
    pub path: String,
    pub reason: String,
    /// Run-level default leaf timeout in effect when the run suspended.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Resumed { at: DateTime<Utc> },
}

/// Stored form of a checkpoint: the encoded body plus its SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub state: CheckpointState,
    pub digest: String,
    pub body: Value,
}

impl CheckpointRecord {
    pub fn seal(id: Uuid, checkpoint: &Checkpoint) -> MaestroResult<Self> {
        let body = serde_json::to_value(checkpoint)?;
        Ok(Self {
            id,
            run_id: checkpoint.run_id,
            state: CheckpointState::Pending,
            digest: digest(&body)?,
            body,
        })
    }

    /// Verifies the digest and decodes the body.
    pub fn open(&self) -> MaestroResult<Checkpoint> {
        let actual = digest(&self.body)?;
        if actual != self.digest {
            return Err(MaestroError::CheckpointCorrupt(format!(
                "digest mismatch for {}",
                self.id
            )));
        }
        serde_json::from_value(self.body.clone())
            .map_err(|e| MaestroError::CheckpointCorrupt(format!("{}: {e}", self.id)))
    }
}

fn digest(body: &Value) -> MaestroResult<String> {
    let bytes = serde_json::to_vec(body)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Durable storage for checkpoint records.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, record: &CheckpointRecord) -> MaestroResult<()>;
    /// `Ok(None)` when absent, `CheckpointCorrupt` when unreadable.
    async fn get(&self, id: Uuid) -> MaestroResult<Option<CheckpointRecord>>;
    async fn list(&self) -> MaestroResult<Vec<Uuid>>;
    /// Takes the exclusive claim lock on `id`. `Ok(false)` when another
    /// claimer holds it. Every manager sharing the store sees the same lock.
    async fn try_lock(&self, id: Uuid) -> MaestroResult<bool>;
    async fn unlock(&self, id: Uuid) -> MaestroResult<()>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<Uuid, CheckpointRecord>>,
    locks: parking_lot::Mutex<HashSet<Uuid>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, record: &CheckpointRecord) -> MaestroResult<()> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> MaestroResult<Option<CheckpointRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn list(&self) -> MaestroResult<Vec<Uuid>> {
        Ok(self.records.read().keys().copied().collect())
    }

    async fn try_lock(&self, id: Uuid) -> MaestroResult<bool> {
        Ok(self.locks.lock().insert(id))
    }

    async fn unlock(&self, id: Uuid) -> MaestroResult<()> {
        self.locks.lock().remove(&id);
        Ok(())
    }
}

/// One JSON file per checkpoint under a directory, written atomically.
///
/// Claim locks are `<id>.lock` files created with `create_new`, so separate
/// processes opening the same directory cannot both resume one checkpoint.
/// A process that dies mid-claim leaves the lock file behind; the checkpoint
/// stays pending but unclaimable until the file is removed.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: impl Into<PathBuf>) -> MaestroResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Checkpoint store opened");
        Ok(Self { dir })
    }

    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, record: &CheckpointRecord) -> MaestroResult<()> {
        let path = self.path_for(record.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(checkpoint = %record.id, path = %path.display(), "Checkpoint written");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> MaestroResult<Option<CheckpointRecord>> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| MaestroError::CheckpointCorrupt(format!("{}: {e}", path.display())))
    }

    async fn list(&self) -> MaestroResult<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn try_lock(&self, id: Uuid) -> MaestroResult<bool> {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(id))
            .await;
        match opened {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock(&self, id: Uuid) -> MaestroResult<()> {
        match tokio::fs::remove_file(self.lock_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Summary of a pending checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PendingCheckpoint {
    pub handle: CheckpointHandle,
    pub task: String,
    pub path: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Creates checkpoints and hands each one out for resumption at most once.
pub struct OperationManager {
    store: Arc<dyn CheckpointStore>,
    claims: Mutex<()>,
}

impl OperationManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            claims: Mutex::new(()),
        }
    }

    pub async fn checkpoint(&self, checkpoint: &Checkpoint) -> MaestroResult<CheckpointHandle> {
        let handle = CheckpointHandle {
            id: Uuid::new_v4(),
            run_id: checkpoint.run_id,
        };
        let record = CheckpointRecord::seal(handle.id, checkpoint)?;
        self.store.put(&record).await?;
        info!(
            run_id = %handle.run_id,
            checkpoint = %handle.id,
            path = %checkpoint.path,
            "Checkpoint created"
        );
        Ok(handle)
    }

    /// Marks the checkpoint resumed and returns its contents. A second claim
    /// of the same handle fails with `AlreadyResumed`.
    pub async fn claim(&self, handle: &CheckpointHandle) -> MaestroResult<Checkpoint> {
        self.claim_with(handle, |_| Ok(())).await
    }

    /// Like [`OperationManager::claim`], but `verify` sees the checkpoint
    /// before it is marked resumed. When `verify` fails the checkpoint stays
    /// pending and the error is returned.
    pub async fn claim_with<F>(
        &self,
        handle: &CheckpointHandle,
        verify: F,
    ) -> MaestroResult<Checkpoint>
    where
        F: FnOnce(&Checkpoint) -> MaestroResult<()>,
    {
        let _guard = self.claims.lock().await;
        if !self.store.try_lock(handle.id).await? {
            warn!(checkpoint = %handle.id, "Checkpoint is being claimed elsewhere");
            return Err(MaestroError::AlreadyResumed(handle.id));
        }
        let claimed = self.claim_locked(handle, verify).await;
        if let Err(e) = self.store.unlock(handle.id).await {
            warn!(checkpoint = %handle.id, error = %e, "Failed to release claim lock");
        }
        claimed
    }

    async fn claim_locked<F>(
        &self,
        handle: &CheckpointHandle,
        verify: F,
    ) -> MaestroResult<Checkpoint>
    where
        F: FnOnce(&Checkpoint) -> MaestroResult<()>,
    {
        let mut record = self
            .store
            .get(handle.id)
            .await?
            .ok_or(MaestroError::CheckpointNotFound(handle.id))?;
        if let CheckpointState::Resumed { at } = record.state {
            warn!(checkpoint = %handle.id, resumed_at = %at, "Checkpoint already resumed");
            return Err(MaestroError::AlreadyResumed(handle.id));
        }
        let checkpoint = record.open()?;
        verify(&checkpoint)?;
        record.state = CheckpointState::Resumed { at: Utc::now() };
        self.store.put(&record).await?;
        Ok(checkpoint)
    }

    /// Reads a checkpoint without claiming it.
    pub async fn inspect(&self, id: Uuid) -> MaestroResult<(CheckpointState, Checkpoint)> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(MaestroError::CheckpointNotFound(id))?;
        let checkpoint = record.open()?;
        Ok((record.state, checkpoint))
    }

    /// Pending checkpoints, oldest first. Unreadable records are skipped.
    pub async fn list_pending(&self) -> MaestroResult<Vec<PendingCheckpoint>> {
        let mut pending = Vec::new();
        for id in self.store.list().await? {
            let record = match self.store.get(id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(checkpoint = %id, error = %e, "Skipping unreadable checkpoint");
                    continue;
                }
            };
            if record.state != CheckpointState::Pending {
                continue;
            }
            match record.open() {
                Ok(cp) => pending.push(PendingCheckpoint {
                    handle: CheckpointHandle {
                        id,
                        run_id: cp.run_id,
                    },
                    task: cp.task,
                    path: cp.path,
                    reason: cp.reason,
                    created_at: cp.created_at,
                }),
                Err(e) => warn!(checkpoint = %id, error = %e, "Skipping corrupt checkpoint"),
            }
        }
        pending.sort_by_key(|p| p.created_at);
        Ok(pending)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::ErrorKind;
    use serde_json::json;

    fn sample(run_id: Uuid) -> Checkpoint {
        let mut context = RunContext::new();
        context.push(Turn::user("weekly report"));
        Checkpoint {
            run_id,
            task: "weekly report".into(),
            root: AgentNode::leaf("approve", "reviewer", "approve"),
            input: json!({"week": 12}),
            progress: Progress::Leaf {
                output: json!("draft"),
            },
            context,
            session: BTreeMap::from([("stage".to_string(), json!("review"))]),
            path: "approve".into(),
            reason: "needs approval".into(),
            timeout_ms: Some(5_000),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_claim_once() {
        let ops = OperationManager::new(Arc::new(InMemoryCheckpointStore::new()));
        let cp = sample(Uuid::new_v4());
        let handle = ops.checkpoint(&cp).await.unwrap();

        let claimed = ops.claim(&handle).await.unwrap();
        assert_eq!(claimed, cp);

        let err = ops.claim(&handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResumed);
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let ops = OperationManager::new(Arc::new(InMemoryCheckpointStore::new()));
        let handle = CheckpointHandle {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
        };
        let err = ops.claim(&handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CheckpointNotFound);
    }

    #[tokio::test]
    async fn test_tampered_body_is_corrupt() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let ops = OperationManager::new(store.clone());
        let handle = ops.checkpoint(&sample(Uuid::new_v4())).await.unwrap();

        let mut record = store.get(handle.id).await.unwrap().unwrap();
        record.body["task"] = json!("something else");
        store.put(&record).await.unwrap();

        let err = ops.claim(&handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CheckpointCorrupt);
    }

    #[tokio::test]
    async fn test_list_pending_skips_resumed() {
        let ops = OperationManager::new(Arc::new(InMemoryCheckpointStore::new()));
        let first = ops.checkpoint(&sample(Uuid::new_v4())).await.unwrap();
        let second = ops.checkpoint(&sample(Uuid::new_v4())).await.unwrap();
        ops.claim(&first).await.unwrap();

        let pending = ops.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].handle, second);
        assert_eq!(pending[0].reason, "needs approval");
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample(Uuid::new_v4());
        let handle = {
            let ops = OperationManager::new(Arc::new(
                FileCheckpointStore::open(dir.path()).await.unwrap(),
            ));
            ops.checkpoint(&cp).await.unwrap()
        };

        let ops = OperationManager::new(Arc::new(
            FileCheckpointStore::open(dir.path()).await.unwrap(),
        ));
        let (state, stored) = ops.inspect(handle.id).await.unwrap();
        assert_eq!(state, CheckpointState::Pending);
        assert_eq!(stored, cp);
        ops.claim(&handle).await.unwrap();
        assert_eq!(
            ops.claim(&handle).await.unwrap_err().kind(),
            ErrorKind::AlreadyResumed
        );
    }

    #[tokio::test]
    async fn test_rejected_claim_stays_pending() {
        let ops = OperationManager::new(Arc::new(InMemoryCheckpointStore::new()));
        let handle = ops.checkpoint(&sample(Uuid::new_v4())).await.unwrap();

        let err = ops
            .claim_with(&handle, |_| Err(MaestroError::Config("unknown capability".into())))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let (state, _) = ops.inspect(handle.id).await.unwrap();
        assert_eq!(state, CheckpointState::Pending);
        assert_eq!(ops.list_pending().await.unwrap().len(), 1);

        ops.claim(&handle).await.unwrap();
        assert!(ops.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_separate_managers_claim_once() {
        let dir = tempfile::tempdir().unwrap();
        let handle = {
            let ops = OperationManager::new(Arc::new(
                FileCheckpointStore::open(dir.path()).await.unwrap(),
            ));
            ops.checkpoint(&sample(Uuid::new_v4())).await.unwrap()
        };

        let first = OperationManager::new(Arc::new(
            FileCheckpointStore::open(dir.path()).await.unwrap(),
        ));
        let second = OperationManager::new(Arc::new(
            FileCheckpointStore::open(dir.path()).await.unwrap(),
        ));
        let (a, b) = tokio::join!(first.claim(&handle), second.claim(&handle));
        let won = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(won, 1);
        let lost = if a.is_err() { a } else { b };
        assert_eq!(lost.unwrap_err().kind(), ErrorKind::AlreadyResumed);
    }

    #[tokio::test]
    async fn test_held_lock_blocks_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCheckpointStore::open(dir.path()).await.unwrap());
        let ops = OperationManager::new(store.clone());
        let handle = ops.checkpoint(&sample(Uuid::new_v4())).await.unwrap();

        assert!(store.try_lock(handle.id).await.unwrap());
        let err = ops.claim(&handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResumed);

        store.unlock(handle.id).await.unwrap();
        ops.claim(&handle).await.unwrap();
        assert!(!store.lock_path(handle.id).exists());
        assert_eq!(store.list().await.unwrap(), vec![handle.id]);
    }

    #[tokio::test]
    async fn test_unreadable_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        tokio::fs::write(store.path_for(id), b"{ not json").await.unwrap();

        let err = store.get(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CheckpointCorrupt);
    }
}
