use crate::record::{MemoryHit, MemoryQuery, MemoryRecord, MemoryStats, MemoryWrite, PrunePolicy};
use crate::store::{InMemoryMemoryBank, MemoryBank};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Memory bank persisted as a JSONL log of records.
///
/// Every applied write appends the resulting record. On open the log is
/// replayed and, per key, the record with the newest `updated_at` wins, so
/// the line order of the file does not matter. Deletes and prunes rewrite the
/// file through a temp file and a rename. Access counts are kept in memory
/// and reach disk with the next rewrite.
///
/// All mutations hold the log lock from the in-memory change through the
/// disk write. A put whose append fails is rolled back in memory.
pub struct FileMemoryBank {
    path: PathBuf,
    inner: InMemoryMemoryBank,
    io: Mutex<()>,
}

impl FileMemoryBank {
    pub async fn open(path: impl Into<PathBuf>) -> MaestroResult<Self> {
        let path = path.into();
        let inner = InMemoryMemoryBank::new();

        if path.exists() {
            let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
                MaestroError::Memory(format!("Failed to read {}: {e}", path.display()))
            })?;
            let (mut loaded, mut superseded) = (0usize, 0usize);
            for (n, line) in data.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryRecord>(line) {
                    Ok(record) => {
                        if inner.load(record).await {
                            loaded += 1;
                        } else {
                            superseded += 1;
                        }
                    }
                    // A torn final line from a crash is skipped; the rest of
                    // the log is still valid.
                    Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable memory line"),
                }
            }
            info!(path = %path.display(), lines = loaded, superseded, "Memory bank loaded");
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MaestroError::Memory(format!("Failed to create dir: {e}")))?;
        }

        Ok(Self {
            path,
            inner,
            io: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Caller holds `io`.
    async fn append(&self, record: &MemoryRecord) -> MaestroResult<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| MaestroError::Memory(format!("Failed to open memory log: {e}")))?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| MaestroError::Memory(format!("Failed to write memory record: {e}")))?;
        file.flush().await?;
        Ok(())
    }

    /// Replaces the log with the current records, compacting superseded lines.
    pub async fn rewrite(&self) -> MaestroResult<()> {
        let _guard = self.io.lock().await;
        self.rewrite_locked().await
    }

    async fn rewrite_locked(&self) -> MaestroResult<()> {
        let mut data = String::new();
        for record in self.inner.all().await {
            data.push_str(&serde_json::to_string(&record)?);
            data.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, data.as_bytes())
            .await
            .map_err(|e| MaestroError::Memory(format!("Failed to write memory log: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| MaestroError::Memory(format!("Failed to replace memory log: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MemoryBank for FileMemoryBank {
    async fn put(&self, namespace: &str, write: MemoryWrite) -> MaestroResult<MemoryRecord> {
        let _guard = self.io.lock().await;
        let key = write.key.clone();
        let previous = self.inner.peek(namespace, &key).await;
        let (record, applied) = self.inner.apply(namespace, write).await;
        if applied {
            if let Err(e) = self.append(&record).await {
                warn!(namespace, key = %key, error = %e, "Memory write not persisted, rolled back");
                self.inner.restore(namespace, &key, previous).await;
                return Err(e);
            }
        }
        Ok(record)
    }

    async fn get(&self, namespace: &str, key: &str) -> MaestroResult<Option<MemoryRecord>> {
        self.inner.get(namespace, key).await
    }

    async fn query(&self, namespace: &str, query: &MemoryQuery) -> MaestroResult<Vec<MemoryHit>> {
        self.inner.query(namespace, query).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> MaestroResult<bool> {
        let _guard = self.io.lock().await;
        let deleted = self.inner.delete(namespace, key).await?;
        if deleted {
            self.rewrite_locked().await?;
        }
        Ok(deleted)
    }

    async fn prune(&self, policy: &PrunePolicy) -> MaestroResult<usize> {
        let _guard = self.io.lock().await;
        let removed = self.inner.prune(policy).await?;
        if removed > 0 {
            self.rewrite_locked().await?;
        }
        Ok(removed)
    }

    async fn stats(&self) -> MaestroResult<MemoryStats> {
        self.inner.stats().await
    }

    async fn namespaces(&self) -> MaestroResult<Vec<String>> {
        self.inner.namespaces().await
    }
}
