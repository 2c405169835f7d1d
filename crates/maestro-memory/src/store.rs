use crate::record::{MemoryHit, MemoryQuery, MemoryRecord, MemoryStats, MemoryWrite, PrunePolicy};
use crate::scoring::overlap_score;
use async_trait::async_trait;
use chrono::Utc;
use maestro_core::MaestroResult;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Durable, namespaced key/value memory shared across runs.
#[async_trait]
pub trait MemoryBank: Send + Sync {
    /// Stores a record, returning what is stored afterwards. A write older
    /// than the stored record leaves it untouched.
    async fn put(&self, namespace: &str, write: MemoryWrite) -> MaestroResult<MemoryRecord>;

    /// Exact lookup. Counts as an access.
    async fn get(&self, namespace: &str, key: &str) -> MaestroResult<Option<MemoryRecord>>;

    /// Filtered search within one namespace, best matches first.
    async fn query(&self, namespace: &str, query: &MemoryQuery) -> MaestroResult<Vec<MemoryHit>>;

    async fn delete(&self, namespace: &str, key: &str) -> MaestroResult<bool>;

    /// Removes records matching the policy. Returns how many were removed.
    async fn prune(&self, policy: &PrunePolicy) -> MaestroResult<usize>;

    async fn stats(&self) -> MaestroResult<MemoryStats>;

    async fn namespaces(&self) -> MaestroResult<Vec<String>>;
}

/// A stored record. Its access counter is bumped under the read lock, so
/// lookups never wait for each other.
struct Entry {
    record: MemoryRecord,
    accesses: AtomicU64,
}

impl Entry {
    fn new(record: MemoryRecord) -> Self {
        let accesses = AtomicU64::new(record.access_count);
        Self { record, accesses }
    }

    fn snapshot(&self) -> MemoryRecord {
        let mut record = self.record.clone();
        record.access_count = self.accesses.load(Ordering::Relaxed);
        record
    }

    /// Counts an access and returns the record as it stands after it.
    fn touch(&self) -> MemoryRecord {
        let mut record = self.record.clone();
        record.access_count = self.accesses.fetch_add(1, Ordering::Relaxed) + 1;
        record
    }
}

type Namespaces = HashMap<String, BTreeMap<String, Entry>>;

/// Memory bank held entirely in process memory.
#[derive(Default)]
pub struct InMemoryMemoryBank {
    records: RwLock<Namespaces>,
}

impl InMemoryMemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a write with last-writer-wins semantics. The flag reports
    /// whether the write changed anything.
    pub(crate) async fn apply(&self, namespace: &str, write: MemoryWrite) -> (MemoryRecord, bool) {
        let mut records = self.records.write().await;
        let ns = records.entry(namespace.to_string()).or_default();
        let written_at = write.written_at.unwrap_or_else(Utc::now);

        if let Some(existing) = ns.get(&write.key) {
            if write
                .written_at
                .is_some_and(|at| at < existing.record.updated_at)
            {
                debug!(
                    namespace,
                    key = %write.key,
                    "Ignoring stale memory write"
                );
                return (existing.snapshot(), false);
            }
        }

        let (created_at, access_count) = ns
            .get(&write.key)
            .map(|e| (e.record.created_at, e.accesses.load(Ordering::Relaxed)))
            .unwrap_or((written_at, 0));
        let record = MemoryRecord {
            namespace: namespace.to_string(),
            key: write.key.clone(),
            value: write.value,
            tags: write.tags,
            origin_run: write.origin_run,
            importance: write.importance,
            access_count,
            created_at,
            updated_at: written_at,
        };
        ns.insert(write.key, Entry::new(record.clone()));
        (record, true)
    }

    /// Inserts a replayed record unless the stored one was updated later.
    /// On equal timestamps the replayed record wins. Returns whether it was
    /// kept.
    pub(crate) async fn load(&self, record: MemoryRecord) -> bool {
        let mut records = self.records.write().await;
        let ns = records.entry(record.namespace.clone()).or_default();
        if ns
            .get(&record.key)
            .is_some_and(|e| e.record.updated_at > record.updated_at)
        {
            return false;
        }
        ns.insert(record.key.clone(), Entry::new(record));
        true
    }

    /// Current record without counting an access.
    pub(crate) async fn peek(&self, namespace: &str, key: &str) -> Option<MemoryRecord> {
        let records = self.records.read().await;
        records
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(Entry::snapshot)
    }

    /// Puts back `previous` for `key`, or removes the key when there was none.
    pub(crate) async fn restore(&self, namespace: &str, key: &str, previous: Option<MemoryRecord>) {
        let mut records = self.records.write().await;
        match previous {
            Some(record) => {
                records
                    .entry(namespace.to_string())
                    .or_default()
                    .insert(key.to_string(), Entry::new(record));
            }
            None => {
                if let Some(ns) = records.get_mut(namespace) {
                    ns.remove(key);
                    if ns.is_empty() {
                        records.remove(namespace);
                    }
                }
            }
        }
    }

    /// Every stored record, ordered by namespace then key.
    pub async fn all(&self) -> Vec<MemoryRecord> {
        let records = self.records.read().await;
        let mut names: Vec<&String> = records.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|n| records[n].values().map(Entry::snapshot))
            .collect()
    }
}

#[async_trait]
impl MemoryBank for InMemoryMemoryBank {
    async fn put(&self, namespace: &str, write: MemoryWrite) -> MaestroResult<MemoryRecord> {
        Ok(self.apply(namespace, write).await.0)
    }

    async fn get(&self, namespace: &str, key: &str) -> MaestroResult<Option<MemoryRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(Entry::touch))
    }

    async fn query(&self, namespace: &str, query: &MemoryQuery) -> MaestroResult<Vec<MemoryHit>> {
        let records = self.records.read().await;
        let Some(ns) = records.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<(&Entry, f32)> = Vec::new();
        for entry in ns.values() {
            let record = &entry.record;
            if query.key.as_ref().is_some_and(|k| k != &record.key) {
                continue;
            }
            if !record.has_tags(&query.tags) {
                continue;
            }
            if query.min_importance.is_some_and(|min| record.importance < min) {
                continue;
            }
            let score = match &query.text {
                Some(text) => {
                    let score = overlap_score(text, &record.searchable_text());
                    if score == 0.0 {
                        continue;
                    }
                    score
                }
                None => record.importance,
            };
            hits.push((entry, score));
        }

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.record.updated_at.cmp(&a.0.record.updated_at))
        });
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }

        Ok(hits
            .into_iter()
            .map(|(entry, score)| MemoryHit {
                record: entry.touch(),
                score,
            })
            .collect())
    }

    async fn delete(&self, namespace: &str, key: &str) -> MaestroResult<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .get_mut(namespace)
            .and_then(|ns| ns.remove(key))
            .is_some())
    }

    async fn prune(&self, policy: &PrunePolicy) -> MaestroResult<usize> {
        let mut records = self.records.write().await;
        let mut removed = 0;
        for ns in records.values_mut() {
            let before = ns.len();
            ns.retain(|_, e| !policy.matches(&e.record));
            removed += before - ns.len();
        }
        records.retain(|_, ns| !ns.is_empty());
        if removed > 0 {
            debug!(removed, "Pruned memory records");
        }
        Ok(removed)
    }

    async fn stats(&self) -> MaestroResult<MemoryStats> {
        let records = self.records.read().await;
        let mut stats = MemoryStats::default();
        let mut importance_sum = 0.0f32;
        for (name, ns) in records.iter() {
            stats.namespaces.insert(name.clone(), ns.len());
            stats.total_records += ns.len();
            for entry in ns.values() {
                stats.total_accesses += entry.accesses.load(Ordering::Relaxed);
                importance_sum += entry.record.importance;
            }
        }
        if stats.total_records > 0 {
            stats.average_importance = importance_sum / stats.total_records as f32;
        }
        Ok(stats)
    }

    async fn namespaces(&self) -> MaestroResult<Vec<String>> {
        let records = self.records.read().await;
        let mut names: Vec<String> = records.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_put_and_get() {
        let bank = InMemoryMemoryBank::new();
        let run = Uuid::new_v4();
        bank.put("sales", MemoryWrite::new("q4_total", json!(1200)).from_run(run))
            .await
            .unwrap();

        let record = bank.get("sales", "q4_total").await.unwrap().unwrap();
        assert_eq!(record.value, json!(1200));
        assert_eq!(record.origin_run, Some(run));
        assert_eq!(record.access_count, 1);

        assert!(bank.get("inventory", "q4_total").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let bank = InMemoryMemoryBank::new();
        let now = Utc::now();

        bank.put("ns", MemoryWrite::new("k", json!("new")).at(now))
            .await
            .unwrap();
        let kept = bank
            .put(
                "ns",
                MemoryWrite::new("k", json!("old")).at(now - Duration::seconds(10)),
            )
            .await
            .unwrap();
        assert_eq!(kept.value, json!("new"));

        bank.put("ns", MemoryWrite::new("k", json!("newer")))
            .await
            .unwrap();
        let record = bank.get("ns", "k").await.unwrap().unwrap();
        assert_eq!(record.value, json!("newer"));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_creation_time() {
        let bank = InMemoryMemoryBank::new();
        let first = bank.put("ns", MemoryWrite::new("k", json!(1))).await.unwrap();
        let second = bank.put("ns", MemoryWrite::new("k", json!(2))).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_query_by_text_and_tags() {
        let bank = InMemoryMemoryBank::new();
        bank.put(
            "reports",
            MemoryWrite::new("north", json!("north region sales grew")).tagged(["sales"]),
        )
        .await
        .unwrap();
        bank.put(
            "reports",
            MemoryWrite::new("stock", json!("warehouse stock is low")).tagged(["inventory"]),
        )
        .await
        .unwrap();

        let hits = bank
            .query("reports", &MemoryQuery::by_text("north sales"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.key, "north");

        let hits = bank
            .query("reports", &MemoryQuery::default().with_tags(["inventory"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.key, "stock");
    }

    #[tokio::test]
    async fn test_query_orders_by_importance_and_limits() {
        let bank = InMemoryMemoryBank::new();
        for (key, importance) in [("low", 0.1), ("high", 0.9), ("mid", 0.5)] {
            bank.put("ns", MemoryWrite::new(key, json!(key)).importance(importance))
                .await
                .unwrap();
        }

        let hits = bank
            .query("ns", &MemoryQuery::default().limit(2))
            .await
            .unwrap();
        let keys: Vec<&str> = hits.iter().map(|h| h.record.key.as_str()).collect();
        assert_eq!(keys, vec!["high", "mid"]);

        let query = MemoryQuery {
            min_importance: Some(0.6),
            ..MemoryQuery::default()
        };
        assert_eq!(bank.query("ns", &query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_and_stats() {
        let bank = InMemoryMemoryBank::new();
        let old = Utc::now() - Duration::days(30);
        bank.put("ns", MemoryWrite::new("stale", json!(1)).importance(0.1).at(old))
            .await
            .unwrap();
        bank.put("ns", MemoryWrite::new("vital", json!(2)).importance(0.9).at(old))
            .await
            .unwrap();
        bank.put("other", MemoryWrite::new("fresh", json!(3)).importance(0.1))
            .await
            .unwrap();

        assert_eq!(bank.prune(&PrunePolicy::default()).await.unwrap(), 0);

        let policy = PrunePolicy {
            namespace: None,
            older_than: Some(Utc::now() - Duration::days(7)),
            below_importance: Some(0.5),
        };
        assert_eq!(bank.prune(&policy).await.unwrap(), 1);

        let stats = bank.stats().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.namespaces.get("ns"), Some(&1));
        assert!((stats.average_importance - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_concurrent_reads_count_every_access() {
        let bank = std::sync::Arc::new(InMemoryMemoryBank::new());
        bank.put("ns", MemoryWrite::new("k", json!("v")).tagged(["hot"]))
            .await
            .unwrap();

        let mut readers = Vec::new();
        for i in 0..16 {
            let bank = bank.clone();
            readers.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    bank.get("ns", "k").await.unwrap().unwrap();
                } else {
                    let hits = bank
                        .query("ns", &MemoryQuery::default().with_tags(["hot"]))
                        .await
                        .unwrap();
                    assert_eq!(hits.len(), 1);
                }
            }));
        }
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(bank.stats().await.unwrap().total_accesses, 16);
        let record = bank.get("ns", "k").await.unwrap().unwrap();
        assert_eq!(record.access_count, 17);
        // Overwrites carry the count forward.
        let updated = bank.put("ns", MemoryWrite::new("k", json!("w"))).await.unwrap();
        assert_eq!(updated.access_count, 17);
    }

    #[tokio::test]
    async fn test_delete() {
        let bank = InMemoryMemoryBank::new();
        bank.put("ns", MemoryWrite::new("k", json!(1))).await.unwrap();
        assert!(bank.delete("ns", "k").await.unwrap());
        assert!(!bank.delete("ns", "k").await.unwrap());
    }
}
