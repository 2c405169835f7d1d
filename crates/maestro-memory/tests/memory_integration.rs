#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for maestro-memory.
//!
//! Run with: `cargo test -p maestro-memory --test memory_integration`

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use maestro_memory::{
    FileMemoryBank, InMemoryMemoryBank, MemoryBank, MemoryQuery, MemoryWrite, PrunePolicy,
};

async fn seed(bank: &dyn MemoryBank) {
    let run = Uuid::new_v4();
    bank.put(
        "analytics",
        MemoryWrite::new("q4_north", json!("Q4 sales in the north region rose 12%"))
            .tagged(["sales", "q4"])
            .importance(0.8)
            .from_run(run),
    )
    .await
    .unwrap();
    bank.put(
        "analytics",
        MemoryWrite::new("q4_south", json!("Q4 sales in the south region were flat"))
            .tagged(["sales", "q4"])
            .importance(0.4)
            .from_run(run),
    )
    .await
    .unwrap();
    bank.put(
        "inventory",
        MemoryWrite::new("widgets", json!({"on_hand": 40})).tagged(["stock"]),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn file_bank_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("memory").join("bank.jsonl");

    {
        let bank = FileMemoryBank::open(&path).await.unwrap();
        seed(&bank).await;
    }

    let bank = FileMemoryBank::open(&path).await.unwrap();
    let stats = bank.stats().await.unwrap();
    assert_eq!(stats.total_records, 3);
    assert_eq!(
        bank.namespaces().await.unwrap(),
        vec!["analytics".to_string(), "inventory".to_string()]
    );

    let widgets = bank.get("inventory", "widgets").await.unwrap().unwrap();
    assert_eq!(widgets.value["on_hand"], 40);
}

#[tokio::test]
async fn exact_key_lookup_is_the_baseline_for_text_search() {
    let bank = InMemoryMemoryBank::new();
    seed(&bank).await;

    let by_key = bank
        .query("analytics", &MemoryQuery::by_key("q4_north"))
        .await
        .unwrap();
    assert_eq!(by_key.len(), 1);

    let by_text = bank
        .query("analytics", &MemoryQuery::by_text("north region"))
        .await
        .unwrap();
    assert_eq!(by_text[0].record.key, "q4_north");
    assert!(by_text[0].score > 0.99);
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let bank = InMemoryMemoryBank::new();
    seed(&bank).await;

    let hits = bank
        .query("inventory", &MemoryQuery::by_text("sales"))
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert!(bank.get("analytics", "widgets").await.unwrap().is_none());
}

#[tokio::test]
async fn stale_write_is_ignored_after_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bank.jsonl");
    let now = Utc::now();

    {
        let bank = FileMemoryBank::open(&path).await.unwrap();
        bank.put("ns", MemoryWrite::new("k", json!("current")).at(now))
            .await
            .unwrap();
    }

    let bank = FileMemoryBank::open(&path).await.unwrap();
    let stored = bank
        .put(
            "ns",
            MemoryWrite::new("k", json!("late")).at(now - Duration::minutes(5)),
        )
        .await
        .unwrap();
    assert_eq!(stored.value, json!("current"));

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 1);
}

#[tokio::test]
async fn concurrent_writers_all_land() {
    let bank = Arc::new(InMemoryMemoryBank::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let bank = Arc::clone(&bank);
        handles.push(tokio::spawn(async move {
            bank.put("ns", MemoryWrite::new(format!("k{i}"), json!(i)))
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(bank.stats().await.unwrap().total_records, 16);
}

#[tokio::test]
async fn prune_is_scoped_to_namespace() {
    let tmp = TempDir::new().unwrap();
    let bank = FileMemoryBank::open(tmp.path().join("bank.jsonl"))
        .await
        .unwrap();
    seed(&bank).await;

    let policy = PrunePolicy {
        namespace: Some("analytics".to_string()),
        older_than: None,
        below_importance: Some(0.6),
    };
    assert_eq!(bank.prune(&policy).await.unwrap(), 1);
    assert!(bank.get("analytics", "q4_south").await.unwrap().is_none());
    // widgets has the default importance, under the threshold.
    assert!(bank.get("inventory", "widgets").await.unwrap().is_some());
}

#[tokio::test]
async fn access_counts_feed_stats() {
    let bank = InMemoryMemoryBank::new();
    seed(&bank).await;
    bank.get("analytics", "q4_north").await.unwrap();
    bank.query("analytics", &MemoryQuery::by_text("sales"))
        .await
        .unwrap();

    let stats = bank.stats().await.unwrap();
    assert_eq!(stats.total_accesses, 3);
}
