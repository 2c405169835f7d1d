use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Key/value state of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    pub run_id: Uuid,
    pub values: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSession {
    pub fn new(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            values: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.updated_at = Utc::now();
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.updated_at = Utc::now();
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
