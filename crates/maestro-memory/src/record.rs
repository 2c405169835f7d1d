use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Importance assigned to writes that do not set one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

/// A single durable fact in the memory bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub namespace: String,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Run that last wrote the record, if it came from a run.
    #[serde(default)]
    pub origin_run: Option<Uuid>,
    pub importance: f32,
    #[serde(default)]
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Text the fuzzy matcher scores against.
    pub(crate) fn searchable_text(&self) -> String {
        let value = match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        format!("{} {} {}", self.key, value, self.tags.join(" "))
    }
}

/// A write request for [`crate::MemoryBank::put`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryWrite {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub origin_run: Option<Uuid>,
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// Logical time of the write. A write older than the stored record is
    /// ignored; `None` means now.
    #[serde(default)]
    pub written_at: Option<DateTime<Utc>>,
}

fn default_importance() -> f32 {
    DEFAULT_IMPORTANCE
}

impl MemoryWrite {
    pub fn new(key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
            tags: Vec::new(),
            origin_run: None,
            importance: DEFAULT_IMPORTANCE,
            written_at: None,
        }
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_run(mut self, run_id: Uuid) -> Self {
        self.origin_run = Some(run_id);
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    pub fn at(mut self, written_at: DateTime<Utc>) -> Self {
        self.written_at = Some(written_at);
        self
    }
}

/// Filter for [`crate::MemoryBank::query`]. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Exact key lookup.
    #[serde(default)]
    pub key: Option<String>,
    /// Records must carry all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Fuzzy text; records are scored by token overlap and non-matching ones
    /// are dropped.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub min_importance: Option<f32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn by_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A query result.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub record: MemoryRecord,
    pub score: f32,
}

/// Criteria for [`crate::MemoryBank::prune`]. A record is removed only when it
/// matches every criterion that is set; a policy with nothing set removes
/// nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrunePolicy {
    pub namespace: Option<String>,
    pub older_than: Option<DateTime<Utc>>,
    pub below_importance: Option<f32>,
}

impl PrunePolicy {
    pub fn is_empty(&self) -> bool {
        self.older_than.is_none() && self.below_importance.is_none()
    }

    pub(crate) fn matches(&self, record: &MemoryRecord) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if &record.namespace != ns {
                return false;
            }
        }
        let old = match self.older_than {
            Some(cutoff) => record.updated_at < cutoff,
            None => true,
        };
        let minor = match self.below_importance {
            Some(threshold) => record.importance < threshold,
            None => true,
        };
        old && minor
    }
}

/// Aggregate numbers over the whole bank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_records: usize,
    pub namespaces: std::collections::BTreeMap<String, usize>,
    pub total_accesses: u64,
    pub average_importance: f32,
}
