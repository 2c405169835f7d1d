use chrono::{DateTime, Utc};
use maestro_core::{EventSink, RunEvent};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub event: RunEvent,
}

/// Append-only audit log that records all orchestration events.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that writes entries to
    /// `<log_dir>/audit.jsonl`, so it must be called inside a Tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                error!(error = %e, dir = %log_dir.display(), "Failed to create audit dir");
                return;
            }
            let log_file = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(error = %e, file = %log_file.display(), "Failed to open audit log");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&entry) else {
                    continue;
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!(error = %e, "Failed to write audit entry");
                    continue;
                }
                let _ = file.flush().await;
            }
        });

        Self { tx }
    }

    pub fn log(&self, entry: AuditEntry) {
        info!(
            run_id = %entry.run_id,
            event = entry.event.name(),
            "audit"
        );
        let _ = self.tx.send(entry);
    }
}

impl EventSink for AuditLog {
    fn emit(&self, run_id: Uuid, event: RunEvent) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            run_id,
            event,
        });
    }
}
