#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for maestro-security: AuditLog and PermissionSet.

use maestro_core::{ErrorKind, EventSink, RunEvent};
use maestro_security::{AuditEntry, AuditLog, Capability, PermissionSet};
use uuid::Uuid;

// --- AuditLog ---

#[tokio::test]
async fn test_audit_log_writes_events() {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("audit");
    let audit = AuditLog::new(log_dir.clone());

    let run_id = Uuid::new_v4();
    audit.emit(
        run_id,
        RunEvent::RunStarted {
            task: "quarterly sales review".into(),
        },
    );

    // Give the background task time to write
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let contents = tokio::fs::read_to_string(log_dir.join("audit.jsonl"))
        .await
        .unwrap();
    assert!(contents.contains("run_started"));
    assert!(contents.contains("quarterly sales review"));
    assert!(contents.contains(&run_id.to_string()));
}

#[tokio::test]
async fn test_audit_log_preserves_order() {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("audit");
    let audit = AuditLog::new(log_dir.clone());

    let run_id = Uuid::new_v4();
    for attempt in 0..5 {
        audit.emit(
            run_id,
            RunEvent::StepStarted {
                path: "root".into(),
                attempt,
            },
        );
    }
    audit.emit(
        run_id,
        RunEvent::StepFailed {
            path: "root".into(),
            kind: ErrorKind::Timeout,
            message: "slow".into(),
        },
    );

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let contents = tokio::fs::read_to_string(log_dir.join("audit.jsonl"))
        .await
        .unwrap();
    let entries: Vec<AuditEntry> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.len(), 6);
    for (i, entry) in entries.iter().take(5).enumerate() {
        assert!(matches!(entry.event, RunEvent::StepStarted { attempt, .. } if attempt == i as u32));
    }
    assert!(matches!(entries[5].event, RunEvent::StepFailed { .. }));
}

// --- PermissionSet ---

#[test]
fn test_permission_set_grant_revoke() {
    let mut perms = PermissionSet::new();
    perms.grant_tool("forecast");
    perms.grant(Capability::DatabaseQuery);
    assert!(perms.allows_tool("forecast"));
    assert!(perms.has(&Capability::DatabaseQuery));

    perms.revoke_tool("forecast");
    perms.revoke(&Capability::DatabaseQuery);
    assert!(perms.is_empty());
}

#[test]
fn test_network_requirement_needs_every_host() {
    let perms = PermissionSet::with_tools(["crm_lookup"]).with_capability(
        Capability::NetworkAccess {
            allowed_hosts: vec!["crm.internal".into()],
        },
    );
    let one_host = [Capability::NetworkAccess {
        allowed_hosts: vec!["crm.internal".into()],
    }];
    let two_hosts = [Capability::NetworkAccess {
        allowed_hosts: vec!["crm.internal".into(), "billing.internal".into()],
    }];
    assert!(perms.check("crm_lookup", &one_host).is_ok());
    assert!(perms.check("crm_lookup", &two_hosts).is_err());
}

#[test]
fn test_permission_set_serialization() {
    let perms = PermissionSet::with_tools(["memory_search"]).with_capability(Capability::MemoryRead);
    let json = serde_json::to_string(&perms).unwrap();
    let parsed: PermissionSet = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, perms);

    let wildcard: PermissionSet = serde_json::from_value(serde_json::json!({
        "tools": ["*"],
    }))
    .unwrap();
    assert!(wildcard.allows_tool("whatever"));
}
