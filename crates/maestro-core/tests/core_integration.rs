#![allow(clippy::unwrap_used, clippy::expect_used)]

use maestro_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Turn serialization keeps the tool record
// ---------------------------------------------------------------------------

#[test]
fn tool_turn_serialization_roundtrip() {
    let call = ToolCall::new(
        "call_abc123",
        "sales_analysis",
        serde_json::json!({"region": "north", "period": "Q4"}),
    );
    let result = ToolResult::success(&call, serde_json::json!({"growth": 0.15}));
    let turn = Turn::tool(call.clone(), result.clone());

    let json = serde_json::to_string(&turn).unwrap();
    let parsed: Turn = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.role, Role::Tool);
    let record = parsed.tool.expect("tool record");
    assert_eq!(record.call, call);
    assert_eq!(record.result, result);
    assert_eq!(parsed.timestamp, turn.timestamp);
}

// ---------------------------------------------------------------------------
// 2. ToolCall -> ToolResult flow (success and error variants)
// ---------------------------------------------------------------------------

#[test]
fn tool_call_to_tool_result_flow() {
    let call = ToolCall::new("call_1", "inventory_check", serde_json::json!({"sku": "X"}));

    let ok = ToolResult::success(&call, serde_json::json!("42 units"));
    assert_eq!(ok.call_id, call.id);
    assert_eq!(ok.content(), "42 units");
    assert!(!ok.is_error());

    let failed = ToolResult::failure(&call, ErrorKind::ToolExecutionError, "warehouse offline");
    assert!(failed.is_error());
    let err = failed.error.as_ref().unwrap();
    let rebuilt = MaestroError::from_tool_failure(&call.name, err.kind, &err.message);
    assert_eq!(rebuilt.kind(), ErrorKind::ToolExecutionError);
}

// ---------------------------------------------------------------------------
// 3. Error display carries the context operators need
// ---------------------------------------------------------------------------

#[test]
fn error_display_formats() {
    let id = Uuid::new_v4();
    assert_eq!(
        MaestroError::AlreadyResumed(id).to_string(),
        format!("Checkpoint {id} was already resumed")
    );
    assert_eq!(
        MaestroError::IterationCapExceeded(5).to_string(),
        "Loop reached its cap of 5 iterations"
    );
    let err = MaestroError::ToolExecution {
        tool: "forecast".into(),
        cause: "division by zero".into(),
    };
    assert_eq!(err.to_string(), "Tool 'forecast' failed: division by zero");
}

// ---------------------------------------------------------------------------
// 4. Events serialize with a type tag
// ---------------------------------------------------------------------------

#[test]
fn run_event_json_shape() {
    let event = RunEvent::StepFailed {
        path: "root/analyst".into(),
        kind: ErrorKind::Timeout,
        message: "Timed out after 50 ms".into(),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "step_failed");
    assert_eq!(json["kind"], "timeout");

    let back: RunEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
}
