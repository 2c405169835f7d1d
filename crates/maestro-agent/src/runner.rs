use crate::context::{Compactor, RunContext};
use crate::executor::{CapabilityExecutor, StepRequest, StepResponse};
use maestro_core::{EventSink, MaestroError, MaestroResult, RunEvent, Turn};
use maestro_security::PermissionSet;
use maestro_session::SessionHandle;
use maestro_tools::{InvocationContext, ToolDescriptor, ToolRegistry};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one leaf step.
#[derive(Debug, Clone)]
pub struct LeafOutcome {
    pub output: Value,
    /// Set when the executor asked the run to pause after this step.
    pub suspend: Option<String>,
    pub executor_calls: u32,
}

/// Runs the agentic loop of one leaf:
/// executor → assistant turn → tool calls → tool turns → repeat.
pub struct LeafRunner<'a> {
    pub executor: &'a dyn CapabilityExecutor,
    pub tools: &'a ToolRegistry,
    pub permissions: &'a PermissionSet,
    pub session: &'a SessionHandle,
    pub events: &'a dyn EventSink,
    /// `None` inside parallel branches, where compaction is deferred.
    pub compactor: Option<&'a Compactor>,
    pub max_turns: u32,
    pub fail_on_tool_error: bool,
}

impl LeafRunner<'_> {
    pub async fn run(
        &self,
        run_id: Uuid,
        path: &str,
        node_id: &str,
        task: &str,
        input: &Value,
        ctx: &mut RunContext,
    ) -> MaestroResult<LeafOutcome> {
        let tools: Vec<ToolDescriptor> = self
            .tools
            .list_descriptors()
            .into_iter()
            .filter(|d| self.permissions.allows_tool(&d.name))
            .cloned()
            .collect();

        debug!(run_id = %run_id, path, "Starting leaf loop");

        for turn in 0..self.max_turns {
            let response: StepResponse = self
                .executor
                .execute(StepRequest {
                    run_id,
                    path,
                    node_id,
                    task,
                    input,
                    history: ctx.turns(),
                    tools: &tools,
                    session: self.session,
                    turn,
                })
                .await
                .map_err(as_capability_error)?;

            self.append(run_id, ctx, Turn::assistant(response.completion.clone()))
                .await;

            let invocation = InvocationContext::new(run_id, path);
            for call in &response.tool_calls {
                info!(run_id = %run_id, path, tool = %call.name, call_id = %call.id, "Executing tool call");
                let result = self.tools.invoke(call, self.permissions, &invocation).await;
                let failure = result.error.clone();
                self.events.emit(
                    run_id,
                    RunEvent::ToolInvoked {
                        path: path.to_string(),
                        tool: call.name.clone(),
                        call_id: call.id.clone(),
                        error: failure.as_ref().map(|e| e.kind),
                    },
                );
                self.append(run_id, ctx, Turn::tool(call.clone(), result))
                    .await;

                if let Some(err) = failure {
                    if self.fail_on_tool_error {
                        return Err(MaestroError::from_tool_failure(
                            &call.name,
                            err.kind,
                            &err.message,
                        ));
                    }
                    warn!(run_id = %run_id, path, tool = %call.name, kind = %err.kind, "Tool failed, continuing");
                }
            }

            if response.tool_calls.is_empty() || response.suspend.is_some() {
                debug!(run_id = %run_id, path, calls = turn + 1, "Leaf loop finished");
                return Ok(LeafOutcome {
                    output: response.output_value(),
                    suspend: response.suspend,
                    executor_calls: turn + 1,
                });
            }
        }

        warn!(
            run_id = %run_id,
            path,
            max_turns = self.max_turns,
            "Leaf loop reached max turns"
        );
        Err(MaestroError::Capability(format!(
            "leaf '{node_id}' still requested tools after {} executor calls",
            self.max_turns
        )))
    }

    async fn append(&self, run_id: Uuid, ctx: &mut RunContext, turn: Turn) {
        let report = match self.compactor {
            Some(compactor) => compactor.append(ctx, turn).await,
            None => {
                ctx.push(turn);
                None
            }
        };
        if let Some(report) = report {
            self.events.emit(
                run_id,
                RunEvent::Compacted {
                    before: report.before,
                    after: report.after,
                    folded_turns: report.folded_turns,
                },
            );
        }
    }
}

/// Executor failures surface as capability errors; timeouts and
/// cancellation keep their own kind.
fn as_capability_error(e: MaestroError) -> MaestroError {
    match e {
        MaestroError::Capability(_) | MaestroError::Timeout(_) | MaestroError::Cancelled => e,
        other => MaestroError::Capability(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::{ErrorKind, RecordingSink, Role, ToolCall};
    use maestro_session::SessionStore;
    use maestro_tools::FnTool;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays scripted responses in order.
    struct Scripted(Mutex<VecDeque<StepResponse>>);

    impl Scripted {
        fn new(responses: Vec<StepResponse>) -> Self {
            Self(Mutex::new(responses.into()))
        }
    }

    #[async_trait]
    impl CapabilityExecutor for Scripted {
        async fn execute(&self, _request: StepRequest<'_>) -> MaestroResult<StepResponse> {
            self.0
                .lock()
                .pop_front()
                .ok_or_else(|| MaestroError::Capability("script exhausted".into()))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::new("double", "doubles n", |args, _| {
            let n = args["n"].as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        })));
        registry
    }

    struct Fixture {
        store: Arc<SessionStore>,
        run_id: Uuid,
        sink: RecordingSink,
        tools: ToolRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(SessionStore::new());
            let run_id = Uuid::new_v4();
            store.open(run_id);
            Self {
                store,
                run_id,
                sink: RecordingSink::new(),
                tools: registry(),
            }
        }

        async fn run(
            &self,
            executor: &dyn CapabilityExecutor,
            permissions: &PermissionSet,
            fail_on_tool_error: bool,
            ctx: &mut RunContext,
        ) -> MaestroResult<LeafOutcome> {
            let session = self.store.handle(self.run_id);
            let runner = LeafRunner {
                executor,
                tools: &self.tools,
                permissions,
                session: &session,
                events: &self.sink,
                compactor: None,
                max_turns: 3,
                fail_on_tool_error,
            };
            runner
                .run(self.run_id, "root/leaf", "leaf", "check stock", &json!(null), ctx)
                .await
        }
    }

    #[tokio::test]
    async fn test_tool_loop_appends_turns() {
        let fx = Fixture::new();
        let executor = Scripted::new(vec![
            StepResponse::text("calling").with_tool_call(ToolCall::new(
                "c1",
                "double",
                json!({"n": 21}),
            )),
            StepResponse::text("done").with_output(json!(42)),
        ]);
        let mut ctx = RunContext::new();
        let outcome = fx
            .run(&executor, &PermissionSet::with_tools(["double"]), true, &mut ctx)
            .await
            .unwrap();

        assert_eq!(outcome.output, json!(42));
        assert_eq!(outcome.executor_calls, 2);
        let roles: Vec<Role> = ctx.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(ctx.turns()[1].content, "42");
        assert_eq!(fx.sink.count("tool_invoked"), 1);
    }

    #[tokio::test]
    async fn test_denied_tool_fails_step() {
        let fx = Fixture::new();
        let executor = Scripted::new(vec![StepResponse::text("try").with_tool_call(
            ToolCall::new("c1", "double", json!({"n": 1})),
        )]);
        let mut ctx = RunContext::new();
        let err = fx
            .run(&executor, &PermissionSet::new(), true, &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(fx.tools.stats("double").invocations, 0);
    }

    #[tokio::test]
    async fn test_tool_failure_tolerated_when_configured() {
        let fx = Fixture::new();
        let executor = Scripted::new(vec![
            StepResponse::text("try").with_tool_call(ToolCall::new("c1", "missing", json!({}))),
            StepResponse::text("recovered"),
        ]);
        let mut ctx = RunContext::new();
        let outcome = fx
            .run(&executor, &PermissionSet::allow_all([]), false, &mut ctx)
            .await
            .unwrap();
        assert_eq!(outcome.output, json!("recovered"));
    }

    #[tokio::test]
    async fn test_max_turns_exhausted() {
        let fx = Fixture::new();
        let call = || ToolCall::new("c", "double", json!({"n": 1}));
        let executor = Scripted::new(vec![
            StepResponse::text("1").with_tool_call(call()),
            StepResponse::text("2").with_tool_call(call()),
            StepResponse::text("3").with_tool_call(call()),
        ]);
        let mut ctx = RunContext::new();
        let err = fx
            .run(&executor, &PermissionSet::with_tools(["double"]), true, &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapabilityError);
    }

    #[tokio::test]
    async fn test_suspend_request_ends_step() {
        let fx = Fixture::new();
        let executor = Scripted::new(vec![StepResponse::text("need approval").suspend("approval")]);
        let mut ctx = RunContext::new();
        let outcome = fx
            .run(&executor, &PermissionSet::new(), true, &mut ctx)
            .await
            .unwrap();
        assert_eq!(outcome.suspend.as_deref(), Some("approval"));
        assert_eq!(outcome.output, json!("need approval"));
    }
}
