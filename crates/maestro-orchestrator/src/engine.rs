use crate::catalog::Catalog;
use crate::checkpoint::{
    BranchProgress, Checkpoint, CheckpointHandle, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore, OperationManager, PendingCheckpoint, Progress,
};
use crate::config::OrchestratorConfig;
use crate::monitor::{RunMonitor, RunState, RunStatus};
use crate::types::{
    AgentNode, CompletionPolicy, Failure, FailureReport, LeafSpec, LoopSpec, MergePolicy,
    NodeKind, NodePath, ParallelSpec, PartialResults, RunCompletion, RunFailure, RunOptions,
    RunOutcome,
};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use maestro_agent::{Compactor, LeafRunner, RetryPolicy, RunContext, Summarizer};
use maestro_core::{
    ErrorKind, EventSink, FanoutSink, MaestroError, MaestroResult, RunEvent, TracingSink, Turn,
};
use maestro_memory::{FileMemoryBank, InMemoryMemoryBank, MemoryBank};
use maestro_security::AuditLog;
use maestro_session::{SessionHandle, SessionStore};
use maestro_tools::{register_builtins, Tool, ToolRegistry};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of executing one node.
enum Step {
    Done {
        output: Value,
        ctx: RunContext,
    },
    Suspended {
        progress: Progress,
        ctx: RunContext,
        pause: Pause,
    },
}

type StepResult = Result<Step, Failure>;

/// Which leaf asked to pause, and why.
struct Pause {
    path: String,
    reason: String,
}

/// Per-run state shared by every node of the run.
struct RunScope {
    run_id: Uuid,
    token: CancellationToken,
    session: SessionHandle,
    timeout_ms: Option<u64>,
}

/// Position of the node being executed.
struct Frame<'a> {
    node: &'a AgentNode,
    path: NodePath,
    in_branch: bool,
    attempt: u32,
    resume: Option<Progress>,
}

impl<'a> Frame<'a> {
    fn child(&self, index: usize, node: &'a AgentNode, resume: Option<Progress>) -> Frame<'a> {
        Frame {
            node,
            path: self.path.child(index, &node.id),
            in_branch: self.in_branch,
            attempt: 0,
            resume,
        }
    }

    fn retry_attempt(&self, attempt: u32) -> Frame<'a> {
        Frame {
            node: self.node,
            path: self.path.clone(),
            in_branch: self.in_branch,
            attempt,
            resume: self.resume.clone(),
        }
    }
}

/// Everything needed to drive a run from its root, fresh or resumed.
struct Drive {
    run_id: Uuid,
    root: AgentNode,
    task: String,
    input: Value,
    ctx: RunContext,
    progress: Option<Progress>,
    timeout_ms: Option<u64>,
}

/// Executes agent compositions.
///
/// One orchestrator serves many concurrent runs; each run gets its own
/// session, context and cancellation token.
pub struct Orchestrator {
    catalog: Catalog,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    operations: OperationManager,
    compactor: Compactor,
    events: FanoutSink,
    monitor: Arc<RunMonitor>,
    config: OrchestratorConfig,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

/// Builder for [`Orchestrator`]. Unset stores default to in-memory ones.
pub struct OrchestratorBuilder {
    catalog: Catalog,
    config: OrchestratorConfig,
    tools: ToolRegistry,
    sessions: Option<Arc<SessionStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl OrchestratorBuilder {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            config: OrchestratorConfig::default(),
            tools: ToolRegistry::new(),
            sessions: None,
            checkpoints: None,
            sinks: Vec::new(),
            summarizer: None,
        }
    }

    /// Builder with stores opened from `config.storage`: file checkpoints,
    /// a file memory bank with the built-in memory tools, and the audit trail.
    pub async fn from_config(catalog: Catalog, config: OrchestratorConfig) -> MaestroResult<Self> {
        config.validate()?;
        let mut builder = Self::new(catalog);
        if let Some(dir) = &config.storage.checkpoint_dir {
            builder = builder.checkpoints(Arc::new(FileCheckpointStore::open(dir.clone()).await?));
        }
        let bank: Arc<dyn MemoryBank> = match &config.storage.memory_path {
            Some(path) => Arc::new(FileMemoryBank::open(path.clone()).await?),
            None => Arc::new(InMemoryMemoryBank::new()),
        };
        builder = builder.memory(bank);
        if let Some(dir) = &config.storage.audit_dir {
            builder = builder.sink(Arc::new(AuditLog::new(dir.clone())));
        }
        Ok(builder.config(config))
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    /// Registers `memory_store` and `memory_search` backed by `bank`.
    pub fn memory(mut self, bank: Arc<dyn MemoryBank>) -> Self {
        register_builtins(&mut self.tools, bank);
        self
    }

    pub fn sessions(mut self, sessions: Arc<SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Adds an event sink. Without any, events go to `tracing`.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn build(self) -> Orchestrator {
        let monitor = Arc::new(RunMonitor::with_retention(
            self.config.execution.monitor_retention,
        ));
        let mut sinks = self.sinks;
        if sinks.is_empty() {
            sinks.push(Arc::new(TracingSink));
        }
        sinks.push(monitor.clone());

        let mut compactor = Compactor::new(self.config.compaction.clone());
        if let Some(summarizer) = self.summarizer {
            compactor = compactor.with_summarizer(summarizer);
        }
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));

        info!(
            capabilities = self.catalog.capability_names().len(),
            tools = self.tools.tool_count(),
            "Orchestrator ready"
        );

        Orchestrator {
            catalog: self.catalog,
            tools: Arc::new(self.tools),
            sessions: self.sessions.unwrap_or_default(),
            operations: OperationManager::new(checkpoints),
            compactor,
            events: FanoutSink::new(sinks),
            monitor,
            config: self.config,
            active: Mutex::new(HashMap::new()),
        }
    }
}

impl Orchestrator {
    pub fn builder(catalog: Catalog) -> OrchestratorBuilder {
        OrchestratorBuilder::new(catalog)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn monitor(&self) -> &Arc<RunMonitor> {
        &self.monitor
    }

    pub fn operations(&self) -> &OperationManager {
        &self.operations
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Status and metrics of a run this orchestrator has seen.
    pub fn status(&self, run_id: Uuid) -> Option<RunState> {
        self.monitor.get_state(run_id)
    }

    /// Requests cooperative cancellation. Returns `false` when the run is not
    /// executing.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.lock().get(&run_id) {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn list_pending(&self) -> MaestroResult<Vec<PendingCheckpoint>> {
        self.operations.list_pending().await
    }

    /// Executes `root` to completion, suspension or failure.
    pub async fn run(&self, root: &AgentNode, input: Value, options: RunOptions) -> RunOutcome {
        let run_id = options.run_id.unwrap_or_else(Uuid::new_v4);
        if let Err(e) = root.validate().and_then(|()| self.catalog.check(root)) {
            error!(run_id = %run_id, root = %root.id, error = %e, "Composition rejected");
            return RunOutcome::Failed(RunFailure {
                run_id,
                failure: Failure::from_error(&NodePath::root(&root.id), &e),
            });
        }

        info!(run_id = %run_id, root = %root.id, task = %options.task, "Run started");
        self.sessions.open(run_id);
        self.monitor.start_run(run_id, &options.task);
        self.events.emit(
            run_id,
            RunEvent::RunStarted {
                task: options.task.clone(),
            },
        );

        let mut ctx = RunContext::new();
        if !options.task.is_empty() {
            self.append_top_level(run_id, &mut ctx, Turn::user(options.task.clone()))
                .await;
        }

        self.drive(Drive {
            run_id,
            root: root.clone(),
            task: options.task,
            input,
            ctx,
            progress: None,
            timeout_ms: options
                .timeout_ms
                .or(self.config.execution.default_timeout_ms),
        })
        .await
    }

    /// Continues a suspended run. Each handle can be resumed once.
    pub async fn resume(&self, handle: &CheckpointHandle) -> RunOutcome {
        self.resume_inner(handle, None).await
    }

    /// Like [`Orchestrator::resume`], appending `input` as a user turn first.
    pub async fn resume_with_input(
        &self,
        handle: &CheckpointHandle,
        input: impl Into<String>,
    ) -> RunOutcome {
        self.resume_inner(handle, Some(input.into())).await
    }

    async fn resume_inner(&self, handle: &CheckpointHandle, external: Option<String>) -> RunOutcome {
        let rejected = |e: MaestroError| {
            warn!(run_id = %handle.run_id, checkpoint = %handle.id, error = %e, "Resume rejected");
            RunOutcome::Failed(RunFailure {
                run_id: handle.run_id,
                failure: Failure::new(handle.id.to_string(), e.kind(), e.to_string()),
            })
        };

        let verify = |checkpoint: &Checkpoint| {
            if checkpoint.run_id != handle.run_id {
                return Err(MaestroError::CheckpointCorrupt(format!(
                    "checkpoint {} belongs to run {}",
                    handle.id, checkpoint.run_id
                )));
            }
            self.catalog.check(&checkpoint.root)
        };
        let checkpoint = match self.operations.claim_with(handle, verify).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => return rejected(e),
        };

        let Checkpoint {
            run_id,
            task,
            root,
            input,
            progress,
            context: mut ctx,
            session,
            timeout_ms,
            ..
        } = checkpoint;

        info!(run_id = %run_id, checkpoint = %handle.id, "Run resumed");
        self.sessions.restore(run_id, session);
        self.monitor.start_run(run_id, &task);
        self.events
            .emit(run_id, RunEvent::RunResumed { checkpoint: handle.id });
        if let Some(text) = external {
            self.append_top_level(run_id, &mut ctx, Turn::user(text)).await;
        }

        self.drive(Drive {
            run_id,
            root,
            task,
            input,
            ctx,
            progress: Some(progress),
            timeout_ms,
        })
        .await
    }

    async fn drive(&self, drive: Drive) -> RunOutcome {
        let Drive {
            run_id,
            root,
            task,
            input,
            ctx,
            progress,
            timeout_ms,
        } = drive;

        let token = CancellationToken::new();
        self.active.lock().insert(run_id, token.clone());
        let scope = RunScope {
            run_id,
            token,
            session: self.sessions.handle(run_id),
            timeout_ms,
        };
        let frame = Frame {
            node: &root,
            path: NodePath::root(&root.id),
            in_branch: false,
            attempt: 0,
            resume: progress,
        };

        let started = Instant::now();
        let result = self
            .run_child(&scope, &RetryPolicy::none(), frame, input.clone(), ctx)
            .await;
        self.active.lock().remove(&run_id);
        let duration_ms = millis(started.elapsed());

        match result {
            Ok(Step::Done { output, ctx }) => {
                self.sessions.discard(run_id);
                info!(run_id = %run_id, duration_ms, turns = ctx.len(), "Run completed");
                self.finish(run_id, RunStatus::Completed);
                RunOutcome::Completed(RunCompletion {
                    run_id,
                    output,
                    context: ctx,
                })
            }
            Ok(Step::Suspended {
                progress,
                ctx,
                pause,
            }) => {
                let checkpoint = Checkpoint {
                    run_id,
                    task,
                    root,
                    input,
                    progress,
                    context: ctx,
                    session: self.sessions.snapshot(run_id).unwrap_or_default(),
                    path: pause.path,
                    reason: pause.reason,
                    timeout_ms,
                    created_at: Utc::now(),
                };
                self.suspend(checkpoint).await
            }
            Err(failure) => {
                self.sessions.discard(run_id);
                error!(
                    run_id = %run_id,
                    path = %failure.path,
                    kind = %failure.kind,
                    message = %failure.message,
                    duration_ms,
                    "Run failed"
                );
                let status = if failure.kind == ErrorKind::Cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                self.finish(run_id, status);
                RunOutcome::Failed(RunFailure { run_id, failure })
            }
        }
    }

    async fn suspend(&self, checkpoint: Checkpoint) -> RunOutcome {
        let run_id = checkpoint.run_id;
        let result = self.operations.checkpoint(&checkpoint).await;
        self.sessions.discard(run_id);
        match result {
            Ok(handle) => {
                info!(
                    run_id = %run_id,
                    checkpoint = %handle.id,
                    path = %checkpoint.path,
                    reason = %checkpoint.reason,
                    "Run suspended"
                );
                self.monitor.finish_run(run_id, RunStatus::Suspended);
                self.events.emit(
                    run_id,
                    RunEvent::Suspended {
                        path: checkpoint.path,
                        checkpoint: handle.id,
                        reason: checkpoint.reason,
                    },
                );
                RunOutcome::Suspended(handle)
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to persist checkpoint");
                self.finish(run_id, RunStatus::Failed);
                RunOutcome::Failed(RunFailure {
                    run_id,
                    failure: Failure::new(checkpoint.path, e.kind(), e.to_string()),
                })
            }
        }
    }

    fn finish(&self, run_id: Uuid, status: RunStatus) {
        self.monitor.finish_run(run_id, status);
        self.events.emit(
            run_id,
            RunEvent::RunFinished {
                status: status.as_str().to_string(),
            },
        );
    }

    /// Runs a child, re-running it from a copy of the pre-attempt context
    /// while the failure is retryable. A leaf's own policy wins over the
    /// policy inherited from its parent.
    async fn run_child<'a>(
        &'a self,
        scope: &'a RunScope,
        inherited: &'a RetryPolicy,
        frame: Frame<'a>,
        input: Value,
        ctx: RunContext,
    ) -> StepResult {
        let own = &frame.node.retry;
        let policy = if matches!(frame.node.kind, NodeKind::Leaf(_)) && own.max_retries > 0 {
            own
        } else {
            inherited
        };

        let mut attempt = 0;
        loop {
            let result = self
                .execute(scope, frame.retry_attempt(attempt), input.clone(), ctx.clone())
                .await;
            let failure = match result {
                Err(failure)
                    if failure.kind.is_retryable()
                        && attempt < policy.max_retries
                        && !scope.token.is_cancelled() =>
                {
                    failure
                }
                other => return other,
            };

            let delay = policy.backoff(attempt);
            attempt += 1;
            warn!(
                run_id = %scope.run_id,
                path = %frame.path,
                attempt,
                max_retries = policy.max_retries,
                delay_ms = millis(delay),
                kind = %failure.kind,
                "Retrying step"
            );
            self.events.emit(
                scope.run_id,
                RunEvent::RetryScheduled {
                    path: frame.path.to_string(),
                    attempt,
                    delay_ms: millis(delay),
                },
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = scope.token.cancelled() => return Err(cancelled(&frame.path)),
            }
        }
    }

    fn execute<'a>(
        &'a self,
        scope: &'a RunScope,
        frame: Frame<'a>,
        input: Value,
        ctx: RunContext,
    ) -> BoxFuture<'a, StepResult> {
        async move {
            if scope.token.is_cancelled() {
                return Err(cancelled(&frame.path));
            }
            let node: &'a AgentNode = frame.node;
            match &node.kind {
                NodeKind::Leaf(leaf) => self.run_leaf(scope, leaf, frame, input, ctx).await,
                NodeKind::Sequential { children } => {
                    self.run_sequential(scope, children, frame, input, ctx).await
                }
                NodeKind::Parallel(spec) => self.run_parallel(scope, spec, frame, input, ctx).await,
                NodeKind::Loop(spec) => self.run_loop(scope, spec, frame, input, ctx).await,
            }
        }
        .boxed()
    }

    async fn run_leaf(
        &self,
        scope: &RunScope,
        leaf: &LeafSpec,
        frame: Frame<'_>,
        input: Value,
        mut ctx: RunContext,
    ) -> StepResult {
        let path = frame.path;
        match frame.resume {
            Some(Progress::Leaf { output }) => {
                debug!(run_id = %scope.run_id, path = %path, "Leaf step completed before suspension");
                return Ok(Step::Done { output, ctx });
            }
            Some(other) => return Err(mismatch(&path, "leaf", &other)),
            None => {}
        }

        let Some(executor) = self.catalog.capability(&leaf.capability) else {
            return Err(Failure::new(
                path.as_str(),
                ErrorKind::Config,
                format!("capability '{}' is not registered", leaf.capability),
            ));
        };

        self.events.emit(
            scope.run_id,
            RunEvent::StepStarted {
                path: path.to_string(),
                attempt: frame.attempt,
            },
        );
        let runner = LeafRunner {
            executor: executor.as_ref(),
            tools: self.tools.as_ref(),
            permissions: &leaf.permissions,
            session: &scope.session,
            events: &self.events,
            compactor: (!frame.in_branch).then_some(&self.compactor),
            max_turns: if leaf.max_turns == 0 {
                self.config.execution.default_max_turns
            } else {
                leaf.max_turns
            },
            fail_on_tool_error: leaf.fail_on_tool_error,
        };

        let started = Instant::now();
        let step = runner.run(
            scope.run_id,
            path.as_str(),
            &frame.node.id,
            &leaf.task,
            &input,
            &mut ctx,
        );
        let result = match leaf.timeout_ms.or(scope.timeout_ms) {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), step)
                .await
                .unwrap_or(Err(MaestroError::Timeout(ms))),
            None => step.await,
        };
        let duration_ms = millis(started.elapsed());

        if scope.token.is_cancelled() {
            info!(run_id = %scope.run_id, path = %path, "Run cancelled after leaf step");
            return Err(cancelled(&path));
        }

        match result {
            Ok(outcome) => {
                debug!(
                    run_id = %scope.run_id,
                    path = %path,
                    duration_ms,
                    executor_calls = outcome.executor_calls,
                    "Leaf step finished"
                );
                self.events.emit(
                    scope.run_id,
                    RunEvent::StepFinished {
                        path: path.to_string(),
                        duration_ms,
                    },
                );
                match outcome.suspend {
                    Some(reason) => Ok(Step::Suspended {
                        progress: Progress::Leaf {
                            output: outcome.output,
                        },
                        ctx,
                        pause: Pause {
                            path: path.to_string(),
                            reason,
                        },
                    }),
                    None => Ok(Step::Done {
                        output: outcome.output,
                        ctx,
                    }),
                }
            }
            Err(e) => {
                let failure = Failure::from_error(&path, &e);
                self.step_failed(scope.run_id, &failure);
                Err(failure)
            }
        }
    }

    async fn run_sequential<'a>(
        &'a self,
        scope: &'a RunScope,
        children: &'a [AgentNode],
        mut frame: Frame<'a>,
        input: Value,
        ctx: RunContext,
    ) -> StepResult {
        let (start, mut resume) = match frame.resume.take() {
            None => (0, None),
            Some(Progress::Sequential { index, child }) if index < children.len() => {
                (index, Some(*child))
            }
            Some(other) => return Err(mismatch(&frame.path, "sequential", &other)),
        };

        let mut input = input;
        let mut ctx = ctx;
        for (index, child) in children.iter().enumerate().skip(start) {
            let child_frame = frame.child(index, child, resume.take());
            match self
                .run_child(scope, &frame.node.retry, child_frame, input, ctx)
                .await?
            {
                Step::Done { output, ctx: next } => {
                    input = output;
                    ctx = next;
                }
                Step::Suspended {
                    progress,
                    ctx,
                    pause,
                } => {
                    return Ok(Step::Suspended {
                        progress: Progress::Sequential {
                            index,
                            child: Box::new(progress),
                        },
                        ctx,
                        pause,
                    })
                }
            }
        }
        Ok(Step::Done { output: input, ctx })
    }

    async fn run_loop<'a>(
        &'a self,
        scope: &'a RunScope,
        spec: &'a LoopSpec,
        mut frame: Frame<'a>,
        input: Value,
        ctx: RunContext,
    ) -> StepResult {
        let (mut iteration, mut resume) = match frame.resume.take() {
            None => (0, None),
            Some(Progress::Loop { iteration, child }) if iteration < spec.max_iterations => {
                (iteration, Some(*child))
            }
            Some(other) => return Err(mismatch(&frame.path, "loop", &other)),
        };

        let mut input = input;
        let mut ctx = ctx;
        loop {
            let child_frame = frame.child(0, &spec.child, resume.take());
            match self
                .run_child(scope, &frame.node.retry, child_frame, input, ctx)
                .await?
            {
                Step::Done { output, ctx: next } => {
                    iteration += 1;
                    input = output;
                    ctx = next;
                }
                Step::Suspended {
                    progress,
                    ctx,
                    pause,
                } => {
                    return Ok(Step::Suspended {
                        progress: Progress::Loop {
                            iteration,
                            child: Box::new(progress),
                        },
                        ctx,
                        pause,
                    })
                }
            }

            if self
                .catalog
                .evaluate(&spec.until, &input, &ctx, &scope.session)
            {
                debug!(run_id = %scope.run_id, path = %frame.path, iteration, "Loop predicate satisfied");
                return Ok(Step::Done { output: input, ctx });
            }
            if iteration >= spec.max_iterations {
                let failure = Failure::from_error(
                    &frame.path,
                    &MaestroError::IterationCapExceeded(spec.max_iterations),
                );
                self.step_failed(scope.run_id, &failure);
                return Err(failure);
            }
        }
    }

    async fn run_parallel<'a>(
        &'a self,
        scope: &'a RunScope,
        spec: &'a ParallelSpec,
        mut frame: Frame<'a>,
        input: Value,
        ctx: RunContext,
    ) -> StepResult {
        let children = &spec.children;
        let (input, mut slots) = match frame.resume.take() {
            None => (input, vec![BranchProgress::NotStarted; children.len()]),
            Some(Progress::Parallel { input, branches }) if branches.len() == children.len() => {
                (input, branches)
            }
            Some(other) => return Err(mismatch(&frame.path, "parallel", &other)),
        };

        let base_len = ctx.len();
        let limit = self.config.execution.max_parallel_branches.max(1);
        let retry = &frame.node.retry;
        let mut pending = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(
                    s,
                    BranchProgress::NotStarted | BranchProgress::Suspended { .. }
                )
            })
            .map(|(i, _)| i)
            .collect::<Vec<_>>()
            .into_iter();
        let mut pauses: Vec<Option<Pause>> = children.iter().map(|_| None).collect();
        let mut running: FuturesUnordered<BoxFuture<'a, (usize, StepResult)>> =
            FuturesUnordered::new();
        let mut winner = None;

        debug!(
            run_id = %scope.run_id,
            path = %frame.path,
            branches = children.len(),
            to_run = pending.len(),
            "Parallel node started"
        );

        loop {
            while running.len() < limit {
                let Some(index) = pending.next() else { break };
                let slot = std::mem::replace(&mut slots[index], BranchProgress::NotStarted);
                let (resume, delta) = match slot {
                    BranchProgress::Suspended { progress, delta } => (Some(progress), delta),
                    _ => (None, Vec::new()),
                };
                let mut branch_ctx = ctx.clone();
                branch_ctx.extend(delta);
                let child = &children[index];
                let child_frame = Frame {
                    node: child,
                    path: frame.path.child(index, &child.id),
                    in_branch: true,
                    attempt: 0,
                    resume,
                };
                running.push(
                    self.run_child(scope, retry, child_frame, input.clone(), branch_ctx)
                        .map(move |result| (index, result))
                        .boxed(),
                );
            }

            let Some((index, result)) = running.next().await else {
                break;
            };
            let branch = match result {
                Ok(Step::Done { output, ctx }) => BranchProgress::Done {
                    output,
                    delta: ctx.delta_since(base_len),
                },
                Ok(Step::Suspended {
                    progress,
                    ctx,
                    pause,
                }) => {
                    pauses[index] = Some(pause);
                    BranchProgress::Suspended {
                        progress,
                        delta: ctx.delta_since(base_len),
                    }
                }
                Err(failure) => BranchProgress::Failed { failure },
            };
            let decided = matches!(
                (spec.completion, &branch),
                (
                    CompletionPolicy::Race | CompletionPolicy::FirstSuccess,
                    BranchProgress::Done { .. }
                ) | (CompletionPolicy::Race, BranchProgress::Failed { .. })
            );
            slots[index] = branch;
            if decided {
                winner = Some(index);
                break;
            }
        }
        // Dropping the set cancels branches that lost a race.
        drop(running);

        if scope.token.is_cancelled() {
            return Err(cancelled(&frame.path));
        }

        if let Some(index) = winner {
            info!(
                run_id = %scope.run_id,
                path = %frame.path,
                branch = %children[index].id,
                completion = ?spec.completion,
                "Parallel node decided by first result"
            );
            match std::mem::replace(&mut slots[index], BranchProgress::NotStarted) {
                BranchProgress::Done { output, delta } => {
                    let mut merged = ctx;
                    merged.extend(delta);
                    return Ok(self.settle(scope, &frame, merged, output).await);
                }
                BranchProgress::Failed { failure } => return Err(failure),
                other => slots[index] = other,
            }
        }

        let failures: Vec<Failure> = slots
            .iter()
            .filter_map(|s| match s {
                BranchProgress::Failed { failure } => Some(failure.clone()),
                _ => None,
            })
            .collect();
        let any_suspended = slots
            .iter()
            .any(|s| matches!(s, BranchProgress::Suspended { .. }));
        let must_fail = match spec.completion {
            CompletionPolicy::WaitAll => !failures.is_empty(),
            CompletionPolicy::Race | CompletionPolicy::FirstSuccess => !any_suspended,
        };

        if must_fail {
            if let Some(failure) = self.aggregate_failure(scope, spec, &frame, &slots, failures) {
                return Err(failure);
            }
        }

        if any_suspended {
            let pause = pauses
                .into_iter()
                .flatten()
                .next()
                .unwrap_or_else(|| Pause {
                    path: frame.path.to_string(),
                    reason: String::new(),
                });
            info!(
                run_id = %scope.run_id,
                path = %frame.path,
                suspended_at = %pause.path,
                "Parallel node suspended"
            );
            return Ok(Step::Suspended {
                progress: Progress::Parallel {
                    input,
                    branches: slots,
                },
                ctx,
                pause,
            });
        }

        let mut merged = ctx;
        let mut outputs = Vec::new();
        let mut writers = 0;
        for (child, slot) in children.iter().zip(slots) {
            if let BranchProgress::Done { output, delta } = slot {
                if !delta.is_empty() {
                    writers += 1;
                }
                merged.extend(delta);
                outputs.push((child.id.clone(), output));
            }
        }

        let output = match &spec.merge {
            MergePolicy::LastWriterWins => {
                if writers > 1 {
                    warn!(
                        run_id = %scope.run_id,
                        path = %frame.path,
                        writers,
                        "Concurrent branch results merged last-writer-wins"
                    );
                }
                outputs.pop().map(|(_, output)| output).unwrap_or(Value::Null)
            }
            MergePolicy::Collect => Value::Object(outputs.into_iter().collect()),
            MergePolicy::Custom(name) => {
                let merged_output = match self.catalog.merger(name) {
                    Some(merger) => merger.merge(&outputs),
                    None => Err(MaestroError::Config(format!(
                        "merger '{name}' is not registered"
                    ))),
                };
                match merged_output {
                    Ok(value) => value,
                    Err(e) => {
                        let failure = Failure::from_error(&frame.path, &e);
                        self.step_failed(scope.run_id, &failure);
                        return Err(failure);
                    }
                }
            }
        };

        Ok(self.settle(scope, &frame, merged, output).await)
    }

    /// Builds the failure a parallel node reports.
    fn aggregate_failure(
        &self,
        scope: &RunScope,
        spec: &ParallelSpec,
        frame: &Frame<'_>,
        slots: &[BranchProgress],
        failures: Vec<Failure>,
    ) -> Option<Failure> {
        let first = failures.first()?.clone();
        let retained: BTreeMap<String, Value> = match spec.partial {
            PartialResults::Discard => BTreeMap::new(),
            PartialResults::Retain => spec
                .children
                .iter()
                .zip(slots)
                .filter_map(|(child, slot)| match slot {
                    BranchProgress::Done { output, .. } => Some((child.id.clone(), output.clone())),
                    _ => None,
                })
                .collect(),
        };

        let failed = failures.len();
        let mut failure = match spec.report {
            FailureReport::First => first,
            FailureReport::All => {
                let mut aggregate = Failure::new(
                    frame.path.as_str(),
                    first.kind,
                    format!("{failed} of {} branches failed", spec.children.len()),
                );
                aggregate.branches = failures;
                self.step_failed(scope.run_id, &aggregate);
                aggregate
            }
        };
        failure.retained = retained;
        warn!(
            run_id = %scope.run_id,
            path = %frame.path,
            failed,
            retained = failure.retained.len(),
            "Parallel node failed"
        );
        Some(failure)
    }

    /// Compacts a merged context unless it belongs to an enclosing branch.
    async fn settle(
        &self,
        scope: &RunScope,
        frame: &Frame<'_>,
        mut ctx: RunContext,
        output: Value,
    ) -> Step {
        if !frame.in_branch {
            if let Some(report) = self.compactor.compact_if_needed(&mut ctx).await {
                self.emit_compacted(scope.run_id, &report);
            }
        }
        Step::Done { output, ctx }
    }

    async fn append_top_level(&self, run_id: Uuid, ctx: &mut RunContext, turn: Turn) {
        if let Some(report) = self.compactor.append(ctx, turn).await {
            self.emit_compacted(run_id, &report);
        }
    }

    fn emit_compacted(&self, run_id: Uuid, report: &maestro_agent::CompactionReport) {
        self.events.emit(
            run_id,
            RunEvent::Compacted {
                before: report.before,
                after: report.after,
                folded_turns: report.folded_turns,
            },
        );
    }

    fn step_failed(&self, run_id: Uuid, failure: &Failure) {
        warn!(
            run_id = %run_id,
            path = %failure.path,
            kind = %failure.kind,
            message = %failure.message,
            "Step failed"
        );
        self.events.emit(
            run_id,
            RunEvent::StepFailed {
                path: failure.path.clone(),
                kind: failure.kind,
                message: failure.message.clone(),
            },
        );
    }
}

fn cancelled(path: &NodePath) -> Failure {
    Failure::from_error(path, &MaestroError::Cancelled)
}

fn mismatch(path: &NodePath, kind: &str, progress: &Progress) -> Failure {
    Failure::from_error(
        path,
        &MaestroError::CheckpointCorrupt(format!(
            "progress {progress:?} does not fit {kind} node"
        )),
    )
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
