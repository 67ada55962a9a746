// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use skein_config::Config;
use skein_events::{AgentRuntimeState, BreakpointState, EventKind};
use skein_model::{
    BlockAccumulator, CompletionRequest, ContentBlock, Message, ModelProvider, ModelStopReason,
    StreamChunk, ToolSchema, Usage,
};
use skein_store::{AgentInfo, MemoryStore, Snapshot, Store, TodoItem};
use skein_tools::{
    PermissionPolicy, Sandbox, ServiceProvider, ToolCall, ToolContext, ToolHooks, ToolRegistry,
};

use crate::breakpoint::BreakpointManager;
use crate::bus::{BusOptions, EventBus};
use crate::context::ContextManager;
use crate::file_pool::FilePool;
use crate::permission::PermissionManager;
use crate::runner::{PendingApproval, RecordTable, ToolRunner};

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxIterations,
    Cancelled,
    AwaitingApproval,
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxIterations => "max_iterations",
            Self::Cancelled => "cancelled",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Error => "error",
        }
    }
}

/// One iteration's verdict: keep looping or surface a stop reason.
enum StepOutcome {
    Continue,
    Finished(StopReason),
}

/// A tool batch parked on approval decisions, carried across the pause.
pub(crate) struct PendingBatch {
    pub(crate) slots: Vec<Option<ContentBlock>>,
    pub(crate) pending: Vec<PendingApproval>,
    pub(crate) iterations: u32,
}

/// The stateful orchestration unit: owns its message list, tool records,
/// breakpoint, event cursor, and pending-approval table, and drives the
/// model ↔ tool loop.
pub struct Agent {
    pub(crate) id: String,
    pub(crate) config: Config,
    pub(crate) model: Arc<dyn ModelProvider>,
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) permissions: Arc<PermissionManager>,
    pub(crate) breakpoints: Arc<std::sync::Mutex<BreakpointManager>>,
    pub(crate) file_pool: Arc<FilePool>,
    pub(crate) sandbox: Arc<dyn Sandbox>,
    pub(crate) services: Arc<ServiceProvider>,
    pub(crate) context: ContextManager,
    pub(crate) runner: ToolRunner,
    pub(crate) records: Arc<RecordTable>,
    pub(crate) messages: Vec<Message>,
    pub(crate) todos: Vec<TodoItem>,
    pub(crate) info: AgentInfo,
    pub(crate) state: AgentRuntimeState,
    pub(crate) step_count: u32,
    pub(crate) pending_batch: Option<PendingBatch>,
    pub(crate) cancel: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn permissions(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    pub fn file_pool(&self) -> &Arc<FilePool> {
        &self.file_pool
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub async fn records(&self) -> Vec<skein_store::ToolCallRecord> {
        self.records.all().await
    }

    pub fn todos(&self) -> &[TodoItem] {
        &self.todos
    }

    pub fn state(&self) -> AgentRuntimeState {
        self.state
    }

    pub fn breakpoint(&self) -> BreakpointState {
        self.breakpoints.lock().unwrap().current()
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn is_paused(&self) -> bool {
        self.pending_batch.is_some()
    }

    /// Token for cancelling the current (or next) turn from another task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve a pending approval positively.
    pub fn approve(&self, call_id: &str) {
        self.permissions.approve(call_id);
    }

    /// Resolve a pending approval negatively.
    pub fn deny(&self, call_id: &str, reason: Option<&str>) {
        self.permissions.deny(call_id, reason);
    }

    // ── Turn entry points ─────────────────────────────────────────────────────

    /// Append a user message and run the step loop until the turn ends.
    /// Never panics or returns an error: every failure is classified into a
    /// [`StopReason`] and reported as a monitor `error` event.
    pub async fn run(&mut self, input: &str) -> StopReason {
        if self.pending_batch.is_some() {
            self.bus.emit(EventKind::Error {
                message: "run() called while a turn is awaiting approval; call resume_turn()"
                    .into(),
                source: None,
            });
            return StopReason::Error;
        }
        self.refresh_cancel();
        let result = self.run_inner(input).await;
        self.finish_turn(result)
    }

    /// Alias for [`run`](Self::run).
    pub async fn send(&mut self, input: &str) -> StopReason {
        self.run(input).await
    }

    /// Execute exactly one loop iteration.  `None` means the turn continues
    /// (more iterations needed); `Some` is the turn's stop reason.
    pub async fn step(&mut self) -> Option<StopReason> {
        match self.step_once().await {
            Ok(StepOutcome::Continue) => None,
            Ok(StepOutcome::Finished(reason)) => Some(reason),
            Err(e) => Some(self.finish_turn(Err(e))),
        }
    }

    /// Continue a turn that paused on approval.  Awaits the outstanding
    /// decisions, finishes the parked batch, and re-enters the loop.
    pub async fn resume_turn(&mut self) -> StopReason {
        let Some(batch) = self.pending_batch.take() else {
            self.bus.emit(EventKind::Error {
                message: "resume_turn() called but no turn is paused".into(),
                source: None,
            });
            return StopReason::Error;
        };
        self.refresh_cancel();
        let result = self.resume_inner(batch).await;
        self.finish_turn(result)
    }

    /// Capture an immutable snapshot; only valid at a safe fork point.
    pub async fn save_snapshot(&mut self, metadata: Value) -> anyhow::Result<String> {
        anyhow::ensure!(
            self.breakpoints.lock().unwrap().is_safe_fork_point(),
            "snapshots require a safe fork point (READY or POST_TOOL)"
        );
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            messages: self.messages.clone(),
            last_sfp_index: self.messages.len().checked_sub(1),
            last_bookmark: self.bus.last_bookmark(),
            created_at: chrono::Utc::now(),
            metadata,
        };
        self.store.save_snapshot(&self.id, &snapshot).await?;
        self.info.last_sfp_index = snapshot.last_sfp_index;
        self.persist_info().await?;
        Ok(snapshot.id)
    }

    /// Manually settle a tool record (the `Manual` recovery strategy leaves
    /// incomplete records for exactly this).  Appends a pairing tool_result
    /// when the call's tool_use is still dangling in the message log.
    pub async fn resolve_tool_manually(
        &mut self,
        call_id: &str,
        output: Value,
        is_error: bool,
        note: Option<&str>,
    ) -> anyhow::Result<()> {
        let output_for_record = output.clone();
        self.records
            .mutate(call_id, |r| {
                r.result = Some(output_for_record);
                r.is_error = is_error;
                if is_error {
                    r.error = Some("manually marked failed".into());
                }
                let state = if is_error {
                    skein_store::RecordState::Failed
                } else {
                    skein_store::RecordState::Completed
                };
                r.transition(state, note.or(Some("manual update")));
            })
            .await?;

        let answered = self.messages.iter().flat_map(|m| &m.content).any(|b| {
            matches!(b, ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == call_id)
        });
        let dangling = self
            .messages
            .iter()
            .any(|m| m.tool_uses().iter().any(|(id, _, _)| *id == call_id));
        if dangling && !answered {
            self.messages.push(Message::tool_results(vec![ContentBlock::tool_result(
                call_id, output, is_error,
            )]));
            self.persist_state().await?;
        }

        self.bus.emit(EventKind::ToolManualUpdated {
            call_id: call_id.into(),
            note: note.map(str::to_string),
        });
        Ok(())
    }

    /// Replace and persist the todo list, announcing the change.
    pub async fn update_todos(&mut self, todos: Vec<TodoItem>) -> anyhow::Result<()> {
        self.store.save_todos(&self.id, &todos).await?;
        self.bus.emit(EventKind::TodoChanged {
            todos: serde_json::to_value(&todos)?,
        });
        self.todos = todos;
        Ok(())
    }

    // ── Loop internals ────────────────────────────────────────────────────────

    fn refresh_cancel(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }

    fn finish_turn(&mut self, result: anyhow::Result<StopReason>) -> StopReason {
        match result {
            Ok(reason) => reason,
            Err(e) => {
                self.bus.emit(EventKind::Error {
                    message: format!("{e:#}"),
                    source: None,
                });
                if self.state != AgentRuntimeState::Ready {
                    let previous = self.state;
                    self.state = AgentRuntimeState::Ready;
                    self.bus.emit(EventKind::StateChanged {
                        previous,
                        current: AgentRuntimeState::Ready,
                    });
                }
                StopReason::Error
            }
        }
    }

    async fn run_inner(&mut self, input: &str) -> anyhow::Result<StopReason> {
        self.messages.push(Message::user(input));
        self.persist_state().await?;
        self.transition(BreakpointState::PreModel).await?;
        self.turn_loop(0).await
    }

    async fn turn_loop(&mut self, start_iterations: u32) -> anyhow::Result<StopReason> {
        let mut iterations = start_iterations;
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(AgentRuntimeState::Ready);
                self.persist_info().await?;
                return Ok(StopReason::Cancelled);
            }
            if iterations >= self.config.agent.max_iterations {
                self.bus.emit(EventKind::Done {
                    step: self.step_count,
                    reason: "max_iterations".into(),
                });
                self.transition(BreakpointState::Ready).await?;
                self.set_state(AgentRuntimeState::Ready);
                self.persist_info().await?;
                return Ok(StopReason::MaxIterations);
            }
            iterations += 1;
            match self.step_once().await? {
                StepOutcome::Continue => {}
                StepOutcome::Finished(reason) => {
                    // Remember how far we got in case this iteration parked.
                    if let Some(batch) = self.pending_batch.as_mut() {
                        batch.iterations = iterations;
                    }
                    return Ok(reason);
                }
            }
        }
    }

    async fn step_once(&mut self) -> anyhow::Result<StepOutcome> {
        let started = Instant::now();
        self.transition(BreakpointState::PreModel).await?;
        self.persist_state().await?;
        self.set_state(AgentRuntimeState::Working);

        // Token-bounded window: compress before the request is built.
        let compressed = self
            .context
            .compress_if_needed(
                &self.id.clone(),
                &mut self.messages,
                &self.bus,
                &self.store,
                &self.file_pool,
                &self.sandbox,
                &self.config.model.name.clone(),
            )
            .await?;
        if compressed.is_some() {
            self.persist_state().await?;
        }

        let request = self.build_request();
        self.transition(BreakpointState::StreamingModel).await?;
        let (blocks, stop_reason, usage) = self.stream_model(request).await?;

        if let Some(usage) = usage {
            self.bus.emit(EventKind::TokenUsage {
                input: usage.input_tokens,
                output: usage.output_tokens,
                total: usage.total(),
            });
        }

        let blocks = if self.config.model.enable_thinking {
            blocks
        } else {
            blocks
                .into_iter()
                .filter(|b| !matches!(b, ContentBlock::Thinking { .. }))
                .collect()
        };

        let calls: Vec<ToolCall> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    args: input.clone(),
                }),
                _ => None,
            })
            .collect();

        if self.cancel.is_cancelled() {
            // Commit whatever streamed before the interrupt.
            if !blocks.is_empty() {
                self.messages.push(Message::assistant_blocks(blocks));
                self.persist_state().await?;
            }
            self.set_state(AgentRuntimeState::Ready);
            self.persist_info().await?;
            return Ok(StepOutcome::Finished(StopReason::Cancelled));
        }

        if calls.is_empty() {
            if !blocks.is_empty() {
                self.messages.push(Message::assistant_blocks(blocks));
                self.persist_state().await?;
            }
            let reason = match stop_reason {
                Some(ModelStopReason::MaxTokens) => "max_tokens",
                Some(ModelStopReason::StopSequence) => "stop_sequence",
                _ => "end_turn",
            };
            self.bus.emit(EventKind::Done {
                step: self.step_count,
                reason: reason.into(),
            });
            self.transition(BreakpointState::Ready).await?;
            self.set_state(AgentRuntimeState::Ready);
            self.emit_step_complete(started);
            self.step_count += 1;
            self.persist_info().await?;
            return Ok(StepOutcome::Finished(StopReason::EndTurn));
        }

        // Tool path: the assistant message carries text + thinking + tool_use
        // blocks exactly as streamed.
        self.messages.push(Message::assistant_blocks(blocks));
        self.persist_state().await?;
        self.transition(BreakpointState::ToolPending).await?;
        self.transition(BreakpointState::PreTool).await?;

        let ctx = self.tool_context();
        let outcome = self.runner.run_batch(&calls, &ctx, &self.cancel).await?;

        if outcome.cancelled {
            self.set_state(AgentRuntimeState::Ready);
            self.persist_info().await?;
            return Ok(StepOutcome::Finished(StopReason::Cancelled));
        }

        if !outcome.pending.is_empty() {
            self.pending_batch = Some(PendingBatch {
                slots: outcome.slots,
                pending: outcome.pending,
                iterations: 0,
            });
            self.transition(BreakpointState::AwaitingApproval).await?;
            self.persist_state().await?;
            self.set_state(AgentRuntimeState::Paused);
            return Ok(StepOutcome::Finished(StopReason::AwaitingApproval));
        }

        self.finish_batch(outcome.slots, started).await?;
        Ok(StepOutcome::Continue)
    }

    /// Append the batch's single tool_results message and close the iteration.
    async fn finish_batch(
        &mut self,
        slots: Vec<Option<ContentBlock>>,
        started: Instant,
    ) -> anyhow::Result<()> {
        self.transition(BreakpointState::PostTool).await?;
        let blocks: Vec<ContentBlock> = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .context("tool batch finished with unfilled result slots")?;
        self.messages.push(Message::tool_results(blocks));
        self.persist_state().await?;
        self.emit_step_complete(started);
        self.step_count += 1;
        self.persist_info().await?;
        Ok(())
    }

    async fn resume_inner(&mut self, mut batch: PendingBatch) -> anyhow::Result<StopReason> {
        let started = Instant::now();
        self.set_state(AgentRuntimeState::Working);
        let ctx = self.tool_context();

        while !batch.pending.is_empty() {
            let mut pending = batch.pending.remove(0);
            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                d = &mut pending.rx => Some(d),
            };
            let Some(decision) = outcome else {
                // Park again; the records stay APPROVAL_REQUIRED.
                batch.pending.insert(0, pending);
                self.pending_batch = Some(batch);
                self.set_state(AgentRuntimeState::Paused);
                return Ok(StopReason::Cancelled);
            };
            let decision = decision.context("approval channel closed without a decision")?;

            if decision.approved {
                self.records
                    .mutate(&pending.call.id, |r| {
                        r.approval.decision = Some("approve".into());
                        r.approval.decided_by = decision.decided_by.clone();
                        r.approval.decided_at = Some(chrono::Utc::now());
                        r.approval.note = decision.note.clone();
                        r.transition(skein_store::RecordState::Approved, Some("approved"));
                    })
                    .await?;
                self.transition(BreakpointState::PreTool).await?;
                let block = self
                    .runner
                    .execute_approved(&pending.call, &ctx, &self.cancel)
                    .await?;
                batch.slots[pending.index] = Some(block);
            } else {
                let note = decision
                    .note
                    .clone()
                    .unwrap_or_else(|| "denied by user".into());
                let msg = format!("permission denied: {note}");
                let record = self
                    .records
                    .mutate(&pending.call.id, |r| {
                        r.approval.decision = Some("deny".into());
                        r.approval.decided_by = decision.decided_by.clone();
                        r.approval.decided_at = Some(chrono::Utc::now());
                        r.approval.note = decision.note.clone();
                        r.error = Some(msg.clone());
                        r.is_error = true;
                        r.transition(skein_store::RecordState::Denied, Some("denied"));
                    })
                    .await?;
                self.bus.emit(EventKind::ToolError {
                    call: record.snapshot(),
                    error: msg.clone(),
                });
                batch.slots[pending.index] = Some(ContentBlock::tool_result(
                    &pending.call.id,
                    Value::String(msg),
                    true,
                ));
            }
        }

        self.finish_batch(batch.slots, started).await?;
        self.transition(BreakpointState::PreModel).await?;
        self.turn_loop(batch.iterations).await
    }

    async fn stream_model(
        &mut self,
        request: CompletionRequest,
    ) -> anyhow::Result<(Vec<ContentBlock>, Option<ModelStopReason>, Option<Usage>)> {
        enum Run {
            Text(String),
            Think(String),
        }

        fn flush(bus: &Arc<EventBus>, open: &mut Option<Run>) {
            match open.take() {
                Some(Run::Text(text)) => {
                    bus.emit(EventKind::TextChunkEnd { text });
                }
                Some(Run::Think(text)) => {
                    bus.emit(EventKind::ThinkChunkEnd { text });
                }
                None => {}
            }
        }

        let expose_thinking = self.config.model.enable_thinking;
        let mut stream = self
            .model
            .stream(request)
            .await
            .context("model request failed")?;
        let mut acc = BlockAccumulator::new();
        let mut open: Option<Run> = None;

        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                break;
            }
            let chunk = chunk.context("model stream failed")?;
            match &chunk {
                StreamChunk::TextDelta { delta } => {
                    match &mut open {
                        Some(Run::Text(buf)) => buf.push_str(delta),
                        other => {
                            flush(&self.bus, other);
                            self.bus.emit(EventKind::TextChunkStart {});
                            *other = Some(Run::Text(delta.clone()));
                        }
                    }
                    self.bus.emit(EventKind::TextChunk { delta: delta.clone() });
                }
                StreamChunk::ThinkingDelta { delta } => {
                    if expose_thinking {
                        match &mut open {
                            Some(Run::Think(buf)) => buf.push_str(delta),
                            other => {
                                flush(&self.bus, other);
                                self.bus.emit(EventKind::ThinkChunkStart {});
                                *other = Some(Run::Think(delta.clone()));
                            }
                        }
                        self.bus.emit(EventKind::ThinkChunk { delta: delta.clone() });
                    }
                }
                _ => flush(&self.bus, &mut open),
            }
            acc.push(chunk);
        }
        flush(&self.bus, &mut open);

        let (blocks, stop_reason, usage) = acc.finish();
        Ok((blocks, stop_reason, usage))
    }

    fn build_request(&self) -> CompletionRequest {
        let tools: Vec<ToolSchema> = self
            .registry
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                input_schema: s.input_schema,
            })
            .collect();
        CompletionRequest {
            model: self.config.model.name.clone(),
            messages: self.messages.clone(),
            system_prompt: self.config.agent.system_prompt.clone(),
            tools,
            max_tokens: self.config.model.max_tokens,
            temperature: self.config.model.temperature,
            stop_sequences: self.config.model.stop_sequences.clone(),
            enable_thinking: self.config.model.enable_thinking,
            thinking_budget: self.config.model.thinking_budget,
        }
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            agent_id: self.id.clone(),
            call_id: String::new(),
            sandbox: self.sandbox.clone(),
            services: self.services.clone(),
        }
    }

    fn emit_step_complete(&self, started: Instant) {
        self.bus.emit(EventKind::StepComplete {
            step: self.step_count,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn set_state(&mut self, next: AgentRuntimeState) {
        if self.state != next {
            let previous = self.state;
            self.state = next;
            self.bus.emit(EventKind::StateChanged { previous, current: next });
        }
    }

    /// Breakpoint transition; metadata is persisted whenever it changed.
    async fn transition(&mut self, next: BreakpointState) -> anyhow::Result<()> {
        let changed = self.breakpoints.lock().unwrap().transition_to(next);
        if changed {
            self.persist_info().await?;
        }
        Ok(())
    }

    /// Critical-path save: messages + metadata.  Failures abort the step.
    pub(crate) async fn persist_state(&mut self) -> anyhow::Result<()> {
        self.store
            .save_messages(&self.id, &self.messages)
            .await
            .context("persisting messages")?;
        self.persist_info().await
    }

    pub(crate) async fn persist_info(&mut self) -> anyhow::Result<()> {
        self.info.message_count = self.messages.len();
        self.info.step_count = self.step_count;
        self.info.last_bookmark = self.bus.last_bookmark();
        self.info.breakpoint = self.breakpoints.lock().unwrap().current();
        self.info.state_version += 1;
        self.store
            .save_info(&self.info)
            .await
            .context("persisting agent metadata")?;
        Ok(())
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Assembles an [`Agent`] and its collaborators.  `model` and `sandbox` are
/// required; everything else has a sensible default (in-memory store, empty
/// registry, policy from config).
#[derive(Default)]
pub struct AgentBuilder {
    id: Option<String>,
    config: Config,
    model: Option<Arc<dyn ModelProvider>>,
    registry: Option<ToolRegistry>,
    store: Option<Arc<dyn Store>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    hooks: ToolHooks,
    services: Option<Arc<ServiceProvider>>,
    policy: Option<PermissionPolicy>,
    bus_options: Option<BusOptions>,
}

impl AgentBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelProvider>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn hooks(mut self, hooks: ToolHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn services(mut self, services: Arc<ServiceProvider>) -> Self {
        self.services = Some(services);
        self
    }

    /// Override the policy built from `config.permissions` (e.g. to attach a
    /// custom mode handler).
    pub fn policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn bus_options(mut self, options: BusOptions) -> Self {
        self.bus_options = Some(options);
        self
    }

    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> anyhow::Result<Agent> {
        let model = self.model.context("an agent requires a model provider")?;
        let sandbox = self.sandbox.context("an agent requires a sandbox")?;
        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let store: Arc<dyn Store> = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let registry = Arc::new(self.registry.unwrap_or_default());
        let services = self.services.unwrap_or_else(|| Arc::new(ServiceProvider::new()));
        let config = self.config;

        let bus = EventBus::new(&id, store.clone(), self.bus_options.unwrap_or_default());
        let policy = self
            .policy
            .unwrap_or_else(|| PermissionPolicy::from_config(&config.permissions));
        let permissions = PermissionManager::new(policy, bus.clone());
        let breakpoints = Arc::new(std::sync::Mutex::new(BreakpointManager::new(
            bus.clone(),
            BreakpointState::Ready,
        )));
        let file_pool = FilePool::new(sandbox.clone());
        file_pool.attach_bus(bus.clone());
        let records = RecordTable::new(&id, store.clone());
        let runner = ToolRunner::new(
            registry.clone(),
            self.hooks,
            permissions.clone(),
            file_pool.clone(),
            bus.clone(),
            records.clone(),
            breakpoints.clone(),
            config.agent.tool_concurrency,
            Duration::from_secs(config.agent.tool_timeout_secs),
        );
        let context = ContextManager::new(config.context.clone());

        let mut info = AgentInfo::new(&id);
        info.config_version = 1;
        info.tools = registry.descriptors();

        Ok(Agent {
            id,
            config,
            model,
            registry,
            store,
            bus,
            permissions,
            breakpoints,
            file_pool,
            sandbox,
            services,
            context,
            runner,
            records,
            messages: Vec::new(),
            todos: Vec::new(),
            info,
            state: AgentRuntimeState::Ready,
            step_count: 0,
            pending_batch: None,
            cancel: CancellationToken::new(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
