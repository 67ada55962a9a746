// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use skein_events::{BreakpointState, EventKind};
use skein_model::ContentBlock;
use skein_store::{RecordState, Store, StoreError, ToolCallRecord};
use skein_tools::{
    validate_input, HookDecision, PolicyDecision, Tool, ToolCall, ToolContext, ToolHooks,
    ToolRegistry,
};

use crate::breakpoint::BreakpointManager;
use crate::bus::EventBus;
use crate::file_pool::FilePool;
use crate::permission::{ApprovalDecision, PermissionManager};

/// The agent's tool-call records plus their persistence.  Every mutation is
/// written through to the store before it returns; record-save failures are
/// step-fatal, unlike event persistence.
pub struct RecordTable {
    agent_id: String,
    store: Arc<dyn Store>,
    records: AsyncMutex<Vec<ToolCallRecord>>,
}

impl RecordTable {
    pub fn new(agent_id: impl Into<String>, store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.into(),
            store,
            records: AsyncMutex::new(Vec::new()),
        })
    }

    /// Rehydrate from the store (tolerates the legacy record shape).
    pub async fn load(agent_id: impl Into<String>, store: Arc<dyn Store>) -> Result<Arc<Self>, StoreError> {
        let agent_id = agent_id.into();
        let records = store.load_tool_records(&agent_id).await?;
        Ok(Arc::new(Self {
            agent_id,
            store,
            records: AsyncMutex::new(records),
        }))
    }

    pub async fn insert(&self, record: ToolCallRecord) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
        } else {
            records.push(record);
        }
        self.persist(&records).await
    }

    /// Apply `f` to the record with `id`, persist, and return the new state.
    pub async fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut ToolCallRecord),
    ) -> anyhow::Result<ToolCallRecord> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("no tool record with id {id}"))?;
        f(record);
        let updated = record.clone();
        self.persist(&records).await?;
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<ToolCallRecord> {
        self.records.lock().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn all(&self) -> Vec<ToolCallRecord> {
        self.records.lock().await.clone()
    }

    pub async fn replace_all(&self, new: Vec<ToolCallRecord>) -> anyhow::Result<()> {
        let mut records = self.records.lock().await;
        *records = new;
        self.persist(&records).await
    }

    async fn persist(&self, records: &[ToolCallRecord]) -> anyhow::Result<()> {
        self.store
            .save_tool_records(&self.agent_id, records)
            .await
            .context("persisting tool records")
    }
}

/// A call parked on an interactive approval decision.
pub struct PendingApproval {
    /// Position in the originating batch (slots index).
    pub index: usize,
    pub call: ToolCall,
    pub rx: oneshot::Receiver<ApprovalDecision>,
}

/// Result of one batch run.
pub struct BatchOutcome {
    /// One entry per submitted call, in submission order.  `None` marks a
    /// call still parked on approval.
    pub slots: Vec<Option<ContentBlock>>,
    pub pending: Vec<PendingApproval>,
    pub cancelled: bool,
}

impl BatchOutcome {
    /// All slots filled → the batch's single tool_results message content.
    pub fn into_blocks(self) -> Option<Vec<ContentBlock>> {
        self.slots.into_iter().collect()
    }
}

/// Executes the tool calls of one assistant message: bounded concurrency,
/// per-call timeout, hook interception, permission gating, freshness checks,
/// and a persisted audit trail per call.
#[derive(Clone)]
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    hooks: ToolHooks,
    permissions: Arc<PermissionManager>,
    file_pool: Arc<FilePool>,
    bus: Arc<EventBus>,
    records: Arc<RecordTable>,
    breakpoints: Arc<std::sync::Mutex<BreakpointManager>>,
    concurrency: usize,
    timeout: Duration,
    serial: Arc<AsyncMutex<()>>,
}

impl ToolRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        hooks: ToolHooks,
        permissions: Arc<PermissionManager>,
        file_pool: Arc<FilePool>,
        bus: Arc<EventBus>,
        records: Arc<RecordTable>,
        breakpoints: Arc<std::sync::Mutex<BreakpointManager>>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            hooks,
            permissions,
            file_pool,
            bus,
            records,
            breakpoints,
            concurrency: concurrency.max(1),
            timeout,
            serial: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Swap in a rehydrated record table (resume path).
    pub(crate) fn set_records(&mut self, records: Arc<RecordTable>) {
        self.records = records;
    }

    /// Run one batch.  Calls that evaluate to `ask` are parked (not executed)
    /// and reported through `pending`; everything else resolves to a slot.
    pub async fn run_batch(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<BatchOutcome> {
        let mut slots: Vec<Option<ContentBlock>> = (0..calls.len()).map(|_| None).collect();
        let mut pending: Vec<PendingApproval> = Vec::new();
        let mut to_execute: Vec<(usize, ToolCall, Arc<dyn Tool>)> = Vec::new();

        // Phase 1: resolve, validate, hook, and gate each call in submission
        // order.  Nothing executes yet.
        for (index, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(BatchOutcome { slots, pending, cancelled: true });
            }

            let mut record = ToolCallRecord::new(&call.id, &call.name, call.args.clone());

            let Some(tool) = self.registry.get(&call.name) else {
                let msg = format!("tool not registered: {}", call.name);
                record.fail(&msg, Some("unregistered"));
                let snapshot = record.snapshot();
                self.records.insert(record).await?;
                self.bus.emit(EventKind::ToolError { call: snapshot, error: msg.clone() });
                slots[index] = Some(error_block(&call.id, &msg));
                continue;
            };

            self.records.insert(record).await?;

            if let Err(detail) = validate_input(&tool.input_schema(), &call.args) {
                let msg = format!("invalid arguments: {detail}");
                slots[index] = Some(self.fail_call(call, &msg, "validation").await?);
                continue;
            }

            let call_ctx = with_call_id(ctx, &call.id);
            match self.hooks.run_before(call, &call_ctx).await {
                Some(HookDecision::Deny { reason }) => {
                    let msg = format!("blocked by hook: {reason}");
                    slots[index] = Some(self.fail_call(call, &msg, "hook-deny").await?);
                }
                Some(HookDecision::Skip { output }) => {
                    let record = self
                        .records
                        .mutate(&call.id, |r| {
                            if output.success {
                                r.complete(output.content());
                            } else {
                                r.fail(output.error.clone().unwrap_or_default(), Some("hook-skip"));
                            }
                            if let Some(last) = r.audit_trail.last_mut() {
                                last.note.get_or_insert_with(|| "hook-skip".into());
                            }
                        })
                        .await?;
                    self.bus.emit(EventKind::ToolEnd { call: record.snapshot() });
                    slots[index] = Some(ContentBlock::tool_result(
                        &call.id,
                        output.content(),
                        !output.success,
                    ));
                }
                Some(HookDecision::RequireApproval { reason }) => {
                    pending.push(self.park_on_approval(index, call, Some(reason)).await?);
                }
                Some(HookDecision::Allow) => to_execute.push((index, call.clone(), tool)),
                None => match self.permissions.evaluate(&call.name, &tool.attributes()) {
                    PolicyDecision::Allow => to_execute.push((index, call.clone(), tool)),
                    PolicyDecision::Deny(reason) => {
                        let msg = format!("permission denied: {reason}");
                        slots[index] = Some(self.fail_call(call, &msg, "policy-deny").await?);
                    }
                    PolicyDecision::Ask => {
                        pending.push(self.park_on_approval(index, call, None).await?);
                    }
                },
            }
        }

        // Phase 2: execute under the concurrency bound.  Results are awaited
        // in submission order so the slot layout is deterministic.
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let first_exec = Arc::new(AtomicBool::new(true));
        let mut handles = Vec::with_capacity(to_execute.len());
        for (index, call, tool) in to_execute {
            let runner = self.clone();
            let ctx = with_call_id(ctx, &call.id);
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();
            let first_exec = first_exec.clone();
            let call_for_task = call.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| anyhow::anyhow!("tool semaphore closed"))?;
                runner.execute_call(&call_for_task, tool, &ctx, &cancel, &first_exec).await
            });
            handles.push((index, call, handle));
        }

        for (index, call, handle) in handles {
            let block = match handle.await {
                Ok(result) => result?,
                Err(join_err) => {
                    // A panicking tool must not take the batch down.
                    let msg = format!("tool panicked: {join_err}");
                    warn!(call_id = %call.id, tool = %call.name, "{msg}");
                    self.fail_call(&call, &msg, "panic").await?
                }
            };
            slots[index] = Some(block);
        }

        Ok(BatchOutcome { slots, pending, cancelled: cancel.is_cancelled() })
    }

    /// Execute one call that has just been approved.
    pub async fn execute_approved(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ContentBlock> {
        let Some(tool) = self.registry.get(&call.name) else {
            let msg = format!("tool not registered: {}", call.name);
            return self.fail_call(call, &msg, "unregistered").await;
        };
        let ctx = with_call_id(ctx, &call.id);
        let first_exec = Arc::new(AtomicBool::new(true));
        self.execute_call(call, tool, &ctx, cancel, &first_exec).await
    }

    /// Mark the record failed and surface the message as an error result.
    async fn fail_call(
        &self,
        call: &ToolCall,
        msg: &str,
        note: &str,
    ) -> anyhow::Result<ContentBlock> {
        let record = self
            .records
            .mutate(&call.id, |r| r.fail(msg, Some(note)))
            .await?;
        self.bus.emit(EventKind::ToolError {
            call: record.snapshot(),
            error: msg.to_string(),
        });
        Ok(error_block(&call.id, msg))
    }

    /// Record `APPROVAL_REQUIRED`, persist, and open the rendezvous.
    async fn park_on_approval(
        &self,
        index: usize,
        call: &ToolCall,
        reason: Option<String>,
    ) -> anyhow::Result<PendingApproval> {
        let reason_note = reason.clone();
        let record = self
            .records
            .mutate(&call.id, |r| {
                r.approval.required = true;
                r.approval.meta = json!({ "reason": reason_note });
                r.transition(RecordState::ApprovalRequired, Some("approval required"));
            })
            .await?;
        let rx = self.permissions.begin_approval(record.snapshot(), reason);
        Ok(PendingApproval { index, call: call.clone(), rx })
    }

    /// The per-call execution core: serialization, tool:start, freshness
    /// gate, timeout-bounded execution, post-hooks, and events.
    async fn execute_call(
        &self,
        call: &ToolCall,
        tool: Arc<dyn Tool>,
        ctx: &ToolContext,
        cancel: &CancellationToken,
        first_exec: &AtomicBool,
    ) -> anyhow::Result<ContentBlock> {
        let attrs = tool.attributes();

        // Tools that did not opt into parallelism run strictly one at a time.
        let _serial = if attrs.allow_parallel {
            None
        } else {
            Some(self.serial.lock().await)
        };

        if cancel.is_cancelled() {
            return self.fail_call(call, "cancelled before execution", "cancelled").await;
        }

        let record = self
            .records
            .mutate(&call.id, |r| r.transition(RecordState::Executing, None))
            .await?;
        self.bus.emit(EventKind::ToolStart { call: record.snapshot() });

        if first_exec.swap(false, Ordering::SeqCst) {
            self.breakpoints
                .lock()
                .unwrap()
                .transition_to(BreakpointState::ToolExecuting);
        }

        // Freshness gate for write-class tools.
        if attrs.is_write_class() {
            if let Some(path) = call.args.get("path").and_then(Value::as_str) {
                if let Some(reason) = self.file_pool.validate_write(path).await? {
                    let msg = format!("stale write rejected: {reason}");
                    return self.fail_call(call, &msg, "stale-write").await;
                }
            }
        }

        // Timeout is linked with the external cancellation: the tool observes
        // one child token for both.
        let call_token = cancel.child_token();
        let output = match tokio::time::timeout(
            self.timeout,
            tool.execute(call.args.clone(), ctx, call_token.clone()),
        )
        .await
        {
            Ok(output) => output,
            Err(_) => {
                call_token.cancel();
                let msg = format!("timed out after {}s", self.timeout.as_secs());
                return self.fail_call(call, &msg, "timeout").await;
            }
        };

        let record = self
            .records
            .mutate(&call.id, |r| {
                if output.success {
                    r.complete(output.content());
                } else {
                    r.fail(output.error.clone().unwrap_or_else(|| "tool failed".into()), None);
                }
            })
            .await?;

        // Successful file access feeds the pool so later writes can be
        // freshness-checked and compression can recover content.
        if output.success {
            if let Some(path) = call.args.get("path").and_then(Value::as_str) {
                let tracked = match attrs.permission_category.as_deref() {
                    Some("write") => self.file_pool.record_edit(path).await,
                    Some("read") => self.file_pool.record_read(path).await,
                    _ => Ok(()),
                };
                if let Err(e) = tracked {
                    warn!(path = %path, error = %e, "file pool update failed");
                }
            }
        }

        // Post-hooks may replace or update the outcome before it becomes a
        // tool_result.
        let final_output = self.hooks.run_after(call, output, ctx).await;

        if final_output.success {
            self.bus.emit(EventKind::ToolEnd { call: record.snapshot() });
        } else {
            self.bus.emit(EventKind::ToolError {
                call: record.snapshot(),
                error: final_output.error.clone().unwrap_or_default(),
            });
        }
        self.bus.emit(EventKind::ToolExecuted { call: record.snapshot() });

        Ok(ContentBlock::tool_result(
            &call.id,
            final_output.content(),
            !final_output.success,
        ))
    }
}

fn error_block(call_id: &str, msg: &str) -> ContentBlock {
    ContentBlock::tool_result(call_id, Value::String(msg.to_string()), true)
}

fn with_call_id(ctx: &ToolContext, call_id: &str) -> ToolContext {
    ToolContext {
        agent_id: ctx.agent_id.clone(),
        call_id: call_id.to_string(),
        sandbox: ctx.sandbox.clone(),
        services: ctx.services.clone(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
