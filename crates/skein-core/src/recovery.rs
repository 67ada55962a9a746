// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::Value;

use skein_config::Config;
use skein_events::{AgentRuntimeState, EventKind};
use skein_model::{ContentBlock, Message, ModelProvider, Role};
use skein_store::{RecordState, Store};
use skein_tools::{PermissionPolicy, Sandbox, ServiceProvider, ToolHooks, ToolRegistry};

use crate::agent::Agent;
use crate::bus::BusOptions;
use crate::runner::RecordTable;

/// How incomplete tool records found in the store are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryStrategy {
    /// Seal every non-terminal record and synthesize error tool_results so
    /// the message log is well-paired again.
    #[default]
    Crash,
    /// Leave records untouched; the caller inspects and fixes them.
    Manual,
}

impl RecoveryStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Manual => "manual",
        }
    }
}

/// Everything needed to reconstruct an agent from persisted state.  Code
/// handles (model, sandbox, hooks, registry builders) cannot be persisted
/// and are supplied fresh; they act as the overrides of the resumed run.
pub struct ResumeOptions {
    pub agent_id: String,
    pub store: Arc<dyn Store>,
    pub model: Arc<dyn ModelProvider>,
    pub sandbox: Arc<dyn Sandbox>,
    /// Registry carrying the builders that reconstruct persisted tool
    /// descriptors.  Tools registered here directly are kept as overrides.
    pub registry: ToolRegistry,
    pub strategy: RecoveryStrategy,
    pub config: Config,
    pub hooks: ToolHooks,
    pub services: Option<Arc<ServiceProvider>>,
    pub policy: Option<PermissionPolicy>,
    pub bus_options: BusOptions,
}

impl ResumeOptions {
    pub fn new(
        agent_id: impl Into<String>,
        store: Arc<dyn Store>,
        model: Arc<dyn ModelProvider>,
        sandbox: Arc<dyn Sandbox>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            store,
            model,
            sandbox,
            registry: ToolRegistry::new(),
            strategy: RecoveryStrategy::Crash,
            config: Config::default(),
            hooks: ToolHooks::new(),
            services: None,
            policy: None,
            bus_options: BusOptions::default(),
        }
    }

    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

impl Agent {
    /// Reconstruct a consistent runtime from persisted state.
    ///
    /// Fails with [`skein_store::StoreError::AgentNotFound`] (inside the
    /// error chain) when the agent was never saved.  The new event bus is
    /// seeded from the persisted bookmark so seq continues monotonically;
    /// the runtime state is always `READY`; a paused turn is never resumed
    /// implicitly.
    pub async fn resume_from_store(opts: ResumeOptions) -> anyhow::Result<Agent> {
        let info = opts
            .store
            .load_info(&opts.agent_id)
            .await
            .context("loading agent metadata")?;

        let messages = opts.store.load_messages(&opts.agent_id).await?;
        let todos = opts.store.load_todos(&opts.agent_id).await?;
        let records = RecordTable::load(&opts.agent_id, opts.store.clone()).await?;

        // Rebuild the persisted tool set through the registry builders;
        // directly-registered tools stay as overrides.
        let mut registry = opts.registry;
        let override_names = registry.names();
        let to_rebuild: Vec<_> = info
            .tools
            .iter()
            .filter(|d| !override_names.contains(&d.name))
            .cloned()
            .collect();
        registry
            .rebuild(&to_rebuild)
            .context("rebuilding persisted tools")?;

        let mut builder = Agent::builder()
            .id(&opts.agent_id)
            .config(opts.config)
            .model(opts.model)
            .sandbox(opts.sandbox)
            .registry(registry)
            .hooks(opts.hooks)
            .services(opts.services.unwrap_or_else(|| Arc::new(ServiceProvider::new())))
            .bus_options(opts.bus_options)
            .store(opts.store.clone());
        if let Some(policy) = opts.policy {
            builder = builder.policy(policy);
        }
        let mut agent = builder.build()?;

        // Continue the event stream where the previous process stopped.
        if let Some(bookmark) = info.last_bookmark {
            agent.bus.seed_from_bookmark(bookmark);
        }

        agent.messages = messages;
        agent.todos = todos;
        agent.records = records.clone();
        agent.runner.set_records(records);
        agent.step_count = info.step_count;
        agent.breakpoints.lock().unwrap().restore(info.breakpoint);
        agent.state = AgentRuntimeState::Ready;

        let mut resumed_info = info;
        resumed_info.tools = agent.registry.descriptors();
        agent.info = resumed_info;

        // Announce the resume before reconciling records, listing what the
        // strategy is about to seal.
        let incomplete: Vec<String> = agent
            .records
            .all()
            .await
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.id.clone())
            .collect();
        let sealed_calls = match opts.strategy {
            RecoveryStrategy::Crash => incomplete.clone(),
            RecoveryStrategy::Manual => Vec::new(),
        };
        agent.bus.emit(EventKind::AgentResumed {
            strategy: opts.strategy.as_str().into(),
            sealed_calls,
        });

        if opts.strategy == RecoveryStrategy::Crash && !incomplete.is_empty() {
            seal_incomplete(&mut agent, &incomplete).await?;
        }

        agent.persist_state().await?;
        Ok(agent)
    }
}

/// Seal every listed record and re-pair its dangling tool_use with a
/// synthesized error result.
async fn seal_incomplete(agent: &mut Agent, incomplete: &[String]) -> anyhow::Result<()> {
    for id in incomplete {
        agent
            .records
            .mutate(id, |r| {
                r.error = Some("tool call interrupted by process crash".into());
                r.is_error = true;
                r.transition(RecordState::Sealed, Some("sealed on resume"));
            })
            .await?;
    }

    // A sealed call only needs a synthesized result when its tool_use is in
    // the log without a matching tool_result.
    let answered: std::collections::HashSet<String> = agent
        .messages
        .iter()
        .flat_map(|m| m.content.iter())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
            _ => None,
        })
        .collect();
    let dangling: std::collections::HashSet<String> = agent
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_uses().into_iter().map(|(id, _, _)| id.to_string()))
        .filter(|id| !answered.contains(id))
        .collect();

    let blocks: Vec<ContentBlock> = incomplete
        .iter()
        .filter(|id| dangling.contains(*id))
        .map(|id| {
            ContentBlock::tool_result(
                id,
                Value::String("tool call interrupted by process crash; no result".into()),
                true,
            )
        })
        .collect();
    if !blocks.is_empty() {
        agent.messages.push(Message::tool_results(blocks));
    }

    agent.bus.emit(EventKind::AgentRecovered {
        reason: "crash".into(),
        detail: Some(format!("sealed {} incomplete tool call(s)", incomplete.len())),
    });
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
