// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tool::{ToolCall, ToolContext, ToolOutput};

/// Verdict of a pre-tool hook.  `None` from a hook means "no opinion";
/// the first non-`None` verdict in registration order wins.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision {
    /// Run the tool (stop consulting later hooks).
    Allow,
    /// Refuse the call; the reason becomes the error tool_result.
    Deny { reason: String },
    /// Skip execution and use this mock output as if the tool ran.
    Skip { output: ToolOutput },
    /// Escalate to an interactive approval decision.
    RequireApproval { reason: String },
}

/// Mutation applied by a post-tool hook to the outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum PostHookAction {
    /// Swap the entire outcome.
    Replace(ToolOutput),
    /// Keep success/error status but replace the value payload.
    Update(Value),
}

/// Interception points around tool execution.
#[async_trait]
pub trait ToolHook: Send + Sync {
    /// Runs before permission evaluation.  Return `None` to pass.
    async fn before(&self, _call: &ToolCall, _ctx: &ToolContext) -> Option<HookDecision> {
        None
    }

    /// Runs after execution, before the outcome becomes a tool_result.
    async fn after(
        &self,
        _call: &ToolCall,
        _output: &ToolOutput,
        _ctx: &ToolContext,
    ) -> Option<PostHookAction> {
        None
    }
}

/// An ordered hook pipeline: a reducer fold that stops at the first verdict.
#[derive(Clone, Default)]
pub struct ToolHooks {
    hooks: Vec<Arc<dyn ToolHook>>,
}

impl ToolHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn ToolHook>) {
        self.hooks.push(hook);
    }

    pub fn with(mut self, hook: Arc<dyn ToolHook>) -> Self {
        self.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// First non-`None` pre-hook verdict, in registration order.
    pub async fn run_before(&self, call: &ToolCall, ctx: &ToolContext) -> Option<HookDecision> {
        for hook in &self.hooks {
            if let Some(decision) = hook.before(call, ctx).await {
                return Some(decision);
            }
        }
        None
    }

    /// Fold the outcome through every post-hook in order.
    pub async fn run_after(
        &self,
        call: &ToolCall,
        mut output: ToolOutput,
        ctx: &ToolContext,
    ) -> ToolOutput {
        for hook in &self.hooks {
            match hook.after(call, &output, ctx).await {
                Some(PostHookAction::Replace(new)) => output = new,
                Some(PostHookAction::Update(value)) => output.value = Some(value),
                None => {}
            }
        }
        output
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
