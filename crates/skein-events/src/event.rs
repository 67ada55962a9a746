// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Channel;
use crate::state::{AgentRuntimeState, BreakpointState};

/// Compact tool-call view carried inside events.  Holds a truncated input
/// preview rather than the full arguments, so event logs stay bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSnapshot {
    pub id: String,
    pub name: String,
    pub state: String,
    pub input_preview: String,
}

/// Every event type the runtime emits.  The `type` strings are frozen for
/// wire compatibility; renaming a variant here is a breaking protocol change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    // ── Streaming output ──────────────────────────────────────────────────────
    #[serde(rename = "text_chunk_start")]
    TextChunkStart {},
    #[serde(rename = "text_chunk")]
    TextChunk { delta: String },
    #[serde(rename = "text_chunk_end")]
    TextChunkEnd { text: String },
    #[serde(rename = "think_chunk_start")]
    ThinkChunkStart {},
    #[serde(rename = "think_chunk")]
    ThinkChunk { delta: String },
    #[serde(rename = "think_chunk_end")]
    ThinkChunkEnd { text: String },

    // ── Tool lifecycle ────────────────────────────────────────────────────────
    #[serde(rename = "tool:start")]
    ToolStart { call: ToolCallSnapshot },
    #[serde(rename = "tool:end")]
    ToolEnd { call: ToolCallSnapshot },
    #[serde(rename = "tool:error")]
    ToolError { call: ToolCallSnapshot, error: String },

    // ── Turn boundaries ───────────────────────────────────────────────────────
    #[serde(rename = "done")]
    Done { step: u32, reason: String },
    #[serde(rename = "step_complete")]
    StepComplete { step: u32, duration_ms: u64 },
    #[serde(rename = "token_usage")]
    TokenUsage { input: u32, output: u32, total: u32 },

    // ── Permissions ───────────────────────────────────────────────────────────
    #[serde(rename = "permission_required")]
    PermissionRequired {
        call: ToolCallSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "permission_decided")]
    PermissionDecided {
        call_id: String,
        decision: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decided_by: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },

    // ── Lifecycle state ───────────────────────────────────────────────────────
    #[serde(rename = "state_changed")]
    StateChanged {
        previous: AgentRuntimeState,
        current: AgentRuntimeState,
    },
    #[serde(rename = "breakpoint_changed")]
    BreakpointChanged {
        previous: BreakpointState,
        current: BreakpointState,
        timestamp: DateTime<Utc>,
    },

    // ── Tool side effects ─────────────────────────────────────────────────────
    #[serde(rename = "tool_executed")]
    ToolExecuted { call: ToolCallSnapshot },
    #[serde(rename = "tool_manual_updated")]
    ToolManualUpdated {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    #[serde(rename = "todo_changed")]
    TodoChanged { todos: Value },
    #[serde(rename = "todo_reminder")]
    TodoReminder { note: String },
    #[serde(rename = "file_changed")]
    FileChanged { path: String, timestamp: DateTime<Utc> },

    // ── Context management ────────────────────────────────────────────────────
    #[serde(rename = "context_repair")]
    ContextRepair {
        reason: String,
        converted: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    #[serde(rename = "context_compression")]
    ContextCompression {
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ratio: Option<f64>,
    },

    // ── Resume / degraded mode ────────────────────────────────────────────────
    #[serde(rename = "agent_resumed")]
    AgentResumed { strategy: String, sealed_calls: Vec<String> },
    #[serde(rename = "agent_recovered")]
    AgentRecovered {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename = "storage_failure")]
    StorageFailure {
        severity: String,
        failed_event_type: String,
        buffered_count: usize,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextChunkStart {} => "text_chunk_start",
            Self::TextChunk { .. } => "text_chunk",
            Self::TextChunkEnd { .. } => "text_chunk_end",
            Self::ThinkChunkStart {} => "think_chunk_start",
            Self::ThinkChunk { .. } => "think_chunk",
            Self::ThinkChunkEnd { .. } => "think_chunk_end",
            Self::ToolStart { .. } => "tool:start",
            Self::ToolEnd { .. } => "tool:end",
            Self::ToolError { .. } => "tool:error",
            Self::Done { .. } => "done",
            Self::StepComplete { .. } => "step_complete",
            Self::TokenUsage { .. } => "token_usage",
            Self::PermissionRequired { .. } => "permission_required",
            Self::PermissionDecided { .. } => "permission_decided",
            Self::StateChanged { .. } => "state_changed",
            Self::BreakpointChanged { .. } => "breakpoint_changed",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::ToolManualUpdated { .. } => "tool_manual_updated",
            Self::TodoChanged { .. } => "todo_changed",
            Self::TodoReminder { .. } => "todo_reminder",
            Self::FileChanged { .. } => "file_changed",
            Self::ContextRepair { .. } => "context_repair",
            Self::ContextCompression { .. } => "context_compression",
            Self::AgentResumed { .. } => "agent_resumed",
            Self::AgentRecovered { .. } => "agent_recovered",
            Self::StorageFailure { .. } => "storage_failure",
            Self::Error { .. } => "error",
        }
    }

    /// The channel this event naturally belongs to.
    pub fn default_channel(&self) -> Channel {
        match self {
            Self::TextChunkStart {}
            | Self::TextChunk { .. }
            | Self::TextChunkEnd { .. }
            | Self::ThinkChunkStart {}
            | Self::ThinkChunk { .. }
            | Self::ThinkChunkEnd { .. }
            | Self::ToolStart { .. }
            | Self::ToolEnd { .. }
            | Self::ToolError { .. }
            | Self::Done { .. } => Channel::Progress,
            Self::PermissionRequired { .. }
            | Self::PermissionDecided { .. }
            | Self::StateChanged { .. } => Channel::Control,
            _ => Channel::Monitor,
        }
    }

    /// Critical events are buffered for retry when store persistence fails
    /// (degraded mode); everything else is dropped.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ToolEnd { .. }
                | Self::Done { .. }
                | Self::PermissionDecided { .. }
                | Self::AgentResumed { .. }
                | Self::StateChanged { .. }
                | Self::BreakpointChanged { .. }
                | Self::Error { .. }
        )
    }
}

/// An event type this build does not know about, preserved verbatim so
/// replaying a store written by a newer runtime loses nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

/// Decoded event payload: a known variant, or a raw-preserving fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Known(EventKind),
    Unknown(UnknownEvent),
}

impl EventPayload {
    pub fn kind(&self) -> Option<&EventKind> {
        match self {
            Self::Known(k) => Some(k),
            Self::Unknown(_) => None,
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            Self::Known(k) => k.event_type(),
            Self::Unknown(u) => &u.event_type,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.kind().map(EventKind::is_critical).unwrap_or(false)
    }
}

impl From<EventKind> for EventPayload {
    fn from(k: EventKind) -> Self {
        Self::Known(k)
    }
}

/// A channel-stamped event as carried inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub channel: Channel,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, payload: impl Into<EventPayload>) -> Self {
        Self { channel, payload: payload.into() }
    }
}

impl From<EventKind> for Event {
    /// Stamp the event with its default channel.
    fn from(k: EventKind) -> Self {
        Self { channel: k.default_channel(), payload: EventPayload::Known(k) }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
