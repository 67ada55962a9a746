// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use skein_events::{
    lookup_variant, Bookmark, BreakpointState, EventEnvelope, StateRepr, ToolCallSnapshot,
};
use skein_model::Message;
use skein_tools::ToolDescriptor;

/// Maximum characters of serialized tool input carried in event snapshots
/// and approval previews.
pub const INPUT_PREVIEW_MAX: usize = 1200;

/// Serialize `value` and truncate to `max` characters, appending an ellipsis
/// when anything was cut.
pub fn preview_json(value: &Value, max: usize) -> String {
    let s = value.to_string();
    if s.chars().count() <= max {
        return s;
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

// ─── Tool call records ────────────────────────────────────────────────────────

/// Lifecycle of one persisted tool call.
///
/// ```text
/// PENDING ─► APPROVAL_REQUIRED ─► APPROVED ─► EXECUTING ─► COMPLETED | FAILED
///   │                           └► DENIED
///   └──────────────────────────► EXECUTING    (no approval needed)
///                                  └► SEALED  (resume decision for incomplete calls)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    #[default]
    Pending,
    ApprovalRequired,
    Approved,
    Denied,
    Executing,
    Completed,
    Failed,
    Sealed,
}

const RECORD_STATE_NAMES: [&str; 8] = [
    "PENDING",
    "APPROVAL_REQUIRED",
    "APPROVED",
    "DENIED",
    "EXECUTING",
    "COMPLETED",
    "FAILED",
    "SEALED",
];

const RECORD_STATE_VARIANTS: [RecordState; 8] = [
    RecordState::Pending,
    RecordState::ApprovalRequired,
    RecordState::Approved,
    RecordState::Denied,
    RecordState::Executing,
    RecordState::Completed,
    RecordState::Failed,
    RecordState::Sealed,
];

impl RecordState {
    /// Terminal states survive resume untouched; everything else is sealed
    /// by the crash-recovery strategy.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied | Self::Sealed)
    }

    pub fn as_str(&self) -> &'static str {
        RECORD_STATE_NAMES[RECORD_STATE_VARIANTS.iter().position(|v| v == self).unwrap()]
    }
}

impl<'de> Deserialize<'de> for RecordState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let repr = StateRepr::deserialize(d)?;
        lookup_variant(&repr, &RECORD_STATE_NAMES)
            .map(|i| RECORD_STATE_VARIANTS[i])
            .ok_or_else(|| serde::de::Error::custom(format!("unknown record state: {repr:?}")))
    }
}

/// One audit-trail entry, appended on every state mutation of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub state: RecordState,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Approval bookkeeping for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
}

/// Persisted per-call state of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub state: RecordState,
    #[serde(default)]
    pub approval: Approval,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        let mut rec = Self {
            id: id.into(),
            name: name.into(),
            input,
            state: RecordState::Pending,
            approval: Approval::default(),
            result: None,
            error: None,
            is_error: false,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
            audit_trail: Vec::new(),
        };
        rec.push_audit(None);
        rec
    }

    fn push_audit(&mut self, note: Option<&str>) {
        self.audit_trail.push(AuditEntry {
            state: self.state,
            timestamp: Utc::now(),
            note: note.map(str::to_string),
        });
    }

    /// Move to `state`, stamping `updated_at` and the audit trail.
    pub fn transition(&mut self, state: RecordState, note: Option<&str>) {
        self.state = state;
        self.updated_at = Utc::now();
        if state == RecordState::Executing && self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        self.push_audit(note);
    }

    /// Terminal success.  Stamps `completed_at` / `duration_ms`.
    pub fn complete(&mut self, result: Value) {
        self.result = Some(result);
        self.is_error = false;
        self.finish(RecordState::Completed, None);
    }

    /// Terminal failure.  The error text also becomes the result surface.
    pub fn fail(&mut self, error: impl Into<String>, note: Option<&str>) {
        let error = error.into();
        self.error = Some(error);
        self.is_error = true;
        self.finish(RecordState::Failed, note);
    }

    fn finish(&mut self, state: RecordState, note: Option<&str>) {
        let now = Utc::now();
        self.completed_at = Some(now);
        if let Some(start) = self.started_at {
            let ms = (now - start).num_milliseconds().max(1);
            self.duration_ms = Some(ms as u64);
        }
        self.transition(state, note);
    }

    /// Truncated-input view for event payloads.
    pub fn snapshot(&self) -> ToolCallSnapshot {
        ToolCallSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state.as_str().into(),
            input_preview: preview_json(&self.input, INPUT_PREVIEW_MAX),
        }
    }
}

/// Tolerant loader shape: current records plus the legacy flat layout that
/// predates approval/audit bookkeeping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum StoredRecord {
    Current(ToolCallRecord),
    Legacy(LegacyRecord),
}

#[derive(Debug, Deserialize)]
pub(crate) struct LegacyRecord {
    id: String,
    name: String,
    #[serde(default)]
    arguments: Value,
    status: RecordState,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl From<StoredRecord> for ToolCallRecord {
    fn from(stored: StoredRecord) -> Self {
        match stored {
            StoredRecord::Current(rec) => rec,
            StoredRecord::Legacy(old) => {
                let now = Utc::now();
                let is_error = old.error.is_some() || old.status == RecordState::Failed;
                ToolCallRecord {
                    id: old.id,
                    name: old.name,
                    input: old.arguments,
                    state: old.status,
                    approval: Approval::default(),
                    result: old.output,
                    error: old.error,
                    is_error,
                    started_at: None,
                    completed_at: None,
                    duration_ms: None,
                    created_at: now,
                    updated_at: now,
                    audit_trail: vec![AuditEntry {
                        state: old.status,
                        timestamp: now,
                        note: Some("migrated".into()),
                    }],
                }
            }
        }
    }
}

// ─── History & snapshots ──────────────────────────────────────────────────────

/// Immutable safe-fork-point capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sfp_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bookmark: Option<Bookmark>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub message_count: usize,
    pub token_count: usize,
    pub event_count: usize,
}

/// Full pre-compression capture of messages and recent events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryWindow {
    pub id: String,
    pub messages: Vec<Message>,
    pub events: Vec<EventEnvelope>,
    pub stats: WindowStats,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub threshold: usize,
}

/// Outcome of one compression pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionRecord {
    pub id: String,
    pub window_id: String,
    pub config: CompressionConfig,
    /// Preview of the synthesized summary (≤ 500 chars)
    pub summary: String,
    pub ratio: f64,
    #[serde(default)]
    pub recovered_files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Content captured for a file touched before compression, so the summary
/// can refer back to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredFile {
    pub path: String,
    pub content: String,
    /// File mtime in milliseconds since the epoch, as reported by the sandbox.
    pub mtime: i64,
    pub timestamp: DateTime<Utc>,
}

/// A structured todo item persisted alongside the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    /// One of: "pending", "in_progress", "completed", "cancelled"
    pub status: String,
}

/// Per-agent metadata, saved on every breakpoint transition so recovery can
/// pick up from the latest consistent point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub lineage: Vec<String>,
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sfp_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bookmark: Option<Bookmark>,
    #[serde(default)]
    pub breakpoint: BreakpointState,
    /// Incremented on every metadata save; lets tooling spot stale copies.
    #[serde(default)]
    pub state_version: u64,
    /// Descriptors of the registered tool set, for rebuild on resume.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            template_id: None,
            created_at: Utc::now(),
            lineage: Vec::new(),
            config_version: 0,
            message_count: 0,
            step_count: 0,
            last_sfp_index: None,
            last_bookmark: None,
            breakpoint: BreakpointState::Ready,
            state_version: 0,
            tools: Vec::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
