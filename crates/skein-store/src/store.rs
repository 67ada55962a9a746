// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use skein_events::{Bookmark, Channel, EventEnvelope};
use skein_model::Message;

use crate::records::{
    AgentInfo, CompressionRecord, HistoryWindow, RecoveredFile, Snapshot, TodoItem, ToolCallRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt store entry at {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
}

/// Abstract persistence contract.
///
/// Implementations must make `save_messages` / `save_tool_records` /
/// `save_info` durable before returning; the agent depends on them across
/// steps and treats their failure as fatal for the step.  `append_event` may
/// fail independently; the bus handles that through degraded-mode buffering.
///
/// All keys are namespaced by `agent_id`; two agents never interfere.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Messages ──────────────────────────────────────────────────────────────
    /// Full replacement of the message log.
    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<(), StoreError>;
    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>, StoreError>;

    // ── Tool call records ─────────────────────────────────────────────────────
    /// Full replacement.  Loaders tolerate the legacy flat record shape.
    async fn save_tool_records(
        &self,
        agent_id: &str,
        records: &[ToolCallRecord],
    ) -> Result<(), StoreError>;
    async fn load_tool_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>, StoreError>;

    // ── Events ────────────────────────────────────────────────────────────────
    /// Append-only, channel-partitioned.
    async fn append_event(&self, agent_id: &str, envelope: &EventEnvelope)
        -> Result<(), StoreError>;
    /// Entries with `seq > since.seq`, in seq order per channel.  A `None`
    /// channel concatenates all channels; the caller re-sorts.
    async fn read_events(
        &self,
        agent_id: &str,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Vec<EventEnvelope>, StoreError>;

    // ── Todos ─────────────────────────────────────────────────────────────────
    async fn save_todos(&self, agent_id: &str, todos: &[TodoItem]) -> Result<(), StoreError>;
    async fn load_todos(&self, agent_id: &str) -> Result<Vec<TodoItem>, StoreError>;

    // ── History ───────────────────────────────────────────────────────────────
    async fn save_history_window(
        &self,
        agent_id: &str,
        window: &HistoryWindow,
    ) -> Result<(), StoreError>;
    async fn load_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>, StoreError>;
    async fn save_compression_record(
        &self,
        agent_id: &str,
        record: &CompressionRecord,
    ) -> Result<(), StoreError>;
    async fn load_compression_records(
        &self,
        agent_id: &str,
    ) -> Result<Vec<CompressionRecord>, StoreError>;
    async fn save_recovered_file(
        &self,
        agent_id: &str,
        file: &RecoveredFile,
    ) -> Result<(), StoreError>;
    async fn load_recovered_files(&self, agent_id: &str) -> Result<Vec<RecoveredFile>, StoreError>;

    // ── Snapshots ─────────────────────────────────────────────────────────────
    async fn save_snapshot(&self, agent_id: &str, snapshot: &Snapshot) -> Result<(), StoreError>;
    async fn load_snapshot(&self, agent_id: &str, id: &str) -> Result<Snapshot, StoreError>;
    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>, StoreError>;
    async fn delete_snapshot(&self, agent_id: &str, id: &str) -> Result<(), StoreError>;

    // ── Metadata ──────────────────────────────────────────────────────────────
    async fn save_info(&self, info: &AgentInfo) -> Result<(), StoreError>;
    /// Fails with [`StoreError::AgentNotFound`] when the agent was never saved.
    async fn load_info(&self, agent_id: &str) -> Result<AgentInfo, StoreError>;

    // ── Lifecycle ─────────────────────────────────────────────────────────────
    async fn exists(&self, agent_id: &str) -> Result<bool, StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
    async fn delete(&self, agent_id: &str) -> Result<(), StoreError>;
}
