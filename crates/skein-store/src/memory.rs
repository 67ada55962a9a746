// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use skein_events::{Bookmark, Channel, EventEnvelope};
use skein_model::Message;

use crate::records::{
    AgentInfo, CompressionRecord, HistoryWindow, RecoveredFile, Snapshot, TodoItem, ToolCallRecord,
};
use crate::store::{Store, StoreError};

#[derive(Default)]
struct AgentData {
    messages: Vec<Message>,
    records: Vec<ToolCallRecord>,
    events: HashMap<Channel, Vec<EventEnvelope>>,
    todos: Vec<TodoItem>,
    windows: Vec<HistoryWindow>,
    compressions: Vec<CompressionRecord>,
    recovered: Vec<RecoveredFile>,
    snapshots: HashMap<String, Snapshot>,
    info: Option<AgentInfo>,
}

/// In-memory store for tests and ephemeral agents.
///
/// `fail_event_appends` switches the event log into a failing mode so
/// degraded-mode bus behavior can be exercised deterministically.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, AgentData>>,
    fail_events: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle fault injection on `append_event`.
    pub fn fail_event_appends(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    fn with<R>(&self, agent_id: &str, f: impl FnOnce(&mut AgentData) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(inner.entry(agent_id.to_string()).or_default())
    }

    fn read<R>(
        &self,
        agent_id: &str,
        f: impl FnOnce(Option<&AgentData>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let inner = self.inner.lock().unwrap();
        f(inner.get(agent_id))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.messages = messages.to_vec());
        Ok(())
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.messages.clone()).unwrap_or_default()))
    }

    async fn save_tool_records(
        &self,
        agent_id: &str,
        records: &[ToolCallRecord],
    ) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.records = records.to_vec());
        Ok(())
    }

    async fn load_tool_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.records.clone()).unwrap_or_default()))
    }

    async fn append_event(
        &self,
        agent_id: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), StoreError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected event-append failure".into()));
        }
        self.with(agent_id, |d| {
            d.events
                .entry(envelope.channel())
                .or_default()
                .push(envelope.clone())
        });
        Ok(())
    }

    async fn read_events(
        &self,
        agent_id: &str,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let floor = since.map(|b| b.seq);
        self.read(agent_id, |d| {
            let Some(d) = d else { return Ok(Vec::new()) };
            let mut out = Vec::new();
            let channels: Vec<Channel> = match channel {
                Some(c) => vec![c],
                None => Channel::ALL.to_vec(),
            };
            for c in channels {
                if let Some(events) = d.events.get(&c) {
                    let mut channel_events: Vec<EventEnvelope> = events
                        .iter()
                        .filter(|e| floor.map(|f| e.seq() > f).unwrap_or(true))
                        .cloned()
                        .collect();
                    // Degraded-mode retries may append behind newer events;
                    // the read contract is seq order per channel.
                    channel_events.sort_by_key(|e| e.seq());
                    out.extend(channel_events);
                }
            }
            Ok(out)
        })
    }

    async fn save_todos(&self, agent_id: &str, todos: &[TodoItem]) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.todos = todos.to_vec());
        Ok(())
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Vec<TodoItem>, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.todos.clone()).unwrap_or_default()))
    }

    async fn save_history_window(
        &self,
        agent_id: &str,
        window: &HistoryWindow,
    ) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.windows.push(window.clone()));
        Ok(())
    }

    async fn load_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.windows.clone()).unwrap_or_default()))
    }

    async fn save_compression_record(
        &self,
        agent_id: &str,
        record: &CompressionRecord,
    ) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.compressions.push(record.clone()));
        Ok(())
    }

    async fn load_compression_records(
        &self,
        agent_id: &str,
    ) -> Result<Vec<CompressionRecord>, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.compressions.clone()).unwrap_or_default()))
    }

    async fn save_recovered_file(
        &self,
        agent_id: &str,
        file: &RecoveredFile,
    ) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.recovered.push(file.clone()));
        Ok(())
    }

    async fn load_recovered_files(&self, agent_id: &str) -> Result<Vec<RecoveredFile>, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.recovered.clone()).unwrap_or_default()))
    }

    async fn save_snapshot(&self, agent_id: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.with(agent_id, |d| {
            d.snapshots.insert(snapshot.id.clone(), snapshot.clone())
        });
        Ok(())
    }

    async fn load_snapshot(&self, agent_id: &str, id: &str) -> Result<Snapshot, StoreError> {
        self.read(agent_id, |d| {
            d.and_then(|d| d.snapshots.get(id).cloned())
                .ok_or_else(|| StoreError::SnapshotNotFound(id.into()))
        })
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        self.read(agent_id, |d| {
            let mut snaps: Vec<Snapshot> = d
                .map(|d| d.snapshots.values().cloned().collect())
                .unwrap_or_default();
            snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(snaps)
        })
    }

    async fn delete_snapshot(&self, agent_id: &str, id: &str) -> Result<(), StoreError> {
        self.with(agent_id, |d| d.snapshots.remove(id));
        Ok(())
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<(), StoreError> {
        self.with(&info.agent_id, |d| d.info = Some(info.clone()));
        Ok(())
    }

    async fn load_info(&self, agent_id: &str) -> Result<AgentInfo, StoreError> {
        self.read(agent_id, |d| {
            d.and_then(|d| d.info.clone())
                .ok_or_else(|| StoreError::AgentNotFound(agent_id.into()))
        })
    }

    async fn exists(&self, agent_id: &str) -> Result<bool, StoreError> {
        self.read(agent_id, |d| Ok(d.map(|d| d.info.is_some()).unwrap_or(false)))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<String> = inner
            .iter()
            .filter(|(_, d)| d.info.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, agent_id: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().remove(agent_id);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
