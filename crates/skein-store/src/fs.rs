// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use skein_events::{Bookmark, Channel, EventEnvelope};
use skein_model::Message;

use crate::records::{
    AgentInfo, CompressionRecord, HistoryWindow, RecoveredFile, Snapshot, StoredRecord, TodoItem,
    ToolCallRecord,
};
use crate::store::{Store, StoreError};

/// File-tree store backend.
///
/// Layout per agent:
/// ```text
/// <root>/<agent_id>/meta.json
///                   messages.json
///                   tool-calls.json
///                   todos.json
///                   events/{progress,control,monitor}.jsonl
///                   snapshots/<id>.json
///                   history/windows/<id>.json
///                   history/compressions/<id>.json
///                   history/recovered/<id>.json
/// ```
///
/// JSON documents are written to a temp file and renamed into place, so a
/// crash mid-save leaves the previous version intact.  Event logs are plain
/// append; a torn trailing line from a crash is skipped on read.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id)
    }

    fn events_path(&self, agent_id: &str, channel: Channel) -> PathBuf {
        self.agent_dir(agent_id)
            .join("events")
            .join(format!("{}.jsonl", channel.as_str()))
    }

    async fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one channel's log, dropping malformed lines instead of failing
    /// the whole read (a torn tail is expected after a crash).
    async fn read_channel(
        &self,
        agent_id: &str,
        channel: Channel,
        floor: Option<u64>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let path = self.events_path(agent_id, channel);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<EventEnvelope>(line) {
                Ok(env) => {
                    if floor.map(|f| env.seq() > f).unwrap_or(true) {
                        out.push(env);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed event line");
                }
            }
        }
        // Degraded-mode retries may append behind newer events; the read
        // contract is seq order per channel.
        out.sort_by_key(|e| e.seq());
        Ok(out)
    }

    /// Load every JSON document under `dir`, ignoring a missing directory.
    async fn read_dir_json<T: serde::de::DeserializeOwned>(
        &self,
        dir: &Path,
    ) -> Result<Vec<T>, StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(v) = self.read_json::<T>(&path).await? {
                out.push(v);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for FsStore {
    async fn save_messages(&self, agent_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.write_json(&self.agent_dir(agent_id).join("messages.json"), &messages)
            .await
    }

    async fn load_messages(&self, agent_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .read_json(&self.agent_dir(agent_id).join("messages.json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_tool_records(
        &self,
        agent_id: &str,
        records: &[ToolCallRecord],
    ) -> Result<(), StoreError> {
        self.write_json(&self.agent_dir(agent_id).join("tool-calls.json"), &records)
            .await
    }

    async fn load_tool_records(&self, agent_id: &str) -> Result<Vec<ToolCallRecord>, StoreError> {
        let stored: Vec<StoredRecord> = self
            .read_json(&self.agent_dir(agent_id).join("tool-calls.json"))
            .await?
            .unwrap_or_default();
        Ok(stored.into_iter().map(ToolCallRecord::from).collect())
    }

    async fn append_event(
        &self,
        agent_id: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), StoreError> {
        let path = self.events_path(agent_id, envelope.channel());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_events(
        &self,
        agent_id: &str,
        channel: Option<Channel>,
        since: Option<Bookmark>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let floor = since.map(|b| b.seq);
        match channel {
            Some(c) => self.read_channel(agent_id, c, floor).await,
            None => {
                let mut out = Vec::new();
                for c in Channel::ALL {
                    out.extend(self.read_channel(agent_id, c, floor).await?);
                }
                Ok(out)
            }
        }
    }

    async fn save_todos(&self, agent_id: &str, todos: &[TodoItem]) -> Result<(), StoreError> {
        self.write_json(&self.agent_dir(agent_id).join("todos.json"), &todos)
            .await
    }

    async fn load_todos(&self, agent_id: &str) -> Result<Vec<TodoItem>, StoreError> {
        Ok(self
            .read_json(&self.agent_dir(agent_id).join("todos.json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_history_window(
        &self,
        agent_id: &str,
        window: &HistoryWindow,
    ) -> Result<(), StoreError> {
        let path = self
            .agent_dir(agent_id)
            .join("history/windows")
            .join(format!("{}.json", window.id));
        self.write_json(&path, window).await
    }

    async fn load_history_windows(&self, agent_id: &str) -> Result<Vec<HistoryWindow>, StoreError> {
        let mut windows: Vec<HistoryWindow> = self
            .read_dir_json(&self.agent_dir(agent_id).join("history/windows"))
            .await?;
        windows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(windows)
    }

    async fn save_compression_record(
        &self,
        agent_id: &str,
        record: &CompressionRecord,
    ) -> Result<(), StoreError> {
        let path = self
            .agent_dir(agent_id)
            .join("history/compressions")
            .join(format!("{}.json", record.id));
        self.write_json(&path, record).await
    }

    async fn load_compression_records(
        &self,
        agent_id: &str,
    ) -> Result<Vec<CompressionRecord>, StoreError> {
        let mut records: Vec<CompressionRecord> = self
            .read_dir_json(&self.agent_dir(agent_id).join("history/compressions"))
            .await?;
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    async fn save_recovered_file(
        &self,
        agent_id: &str,
        file: &RecoveredFile,
    ) -> Result<(), StoreError> {
        let path = self
            .agent_dir(agent_id)
            .join("history/recovered")
            .join(format!("{}.json", uuid::Uuid::new_v4()));
        self.write_json(&path, file).await
    }

    async fn load_recovered_files(&self, agent_id: &str) -> Result<Vec<RecoveredFile>, StoreError> {
        let mut files: Vec<RecoveredFile> = self
            .read_dir_json(&self.agent_dir(agent_id).join("history/recovered"))
            .await?;
        files.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(files)
    }

    async fn save_snapshot(&self, agent_id: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        let path = self
            .agent_dir(agent_id)
            .join("snapshots")
            .join(format!("{}.json", snapshot.id));
        self.write_json(&path, snapshot).await
    }

    async fn load_snapshot(&self, agent_id: &str, id: &str) -> Result<Snapshot, StoreError> {
        let path = self
            .agent_dir(agent_id)
            .join("snapshots")
            .join(format!("{id}.json"));
        self.read_json(&path)
            .await?
            .ok_or_else(|| StoreError::SnapshotNotFound(id.into()))
    }

    async fn list_snapshots(&self, agent_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        let mut snaps: Vec<Snapshot> = self
            .read_dir_json(&self.agent_dir(agent_id).join("snapshots"))
            .await?;
        snaps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snaps)
    }

    async fn delete_snapshot(&self, agent_id: &str, id: &str) -> Result<(), StoreError> {
        let path = self
            .agent_dir(agent_id)
            .join("snapshots")
            .join(format!("{id}.json"));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_info(&self, info: &AgentInfo) -> Result<(), StoreError> {
        self.write_json(&self.agent_dir(&info.agent_id).join("meta.json"), info)
            .await
    }

    async fn load_info(&self, agent_id: &str) -> Result<AgentInfo, StoreError> {
        self.read_json(&self.agent_dir(agent_id).join("meta.json"))
            .await?
            .ok_or_else(|| StoreError::AgentNotFound(agent_id.into()))
    }

    async fn exists(&self, agent_id: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.agent_dir(agent_id).join("meta.json")).await?)
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join("meta.json")).await? {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, agent_id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.agent_dir(agent_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
