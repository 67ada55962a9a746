// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use skein_config::ContextConfig;
use skein_events::EventKind;
use skein_model::{ContentBlock, Message, Role};
use skein_store::{
    CompressionConfig, CompressionRecord, HistoryWindow, RecoveredFile, Store, WindowStats,
};
use skein_tools::Sandbox;

use crate::bus::EventBus;
use crate::file_pool::FilePool;

/// What one compression pass did.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub window_id: String,
    pub record_id: String,
    pub ratio: f64,
    pub converted_orphans: usize,
    pub recovered_files: Vec<String>,
}

/// Token-bounded window management: cheap estimation, history compression,
/// and orphan tool_result repair.
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// 4-chars-per-token heuristic over every block's serialized form.
    pub fn estimate_tokens(messages: &[Message]) -> usize {
        messages.iter().map(Message::approx_tokens).sum()
    }

    pub fn needs_compression(&self, messages: &[Message]) -> bool {
        Self::estimate_tokens(messages) > self.config.max_tokens
    }

    /// Replace every `tool_result` whose paired `tool_use` is not present in
    /// `messages` with a text block carrying its payload.  Returns how many
    /// blocks were converted.
    pub fn repair_orphans(messages: &mut [Message]) -> usize {
        let tool_use_ids: std::collections::HashSet<String> = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_uses().into_iter().map(|(id, _, _)| id.to_string()))
            .collect();

        let mut converted = 0;
        for message in messages.iter_mut() {
            for block in message.content.iter_mut() {
                if let ContentBlock::ToolResult { tool_use_id, content, .. } = block {
                    if !tool_use_ids.contains(tool_use_id.as_str()) {
                        let preview = truncate_chars(&content.to_string(), 200);
                        *block = ContentBlock::text(format!("[Previous tool result: {preview}]"));
                        converted += 1;
                    }
                }
            }
        }
        converted
    }

    /// Compress when over budget.  One invocation is atomic: history window,
    /// retained-slice repair, summary injection, recovered files, and the
    /// compression record either all land or the error propagates.
    #[allow(clippy::too_many_arguments)]
    pub async fn compress_if_needed(
        &self,
        agent_id: &str,
        messages: &mut Vec<Message>,
        bus: &Arc<EventBus>,
        store: &Arc<dyn Store>,
        file_pool: &Arc<FilePool>,
        sandbox: &Arc<dyn Sandbox>,
        model_name: &str,
    ) -> anyhow::Result<Option<CompressionOutcome>> {
        let total = Self::estimate_tokens(messages);
        if total <= self.config.max_tokens {
            return Ok(None);
        }

        let count = messages.len();
        let target_ratio = self.config.compress_to_tokens as f64 / total as f64;
        let effective_ratio = target_ratio.max(self.config.min_keep_ratio);
        let keep = ((count as f64 * effective_ratio).ceil() as usize).max(1);
        if keep >= count {
            debug!(agent = %agent_id, "over token budget but nothing to remove");
            return Ok(None);
        }

        bus.emit(EventKind::ContextCompression {
            phase: "start".into(),
            summary: None,
            ratio: None,
        });

        // 1. Capture the full pre-compression window.
        let window = HistoryWindow {
            id: Uuid::new_v4().to_string(),
            messages: messages.clone(),
            events: bus.recent_events(100),
            stats: WindowStats {
                message_count: count,
                token_count: total,
                event_count: bus.recent_events(100).len(),
            },
            timestamp: Utc::now(),
        };
        store
            .save_history_window(agent_id, &window)
            .await
            .context("saving history window")?;

        // 2. Split and repair the retained tail.
        let removed: Vec<Message> = messages[..count - keep].to_vec();
        let mut retained: Vec<Message> = messages[count - keep..].to_vec();
        let converted = Self::repair_orphans(&mut retained);
        if converted > 0 {
            bus.emit(EventKind::ContextRepair {
                reason: "compression".into(),
                converted,
                note: Some("orphan tool results converted to text".into()),
            });
        }

        // 3. Synthesize the summary system message from the removed slice.
        let timestamp = Utc::now();
        let summary_text = summarize_removed(&removed, &window.id, &timestamp.to_rfc3339());
        let mut compressed = Vec::with_capacity(retained.len() + 1);
        compressed.push(Message::system(summary_text.clone()));
        compressed.extend(retained);

        // 4. Capture recently-accessed files so the summary can refer to them.
        let mut recovered_files = Vec::new();
        for path in file_pool
            .accessed_files()
            .into_iter()
            .take(self.config.max_recovered_files)
        {
            let content = match sandbox.read_file(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path, error = %e, "skipping unreadable file during recovery");
                    continue;
                }
            };
            let mtime = sandbox
                .stat(&path)
                .await?
                .map(|s| s.mtime_ms)
                .unwrap_or_default();
            let file = RecoveredFile { path: path.clone(), content, mtime, timestamp: Utc::now() };
            store
                .save_recovered_file(agent_id, &file)
                .await
                .context("saving recovered file")?;
            recovered_files.push(path);
        }

        // 5. Persist the compression record.
        let record = CompressionRecord {
            id: Uuid::new_v4().to_string(),
            window_id: window.id.clone(),
            config: CompressionConfig {
                model: model_name.into(),
                prompt: String::new(),
                threshold: self.config.max_tokens,
            },
            summary: truncate_chars(&summary_text, 500),
            ratio: effective_ratio,
            recovered_files: recovered_files.clone(),
            timestamp,
        };
        store
            .save_compression_record(agent_id, &record)
            .await
            .context("saving compression record")?;

        bus.emit(EventKind::ContextCompression {
            phase: "end".into(),
            summary: Some(record.summary.clone()),
            ratio: Some(effective_ratio),
        });

        *messages = compressed;
        Ok(Some(CompressionOutcome {
            window_id: window.id,
            record_id: record.id,
            ratio: effective_ratio,
            converted_orphans: converted,
            recovered_files,
        }))
    }
}

fn summarize_removed(removed: &[Message], window_id: &str, timestamp: &str) -> String {
    let users = removed.iter().filter(|m| m.role == Role::User).count();
    let assistants = removed.iter().filter(|m| m.role == Role::Assistant).count();
    let tool_calls: usize = removed.iter().map(|m| m.tool_uses().len()).sum();

    let user_texts: Vec<String> = removed
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.text())
        .filter(|t| !t.is_empty())
        .collect();
    let first = user_texts
        .first()
        .map(|t| truncate_chars(t, 200))
        .unwrap_or_else(|| "(none)".into());
    let last = user_texts
        .last()
        .map(|t| truncate_chars(t, 200))
        .unwrap_or_else(|| "(none)".into());

    format!(
        "<context-summary window=\"{window_id}\" timestamp=\"{timestamp}\">\n\
         Compressed {n} earlier messages: {users} user, {assistants} assistant, {tool_calls} tool calls.\n\
         First user message: {first}\n\
         Last user message: {last}\n\
         </context-summary>",
        n = removed.len(),
    )
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
