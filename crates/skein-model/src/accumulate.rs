// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use crate::{ContentBlock, ModelStopReason, StreamChunk, Usage};

/// Folds a chunk stream into ordered content blocks.
///
/// Text and thinking deltas coalesce into one block per run; tool-use input
/// deltas are buffered per call id and parsed as JSON when the matching
/// `ToolUseComplete` arrives.  Input that fails to parse becomes an empty
/// object so the tool runner's schema validation reports it as a normal
/// validation failure instead of a decode panic.
#[derive(Debug, Default)]
pub struct BlockAccumulator {
    blocks: Vec<ContentBlock>,
    pending: Vec<PendingToolUse>,
    stop_reason: Option<ModelStopReason>,
    usage: Option<Usage>,
}

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    buf: String,
}

impl BlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { delta } => {
                if let Some(ContentBlock::Text { text }) = self.blocks.last_mut() {
                    text.push_str(&delta);
                } else {
                    self.blocks.push(ContentBlock::text(delta));
                }
            }
            StreamChunk::ThinkingDelta { delta } => {
                if let Some(ContentBlock::Thinking { text }) = self.blocks.last_mut() {
                    text.push_str(&delta);
                } else {
                    self.blocks.push(ContentBlock::thinking(delta));
                }
            }
            StreamChunk::ToolUseStart { id, name } => {
                self.pending.push(PendingToolUse { id, name, buf: String::new() });
            }
            StreamChunk::ToolUseInputDelta { id, delta } => {
                if let Some(p) = self.pending.iter_mut().find(|p| p.id == id) {
                    p.buf.push_str(&delta);
                }
            }
            StreamChunk::ToolUseComplete { id } => {
                if let Some(pos) = self.pending.iter().position(|p| p.id == id) {
                    let p = self.pending.remove(pos);
                    let input = parse_input(&p.buf);
                    self.blocks.push(ContentBlock::tool_use(p.id, p.name, input));
                }
            }
            StreamChunk::MessageStop { stop_reason, usage } => {
                self.stop_reason = Some(stop_reason);
                self.usage = Some(usage);
            }
        }
    }

    /// Finish accumulation.  Tool uses never closed by a `ToolUseComplete`
    /// (a truncated stream) are flushed with whatever input was buffered.
    pub fn finish(mut self) -> (Vec<ContentBlock>, Option<ModelStopReason>, Option<Usage>) {
        for p in self.pending.drain(..) {
            let input = parse_input(&p.buf);
            self.blocks.push(ContentBlock::tool_use(p.id, p.name, input));
        }
        (self.blocks, self.stop_reason, self.usage)
    }
}

fn parse_input(buf: &str) -> Value {
    if buf.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(buf).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
