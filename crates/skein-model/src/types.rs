// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One content block inside a message.
///
/// `tool_use` is assistant-produced; the paired `tool_result` arrives in the
/// next user-role message and must reference a `tool_use` id still present in
/// the retained history (the context manager repairs violations before a
/// request is built).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse { id: id.into(), name: name.into(), input }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value, is_error: bool) -> Self {
        Self::ToolResult { tool_use_id: tool_use_id.into(), content, is_error }
    }

    /// Approximate token count: serialized length / 4, rounded up.
    /// Non-text blocks are measured on their JSON form.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::Text { text } | Self::Thinking { text } => text.len(),
            other => serde_json::to_string(other).map(|s| s.len()).unwrap_or(0),
        };
        chars.div_ceil(4).max(1)
    }
}

/// A single message in the conversation history: a role plus an ordered list
/// of content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: vec![ContentBlock::text(text)] }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: vec![ContentBlock::text(text)] }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: vec![ContentBlock::text(text)] }
    }

    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self { role: Role::Assistant, content }
    }

    /// Tool results travel as a user-role message, one `tool_result` block per
    /// call, in the submission order of the originating `tool_use` blocks.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self { role: Role::User, content: blocks }
    }

    /// Concatenation of all text blocks (thinking excluded).
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All `tool_use` blocks in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// Drop thinking blocks (applied before persistence when thinking
    /// exposure is off).
    pub fn without_thinking(mut self) -> Self {
        self.content
            .retain(|b| !matches!(b, ContentBlock::Thinking { .. }));
        self
    }

    pub fn approx_tokens(&self) -> usize {
        self.content.iter().map(ContentBlock::approx_tokens).sum::<usize>().max(1)
    }
}

// ─── Provider request/response shapes ─────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stop_sequences: Vec<String>,
    pub enable_thinking: bool,
    pub thinking_budget: Option<u32>,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A single streamed chunk from the model.
///
/// Tool-use input arrives as partial JSON across any number of
/// `ToolUseInputDelta` chunks; it is accumulated and parsed when the matching
/// `ToolUseComplete` arrives (see [`crate::BlockAccumulator`]).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta { delta: String },
    ThinkingDelta { delta: String },
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta { id: String, delta: String },
    ToolUseComplete { id: String },
    MessageStop { stop_reason: ModelStopReason, usage: Usage },
}

/// Non-streaming completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: Vec<ContentBlock>,
    pub stop_reason: ModelStopReason,
    pub usage: Usage,
    pub model: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn message_text_concatenates_text_blocks_only() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::thinking("pondering"),
            ContentBlock::text("a"),
            ContentBlock::tool_use("c1", "fs_glob", json!({"pattern": "*"})),
            ContentBlock::text("b"),
        ]);
        assert_eq!(m.text(), "ab");
    }

    #[test]
    fn tool_uses_returns_blocks_in_order() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::tool_use("c1", "first", json!({})),
            ContentBlock::tool_use("c2", "second", json!({})),
        ]);
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "c1");
        assert_eq!(uses[1].1, "second");
    }

    #[test]
    fn without_thinking_strips_only_thinking() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::thinking("hmm"),
            ContentBlock::text("visible"),
        ])
        .without_thinking();
        assert_eq!(m.content.len(), 1);
        assert_eq!(m.text(), "visible");
    }

    // ── Token approximation ───────────────────────────────────────────────────

    #[test]
    fn approx_tokens_text_divides_by_four() {
        let m = Message::user("12345678");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_rounds_up() {
        let m = Message::user("12345");
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        let m = Message::user("");
        assert_eq!(m.approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_tool_use_measures_json_form() {
        let b = ContentBlock::tool_use("c1", "fs_read", json!({"path": "a.txt"}));
        let expected = serde_json::to_string(&b).unwrap().len().div_ceil(4);
        assert_eq!(b.approx_tokens(), expected);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn content_block_tagged_by_type() {
        let b = ContentBlock::text("hi");
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"type\":\"text\""));
    }

    #[test]
    fn tool_result_is_error_defaults_false() {
        let json = r#"{"type":"tool_result","tool_use_id":"c1","content":"ok"}"#;
        let b: ContentBlock = serde_json::from_str(json).unwrap();
        assert!(matches!(b, ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[test]
    fn message_round_trips() {
        let m = Message::assistant_blocks(vec![
            ContentBlock::text("t"),
            ContentBlock::tool_use("c1", "fs_glob", json!({"pattern": "*"})),
        ]);
        let text = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn model_stop_reason_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ModelStopReason::EndTurn).unwrap(),
            "\"end_turn\""
        );
    }

    #[test]
    fn usage_total_is_sum() {
        let u = Usage { input_tokens: 5, output_tokens: 1 };
        assert_eq!(u.total(), 6);
    }
}
