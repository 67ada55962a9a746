// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::ChunkStream, CompletionRequest, ModelStopReason, Role, StreamChunk, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());

        let chunks: Vec<anyhow::Result<StreamChunk>> = vec![
            Ok(StreamChunk::TextDelta { delta: format!("MOCK: {reply}") }),
            Ok(StreamChunk::MessageStop {
                stop_reason: ModelStopReason::EndTurn,
                usage: Usage { input_tokens: 10, output_tokens: 10 },
            }),
        ];
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// A pre-scripted mock provider.  Each call to `stream` pops the next
/// chunk script from the front of the queue.  This lets tests specify
/// exact chunk sequences – including tool calls – without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamChunk>>>>,
    name: String,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of chunk scripts.
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// sequence of [`StreamChunk`]s emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// One script producing `reply` with a 5-in / 1-out usage stamp.
    pub fn text_script(reply: impl Into<String>) -> Vec<StreamChunk> {
        vec![
            StreamChunk::TextDelta { delta: reply.into() },
            StreamChunk::MessageStop {
                stop_reason: ModelStopReason::EndTurn,
                usage: Usage { input_tokens: 5, output_tokens: 1 },
            },
        ]
    }

    /// One script producing a single complete tool call.
    pub fn tool_script(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<StreamChunk> {
        let id = id.into();
        vec![
            StreamChunk::ToolUseStart { id: id.clone(), name: name.into() },
            StreamChunk::ToolUseInputDelta { id: id.clone(), delta: args_json.into() },
            StreamChunk::ToolUseComplete { id },
            StreamChunk::MessageStop {
                stop_reason: ModelStopReason::ToolUse,
                usage: Usage { input_tokens: 8, output_tokens: 4 },
            },
        ]
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_script(tool_id, tool_name, args_json),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let chunks = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                vec![
                    StreamChunk::TextDelta { delta: "[no more scripts]".into() },
                    StreamChunk::MessageStop {
                        stop_reason: ModelStopReason::EndTurn,
                        usage: Usage::default(),
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamChunk>> = chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{Message, ModelProvider};

    fn empty_req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let mut stream = p.stream(empty_req()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        match first {
            StreamChunk::TextDelta { delta } => assert!(delta.contains("MOCK: hi")),
            other => panic!("unexpected first chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mock_ends_with_message_stop() {
        let p = MockProvider;
        let mut stream = p.stream(empty_req()).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(c) = stream.next().await {
            chunks.push(c.unwrap());
        }
        assert!(matches!(chunks.last(), Some(StreamChunk::MessageStop { .. })));
    }

    #[tokio::test]
    async fn scripted_single_text_reply() {
        let p = ScriptedMockProvider::always_text("hello world");
        let mut stream = p.stream(empty_req()).await.unwrap();
        let c = stream.next().await.unwrap().unwrap();
        assert!(matches!(c, StreamChunk::TextDelta { delta } if delta == "hello world"));
    }

    #[tokio::test]
    async fn scripted_records_last_request() {
        let p = ScriptedMockProvider::always_text("x");
        let _ = p.stream(empty_req()).await.unwrap();
        let captured = p.last_request.lock().unwrap();
        assert_eq!(captured.as_ref().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn scripted_tool_then_text_two_rounds() {
        let p = ScriptedMockProvider::tool_then_text(
            "call-1",
            "fs_glob",
            r#"{"pattern":"*"}"#,
            "done",
        );

        // Round 1
        let mut chunks = Vec::new();
        let mut stream = p.stream(empty_req()).await.unwrap();
        while let Some(c) = stream.next().await {
            chunks.push(c.unwrap());
        }
        assert!(chunks
            .iter()
            .any(|c| matches!(c, StreamChunk::ToolUseStart { name, .. } if name == "fs_glob")));

        // Round 2
        let mut chunks2 = Vec::new();
        let mut stream2 = p.stream(empty_req()).await.unwrap();
        while let Some(c) = stream2.next().await {
            chunks2.push(c.unwrap());
        }
        assert!(chunks2
            .iter()
            .any(|c| matches!(c, StreamChunk::TextDelta { delta } if delta == "done")));
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let mut stream = p.stream(empty_req()).await.unwrap();
        let c = stream.next().await.unwrap().unwrap();
        assert!(matches!(c, StreamChunk::TextDelta { delta } if delta.contains("no more scripts")));
    }
}
