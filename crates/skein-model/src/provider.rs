// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

use crate::{BlockAccumulator, Completion, CompletionRequest, ModelStopReason, StreamChunk, Usage};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream>;

    /// Non-streaming completion.
    ///
    /// The default implementation folds the chunk stream through a
    /// [`BlockAccumulator`].  A stream that ends without a `MessageStop`
    /// chunk reports `EndTurn` with zero usage.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<Completion> {
        let model = self.model_name().to_string();
        let mut stream = self.stream(req).await?;
        let mut acc = BlockAccumulator::new();
        while let Some(chunk) = stream.next().await {
            acc.push(chunk?);
        }
        let (content, stop_reason, usage) = acc.finish();
        Ok(Completion {
            content,
            stop_reason: stop_reason.unwrap_or(ModelStopReason::EndTurn),
            usage: usage.unwrap_or(Usage::default()),
            model,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentBlock, ScriptedMockProvider};

    #[tokio::test]
    async fn default_complete_folds_stream() {
        let p = ScriptedMockProvider::always_text("hello");
        let c = p.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(c.content, vec![ContentBlock::text("hello")]);
        assert_eq!(c.stop_reason, ModelStopReason::EndTurn);
    }

    #[tokio::test]
    async fn default_complete_parses_tool_use() {
        let p = ScriptedMockProvider::tool_then_text(
            "c1",
            "fs_glob",
            r#"{"pattern":"*"}"#,
            "done",
        );
        let c = p.complete(CompletionRequest::default()).await.unwrap();
        assert_eq!(c.stop_reason, ModelStopReason::ToolUse);
        assert!(matches!(&c.content[0], ContentBlock::ToolUse { name, .. } if name == "fs_glob"));
    }
}
