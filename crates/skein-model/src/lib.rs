// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod accumulate;
mod mock;
mod provider;
mod types;

pub use accumulate::BlockAccumulator;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{ChunkStream, ModelProvider};
pub use types::{
    Completion, CompletionRequest, ContentBlock, Message, ModelStopReason, Role, StreamChunk,
    ToolSchema, Usage,
};
