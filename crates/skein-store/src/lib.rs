// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod fs;
mod memory;
mod records;
mod store;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use records::{
    AgentInfo, Approval, AuditEntry, CompressionConfig, CompressionRecord, HistoryWindow,
    RecordState, RecoveredFile, Snapshot, TodoItem, ToolCallRecord, WindowStats,
    preview_json,
};
pub use store::{Store, StoreError};
