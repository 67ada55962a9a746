// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::tool::{Tool, ToolDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no builder registered for tool source {tool_source:?} (tool {name:?})")]
    UnknownSource { tool_source: String, name: String },
    #[error("building tool {name:?} failed: {detail}")]
    BuildFailed { name: String, detail: String },
}

/// A tool schema as offered to the model.
#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

type ToolBuilder = Arc<dyn Fn(&ToolDescriptor) -> anyhow::Result<Arc<dyn Tool>> + Send + Sync>;

/// Central registry holding all available tools, plus builders able to
/// reconstruct them from persisted descriptors on resume.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    builders: HashMap<String, ToolBuilder>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Register a builder keyed by descriptor `source`.
    pub fn register_builder(
        &mut self,
        source: impl Into<String>,
        builder: impl Fn(&ToolDescriptor) -> anyhow::Result<Arc<dyn Tool>> + Send + Sync + 'static,
    ) {
        self.builders.insert(source.into(), Arc::new(builder));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Produce schemas for all registered tools, name-sorted for a stable
    /// request shape.
    pub fn schemas(&self) -> Vec<RegisteredSchema> {
        let mut schemas: Vec<RegisteredSchema> = self
            .tools
            .values()
            .map(|t| RegisteredSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Descriptors of every registered tool, name-sorted.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|t| t.descriptor()).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Reconstruct tool instances from persisted descriptors.
    ///
    /// Every descriptor must have a builder for its `source`; the first
    /// failure aborts the rebuild so a resumed agent never runs with a
    /// silently partial tool set.
    pub fn rebuild(&mut self, descriptors: &[ToolDescriptor]) -> Result<(), RegistryError> {
        for desc in descriptors {
            let builder =
                self.builders
                    .get(&desc.source)
                    .ok_or_else(|| RegistryError::UnknownSource {
                        tool_source: desc.source.clone(),
                        name: desc.name.clone(),
                    })?;
            let tool = builder(desc).map_err(|e| RegistryError::BuildFailed {
                name: desc.name.clone(),
                detail: e.to_string(),
            })?;
            self.tools.insert(tool.name().to_string(), tool);
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
