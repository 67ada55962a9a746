// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sandbox::Sandbox;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier produced by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(value: Value) -> Self {
        Self { success: true, value: Some(value), error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self { success: false, value: None, error: Some(msg.into()) }
    }

    /// The surface that becomes a `tool_result` block: the value on success,
    /// the error text on failure.
    pub fn content(&self) -> Value {
        if self.success {
            self.value.clone().unwrap_or(Value::Null)
        } else {
            Value::String(self.error.clone().unwrap_or_default())
        }
    }
}

/// Static behavioral flags a tool declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAttributes {
    /// Observes but never mutates; runnable in readonly permission mode.
    #[serde(default)]
    pub read_only: bool,
    /// No observable side effect at all (pure computation).
    #[serde(default)]
    pub no_effect: bool,
    /// Always requires an approval decision regardless of config lists.
    #[serde(default)]
    pub requires_approval: bool,
    /// Safe to run concurrently with other tools in the same batch.
    #[serde(default)]
    pub allow_parallel: bool,
    /// Category consulted by the freshness gate ("write" tools are checked
    /// against the file pool before execution).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_category: Option<String>,
}

impl ToolAttributes {
    pub fn is_write_class(&self) -> bool {
        self.permission_category.as_deref() == Some("write")
    }
}

/// Persistable identity of a tool instance: enough to rebuild it through a
/// registry builder on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Which builder reconstructs this tool (e.g. "builtin", "mcp")
    pub source: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

/// Type-keyed bag of shared services tools may need (clients, caches).
/// Deliberately untyped at this layer; the embedder registers what its
/// tools look up.
#[derive(Default)]
pub struct ServiceProvider {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, service: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), service);
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }
}

/// Everything a tool execution can reach.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub call_id: String,
    pub sandbox: Arc<dyn Sandbox>,
    pub services: Arc<ServiceProvider>,
}

/// Trait every tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object
    fn input_schema(&self) -> Value;
    fn attributes(&self) -> ToolAttributes {
        ToolAttributes::default()
    }
    /// Extra prompt text injected when this tool is offered to the model.
    fn prompt(&self, _ctx: &ToolContext) -> Option<String> {
        None
    }
    /// Execute the tool.  Failures should be reported via [`ToolOutput::err`];
    /// a panic is caught by the runner and surfaced the same way.
    async fn execute(&self, args: Value, ctx: &ToolContext, cancel: CancellationToken)
        -> ToolOutput;
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            source: "builtin".into(),
            name: self.name().into(),
            registry_id: None,
            config: Value::Null,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
