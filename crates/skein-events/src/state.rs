// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Deserializer, Serialize};

/// Raw persisted form of a state enum.  Current writers emit
/// `UPPER_SNAKE_CASE` strings; legacy stores carried plain enum ordinals,
/// and hand-edited files show up with arbitrary casing.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StateRepr {
    Name(String),
    Ordinal(u64),
}

/// Resolve a [`StateRepr`] against an ordered variant-name table.
/// Name matching is case-insensitive; ordinals index the table directly.
pub fn lookup_variant(repr: &StateRepr, names: &[&str]) -> Option<usize> {
    match repr {
        StateRepr::Name(s) => names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(s.trim())),
        StateRepr::Ordinal(i) => {
            let i = *i as usize;
            (i < names.len()).then_some(i)
        }
    }
}

/// Coarse lifecycle tag persisted on every step transition; the anchor for
/// crash recovery.  Distinct from [`AgentRuntimeState`], which is what
/// callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakpointState {
    #[default]
    Ready,
    PreModel,
    StreamingModel,
    ToolPending,
    AwaitingApproval,
    PreTool,
    ToolExecuting,
    PostTool,
}

const BREAKPOINT_NAMES: [&str; 8] = [
    "READY",
    "PRE_MODEL",
    "STREAMING_MODEL",
    "TOOL_PENDING",
    "AWAITING_APPROVAL",
    "PRE_TOOL",
    "TOOL_EXECUTING",
    "POST_TOOL",
];

const BREAKPOINT_VARIANTS: [BreakpointState; 8] = [
    BreakpointState::Ready,
    BreakpointState::PreModel,
    BreakpointState::StreamingModel,
    BreakpointState::ToolPending,
    BreakpointState::AwaitingApproval,
    BreakpointState::PreTool,
    BreakpointState::ToolExecuting,
    BreakpointState::PostTool,
];

impl BreakpointState {
    /// Safe fork points are the only states where messages and tool records
    /// are mutually consistent for snapshotting.
    pub fn is_safe_fork_point(&self) -> bool {
        matches!(self, Self::Ready | Self::PostTool)
    }

    pub fn as_str(&self) -> &'static str {
        BREAKPOINT_NAMES[BREAKPOINT_VARIANTS.iter().position(|v| v == self).unwrap()]
    }
}

impl<'de> Deserialize<'de> for BreakpointState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let repr = StateRepr::deserialize(d)?;
        lookup_variant(&repr, &BREAKPOINT_NAMES)
            .map(|i| BREAKPOINT_VARIANTS[i])
            .ok_or_else(|| serde::de::Error::custom(format!("unknown breakpoint state: {repr:?}")))
    }
}

/// Runtime state exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentRuntimeState {
    #[default]
    Ready,
    Working,
    Paused,
}

const RUNTIME_NAMES: [&str; 3] = ["READY", "WORKING", "PAUSED"];
const RUNTIME_VARIANTS: [AgentRuntimeState; 3] = [
    AgentRuntimeState::Ready,
    AgentRuntimeState::Working,
    AgentRuntimeState::Paused,
];

impl AgentRuntimeState {
    pub fn as_str(&self) -> &'static str {
        RUNTIME_NAMES[RUNTIME_VARIANTS.iter().position(|v| v == self).unwrap()]
    }
}

impl<'de> Deserialize<'de> for AgentRuntimeState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let repr = StateRepr::deserialize(d)?;
        lookup_variant(&repr, &RUNTIME_NAMES)
            .map(|i| RUNTIME_VARIANTS[i])
            .ok_or_else(|| serde::de::Error::custom(format!("unknown runtime state: {repr:?}")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
