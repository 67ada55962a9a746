// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
#[allow(dead_code)]
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Describes the completion requests the runtime builds.  The provider
/// implementation itself is supplied by the embedding application; these
/// fields are forwarded verbatim into every [`CompletionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier, forwarded to the embedder's provider factory.
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Stop sequences forwarded to the provider
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Request extended-thinking output from providers that support it.
    /// When off, thinking deltas are dropped from progress events and
    /// stripped from persisted assistant messages.
    #[serde(default)]
    pub enable_thinking: bool,
    /// Token budget for extended thinking (forwarded when set)
    pub thinking_budget: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            max_tokens: Some(4096),
            temperature: Some(0.2),
            stop_sequences: Vec::new(),
            enable_thinking: false,
            thinking_budget: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    50
}
fn default_tool_concurrency() -> usize {
    3
}
fn default_tool_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model↔tool iterations per turn before the loop stops with
    /// a `MAX_ITERATIONS` done event.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Upper bound on tool calls executing concurrently within one batch.
    /// Tools that do not declare `allow_parallel` serialize regardless.
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
    /// Per-tool-call wall-clock timeout in seconds.  A timed-out call fails
    /// with a timeout error; the rest of the batch continues.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// System prompt override; leave None for no system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_concurrency: default_tool_concurrency(),
            tool_timeout_secs: default_tool_timeout_secs(),
            system_prompt: None,
        }
    }
}

/// Default decision applied after the deny / allow / require-approval lists
/// have been consulted without a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Allow everything not otherwise listed
    #[default]
    Auto,
    /// Ask for everything not otherwise listed
    Approval,
    /// Deny any tool whose descriptor is not marked read-only
    Readonly,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default)]
    pub mode: PermissionMode,
    /// Tools that may never run.  Entries support `*` / `?` globs.
    #[serde(default)]
    pub deny_tools: Vec<String>,
    /// When non-empty and lacking `*`, any tool not listed is denied.
    #[serde(default)]
    pub allow_tools: Vec<String>,
    /// Tools that always require an interactive approval decision.
    #[serde(default)]
    pub require_approval_tools: Vec<String>,
}

fn default_context_max_tokens() -> usize {
    100_000
}
fn default_compress_to_tokens() -> usize {
    50_000
}
fn default_min_keep_ratio() -> f64 {
    0.6
}
fn default_max_recovered_files() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Estimated-token ceiling; exceeding it triggers compression before the
    /// next model call.
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,
    /// Target estimated size after compression.
    #[serde(default = "default_compress_to_tokens")]
    pub compress_to_tokens: usize,
    /// Floor on the fraction of messages retained by one compression pass.
    /// Keeping at least 60% of the tail preserves tool_use/tool_result
    /// pairings for recent work.
    #[serde(default = "default_min_keep_ratio")]
    pub min_keep_ratio: f64,
    /// Number of recently-accessed files captured as recovered-file
    /// snapshots during compression.
    #[serde(default = "default_max_recovered_files")]
    pub max_recovered_files: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            compress_to_tokens: default_compress_to_tokens(),
            min_keep_ratio: default_min_keep_ratio(),
            max_recovered_files: default_max_recovered_files(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for the file-tree store backend.  `None` selects the
    /// in-memory backend.
    #[serde(default)]
    pub root: Option<std::path::PathBuf>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_agent_config_values() {
        let c = AgentConfig::default();
        assert_eq!(c.max_iterations, 50);
        assert_eq!(c.tool_concurrency, 3);
        assert_eq!(c.tool_timeout_secs, 60);
        assert!(c.system_prompt.is_none());
    }

    #[test]
    fn default_permission_mode_is_auto() {
        assert_eq!(PermissionMode::default(), PermissionMode::Auto);
    }

    #[test]
    fn permission_mode_parses_lowercase() {
        let m: PermissionMode = serde_yaml::from_str("readonly").unwrap();
        assert_eq!(m, PermissionMode::Readonly);
    }

    #[test]
    fn default_context_keeps_sixty_percent_floor() {
        let c = ContextConfig::default();
        assert_eq!(c.min_keep_ratio, 0.6);
        assert_eq!(c.max_recovered_files, 5);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.model.provider, "mock");
        assert_eq!(cfg.agent.tool_concurrency, 3);
        assert!(cfg.store.root.is_none());
    }

    #[test]
    fn partial_yaml_overrides_single_field() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_iterations: 7").unwrap();
        assert_eq!(cfg.agent.max_iterations, 7);
        // untouched siblings keep their defaults
        assert_eq!(cfg.agent.tool_timeout_secs, 60);
    }

    #[test]
    fn permission_lists_deserialize() {
        let cfg: Config = serde_yaml::from_str(
            "permissions:\n  mode: approval\n  deny_tools: [\"bash_*\"]\n  require_approval_tools: [\"fs_write\"]",
        )
        .unwrap();
        assert_eq!(cfg.permissions.mode, PermissionMode::Approval);
        assert_eq!(cfg.permissions.deny_tools, vec!["bash_*"]);
        assert_eq!(cfg.permissions.require_approval_tools, vec!["fs_write"]);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.model.name, cfg.model.name);
        assert_eq!(back.context.max_tokens, cfg.context.max_tokens);
    }
}
