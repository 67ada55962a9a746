// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use regex::Regex;

use skein_config::{PermissionConfig, PermissionMode};

use crate::tool::ToolAttributes;

/// Outcome of policy evaluation for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    /// Park the call on an interactive approval decision.
    Ask,
    Deny(String),
}

type CustomHandler = Arc<dyn Fn(&str, &ToolAttributes) -> PolicyDecision + Send + Sync>;

/// Policy engine mapping a tool call to allow / ask / deny.
///
/// Precedence (highest first): deny list, restrictive allow list,
/// require-approval list (or the tool's own `requires_approval` flag), then
/// the mode default.  A custom handler, when installed, replaces the mode
/// default only; the lists still win.
#[derive(Clone)]
pub struct PermissionPolicy {
    deny: Vec<Regex>,
    /// `None` when the allow list is absent, empty, or contains `*`
    /// (i.e. unrestricted).
    allow: Option<Vec<Regex>>,
    require_approval: Vec<Regex>,
    mode: PermissionMode,
    custom: Option<CustomHandler>,
}

impl PermissionPolicy {
    pub fn from_config(cfg: &PermissionConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        let allow = if cfg.allow_tools.is_empty() || cfg.allow_tools.iter().any(|p| p == "*") {
            None
        } else {
            Some(compile(&cfg.allow_tools))
        };
        Self {
            deny: compile(&cfg.deny_tools),
            allow,
            require_approval: compile(&cfg.require_approval_tools),
            mode: cfg.mode,
            custom: None,
        }
    }

    /// Replace the mode default with a custom handler.
    pub fn with_custom_handler(
        mut self,
        handler: impl Fn(&str, &ToolAttributes) -> PolicyDecision + Send + Sync + 'static,
    ) -> Self {
        self.custom = Some(Arc::new(handler));
        self
    }

    pub fn decide(&self, tool_name: &str, attrs: &ToolAttributes) -> PolicyDecision {
        if self.deny.iter().any(|re| re.is_match(tool_name)) {
            return PolicyDecision::Deny(format!("tool {tool_name} is deny-listed"));
        }
        if let Some(allow) = &self.allow {
            if !allow.iter().any(|re| re.is_match(tool_name)) {
                return PolicyDecision::Deny(format!(
                    "tool {tool_name} is not on the allow list"
                ));
            }
        }
        if attrs.requires_approval
            || self.require_approval.iter().any(|re| re.is_match(tool_name))
        {
            return PolicyDecision::Ask;
        }
        if let Some(custom) = &self.custom {
            return custom(tool_name, attrs);
        }
        match self.mode {
            PermissionMode::Auto => PolicyDecision::Allow,
            PermissionMode::Approval => PolicyDecision::Ask,
            PermissionMode::Readonly => {
                if attrs.read_only {
                    PolicyDecision::Allow
                } else {
                    PolicyDecision::Deny(format!(
                        "tool {tool_name} is not read-only (readonly mode)"
                    ))
                }
            }
        }
    }
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self::from_config(&PermissionConfig::default())
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(cfg: PermissionConfig) -> PermissionPolicy {
        PermissionPolicy::from_config(&cfg)
    }

    fn attrs() -> ToolAttributes {
        ToolAttributes::default()
    }

    fn read_only() -> ToolAttributes {
        ToolAttributes { read_only: true, ..Default::default() }
    }

    // ── Deny takes priority ───────────────────────────────────────────────────

    #[test]
    fn deny_beats_allow_for_same_tool() {
        let p = policy(PermissionConfig {
            deny_tools: vec!["bash_run".into()],
            allow_tools: vec!["bash_run".into()],
            ..Default::default()
        });
        assert!(matches!(p.decide("bash_run", &attrs()), PolicyDecision::Deny(_)));
    }

    #[test]
    fn deny_glob_matches_prefix() {
        let p = policy(PermissionConfig {
            deny_tools: vec!["bash_*".into()],
            ..Default::default()
        });
        assert!(matches!(p.decide("bash_run", &attrs()), PolicyDecision::Deny(_)));
        assert_eq!(p.decide("fs_read", &attrs()), PolicyDecision::Allow);
    }

    #[test]
    fn deny_beats_require_approval() {
        let p = policy(PermissionConfig {
            deny_tools: vec!["x".into()],
            require_approval_tools: vec!["x".into()],
            ..Default::default()
        });
        assert!(matches!(p.decide("x", &attrs()), PolicyDecision::Deny(_)));
    }

    // ── Allow list ────────────────────────────────────────────────────────────

    #[test]
    fn restrictive_allow_list_denies_unlisted() {
        let p = policy(PermissionConfig {
            allow_tools: vec!["fs_read".into()],
            ..Default::default()
        });
        assert_eq!(p.decide("fs_read", &attrs()), PolicyDecision::Allow);
        assert!(matches!(p.decide("fs_write", &attrs()), PolicyDecision::Deny(_)));
    }

    #[test]
    fn wildcard_allow_list_is_unrestricted() {
        let p = policy(PermissionConfig {
            allow_tools: vec!["*".into()],
            ..Default::default()
        });
        assert_eq!(p.decide("anything", &attrs()), PolicyDecision::Allow);
    }

    #[test]
    fn empty_allow_list_is_unrestricted() {
        let p = policy(PermissionConfig::default());
        assert_eq!(p.decide("anything", &attrs()), PolicyDecision::Allow);
    }

    // ── Require-approval ──────────────────────────────────────────────────────

    #[test]
    fn listed_tool_asks() {
        let p = policy(PermissionConfig {
            require_approval_tools: vec!["bash_run".into()],
            ..Default::default()
        });
        assert_eq!(p.decide("bash_run", &attrs()), PolicyDecision::Ask);
    }

    #[test]
    fn tool_declared_requires_approval_asks() {
        let p = policy(PermissionConfig::default());
        let a = ToolAttributes { requires_approval: true, ..Default::default() };
        assert_eq!(p.decide("anything", &a), PolicyDecision::Ask);
    }

    // ── Mode defaults ─────────────────────────────────────────────────────────

    #[test]
    fn auto_mode_defaults_allow() {
        let p = policy(PermissionConfig::default());
        assert_eq!(p.decide("t", &attrs()), PolicyDecision::Allow);
    }

    #[test]
    fn approval_mode_defaults_ask() {
        let p = policy(PermissionConfig {
            mode: PermissionMode::Approval,
            ..Default::default()
        });
        assert_eq!(p.decide("t", &attrs()), PolicyDecision::Ask);
    }

    #[test]
    fn readonly_mode_denies_writers_allows_readers() {
        let p = policy(PermissionConfig {
            mode: PermissionMode::Readonly,
            ..Default::default()
        });
        assert!(matches!(p.decide("fs_write", &attrs()), PolicyDecision::Deny(_)));
        assert_eq!(p.decide("fs_read", &read_only()), PolicyDecision::Allow);
    }

    // ── Custom handler ────────────────────────────────────────────────────────

    #[test]
    fn custom_handler_replaces_mode_default() {
        let p = policy(PermissionConfig::default())
            .with_custom_handler(|name, _| {
                if name.starts_with("net_") {
                    PolicyDecision::Deny("network disabled".into())
                } else {
                    PolicyDecision::Allow
                }
            });
        assert!(matches!(p.decide("net_fetch", &attrs()), PolicyDecision::Deny(_)));
        assert_eq!(p.decide("fs_read", &attrs()), PolicyDecision::Allow);
    }

    #[test]
    fn custom_handler_does_not_override_deny_list() {
        let p = policy(PermissionConfig {
            deny_tools: vec!["x".into()],
            ..Default::default()
        })
        .with_custom_handler(|_, _| PolicyDecision::Allow);
        assert!(matches!(p.decide("x", &attrs()), PolicyDecision::Deny(_)));
    }
}
