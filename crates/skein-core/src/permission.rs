// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use skein_events::{EventKind, ToolCallSnapshot};
use skein_tools::{PermissionPolicy, PolicyDecision, ToolAttributes};

use crate::bus::EventBus;

/// The resolved outcome of one approval rendezvous.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub decided_by: Option<String>,
    pub note: Option<String>,
}

/// Policy evaluation plus the approval request/response rendezvous.
///
/// A table keyed by call id holds a oneshot signal per outstanding request;
/// a synchronous control-channel handler resolves the matching signal when a
/// `permission_decided` event arrives.  Only the first decision for a call
/// wins: the entry is removed on resolution, so later decisions for the
/// same call are ignored.
pub struct PermissionManager {
    policy: PermissionPolicy,
    bus: Arc<EventBus>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>>,
}

impl PermissionManager {
    pub fn new(policy: PermissionPolicy, bus: Arc<EventBus>) -> Arc<Self> {
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let table = pending.clone();
        bus.on_control(move |env| {
            if let Some(EventKind::PermissionDecided { call_id, decision, decided_by, note }) =
                env.event.payload.kind()
            {
                let Some(tx) = table.lock().unwrap().remove(call_id) else {
                    debug!(call_id = %call_id, "decision for unknown or already-decided call");
                    return;
                };
                let _ = tx.send(ApprovalDecision {
                    approved: decision == "approve",
                    decided_by: decided_by.clone(),
                    note: note.clone(),
                });
            }
        });

        Arc::new(Self { policy, bus, pending })
    }

    /// Evaluate the configured policy for one tool call.
    pub fn evaluate(&self, tool_name: &str, attrs: &ToolAttributes) -> PolicyDecision {
        self.policy.decide(tool_name, attrs)
    }

    /// Open the rendezvous for a call and announce `permission_required`.
    ///
    /// The returned receiver resolves when the decision event arrives; the
    /// call id inside the event snapshot is the handle a responder passes to
    /// [`approve`](Self::approve) / [`deny`](Self::deny).
    pub fn begin_approval(
        &self,
        call: ToolCallSnapshot,
        reason: Option<String>,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(call.id.clone(), tx);
        self.bus.emit(EventKind::PermissionRequired { call, reason });
        rx
    }

    /// Convenience: open the rendezvous and block until a decision or
    /// cancellation.  `None` means cancelled before any decision.
    pub async fn request_approval(
        &self,
        call: ToolCallSnapshot,
        reason: Option<String>,
        cancel: &CancellationToken,
    ) -> Option<ApprovalDecision> {
        let call_id = call.id.clone();
        let rx = self.begin_approval(call, reason);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Leave the pending entry so a later decision still lands.
                debug!(call_id = %call_id, "approval wait cancelled");
                None
            }
            decision = rx => decision.ok(),
        }
    }

    /// Emit an approval decision programmatically.
    pub fn approve(&self, call_id: &str) {
        self.bus.emit(EventKind::PermissionDecided {
            call_id: call_id.into(),
            decision: "approve".into(),
            decided_by: None,
            note: None,
        });
    }

    /// Emit a denial decision programmatically.
    pub fn deny(&self, call_id: &str, reason: Option<&str>) {
        self.bus.emit(EventKind::PermissionDecided {
            call_id: call_id.into(),
            decision: "deny".into(),
            decided_by: None,
            note: reason.map(str::to_string),
        });
    }

    /// Whether a call is still waiting for its decision.
    pub fn is_pending(&self, call_id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(call_id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
