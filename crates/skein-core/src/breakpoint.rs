// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use chrono::Utc;

use skein_events::{BreakpointState, EventKind};

use crate::bus::EventBus;

/// Holds the agent's coarse lifecycle tag and announces every change.
///
/// The agent persists its metadata after each transition; the persisted tag
/// is what crash recovery anchors on.
pub struct BreakpointManager {
    current: BreakpointState,
    bus: Arc<EventBus>,
}

impl BreakpointManager {
    pub fn new(bus: Arc<EventBus>, initial: BreakpointState) -> Self {
        Self { current: initial, bus }
    }

    pub fn current(&self) -> BreakpointState {
        self.current
    }

    pub fn is_safe_fork_point(&self) -> bool {
        self.current.is_safe_fork_point()
    }

    /// Restore a persisted state without announcing a transition (resume path).
    pub(crate) fn restore(&mut self, state: BreakpointState) {
        self.current = state;
    }

    /// Move to `next`.  A same-state transition is a no-op and emits nothing.
    /// Returns whether the state actually changed (the caller persists
    /// metadata when it did).
    pub fn transition_to(&mut self, next: BreakpointState) -> bool {
        if self.current == next {
            return false;
        }
        let previous = self.current;
        self.current = next;
        self.bus.emit(EventKind::BreakpointChanged {
            previous,
            current: next,
            timestamp: Utc::now(),
        });
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use skein_events::Channel;
    use skein_store::MemoryStore;

    use super::*;
    use crate::bus::{BusOptions, SubscribeOptions};

    fn manager() -> (Arc<EventBus>, BreakpointManager) {
        let bus = EventBus::new(
            "a1",
            Arc::new(MemoryStore::new()),
            BusOptions::default(),
        );
        let mgr = BreakpointManager::new(bus.clone(), BreakpointState::Ready);
        (bus, mgr)
    }

    #[tokio::test]
    async fn transition_emits_breakpoint_changed() {
        let (bus, mut mgr) = manager();
        let mut stream = bus.subscribe(SubscribeOptions::channel(Channel::Monitor)).await;
        assert!(mgr.transition_to(BreakpointState::PreModel));
        let env = stream.next().await.unwrap();
        match env.event.payload.kind().unwrap() {
            EventKind::BreakpointChanged { previous, current, .. } => {
                assert_eq!(*previous, BreakpointState::Ready);
                assert_eq!(*current, BreakpointState::PreModel);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_state_transition_is_noop() {
        let (bus, mut mgr) = manager();
        assert!(!mgr.transition_to(BreakpointState::Ready));
        assert_eq!(bus.cursor(), 0, "no event may be emitted for a no-op");
    }

    #[tokio::test]
    async fn safe_fork_point_tracks_state() {
        let (_bus, mut mgr) = manager();
        assert!(mgr.is_safe_fork_point());
        mgr.transition_to(BreakpointState::ToolExecuting);
        assert!(!mgr.is_safe_fork_point());
        mgr.transition_to(BreakpointState::PostTool);
        assert!(mgr.is_safe_fork_point());
    }
}
