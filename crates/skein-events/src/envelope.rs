// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// The three delivery channels of the bus.
///
/// `progress` carries what a turn is producing (text/thinking chunks, tool
/// lifecycle, `done`); `control` carries events a caller is expected to act
/// on (approvals, runtime-state changes); `monitor` carries observability
/// events nothing in the loop depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::Control, Channel::Monitor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Progress => "progress",
            Channel::Control => "control",
            Channel::Monitor => "monitor",
        }
    }
}

/// A position in one agent's event stream.
///
/// `seq` is a per-agent strictly-monotonic counter; two envelopes from the
/// same agent never share a seq.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(seq: u64) -> Self {
        Self { seq, timestamp: Utc::now() }
    }
}

/// A stamped event as delivered to subscribers and appended to the store.
///
/// `cursor` is the bus cursor *after* this emission, so `cursor > bookmark.seq`
/// always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub cursor: u64,
    pub bookmark: Bookmark,
    pub event: Event,
}

impl EventEnvelope {
    pub fn seq(&self) -> u64 {
        self.bookmark.seq
    }

    pub fn channel(&self) -> Channel {
        self.event.channel
    }

    pub fn event_type(&self) -> &str {
        self.event.payload.event_type()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
