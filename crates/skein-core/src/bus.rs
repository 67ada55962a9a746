// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::warn;

use skein_events::{Bookmark, Channel, Event, EventEnvelope, EventKind};
use skein_store::Store;

pub type EventStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>;

/// Capacity knobs for the in-memory side of the bus.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Recent-envelope ring used for replay without touching the store.
    pub timeline_capacity: usize,
    /// Per-subscriber queue; overflow drops the *oldest* entry so a slow
    /// subscriber can never block the emitter.
    pub subscriber_capacity: usize,
    /// Critical-event retry buffer used while persistence is failing.
    pub failed_capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            timeline_capacity: 1024,
            subscriber_capacity: 256,
            failed_capacity: 512,
        }
    }
}

/// Filter for [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub channels: Vec<Channel>,
    /// `None` attaches live-only (no replay).  `Some(bm)` replays everything
    /// after `bm.seq` — from the store when the in-memory timeline no longer
    /// reaches back far enough.
    pub since: Option<Bookmark>,
    /// Restrict to specific event type strings.
    pub kinds: Option<Vec<String>>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { channels: Channel::ALL.to_vec(), since: None, kinds: None }
    }
}

impl SubscribeOptions {
    pub fn channel(channel: Channel) -> Self {
        Self { channels: vec![channel], ..Default::default() }
    }

    pub fn since(mut self, bookmark: Bookmark) -> Self {
        self.since = Some(bookmark);
        self
    }

    fn matches(&self, env: &EventEnvelope) -> bool {
        self.channels.contains(&env.channel())
            && self
                .kinds
                .as_ref()
                .map(|k| k.iter().any(|t| t == env.event_type()))
                .unwrap_or(true)
    }
}

type Handler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Bounded drop-oldest queue feeding one subscriber.
struct SubscriberQueue {
    inner: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::new()), notify: Notify::new(), capacity }
    }

    fn push(&self, env: EventEnvelope) {
        {
            let mut q = self.inner.lock().unwrap();
            if q.len() == self.capacity {
                q.pop_front();
            }
            q.push_back(env);
        }
        self.notify.notify_one();
    }

    async fn pop(self: &Arc<Self>) -> EventEnvelope {
        loop {
            if let Some(env) = self.inner.lock().unwrap().pop_front() {
                return env;
            }
            self.notify.notified().await;
        }
    }
}

struct Subscriber {
    opts: SubscribeOptions,
    queue: Weak<SubscriberQueue>,
}

struct BusState {
    /// Next seq to assign; also the value reported by [`EventBus::cursor`].
    cursor: u64,
    last_bookmark: Option<Bookmark>,
    timeline: VecDeque<EventEnvelope>,
    subscribers: Vec<Subscriber>,
    control_handlers: Vec<Handler>,
    monitor_handlers: Vec<Handler>,
    /// Critical envelopes awaiting a persistence retry, FIFO.
    failed: VecDeque<EventEnvelope>,
}

enum PersistMsg {
    Envelope(EventEnvelope),
    Flush(oneshot::Sender<usize>),
}

/// In-process pub/sub with durable ordering and replay.
///
/// The emit path is synchronous and lock-protected: seq assignment, timeline
/// append, subscriber fan-out, and inline handler invocation all happen
/// before `emit` returns.  Persistence runs behind an unbounded channel on a
/// single background worker so appends reach the store in seq order.
pub struct EventBus {
    agent_id: String,
    options: BusOptions,
    state: Mutex<BusState>,
    persist_tx: mpsc::UnboundedSender<PersistMsg>,
    store: Arc<dyn Store>,
}

impl EventBus {
    /// Must be called inside a Tokio runtime (spawns the persistence worker).
    pub fn new(agent_id: impl Into<String>, store: Arc<dyn Store>, options: BusOptions) -> Arc<Self> {
        let agent_id = agent_id.into();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(Self {
            agent_id: agent_id.clone(),
            options,
            state: Mutex::new(BusState {
                cursor: 0,
                last_bookmark: None,
                timeline: VecDeque::new(),
                subscribers: Vec::new(),
                control_handlers: Vec::new(),
                monitor_handlers: Vec::new(),
                failed: VecDeque::new(),
            }),
            persist_tx,
            store: store.clone(),
        });
        tokio::spawn(persist_worker(
            Arc::downgrade(&bus),
            persist_rx,
            store,
            agent_id,
        ));
        bus
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    // ── Emit ──────────────────────────────────────────────────────────────────

    /// Emit on the event's default channel.
    pub fn emit(&self, kind: EventKind) -> EventEnvelope {
        let event = Event::from(kind);
        self.emit_event(event, true)
    }

    /// Emit on an explicit channel.
    pub fn emit_on(&self, channel: Channel, kind: EventKind) -> EventEnvelope {
        self.emit_event(Event::new(channel, kind), true)
    }

    /// Emit without scheduling persistence (used for `storage_failure`).
    fn emit_unpersisted(&self, kind: EventKind) -> EventEnvelope {
        self.emit_event(Event::from(kind), false)
    }

    fn emit_event(&self, event: Event, persist: bool) -> EventEnvelope {
        let (envelope, handlers) = {
            let mut state = self.state.lock().unwrap();
            let seq = state.cursor;
            state.cursor += 1;
            let bookmark = Bookmark::new(seq);
            state.last_bookmark = Some(bookmark);
            let envelope = EventEnvelope { cursor: state.cursor, bookmark, event };

            if state.timeline.len() == self.options.timeline_capacity {
                state.timeline.pop_front();
            }
            state.timeline.push_back(envelope.clone());

            // Fan out to live subscribers, pruning the dropped ones.
            state.subscribers.retain(|sub| match sub.queue.upgrade() {
                Some(queue) => {
                    if sub.opts.matches(&envelope) {
                        queue.push(envelope.clone());
                    }
                    true
                }
                None => false,
            });

            let handlers: Vec<Handler> = match envelope.channel() {
                Channel::Control => state.control_handlers.clone(),
                Channel::Monitor => state.monitor_handlers.clone(),
                Channel::Progress => Vec::new(),
            };
            (envelope, handlers)
        };

        // Inline handlers run outside the lock so they may emit themselves.
        // A panicking handler is logged and swallowed; it must never block
        // emission.
        for handler in handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&envelope)
            }));
            if result.is_err() {
                warn!(
                    agent = %self.agent_id,
                    event = envelope.event_type(),
                    "event handler panicked; continuing"
                );
            }
        }

        if persist {
            let _ = self.persist_tx.send(PersistMsg::Envelope(envelope.clone()));
        }
        envelope
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Register a synchronous handler for control-channel events, invoked
    /// inline after each emit in registration order.
    pub fn on_control(&self, handler: impl Fn(&EventEnvelope) + Send + Sync + 'static) {
        self.state.lock().unwrap().control_handlers.push(Arc::new(handler));
    }

    /// Register a synchronous handler for monitor-channel events.
    pub fn on_monitor(&self, handler: impl Fn(&EventEnvelope) + Send + Sync + 'static) {
        self.state.lock().unwrap().monitor_handlers.push(Arc::new(handler));
    }

    // ── Cursor / bookmark ─────────────────────────────────────────────────────

    /// The next seq to be assigned.  Strictly greater than the seq of every
    /// envelope emitted so far.
    pub fn cursor(&self) -> u64 {
        self.state.lock().unwrap().cursor
    }

    pub fn last_bookmark(&self) -> Option<Bookmark> {
        self.state.lock().unwrap().last_bookmark
    }

    /// Continue the seq sequence of a previous process after resume.
    pub fn seed_from_bookmark(&self, bookmark: Bookmark) {
        let mut state = self.state.lock().unwrap();
        state.cursor = bookmark.seq + 1;
        state.last_bookmark = Some(bookmark);
    }

    /// Most recent envelopes from the in-memory timeline (for history capture).
    pub fn recent_events(&self, limit: usize) -> Vec<EventEnvelope> {
        let state = self.state.lock().unwrap();
        let skip = state.timeline.len().saturating_sub(limit);
        state.timeline.iter().skip(skip).cloned().collect()
    }

    // ── Degraded mode ─────────────────────────────────────────────────────────

    pub fn failed_event_count(&self) -> usize {
        self.state.lock().unwrap().failed.len()
    }

    /// Attempt to drain the failed-event buffer now; returns how many
    /// envelopes reached the store.
    pub async fn flush_failed_events(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.persist_tx.send(PersistMsg::Flush(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn note_persist_failure(&self, envelope: EventEnvelope) {
        let event_type = envelope.event_type().to_string();
        let critical = envelope.event.payload.is_critical();
        let buffered_count = {
            let mut state = self.state.lock().unwrap();
            if critical {
                if state.failed.len() == self.options.failed_capacity {
                    state.failed.pop_front();
                }
                state.failed.push_back(envelope);
            }
            state.failed.len()
        };
        warn!(
            agent = %self.agent_id,
            event = %event_type,
            buffered = buffered_count,
            "event persistence failed; running degraded"
        );
        self.emit_unpersisted(EventKind::StorageFailure {
            severity: if critical { "critical".into() } else { "warning".into() },
            failed_event_type: event_type,
            buffered_count,
        });
    }

    // ── Subscribe ─────────────────────────────────────────────────────────────

    /// Attach a subscriber.
    ///
    /// With `since = None` only future events are delivered.  With a
    /// bookmark, the gap is replayed first — from the in-memory timeline
    /// when it reaches back far enough, otherwise from the store up to the
    /// timeline's earliest entry — and the live feed continues seamlessly.
    /// A per-subscription monotonic filter guarantees no duplicates and no
    /// out-of-order delivery.
    pub async fn subscribe(self: &Arc<Self>, opts: SubscribeOptions) -> EventStream {
        let queue = Arc::new(SubscriberQueue::new(self.options.subscriber_capacity));

        // Register under the lock so no live event can fall between replay
        // snapshot and live attachment.
        let (floor, timeline_replay, earliest_in_memory) = {
            let mut state = self.state.lock().unwrap();
            state.subscribers.push(Subscriber {
                opts: opts.clone(),
                queue: Arc::downgrade(&queue),
            });

            let earliest = state.timeline.front().map(|e| e.seq()).unwrap_or(state.cursor);
            match opts.since {
                None => {
                    // Live-only: suppress anything at or below the current tip.
                    let floor = state.cursor.checked_sub(1);
                    (floor, Vec::new(), earliest)
                }
                Some(since) => {
                    let replay: Vec<EventEnvelope> = state
                        .timeline
                        .iter()
                        .filter(|e| e.seq() > since.seq && opts.matches(e))
                        .cloned()
                        .collect();
                    (Some(since.seq), replay, earliest)
                }
            }
        };

        // Store replay is only needed when the bookmark predates the
        // in-memory window.
        let mut store_replay: Vec<EventEnvelope> = Vec::new();
        if let Some(since) = opts.since {
            if since.seq + 1 < earliest_in_memory {
                let hint = if opts.channels.len() == 1 {
                    Some(opts.channels[0])
                } else {
                    None
                };
                match self.store.read_events(&self.agent_id, hint, Some(since)).await {
                    Ok(mut events) => {
                        events.retain(|e| e.seq() < earliest_in_memory && opts.matches(e));
                        events.sort_by_key(|e| e.seq());
                        store_replay = events;
                    }
                    Err(e) => {
                        warn!(agent = %self.agent_id, error = %e, "store replay failed; continuing from memory");
                    }
                }
            }
        }

        let live = stream::unfold(queue, |queue| async move {
            let env = queue.pop().await;
            Some((env, queue))
        });

        let combined = stream::iter(store_replay)
            .chain(stream::iter(timeline_replay))
            .chain(live);

        // Monotonic floor: drop anything at or below the last yielded seq.
        let filtered = combined.scan(floor, |floor, env| {
            let pass = floor.map(|f| env.seq() > f).unwrap_or(true);
            if pass {
                *floor = Some(env.seq());
            }
            futures::future::ready(Some((pass, env)))
        });
        Box::pin(filtered.filter_map(|(pass, env)| async move { pass.then_some(env) }))
    }
}

/// Single-writer persistence worker: keeps store appends in seq order and
/// owns the degraded-mode retry cycle.
async fn persist_worker(
    bus: Weak<EventBus>,
    mut rx: mpsc::UnboundedReceiver<PersistMsg>,
    store: Arc<dyn Store>,
    agent_id: String,
) {
    while let Some(msg) = rx.recv().await {
        let Some(bus) = bus.upgrade() else { break };
        match msg {
            PersistMsg::Envelope(env) => {
                match store.append_event(&agent_id, &env).await {
                    Ok(()) => {
                        // Success ends degraded mode: drain buffered criticals.
                        drain_failed(&bus, &store, &agent_id).await;
                    }
                    Err(_) => bus.note_persist_failure(env),
                }
            }
            PersistMsg::Flush(reply) => {
                let n = drain_failed(&bus, &store, &agent_id).await;
                let _ = reply.send(n);
            }
        }
    }
}

/// FIFO drain of the failed buffer.  A retry failure reinserts the envelope
/// at the head so order is preserved for the next attempt.
async fn drain_failed(bus: &Arc<EventBus>, store: &Arc<dyn Store>, agent_id: &str) -> usize {
    let mut drained = 0;
    loop {
        let next = bus.state.lock().unwrap().failed.pop_front();
        let Some(env) = next else { break };
        match store.append_event(agent_id, &env).await {
            Ok(()) => drained += 1,
            Err(_) => {
                bus.state.lock().unwrap().failed.push_front(env);
                break;
            }
        }
    }
    drained
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use skein_store::MemoryStore;

    use super::*;

    fn text(delta: &str) -> EventKind {
        EventKind::TextChunk { delta: delta.into() }
    }

    fn done() -> EventKind {
        EventKind::Done { step: 0, reason: "end_turn".into() }
    }

    async fn bus_with_store() -> (Arc<MemoryStore>, Arc<EventBus>) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new("a1", store.clone(), BusOptions::default());
        (store, bus)
    }

    /// Wait until the background worker has drained everything it was sent.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    // ── Seq / cursor ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn seq_is_strictly_monotonic() {
        let (_s, bus) = bus_with_store().await;
        let seqs: Vec<u64> = (0..10).map(|i| bus.emit(text(&i.to_string())).seq()).collect();
        for pair in seqs.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[tokio::test]
    async fn cursor_exceeds_every_emitted_seq() {
        let (_s, bus) = bus_with_store().await;
        for i in 0..5 {
            let env = bus.emit(text(&i.to_string()));
            assert!(bus.cursor() > env.seq());
            assert_eq!(env.cursor, env.seq() + 1);
        }
    }

    #[tokio::test]
    async fn seed_from_bookmark_continues_sequence() {
        let (_s, bus) = bus_with_store().await;
        bus.seed_from_bookmark(Bookmark::new(41));
        let env = bus.emit(done());
        assert_eq!(env.seq(), 42);
        assert_eq!(bus.last_bookmark().unwrap().seq, 42);
    }

    // ── Subscribe: live + replay ──────────────────────────────────────────────

    #[tokio::test]
    async fn live_subscriber_sees_future_events_only() {
        let (_s, bus) = bus_with_store().await;
        bus.emit(text("before"));
        let mut stream = bus.subscribe(SubscribeOptions::default()).await;
        bus.emit(text("after"));
        let env = stream.next().await.unwrap();
        match env.event.payload.kind().unwrap() {
            EventKind::TextChunk { delta } => assert_eq!(delta, "after"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replay_from_timeline_then_live() {
        let (_s, bus) = bus_with_store().await;
        let first = bus.emit(text("one"));
        bus.emit(text("two"));
        let mut stream = bus
            .subscribe(SubscribeOptions::default().since(first.bookmark))
            .await;
        bus.emit(text("three"));
        let got: Vec<String> = vec![
            stream.next().await.unwrap(),
            stream.next().await.unwrap(),
        ]
        .iter()
        .map(|e| e.seq().to_string())
        .collect();
        assert_eq!(got, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn replay_from_store_when_timeline_evicted() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(
            "a1",
            store.clone(),
            BusOptions { timeline_capacity: 4, ..Default::default() },
        );
        for i in 0..10 {
            bus.emit(text(&i.to_string()));
        }
        settle().await; // everything persisted
        // Bookmark before the in-memory window (timeline holds seqs 6..=9).
        let mut stream = bus
            .subscribe(SubscribeOptions::channel(Channel::Progress).since(Bookmark::new(1)))
            .await;
        let mut seqs = Vec::new();
        for _ in 0..8 {
            seqs.push(stream.next().await.unwrap().seq());
        }
        assert_eq!(seqs, (2..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn subscriber_at_last_bookmark_sees_nothing_replayed() {
        let (_s, bus) = bus_with_store().await;
        for i in 0..5 {
            bus.emit(text(&i.to_string()));
        }
        let last = bus.last_bookmark().unwrap();
        let mut stream = bus.subscribe(SubscribeOptions::default().since(last)).await;
        // Replay must be empty; the next thing delivered is a live event.
        bus.emit(done());
        let env = stream.next().await.unwrap();
        assert_eq!(env.event_type(), "done");
    }

    #[tokio::test]
    async fn no_duplicates_across_replay_live_boundary() {
        let (_s, bus) = bus_with_store().await;
        let first = bus.emit(text("a"));
        // Subscribe (registers live) while more events race in.
        let mut stream = bus
            .subscribe(SubscribeOptions::default().since(first.bookmark))
            .await;
        bus.emit(text("b"));
        bus.emit(text("c"));
        let mut seqs = Vec::new();
        for _ in 0..2 {
            seqs.push(stream.next().await.unwrap().seq());
        }
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn channel_filter_applies() {
        let (_s, bus) = bus_with_store().await;
        let mut stream = bus.subscribe(SubscribeOptions::channel(Channel::Monitor)).await;
        bus.emit(text("progress event"));
        bus.emit(EventKind::TokenUsage { input: 1, output: 2, total: 3 });
        let env = stream.next().await.unwrap();
        assert_eq!(env.event_type(), "token_usage");
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let (_s, bus) = bus_with_store().await;
        let mut stream = bus
            .subscribe(SubscribeOptions {
                channels: Channel::ALL.to_vec(),
                since: None,
                kinds: Some(vec!["done".into()]),
            })
            .await;
        bus.emit(text("x"));
        bus.emit(done());
        let env = stream.next().await.unwrap();
        assert_eq!(env.event_type(), "done");
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_not_emitter() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(
            "a1",
            store,
            BusOptions { subscriber_capacity: 3, ..Default::default() },
        );
        let mut stream = bus.subscribe(SubscribeOptions::default()).await;
        for i in 0..10 {
            bus.emit(text(&i.to_string()));
        }
        // Only the newest 3 survive; first delivered is seq 7.
        let env = stream.next().await.unwrap();
        assert_eq!(env.seq(), 7);
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn control_handlers_fire_in_registration_order() {
        let (_s, bus) = bus_with_store().await;
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            bus.on_control(move |_| order.lock().unwrap().push(tag));
        }
        bus.emit(EventKind::PermissionDecided {
            call_id: "c1".into(),
            decision: "approve".into(),
            decided_by: None,
            note: None,
        });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn panicking_handler_is_swallowed() {
        let (_s, bus) = bus_with_store().await;
        let hits = Arc::new(AtomicUsize::new(0));
        bus.on_monitor(|_| panic!("boom"));
        let hits2 = hits.clone();
        bus.on_monitor(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(EventKind::TokenUsage { input: 0, output: 0, total: 0 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_only_fire_for_their_channel() {
        let (_s, bus) = bus_with_store().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        bus.on_control(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(text("progress only"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    // ── Degraded mode ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_critical_events_are_buffered_and_counted() {
        let (store, bus) = bus_with_store().await;
        store.fail_event_appends(true);
        bus.emit(done());
        settle().await;
        assert_eq!(bus.failed_event_count(), 1);
    }

    #[tokio::test]
    async fn failed_noncritical_events_are_not_buffered() {
        let (store, bus) = bus_with_store().await;
        store.fail_event_appends(true);
        bus.emit(text("chunk"));
        settle().await;
        assert_eq!(bus.failed_event_count(), 0);
    }

    #[tokio::test]
    async fn storage_failure_event_is_broadcast_but_not_persisted() {
        let (store, bus) = bus_with_store().await;
        let mut stream = bus
            .subscribe(SubscribeOptions {
                channels: vec![Channel::Monitor],
                since: None,
                kinds: Some(vec!["storage_failure".into()]),
            })
            .await;
        store.fail_event_appends(true);
        bus.emit(done());
        let env = stream.next().await.unwrap();
        match env.event.payload.kind().unwrap() {
            EventKind::StorageFailure { failed_event_type, buffered_count, .. } => {
                assert_eq!(failed_event_type, "done");
                assert_eq!(*buffered_count, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // Nothing about the failure reaches the store even after recovery.
        store.fail_event_appends(false);
        bus.flush_failed_events().await;
        let persisted = store.read_events("a1", Some(Channel::Monitor), None).await.unwrap();
        assert!(persisted.iter().all(|e| e.event_type() != "storage_failure"));
    }

    #[tokio::test]
    async fn next_successful_persist_drains_buffer_in_order() {
        let (store, bus) = bus_with_store().await;
        store.fail_event_appends(true);
        bus.emit(done());
        bus.emit(EventKind::Error { message: "m".into(), source: None });
        settle().await;
        assert_eq!(bus.failed_event_count(), 2);

        store.fail_event_appends(false);
        // Any successful persist triggers the drain.
        bus.emit(done());
        settle().await;
        assert_eq!(bus.failed_event_count(), 0);
        let events = store.read_events("a1", Some(Channel::Progress), None).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq()).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted, "drained events must preserve seq order");
    }

    #[tokio::test]
    async fn flush_failed_events_drains_on_demand() {
        let (store, bus) = bus_with_store().await;
        store.fail_event_appends(true);
        bus.emit(done());
        settle().await;
        assert_eq!(bus.failed_event_count(), 1);
        store.fail_event_appends(false);
        let n = bus.flush_failed_events().await;
        assert_eq!(n, 1);
        assert_eq!(bus.failed_event_count(), 0);
    }
}
