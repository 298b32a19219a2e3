//! Live Monitor Bus (C4): per-session multi-subscriber fan-out with a replayable header buffer
//! and slow-consumer drop.
//!
//! Generalizes the teacher's `Registry = Arc<DashMap<SessionId, SessionContext>>` +
//! `broadcast::Sender<Bytes>` shape. A `tokio::sync::broadcast` channel was not reused because a
//! lagging `broadcast` receiver drops the *oldest* shared history for every subscriber; spec
//! §4.4 requires dropping only the *slow subscriber's own* newest message, leaving everyone else
//! untouched. That needs one bounded `mpsc` per subscriber.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Capacity of each subscriber's bounded queue.
pub const SUBSCRIBER_CAPACITY: usize = 100;

/// Receive end handed back by [`MonitorBus::subscribe`]. Dropping it without calling
/// [`MonitorBus::unsubscribe`] leaks the sender-side slot until the next broadcast notices the
/// channel is closed — callers MUST unsubscribe explicitly (spec §5).
pub type SubscriberId = u64;

struct SessionState {
    header: Option<Bytes>,
    subscribers: Vec<(SubscriberId, mpsc::Sender<Bytes>)>,
    next_subscriber_id: SubscriberId,
    /// Forwards bytes into the active proxy's own recording file (spec §6: observer banners must
    /// land in the replay file, not just the live bus). Only the owning SSH/RDP proxy task holds
    /// the recorder itself, so this channel is how `broadcast_and_record` reaches it.
    recorder_sink: Option<mpsc::UnboundedSender<Bytes>>,
}

impl SessionState {
    fn new() -> Self {
        Self { header: None, subscribers: Vec::new(), next_subscriber_id: 0, recorder_sink: None }
    }
}

/// Process-wide singleton mapping session id to (header buffer, subscriber list). All operations
/// are internally synchronized; `broadcast` never blocks on a subscriber.
#[derive(Clone, Default)]
pub struct MonitorBus {
    sessions: Arc<DashMap<Uuid, Arc<RwLock<SessionState>>>>,
}

impl MonitorBus {
    pub fn new() -> Self {
        Self { sessions: Arc::new(DashMap::new()) }
    }

    fn entry(&self, session_id: Uuid) -> Arc<RwLock<SessionState>> {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| Arc::new(RwLock::new(SessionState::new())))
            .clone()
    }

    /// Allocate a bounded subscriber queue and register it. If a header buffer is set, it is
    /// enqueued as the first message before returning.
    pub async fn subscribe(&self, session_id: Uuid) -> (SubscriberId, mpsc::Receiver<Bytes>) {
        let state = self.entry(session_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut guard = state.write().await;
        if let Some(header) = guard.header.clone() {
            // The header is replayed synchronously on subscribe, before any live broadcast can
            // reach this subscriber (the write lock is held the whole time), so ordering holds.
            let _ = tx.try_send(header);
        }
        let id = guard.next_subscriber_id;
        guard.next_subscriber_id += 1;
        guard.subscribers.push((id, tx));
        (id, rx)
    }

    /// Remove and close a subscriber's channel. Drops the session entry entirely once its last
    /// subscriber is gone.
    pub async fn unsubscribe(&self, session_id: Uuid, subscriber_id: SubscriberId) {
        let Some(state) = self.sessions.get(&session_id).map(|e| e.clone()) else { return };
        let mut guard = state.write().await;
        guard.subscribers.retain(|(id, _)| *id != subscriber_id);
        let empty = guard.subscribers.is_empty();
        drop(guard);
        if empty {
            self.sessions.remove(&session_id);
        }
    }

    /// Store bytes as the replay prefix for late subscribers, overwriting any prior header.
    pub async fn set_header(&self, session_id: Uuid, bytes: Bytes) {
        let state = self.entry(session_id);
        state.write().await.header = Some(bytes);
    }

    /// Register the channel the owning SSH/RDP proxy reads to fold bytes into its recording file.
    /// Called once, when the proxy opens its recorder.
    pub async fn set_recorder_sink(&self, session_id: Uuid, sink: mpsc::UnboundedSender<Bytes>) {
        let state = self.entry(session_id);
        state.write().await.recorder_sink = Some(sink);
    }

    /// Non-blocking enqueue to every current subscriber. If a subscriber's queue is full, the
    /// message is dropped for that subscriber only.
    pub async fn broadcast(&self, session_id: Uuid, bytes: Bytes) {
        let Some(state) = self.sessions.get(&session_id).map(|e| e.clone()) else { return };
        let guard = state.read().await;
        for (_, tx) in &guard.subscribers {
            // try_send never awaits: a full queue drops this message for this subscriber only,
            // and a closed channel (subscriber gone but not yet unsubscribed) is likewise ignored.
            let _ = tx.try_send(bytes.clone());
        }
    }

    /// Like [`broadcast`](Self::broadcast), and also forwards to the session's recorder sink, if
    /// one is registered, so the bytes land in the replay file too (spec §6 banners).
    pub async fn broadcast_and_record(&self, session_id: Uuid, bytes: Bytes) {
        let Some(state) = self.sessions.get(&session_id).map(|e| e.clone()) else { return };
        let guard = state.read().await;
        if let Some(sink) = &guard.recorder_sink {
            let _ = sink.send(bytes.clone());
        }
        for (_, tx) in &guard.subscribers {
            let _ = tx.try_send(bytes.clone());
        }
    }

    /// Whether a session currently has a header/subscriber entry at all. Used by tests and by
    /// the monitor handler to decide whether to announce "observable".
    pub fn has_session(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_gets_header_then_new_broadcasts_only() {
        let bus = MonitorBus::new();
        let session_id = Uuid::new_v4();
        bus.set_header(session_id, Bytes::from_static(b"HEADER")).await;

        bus.broadcast(session_id, Bytes::from_static(b"before")).await;

        let (id, mut rx) = bus.subscribe(session_id).await;
        bus.broadcast(session_id, Bytes::from_static(b"after")).await;

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"HEADER"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"after"));

        bus.unsubscribe(session_id, id).await;
        assert!(!bus.has_session(session_id));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_do_not_affect_others() {
        let bus = MonitorBus::new();
        let session_id = Uuid::new_v4();
        let (slow_id, mut slow_rx) = bus.subscribe(session_id).await;
        let (fast_id, mut fast_rx) = bus.subscribe(session_id).await;

        for i in 0..(SUBSCRIBER_CAPACITY * 2) {
            bus.broadcast(session_id, Bytes::from(format!("msg-{i}"))).await;
        }

        // Fast subscriber drains promptly: receives up to capacity before we drained above, but
        // since both queues fill identically here, assert both are bounded, and draining one
        // does not disturb the other's queued contents.
        let mut fast_count = 0;
        while fast_rx.try_recv().is_ok() {
            fast_count += 1;
        }
        assert!(fast_count <= SUBSCRIBER_CAPACITY);

        let mut slow_count = 0;
        while slow_rx.try_recv().is_ok() {
            slow_count += 1;
        }
        assert!(slow_count <= SUBSCRIBER_CAPACITY);

        bus.unsubscribe(session_id, slow_id).await;
        bus.unsubscribe(session_id, fast_id).await;
    }

    #[tokio::test]
    async fn double_subscribe_gives_independent_queues() {
        let bus = MonitorBus::new();
        let session_id = Uuid::new_v4();
        bus.set_header(session_id, Bytes::from_static(b"H")).await;

        let (id1, mut rx1) = bus.subscribe(session_id).await;
        let (id2, mut rx2) = bus.subscribe(session_id).await;
        bus.broadcast(session_id, Bytes::from_static(b"X")).await;

        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"H"));
        assert_eq!(rx1.recv().await.unwrap(), Bytes::from_static(b"X"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"H"));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from_static(b"X"));

        bus.unsubscribe(session_id, id1).await;
        bus.unsubscribe(session_id, id2).await;
    }

    #[tokio::test]
    async fn broadcast_and_record_reaches_both_the_recorder_sink_and_subscribers() {
        let bus = MonitorBus::new();
        let session_id = Uuid::new_v4();
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        bus.set_recorder_sink(session_id, sink_tx).await;
        let (sub_id, mut sub_rx) = bus.subscribe(session_id).await;

        bus.broadcast_and_record(session_id, Bytes::from_static(b"banner")).await;

        assert_eq!(sink_rx.recv().await.unwrap(), Bytes::from_static(b"banner"));
        assert_eq!(sub_rx.recv().await.unwrap(), Bytes::from_static(b"banner"));

        bus.unsubscribe(session_id, sub_id).await;
    }
}
