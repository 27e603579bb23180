//! Session output multiplexer.
//!
//! This module fans out each session event to every attached subscriber.
//! Every subscriber owns a bounded queue; publishing never waits on a
//! consumer. A subscriber whose queue is full when a new event arrives is
//! dropped, so one slow consumer can never stall the PTY read loop or cost
//! other subscribers any events.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use protocol::{SessionId, SessionState, TerminalSize};
use tokio::sync::mpsc;

/// Opaque handle identifying one subscriber of one session.
pub type SubscriberId = u64;

/// Event delivered to subscribers, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of PTY output.
    Output(Bytes),
    /// The terminal was resized.
    Resized(TerminalSize),
    /// The session moved to a new lifecycle state.
    StateChanged {
        state: SessionState,
        exit_code: Option<i32>,
    },
}

/// Statistics about a subscriber's delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Events queued successfully.
    pub events_sent: u64,
}

/// Outcome of one [`OutputBroadcaster::publish`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the event.
    pub delivered: usize,
    /// Subscribers removed because their queue was full.
    pub dropped: Vec<SubscriberId>,
}

/// Receiving side of a subscription.
///
/// Dropping it unsubscribes implicitly; the broadcaster notices on the
/// next publish.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    session_id: SessionId,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    /// Returns the subscriber handle.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns the session this subscription belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscriber has been removed (unsubscribed,
    /// dropped for falling behind, or the session was closed) and every
    /// queued event has been received.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    tx: mpsc::Sender<SessionEvent>,
    events_sent: AtomicU64,
}

/// Broadcasts events of one session to its subscribers.
pub struct OutputBroadcaster {
    session_id: SessionId,
    queue_depth: usize,
    subscribers: DashMap<SubscriberId, Subscriber>,
    next_id: AtomicU64,
}

impl OutputBroadcaster {
    /// Creates a broadcaster whose subscribers hold `queue_depth` events.
    pub fn new(session_id: SessionId, queue_depth: usize) -> Self {
        Self {
            session_id,
            queue_depth: queue_depth.max(1),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a subscriber receiving events published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.queue_depth)
    }

    /// Registers a subscriber with a specific queue depth.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                events_sent: AtomicU64::new(0),
            },
        );

        tracing::debug!(
            session_id = %self.session_id,
            subscriber_id = id,
            "Subscriber attached"
        );

        Subscription {
            id,
            session_id: self.session_id,
            rx,
        }
    }

    /// Removes a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::debug!(
                session_id = %self.session_id,
                subscriber_id = id,
                "Subscriber detached"
            );
        }
        removed
    }

    /// Returns the number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns statistics for a specific subscriber.
    pub fn stats(&self, id: SubscriberId) -> Option<SubscriberStats> {
        self.subscribers.get(&id).map(|s| SubscriberStats {
            events_sent: s.events_sent.load(Ordering::Relaxed),
        })
    }

    /// Delivers `event` to every subscriber without waiting.
    ///
    /// Subscribers with a full queue are dropped; subscribers whose
    /// receiver is gone are removed silently.
    pub fn publish(&self, event: SessionEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let mut disconnected = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    subscriber.events_sent.fetch_add(1, Ordering::Relaxed);
                    report.delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    report.dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    disconnected.push(*entry.key());
                }
            }
        }

        for id in &report.dropped {
            self.subscribers.remove(id);
            tracing::warn!(
                session_id = %self.session_id,
                subscriber_id = id,
                "Subscriber fell behind, dropping it"
            );
        }

        for id in disconnected {
            self.subscribers.remove(&id);
            tracing::debug!(
                session_id = %self.session_id,
                subscriber_id = id,
                "Removed disconnected subscriber"
            );
        }

        report
    }

    /// Removes every subscriber, ending their streams.
    pub fn close(&self) {
        self.subscribers.clear();
    }
}
