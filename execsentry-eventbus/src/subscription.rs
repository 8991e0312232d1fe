//! Subscription handles and their bounded inbound queues.
//!
//! Each subscription owns one queue with a fixed capacity. The bus is the
//! only writer and the [`Subscription`] is the only reader. When the queue is
//! full the oldest pending event is evicted to make room, so publishing
//! never waits on a slow reader.

use execsentry_lib::models::ProcessEvent;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bus::BusShared;

/// Identifier assigned by the bus to each subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw identifier value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Per-subscription counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Events accepted into the queue
    pub enqueued: u64,
    /// Events handed to the reader
    pub received: u64,
    /// Events evicted because the queue was full
    pub dropped: u64,
    /// Events currently pending
    pub depth: usize,
    /// Fixed queue capacity
    pub capacity: usize,
}

/// Non-blocking receive failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    #[error("Subscription queue is empty")]
    Empty,

    #[error("Subscription is closed")]
    Closed,
}

/// Result of offering one event to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Event queued, nothing evicted
    Queued,
    /// Event queued after evicting the oldest pending event
    QueuedEvicting,
    /// Queue already closed; event not queued
    Closed,
}

enum Pop {
    Event(Arc<ProcessEvent>),
    Empty,
    Closed,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<Arc<ProcessEvent>>,
    closed: bool,
    saturated: bool,
}

/// Bounded drop-oldest queue shared between the bus and one subscription.
pub(crate) struct SubscriberQueue {
    id: SubscriptionId,
    name: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    enqueued: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    pub(crate) fn new(id: SubscriptionId, name: String, capacity: usize) -> Self {
        Self {
            id,
            name,
            capacity,
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Queue an event, evicting the oldest pending one if full.
    pub(crate) fn push(&self, event: Arc<ProcessEvent>) -> PushOutcome {
        let (outcome, newly_saturated) = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }

            let mut outcome = PushOutcome::Queued;
            let mut newly_saturated = false;
            if state.events.len() >= self.capacity {
                state.events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                outcome = PushOutcome::QueuedEvicting;
                newly_saturated = !state.saturated;
                state.saturated = true;
            }

            state.events.push_back(event);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
            (outcome, newly_saturated)
        };

        if newly_saturated {
            warn!(
                subscription_id = %self.id,
                subscriber = %self.name,
                capacity = self.capacity,
                "Subscriber queue full, dropping oldest events"
            );
        }

        self.notify.notify_one();
        outcome
    }

    fn pop(&self) -> Pop {
        let (pop, recovered) = {
            let mut state = self.lock();
            if state.closed {
                return Pop::Closed;
            }

            match state.events.pop_front() {
                Some(event) => {
                    let recovered = state.saturated && state.events.is_empty();
                    if recovered {
                        state.saturated = false;
                    }
                    (Pop::Event(event), recovered)
                }
                None => (Pop::Empty, false),
            }
        };

        if let Pop::Event(_) = pop {
            self.received.fetch_add(1, Ordering::Relaxed);
        }

        if recovered {
            info!(
                subscription_id = %self.id,
                subscriber = %self.name,
                dropped_total = self.dropped.load(Ordering::Relaxed),
                "Subscriber queue drained after saturation"
            );
        }

        pop
    }

    /// Close the queue, discard pending events and wake the reader.
    ///
    /// Returns the number of events discarded. Closing twice discards nothing
    /// the second time.
    pub(crate) fn close(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            let discarded = state.events.len();
            state.events.clear();
            discarded
        };

        debug!(
            subscription_id = %self.id,
            subscriber = %self.name,
            discarded,
            "Subscriber queue closed"
        );

        // Stores a permit if the reader is not parked yet.
        self.notify.notify_one();
        discarded
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub(crate) fn stats(&self) -> SubscriptionStats {
        let depth = self.lock().events.len();
        SubscriptionStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            depth,
            capacity: self.capacity,
        }
    }
}

/// One reader's attachment to the bus.
///
/// Events arrive in publish order. Dropping the handle unsubscribes it.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusShared>,
}

impl Subscription {
    pub(crate) fn new(queue: Arc<SubscriberQueue>, bus: Weak<BusShared>) -> Self {
        Self { queue, bus }
    }

    /// Identifier assigned by the bus.
    pub fn id(&self) -> SubscriptionId {
        self.queue.id
    }

    /// Name given at subscribe time.
    pub fn name(&self) -> &str {
        &self.queue.name
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription has been closed by unsubscribe
    /// or bus shutdown. Events still pending at that moment are discarded,
    /// not returned. Cancel safe: dropping the future never loses an event.
    pub async fn recv(&self) -> Option<Arc<ProcessEvent>> {
        loop {
            match self.queue.pop() {
                Pop::Event(event) => return Some(event),
                Pop::Closed => return None,
                Pop::Empty => self.queue.notify.notified().await,
            }
        }
    }

    /// Take the next event without waiting.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] if nothing is pending, [`TryRecvError::Closed`]
    /// once the subscription has been closed.
    pub fn try_recv(&self) -> Result<Arc<ProcessEvent>, TryRecvError> {
        match self.queue.pop() {
            Pop::Event(event) => Ok(event),
            Pop::Empty => Err(TryRecvError::Empty),
            Pop::Closed => Err(TryRecvError::Closed),
        }
    }

    /// Current queue counters.
    pub fn stats(&self) -> SubscriptionStats {
        self.queue.stats()
    }

    /// True once the subscription has been closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.queue.id)
            .field("name", &self.queue.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.queue.id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn event(n: usize) -> Arc<ProcessEvent> {
        Arc::new(ProcessEvent::new("rm", [format!("/tmp/{n}")]))
    }

    fn queue(capacity: usize) -> Arc<SubscriberQueue> {
        Arc::new(SubscriberQueue::new(
            SubscriptionId::new(1),
            "test".to_owned(),
            capacity,
        ))
    }

    #[test]
    fn test_push_evicts_oldest_when_full() {
        let q = queue(2);
        assert_eq!(q.push(event(1)), PushOutcome::Queued);
        assert_eq!(q.push(event(2)), PushOutcome::Queued);
        assert_eq!(q.push(event(3)), PushOutcome::QueuedEvicting);

        let sub = Subscription::new(Arc::clone(&q), Weak::new());
        assert_eq!(sub.try_recv().expect("pending").args[0], "/tmp/2");
        assert_eq!(sub.try_recv().expect("pending").args[0], "/tmp/3");
        assert_eq!(sub.try_recv(), Err(TryRecvError::Empty));

        let stats = sub.stats();
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.capacity, 2);
    }

    #[test]
    fn test_close_discards_and_rejects() {
        let q = queue(4);
        q.push(event(1));
        q.push(event(2));
        assert_eq!(q.close(), 2);
        assert_eq!(q.close(), 0);
        assert_eq!(q.push(event(3)), PushOutcome::Closed);

        let sub = Subscription::new(q, Weak::new());
        assert!(sub.is_closed());
        assert_eq!(sub.try_recv(), Err(TryRecvError::Closed));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let q = queue(4);
        let sub = Subscription::new(Arc::clone(&q), Weak::new());

        let reader = tokio::spawn(async move { sub.recv().await.map(|e| e.args[0].clone()) });
        tokio::task::yield_now().await;
        q.push(event(7));

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), reader)
            .await
            .expect("reader woke")
            .expect("task joined");
        assert_eq!(got.as_deref(), Some("/tmp/7"));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_close() {
        let q = queue(4);
        let sub = Subscription::new(Arc::clone(&q), Weak::new());

        let reader = tokio::spawn(async move { sub.recv().await });
        tokio::task::yield_now().await;
        q.close();

        let got = tokio::time::timeout(std::time::Duration::from_secs(5), reader)
            .await
            .expect("reader woke")
            .expect("task joined");
        assert!(got.is_none());
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId::new(12).to_string(), "sub-12");
        assert_eq!(SubscriptionId::new(12).raw(), 12);
    }
}
