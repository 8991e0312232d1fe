//! In-process fan-out event bus.
//!
//! The bus keeps one bounded queue per subscription and copies a shared
//! reference to every published event into each of them. The subscriber map
//! sits behind a read/write lock: `publish` only ever takes the read side,
//! while `subscribe`, `unsubscribe` and `shutdown` take the write side.

use execsentry_lib::models::ProcessEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{EventBusError, Result};
use crate::subscription::{
    PushOutcome, SubscriberQueue, Subscription, SubscriptionId, SubscriptionStats,
};

/// Event bus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Capacity of each subscription queue
    pub queue_capacity: usize,
    /// Maximum number of concurrent subscriptions
    pub max_subscribers: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            max_subscribers: 1024,
        }
    }
}

impl BusConfig {
    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Both limits must be greater than zero.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(EventBusError::configuration(
                "queue_capacity must be greater than 0",
            ));
        }
        if self.max_subscribers == 0 {
            return Err(EventBusError::configuration(
                "max_subscribers must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Per-publish delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Subscriptions the event was queued on
    pub delivered: usize,
    /// Older events evicted to make room for this one
    pub dropped: usize,
}

/// Bus-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStatistics {
    /// Events accepted by `publish`
    pub events_published: u64,
    /// Queue insertions across all subscriptions
    pub events_delivered: u64,
    /// Events evicted by the drop-oldest policy
    pub events_dropped: u64,
    /// Pending events discarded when a queue was closed
    pub events_discarded: u64,
    /// Currently registered subscriptions
    pub active_subscribers: usize,
    /// Time since the bus was created
    pub uptime: Duration,
}

/// Summary of one registered subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: SubscriptionId,
    pub name: String,
    pub stats: SubscriptionStats,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
}

/// State shared by every clone of an [`EventBus`] and referenced weakly by
/// each [`Subscription`].
pub(crate) struct BusShared {
    config: BusConfig,
    subscribers: RwLock<HashMap<SubscriptionId, Arc<SubscriberQueue>>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
    start_time: Instant,
}

impl BusShared {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionId, Arc<SubscriberQueue>>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionId, Arc<SubscriberQueue>>> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove and close one subscription. Idempotent.
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let removed = self.write().remove(&id);
        match removed {
            Some(queue) => {
                let discarded = queue.close();
                self.counters
                    .discarded
                    .fetch_add(discarded as u64, Ordering::Relaxed);
                debug!(
                    subscription_id = %id,
                    subscriber = %queue.name(),
                    discarded,
                    "Subscriber removed"
                );
                true
            }
            None => false,
        }
    }
}

/// Cloneable handle to a shared event bus.
///
/// # Examples
///
/// ```
/// use execsentry_eventbus::EventBus;
/// use execsentry_lib::models::ProcessEvent;
///
/// let bus = EventBus::new();
/// let sub = bus.subscribe("docs").expect("bus open");
/// bus.publish(ProcessEvent::new("rm", ["/var/log/secure"])).expect("bus open");
/// assert_eq!(sub.try_recv().expect("queued").command, "rm");
/// ```
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default configuration.
    pub fn new() -> Self {
        Self::from_validated(BusConfig::default())
    }

    /// Create a bus with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Configuration`] if either limit is zero.
    pub fn with_config(config: BusConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                config,
                subscribers: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
                start_time: Instant::now(),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> BusConfig {
        self.shared.config
    }

    /// Deliver an event to every current subscription.
    ///
    /// Never waits on a reader: a full queue evicts its oldest pending event.
    /// Subscriptions created afterwards never see this event.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Closed`] once shutdown has begun.
    pub fn publish(&self, event: ProcessEvent) -> Result<PublishReceipt> {
        if self.is_closed() {
            return Err(EventBusError::Closed);
        }

        let event = Arc::new(event);
        let mut receipt = PublishReceipt::default();
        {
            let subscribers = self.shared.read();
            // Shutdown flips the flag before draining under the write lock.
            if self.is_closed() {
                return Err(EventBusError::Closed);
            }

            for queue in subscribers.values() {
                match queue.push(Arc::clone(&event)) {
                    PushOutcome::Queued => receipt.delivered += 1,
                    PushOutcome::QueuedEvicting => {
                        receipt.delivered += 1;
                        receipt.dropped += 1;
                    }
                    PushOutcome::Closed => {}
                }
            }
        }

        let counters = &self.shared.counters;
        counters.published.fetch_add(1, Ordering::Relaxed);
        counters
            .delivered
            .fetch_add(receipt.delivered as u64, Ordering::Relaxed);
        counters
            .dropped
            .fetch_add(receipt.dropped as u64, Ordering::Relaxed);

        Ok(receipt)
    }

    /// Register a new subscription.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Closed`] after shutdown, or
    /// [`EventBusError::SubscriberLimit`] when the bus is full.
    pub fn subscribe(&self, name: impl Into<String>) -> Result<Subscription> {
        let name = name.into();
        if self.is_closed() {
            return Err(EventBusError::Closed);
        }

        let queue = {
            let mut subscribers = self.shared.write();
            if self.is_closed() {
                return Err(EventBusError::Closed);
            }

            let limit = self.shared.config.max_subscribers;
            if subscribers.len() >= limit {
                return Err(EventBusError::SubscriberLimit { limit });
            }

            let id = SubscriptionId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
            let queue = Arc::new(SubscriberQueue::new(
                id,
                name,
                self.shared.config.queue_capacity,
            ));
            subscribers.insert(id, Arc::clone(&queue));
            queue
        };

        let subscription = Subscription::new(queue, Arc::downgrade(&self.shared));
        debug!(
            subscription_id = %subscription.id(),
            subscriber = %subscription.name(),
            capacity = self.shared.config.queue_capacity,
            "Subscriber registered"
        );
        Ok(subscription)
    }

    /// Remove a subscription and wake its reader.
    ///
    /// Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.remove(id)
    }

    /// Close the bus.
    ///
    /// Every queue is closed, pending events are discarded and every reader
    /// is woken. Returns `true` only for the call that initiated shutdown.
    pub fn shutdown(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!("Event bus shutdown already initiated");
            return false;
        }

        let queues: Vec<Arc<SubscriberQueue>> =
            self.shared.write().drain().map(|(_, queue)| queue).collect();

        let discarded: usize = queues.iter().map(|queue| queue.close()).sum();
        self.shared
            .counters
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);

        info!(
            subscribers = queues.len(),
            discarded,
            events_published = self.shared.counters.published.load(Ordering::Relaxed),
            "Event bus shut down"
        );
        true
    }

    /// True once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.read().len()
    }

    /// Registered subscriptions ordered by id.
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut infos: Vec<SubscriberInfo> = self
            .shared
            .read()
            .iter()
            .map(|(id, queue)| SubscriberInfo {
                id: *id,
                name: queue.name().to_owned(),
                stats: queue.stats(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Bus-wide counters.
    pub fn statistics(&self) -> EventBusStatistics {
        let counters = &self.shared.counters;
        EventBusStatistics {
            events_published: counters.published.load(Ordering::Relaxed),
            events_delivered: counters.delivered.load(Ordering::Relaxed),
            events_dropped: counters.dropped.load(Ordering::Relaxed),
            events_discarded: counters.discarded.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
            uptime: self.shared.start_time.elapsed(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.shared.config)
            .field("closed", &self.is_closed())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(tag: &str) -> ProcessEvent {
        ProcessEvent::new("rm", [tag])
    }

    #[test]
    fn test_config_validation() {
        assert!(BusConfig::default().validate().is_ok());
        let zero = BusConfig {
            queue_capacity: 0,
            ..BusConfig::default()
        };
        assert!(matches!(
            EventBus::with_config(zero),
            Err(EventBusError::Configuration(_))
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let receipt = bus.publish(event("a")).expect("open");
        assert_eq!(receipt, PublishReceipt::default());
        assert_eq!(bus.statistics().events_published, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let first = bus.subscribe("first").expect("open");
        let second = bus.subscribe("second").expect("open");

        let receipt = bus.publish(event("a")).expect("open");
        assert_eq!(receipt.delivered, 2);

        for sub in [&first, &second] {
            let got = timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("delivered")
                .expect("open");
            assert_eq!(got.args, vec!["a".to_owned()]);
        }

        let stats = bus.statistics();
        assert_eq!(stats.events_delivered, 2);
        assert_eq!(stats.active_subscribers, 2);
    }

    #[test]
    fn test_subscriber_limit() {
        let bus = EventBus::with_config(BusConfig {
            queue_capacity: 4,
            max_subscribers: 1,
        })
        .expect("valid");
        let _held = bus.subscribe("one").expect("first fits");
        assert_eq!(
            bus.subscribe("two").expect_err("limit"),
            EventBusError::SubscriberLimit { limit: 1 }
        );
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe("temp").expect("open");
        let id = sub.id();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_unsubscribe_closes_queue() {
        let bus = EventBus::new();
        let sub = bus.subscribe("temp").expect("open");
        bus.publish(event("pending")).expect("open");
        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert!(sub.is_closed());
        assert_eq!(bus.statistics().events_discarded, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe("s").expect("open");
        bus.publish(event("a")).expect("open");

        assert!(bus.shutdown());
        assert!(!bus.shutdown());
        assert!(sub.is_closed());

        let stats = bus.statistics();
        assert_eq!(stats.active_subscribers, 0);
        assert_eq!(stats.events_discarded, 1);
        assert_eq!(bus.publish(event("b")), Err(EventBusError::Closed));
        assert_eq!(bus.subscribe("late").expect_err("closed"), EventBusError::Closed);
    }

    #[test]
    fn test_subscribers_listing() {
        let bus = EventBus::new();
        let _a = bus.subscribe("alpha").expect("open");
        let _b = bus.subscribe("beta").expect("open");
        bus.publish(event("x")).expect("open");

        let infos = bus.subscribers();
        let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(infos.iter().all(|i| i.stats.depth == 1));
    }
}
