//! Rule engine: wires the registry, bus, evaluators and shutdown together.

use execsentry_eventbus::{BusConfig, EventBus, EventBusError, EventBusStatistics, PublishReceipt};
use execsentry_lib::alerting::AlertManager;
use execsentry_lib::models::{ProcessEvent, RuleId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, warn};

use crate::evaluator::{EvaluatorReport, RuleEvaluator};
use crate::lifecycle::{LifecycleTracker, RuleState};
use crate::registry::RuleRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownToken};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Rule engine already started")]
    AlreadyStarted,

    #[error("Event bus is closed")]
    BusClosed,

    #[error("Event bus error: {0}")]
    Bus(EventBusError),
}

impl From<EventBusError> for EngineError {
    fn from(err: EventBusError) -> Self {
        match err {
            EventBusError::Closed => Self::BusClosed,
            other => Self::Bus(other),
        }
    }
}

/// Result of [`RuleEngine::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownSummary {
    /// Whether this call initiated shutdown
    pub initiated: bool,
    /// Reports from evaluators that stopped in time
    pub reports: Vec<EvaluatorReport>,
    /// Evaluators still running at the deadline; their tasks were aborted
    pub timed_out: Vec<RuleId>,
    /// Evaluators whose task ended abnormally
    pub failed: Vec<RuleId>,
}

impl ShutdownSummary {
    /// Total alerts emitted across all reports.
    pub fn alerts_emitted(&self) -> u64 {
        self.reports.iter().map(|r| r.alerts_emitted).sum()
    }
}

/// Owns the event bus and one evaluator task per registered rule.
pub struct RuleEngine {
    bus: EventBus,
    coordinator: ShutdownCoordinator,
    registry: RuleRegistry,
    alerts: Arc<AlertManager>,
    lifecycle: Arc<LifecycleTracker>,
    handles: Vec<(RuleId, JoinHandle<EvaluatorReport>)>,
    started: bool,
}

impl RuleEngine {
    /// Create an engine over a populated registry.
    ///
    /// Every registered rule starts out `Created`.
    ///
    /// # Errors
    ///
    /// Fails if the bus configuration is invalid.
    pub fn new(
        registry: RuleRegistry,
        alerts: AlertManager,
        bus_config: BusConfig,
    ) -> Result<Self, EngineError> {
        let bus = EventBus::with_config(bus_config)?;
        let lifecycle = Arc::new(LifecycleTracker::new());
        for rule in registry.rules() {
            lifecycle.track(rule.id());
        }

        Ok(Self {
            bus,
            coordinator: ShutdownCoordinator::new(),
            registry,
            alerts: Arc::new(alerts),
            lifecycle,
            handles: Vec::new(),
            started: false,
        })
    }

    /// Subscribe every rule and spawn its evaluator.
    ///
    /// Returns the number of evaluators started. A rule whose subscription
    /// is refused (for example over the subscriber limit) is logged, moved
    /// to `Stopped`, and the remaining rules still start.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyStarted`] on a second call,
    /// [`EngineError::BusClosed`] once shutdown has begun.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> Result<usize, EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        if self.coordinator.is_initiated() || self.bus.is_closed() {
            return Err(EngineError::BusClosed);
        }
        self.started = true;

        for rule in self.registry.rules() {
            let rule_id = rule.id().clone();
            let subscription = match self.bus.subscribe(rule_id.raw()) {
                Ok(subscription) => subscription,
                Err(EventBusError::Closed) => return Err(EngineError::BusClosed),
                Err(e) => {
                    error!(rule_id = %rule_id, error = %e, "Rule failed to subscribe");
                    self.lifecycle.advance(&rule_id, RuleState::Stopped);
                    continue;
                }
            };
            self.lifecycle.advance(&rule_id, RuleState::Subscribed);

            let evaluator = RuleEvaluator::new(
                rule.clone(),
                subscription,
                self.bus.clone(),
                self.coordinator.token(),
                Arc::clone(&self.alerts),
                Arc::clone(&self.lifecycle),
            );
            debug!(rule_id = %rule_id, "Spawning rule evaluator");
            self.handles.push((rule_id, tokio::spawn(evaluator.run())));
        }

        info!(
            evaluators = self.handles.len(),
            sinks = self.alerts.sink_count(),
            queue_capacity = self.bus.config().queue_capacity,
            "Rule engine started"
        );
        Ok(self.handles.len())
    }

    /// Hand one event to the bus.
    ///
    /// # Errors
    ///
    /// [`EngineError::BusClosed`] once shutdown has begun.
    pub fn publish(&self, event: ProcessEvent) -> Result<PublishReceipt, EngineError> {
        Ok(self.bus.publish(event)?)
    }

    /// Wait until every subscription queue is empty.
    ///
    /// Used before a planned shutdown (end of input) so queued events are
    /// still evaluated. An event already dequeued finishes even after
    /// shutdown is signalled. Returns `false` if queues were still non-empty
    /// at the deadline.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: usize = self
                .bus
                .subscribers()
                .iter()
                .map(|s| s.stats.depth)
                .sum();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Queues still busy at drain deadline");
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Signal shutdown, close the bus and wait for evaluators.
    ///
    /// Waits at most `timeout` in total. Evaluators still running at the
    /// deadline are aborted and listed in the summary. Calling this again
    /// returns an empty summary with `initiated == false`.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self, reason: &str, timeout: Duration) -> ShutdownSummary {
        let initiated = self.coordinator.initiate(reason);
        self.bus.shutdown();

        let mut summary = ShutdownSummary {
            initiated,
            ..ShutdownSummary::default()
        };

        let deadline = Instant::now() + timeout;
        for (rule_id, mut handle) in self.handles.drain(..) {
            debug!(rule_id = %rule_id, "Waiting for rule evaluator to stop");
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(report)) => summary.reports.push(report),
                Ok(Err(e)) => {
                    error!(rule_id = %rule_id, error = %e, "Rule evaluator task failed");
                    self.lifecycle.advance(&rule_id, RuleState::Stopped);
                    summary.failed.push(rule_id);
                }
                Err(_) => {
                    handle.abort();
                    self.lifecycle.advance(&rule_id, RuleState::Stopped);
                    summary.timed_out.push(rule_id);
                }
            }
        }

        if !summary.timed_out.is_empty() {
            warn!(
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                stragglers = summary.timed_out.len(),
                "Shutdown timeout exceeded, aborted remaining evaluators"
            );
        } else if initiated {
            info!(
                evaluators = summary.reports.len(),
                alerts_emitted = summary.alerts_emitted(),
                "All rule evaluators stopped"
            );
        }

        summary
    }

    /// Rule states ordered by rule id.
    pub fn states(&self) -> Vec<(RuleId, RuleState)> {
        self.lifecycle.snapshot()
    }

    /// Handle to the engine's bus.
    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Token observing the engine's shutdown signal.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.coordinator.token()
    }

    /// Bus-wide counters.
    pub fn statistics(&self) -> EventBusStatistics {
        self.bus.statistics()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use execsentry_lib::alerting::MemorySink;
    use execsentry_lib::models::{AlertSeverity, RuleDefinition};

    fn engine_with(rules: &[(&str, &str)], sink: &MemorySink) -> RuleEngine {
        let mut registry = RuleRegistry::new();
        for (id, pattern) in rules {
            registry
                .register(RuleDefinition::new(*id, AlertSeverity::High, ["rm"], [*pattern]))
                .expect("valid rule");
        }
        let mut alerts = AlertManager::new();
        alerts.add_sink(Box::new(sink.clone()));
        RuleEngine::new(registry, alerts, BusConfig::default()).expect("valid config")
    }

    #[test]
    fn test_invalid_bus_config() {
        let result = RuleEngine::new(
            RuleRegistry::new(),
            AlertManager::new(),
            BusConfig {
                queue_capacity: 0,
                max_subscribers: 1,
            },
        );
        assert!(matches!(result, Err(EngineError::Bus(EventBusError::Configuration(_)))));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let sink = MemorySink::new("memory");
        let mut engine = engine_with(&[("a", "/x")], &sink);
        assert_eq!(engine.start(), Ok(1));
        assert_eq!(engine.start(), Err(EngineError::AlreadyStarted));
        engine.shutdown("test", Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let sink = MemorySink::new("memory");
        let mut engine = engine_with(&[("a", "/x")], &sink);
        let summary = engine.shutdown("early", Duration::from_secs(1)).await;
        assert!(summary.initiated);
        assert_eq!(engine.start(), Err(EngineError::BusClosed));
        assert_eq!(
            engine.publish(ProcessEvent::new("rm", ["/x"])),
            Err(EngineError::BusClosed)
        );
    }

    #[tokio::test]
    async fn test_states_follow_lifecycle() {
        let sink = MemorySink::new("memory");
        let mut engine = engine_with(&[("a", "/x"), ("b", "/y")], &sink);
        assert!(engine.states().iter().all(|(_, s)| *s == RuleState::Created));

        engine.start().expect("started");
        assert!(engine
            .states()
            .iter()
            .all(|(_, s)| matches!(s, RuleState::Subscribed | RuleState::Running)));

        let summary = engine.shutdown("test", Duration::from_secs(5)).await;
        assert_eq!(summary.reports.len(), 2);
        assert!(summary.timed_out.is_empty());
        assert!(engine.states().iter().all(|(_, s)| *s == RuleState::Stopped));

        let again = engine.shutdown("again", Duration::from_secs(5)).await;
        assert!(!again.initiated);
        assert!(again.reports.is_empty());
    }

    #[test]
    fn test_error_conversion() {
        assert_eq!(EngineError::from(EventBusError::Closed), EngineError::BusClosed);
        assert_eq!(
            EngineError::from(EventBusError::SubscriberLimit { limit: 2 }),
            EngineError::Bus(EventBusError::SubscriberLimit { limit: 2 })
        );
    }
}
