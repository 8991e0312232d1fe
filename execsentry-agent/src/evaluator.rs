//! Rule evaluator task.
//!
//! One evaluator runs per registered rule. It owns its subscription and
//! suspends in exactly one place: a select over the shutdown token and the
//! next queued event. Each dequeued event is matched and any alert is
//! delivered before the evaluator waits again, so an evaluator never has
//! more than one event in flight.

use execsentry_eventbus::{EventBus, Subscription};
use execsentry_lib::alerting::AlertManager;
use execsentry_lib::models::{Alert, ProcessEvent, RuleId};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::lifecycle::{LifecycleTracker, RuleState};
use crate::registry::RegisteredRule;
use crate::shutdown::ShutdownToken;

/// Counters returned when an evaluator stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorReport {
    pub rule_id: RuleId,
    /// Events taken off the queue
    pub events_processed: u64,
    /// Alerts handed to the alert manager
    pub alerts_emitted: u64,
    /// Events skipped because the detector failed or panicked
    pub match_errors: u64,
    /// Sink deliveries that reported failure
    pub delivery_failures: u64,
}

impl EvaluatorReport {
    fn new(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            events_processed: 0,
            alerts_emitted: 0,
            match_errors: 0,
            delivery_failures: 0,
        }
    }
}

/// Applies one rule's detector to every event on its subscription.
pub struct RuleEvaluator {
    rule: RegisteredRule,
    subscription: Subscription,
    bus: EventBus,
    shutdown: ShutdownToken,
    alerts: Arc<AlertManager>,
    lifecycle: Arc<LifecycleTracker>,
}

impl RuleEvaluator {
    pub fn new(
        rule: RegisteredRule,
        subscription: Subscription,
        bus: EventBus,
        shutdown: ShutdownToken,
        alerts: Arc<AlertManager>,
        lifecycle: Arc<LifecycleTracker>,
    ) -> Self {
        Self {
            rule,
            subscription,
            bus,
            shutdown,
            alerts,
            lifecycle,
        }
    }

    /// Run until shutdown is signalled or the subscription is closed.
    pub async fn run(self) -> EvaluatorReport {
        let span = info_span!("rule_evaluator", rule_id = %self.rule.id());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> EvaluatorReport {
        let rule_id = self.rule.id().clone();
        let mut report = EvaluatorReport::new(rule_id.clone());
        self.lifecycle.advance(&rule_id, RuleState::Running);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    debug!("Shutdown observed");
                    break;
                }
                next = self.subscription.recv() => match next {
                    Some(event) => self.process(&event, &mut report).await,
                    None => {
                        debug!("Subscription closed");
                        break;
                    }
                },
            }
        }

        self.lifecycle.advance(&rule_id, RuleState::Draining);
        let pending = self.subscription.stats().depth;
        self.bus.unsubscribe(self.subscription.id());
        drop(self.subscription);
        self.lifecycle.advance(&rule_id, RuleState::Stopped);

        info!(
            events_processed = report.events_processed,
            alerts_emitted = report.alerts_emitted,
            match_errors = report.match_errors,
            delivery_failures = report.delivery_failures,
            pending_discarded = pending,
            "Rule evaluator stopped"
        );
        report
    }

    async fn process(&self, event: &ProcessEvent, report: &mut EvaluatorReport) {
        report.events_processed += 1;
        let detector = &self.rule.detector;

        let detail = match catch_unwind(AssertUnwindSafe(|| detector.evaluate(event))) {
            Ok(Ok(Some(detail))) => detail,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                report.match_errors += 1;
                warn!(error = %e, command = %event.command, "Detector error, skipping event");
                return;
            }
            Err(panic) => {
                report.match_errors += 1;
                error!(
                    panic = %panic_message(panic.as_ref()),
                    command = %event.command,
                    "Detector panicked, skipping event"
                );
                return;
            }
        };

        let definition = &self.rule.definition;
        let event_json = event.to_json().unwrap_or_else(|e| {
            warn!(error = %e, "Event serialization failed, falling back to debug form");
            format!("{event:?}")
        });
        let alert = Alert::new(
            definition.id.clone(),
            definition.display_name(),
            definition.severity,
            event_json,
            detail.describe(definition.display_name()),
        );

        info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            argument = %detail.argument,
            pattern = %detail.pattern,
            "Detection matched"
        );

        let results = self.alerts.send_alert(&alert).await;
        report.alerts_emitted += 1;
        report.delivery_failures += results.iter().filter(|r| !r.success).count() as u64;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
