//! JSON-lines sensor adapter.
//!
//! Reads one [`ProcessEvent`] per line from any buffered async reader and
//! publishes it. Bad input never stops the stream: blank lines are skipped
//! and malformed lines are logged and counted.
//!
//! A live sensor publishes as events arrive and lets full queues drop their
//! oldest entry. Replaying a file or pipe is different: input arrives far
//! faster than rules drain it, so a [paced](JsonLinesSource::paced) source
//! holds each event until every subscriber queue has room.

use execsentry_eventbus::{EventBus, EventBusError};
use execsentry_lib::models::ProcessEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, info, trace, warn};

use crate::shutdown::ShutdownToken;

const PACE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Sensor input errors.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Failed to read event input: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to publish event: {0}")]
    Publish(#[from] EventBusError),
}

/// Input counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorStats {
    pub lines_read: u64,
    pub events_published: u64,
    /// Lines that did not parse as an event
    pub malformed: u64,
    pub blank: u64,
    /// Events evicted from full subscriber queues by our publishes
    pub evictions: u64,
}

/// Newline-delimited JSON event source.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    stats: SensorStats,
    paced: bool,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            stats: SensorStats::default(),
            paced: false,
        }
    }

    /// Wait for room in every subscriber queue before each publish, so no
    /// event is evicted by this source.
    #[must_use]
    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    /// Counters so far.
    pub fn stats(&self) -> SensorStats {
        self.stats
    }

    /// Next well-formed event, or `None` at end of input.
    ///
    /// Cancel safe: no line is lost if the future is dropped while waiting.
    ///
    /// # Errors
    ///
    /// Only read failures are returned; malformed lines are skipped.
    pub async fn next_event(&mut self) -> Result<Option<ProcessEvent>, SensorError> {
        while let Some(line) = self.lines.next_line().await? {
            self.stats.lines_read += 1;
            let line = line.trim();
            if line.is_empty() {
                self.stats.blank += 1;
                continue;
            }

            match serde_json::from_str::<ProcessEvent>(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(
                        line = self.stats.lines_read,
                        error = %e,
                        "Skipping malformed event line"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Publish every event until end of input, shutdown, or bus close.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Io`] if reading fails.
    pub async fn run(
        mut self,
        bus: &EventBus,
        shutdown: &ShutdownToken,
    ) -> Result<SensorStats, SensorError> {
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    debug!("Shutdown observed, sensor stopping");
                    break;
                }
                next = self.next_event() => next?,
            };

            let Some(event) = next else {
                info!(lines = self.stats.lines_read, "Event input reached end of stream");
                break;
            };

            if self.paced && !wait_for_room(bus, shutdown).await {
                debug!("Shutdown observed while waiting for queue room, sensor stopping");
                break;
            }

            match bus.publish(event) {
                Ok(receipt) => {
                    self.stats.events_published += 1;
                    self.stats.evictions += receipt.dropped as u64;
                    trace!(delivered = receipt.delivered, dropped = receipt.dropped, "Event published");
                }
                Err(EventBusError::Closed) => {
                    warn!("Event bus closed, sensor stopping");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            lines_read = self.stats.lines_read,
            events_published = self.stats.events_published,
            malformed = self.stats.malformed,
            blank = self.stats.blank,
            evictions = self.stats.evictions,
            "Sensor stopped"
        );
        Ok(self.stats)
    }
}

/// Block until no subscriber queue is full. Returns `false` on shutdown.
async fn wait_for_room(bus: &EventBus, shutdown: &ShutdownToken) -> bool {
    loop {
        // A closed bus is reported by the publish that follows.
        if bus.is_closed()
            || bus
                .subscribers()
                .iter()
                .all(|s| s.stats.depth < s.stats.capacity)
        {
            return true;
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(PACE_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;
    use execsentry_eventbus::BusConfig;
    use tokio::time::timeout;

    fn numbered_events(count: usize) -> String {
        (0..count)
            .map(|i| format!("{{\"command\":\"cmd-{i}\"}}\n"))
            .collect()
    }

    #[tokio::test]
    async fn test_next_event_skips_bad_lines() {
        let input = concat!(
            "{\"command\":\"rm\",\"args\":[\"/var/log/secure\"]}\n",
            "\n",
            "   \n",
            "not json\n",
            "{\"args\":[\"missing command\"]}\n",
            "{\"command\":\"ls\"}\n",
        );
        let mut source = JsonLinesSource::new(input.as_bytes());

        let first = source.next_event().await.expect("read").expect("event");
        assert_eq!(first.command, "rm");
        assert_eq!(first.args, vec!["/var/log/secure"]);

        let second = source.next_event().await.expect("read").expect("event");
        assert_eq!(second.command, "ls");
        assert!(second.args.is_empty());

        assert!(source.next_event().await.expect("read").is_none());
        let stats = source.stats();
        assert_eq!(stats.lines_read, 6);
        assert_eq!(stats.blank, 2);
        assert_eq!(stats.malformed, 2);
    }

    #[tokio::test]
    async fn test_run_publishes_until_eof() {
        let bus = EventBus::new();
        let subscription = bus.subscribe("reader").expect("open");
        let coordinator = ShutdownCoordinator::new();

        let input = "{\"command\":\"a\"}\n{\"command\":\"b\"}\n";
        let stats = JsonLinesSource::new(input.as_bytes())
            .run(&bus, &coordinator.token())
            .await
            .expect("ran");
        assert_eq!(stats.events_published, 2);

        let first = subscription.try_recv().expect("queued");
        let second = subscription.try_recv().expect("queued");
        assert_eq!((first.command.as_str(), second.command.as_str()), ("a", "b"));
    }

    #[tokio::test]
    async fn test_run_stops_when_bus_closed() {
        let bus = EventBus::new();
        bus.shutdown();
        let coordinator = ShutdownCoordinator::new();

        let input = "{\"command\":\"a\"}\n{\"command\":\"b\"}\n";
        let stats = JsonLinesSource::new(input.as_bytes())
            .run(&bus, &coordinator.token())
            .await
            .expect("ran");
        assert_eq!(stats.events_published, 0);
        assert_eq!(stats.lines_read, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bus = EventBus::new();
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        // Writer half stays open, so input never reaches EOF.
        let (_writer, reader) = tokio::io::duplex(64);
        let source = JsonLinesSource::new(tokio::io::BufReader::new(reader));
        let task = tokio::spawn(async move { source.run(&bus, &token).await });

        tokio::task::yield_now().await;
        coordinator.initiate("test");
        let stats = timeout(Duration::from_secs(5), task)
            .await
            .expect("stopped")
            .expect("joined")
            .expect("ran");
        assert_eq!(stats.lines_read, 0);
    }

    #[tokio::test]
    async fn test_unpaced_run_evicts_from_full_queue() {
        let bus = EventBus::with_config(BusConfig {
            queue_capacity: 3,
            max_subscribers: 4,
        })
        .expect("valid config");
        let subscription = bus.subscribe("idle").expect("open");
        let coordinator = ShutdownCoordinator::new();

        let input = numbered_events(10);
        let stats = JsonLinesSource::new(input.as_bytes())
            .run(&bus, &coordinator.token())
            .await
            .expect("ran");
        assert_eq!(stats.events_published, 10);
        assert_eq!(stats.evictions, 7);
        assert_eq!(subscription.try_recv().expect("queued").command, "cmd-7");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_paced_run_delivers_every_event() {
        let bus = EventBus::with_config(BusConfig {
            queue_capacity: 3,
            max_subscribers: 4,
        })
        .expect("valid config");
        let subscription = bus.subscribe("slow").expect("open");
        let coordinator = ShutdownCoordinator::new();

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = subscription.recv().await {
                seen.push(event.command.clone());
                tokio::time::sleep(Duration::from_millis(2)).await;
                if seen.len() == 20 {
                    break;
                }
            }
            seen
        });

        let input = numbered_events(20);
        let stats = timeout(
            Duration::from_secs(10),
            JsonLinesSource::new(input.as_bytes())
                .paced()
                .run(&bus, &coordinator.token()),
        )
        .await
        .expect("finished")
        .expect("ran");
        assert_eq!(stats.events_published, 20);
        assert_eq!(stats.evictions, 0);

        let seen = timeout(Duration::from_secs(10), reader)
            .await
            .expect("drained")
            .expect("joined");
        let expected: Vec<String> = (0..20).map(|i| format!("cmd-{i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(bus.statistics().events_dropped, 0);
    }

    #[tokio::test]
    async fn test_paced_run_stops_on_shutdown_while_full() {
        let bus = EventBus::with_config(BusConfig {
            queue_capacity: 1,
            max_subscribers: 4,
        })
        .expect("valid config");
        let _stalled = bus.subscribe("stalled").expect("open");
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let task = tokio::spawn({
            let bus = bus.clone();
            async move {
                let input = numbered_events(5);
                JsonLinesSource::new(input.as_bytes())
                    .paced()
                    .run(&bus, &token)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.initiate("test");
        let stats = timeout(Duration::from_secs(5), task)
            .await
            .expect("stopped")
            .expect("joined")
            .expect("ran");
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.evictions, 0);
    }
}
