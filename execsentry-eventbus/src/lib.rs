#![forbid(unsafe_code)]

//! # execsentry event bus
//!
//! In-process fan-out of process events to independently running readers.
//!
//! ## Delivery semantics
//!
//! - **Fan-out**: every published event is queued on every subscription
//!   registered at that moment, as a shared `Arc<ProcessEvent>`.
//! - **No replay**: a new subscription only sees events published after it.
//! - **FIFO** per subscription; no ordering across subscriptions.
//! - **Bounded, drop-oldest**: each queue has a fixed capacity. When it is
//!   full the oldest pending event is evicted and counted. `publish` never
//!   waits on a reader.
//! - **Explicit close**: after [`EventBus::shutdown`] both `publish` and
//!   `subscribe` fail with [`EventBusError::Closed`] and every reader's
//!   `recv` resolves to `None`.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use execsentry_eventbus::{BusConfig, EventBus};
//! use execsentry_lib::models::ProcessEvent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::with_config(BusConfig { queue_capacity: 100, max_subscribers: 16 })?;
//!     let subscription = bus.subscribe("log-wipe")?;
//!
//!     let reader = tokio::spawn(async move {
//!         while let Some(event) = subscription.recv().await {
//!             println!("{} {:?}", event.command, event.args);
//!         }
//!     });
//!
//!     bus.publish(ProcessEvent::new("rm", ["-f", "/var/log/wtmp"]))?;
//!     bus.shutdown();
//!     reader.await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod error;
pub mod subscription;

pub use bus::{BusConfig, EventBus, EventBusStatistics, PublishReceipt, SubscriberInfo};
pub use error::{EventBusError, Result};
pub use subscription::{Subscription, SubscriptionId, SubscriptionStats, TryRecvError};
