//! ExecSentry agent library.
//!
//! Runs one evaluator task per registered detection rule on top of the
//! shared event bus, with a single shutdown signal that every evaluator
//! observes at its wait point.

#![forbid(unsafe_code)]

pub mod engine;
pub mod evaluator;
pub mod lifecycle;
pub mod registry;
pub mod rules;
pub mod sensor;
pub mod shutdown;

pub use engine::{EngineError, RuleEngine, ShutdownSummary};
pub use evaluator::{EvaluatorReport, RuleEvaluator};
pub use lifecycle::{LifecycleTracker, RuleState};
pub use registry::{RegisteredRule, Registration, RegistryError, RuleRegistry};
pub use sensor::{JsonLinesSource, SensorError, SensorStats};
pub use shutdown::{ShutdownCoordinator, ShutdownToken};
