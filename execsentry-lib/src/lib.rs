#![forbid(unsafe_code)]

//! execsentry-lib: shared building blocks for the execsentry detection engine.
//!
//! - Core data models for process events, rule definitions and alerts
//! - Trigger-gated glob matcher and the [`matcher::Detector`] seam
//! - Alert sinks and fan-out delivery
//! - Configuration management with hierarchical overrides
//! - Logging setup

pub mod alerting;
pub mod config;
pub mod matcher;
pub mod models;
pub mod telemetry;

pub use matcher::{DetectionError, Detector, GlobMatcher, MatchDetail};
pub use models::{Alert, AlertSeverity, EventKind, ProcessEvent, RuleDefinition, RuleError, RuleId};
