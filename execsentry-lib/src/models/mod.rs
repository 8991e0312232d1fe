//! Core data models shared by the bus, the matcher and the agent.

pub mod alert;
pub mod event;
pub mod rule;

pub use alert::{Alert, AlertSeverity};
pub use event::{EventKind, ProcessEvent};
pub use rule::{RuleDefinition, RuleError, RuleId, ThreatTag};
