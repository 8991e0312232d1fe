//! Alert data structures and types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::rule::RuleId;

/// Alert severity levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Low severity alert
    Low,
    /// Medium severity alert
    Medium,
    /// High severity alert
    High,
    /// Critical severity alert
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Low => write!(f, "low"),
            AlertSeverity::Medium => write!(f, "medium"),
            AlertSeverity::High => write!(f, "high"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            _ => Err(format!("Invalid alert severity: {s}")),
        }
    }
}

/// One emitted detection.
///
/// Alerts are handed to the sinks once and not retained by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    /// Unique alert identifier
    pub id: Uuid,
    /// Rule that produced the alert
    pub rule_id: RuleId,
    /// Human readable rule name
    pub rule_name: String,
    /// Severity copied from the rule definition
    pub severity: AlertSeverity,
    /// JSON serialization of the offending event
    pub event: String,
    /// Free-text match detail
    pub detail: String,
    /// Alert creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create a new alert with a fresh identifier and the current time.
    pub fn new(
        rule_id: RuleId,
        rule_name: impl Into<String>,
        severity: AlertSeverity,
        event: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_id,
            rule_name: rule_name.into(),
            severity,
            event: event.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }

    /// Single-line human readable rendering.
    pub fn to_human(&self) -> String {
        format!(
            "[{}] {} severity={} rule={} detail=\"{}\" event={}",
            self.timestamp.to_rfc3339(),
            self.id,
            self.severity,
            self.rule_id,
            self.detail,
            self.event
        )
    }

    /// CSV rendering: `timestamp,id,rule_id,severity,detail,event`.
    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.timestamp.to_rfc3339(),
            self.id,
            csv_field(self.rule_id.raw()),
            self.severity,
            csv_field(&self.detail),
            csv_field(&self.event)
        )
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_round_trip() {
        for s in ["low", "MEDIUM", "High", "critical"] {
            let parsed: AlertSeverity = s.parse().expect("valid severity");
            assert_eq!(parsed.to_string(), s.to_lowercase());
        }
        assert!("urgent".parse::<AlertSeverity>().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::High);
        assert!(AlertSeverity::Medium > AlertSeverity::Low);
    }

    #[test]
    fn test_alerts_get_unique_ids() {
        let a = Alert::new(RuleId::new("r"), "R", AlertSeverity::High, "{}", "d");
        let b = Alert::new(RuleId::new("r"), "R", AlertSeverity::High, "{}", "d");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_csv_quotes_event_json() {
        let alert = Alert::new(
            RuleId::new("r"),
            "R",
            AlertSeverity::Low,
            r#"{"command":"rm","args":["a","b"]}"#,
            "plain",
        );
        let line = alert.to_csv();
        assert!(line.ends_with(r#""{""command"":""rm"",""args"":[""a"",""b""]}""#));
        assert!(line.contains(",r,low,plain,"));
    }

    #[test]
    fn test_json_shape() {
        let alert = Alert::new(RuleId::new("r"), "R", AlertSeverity::Critical, "{}", "d");
        let json = serde_json::to_value(&alert).expect("serializable");
        assert_eq!(json["rule_id"], "r");
        assert_eq!(json["severity"], "critical");
    }
}
