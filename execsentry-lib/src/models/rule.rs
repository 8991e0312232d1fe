//! Detection rule definitions.
//!
//! A [`RuleDefinition`] is static configuration: it is loaded from the
//! built-in catalog or from `[[rules]]` entries in the configuration file
//! and is never mutated by the engine once registered.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::alert::AlertSeverity;
use crate::models::event::EventKind;

/// Strongly-typed rule identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    /// Create a new `RuleId` from any type convertible into `String`.
    ///
    /// # Examples
    ///
    /// ```
    /// use execsentry_lib::models::RuleId;
    /// let id = RuleId::new("defense_evasion_log_files_deleted");
    /// assert_eq!(id.raw(), "defense_evasion_log_files_deleted");
    /// ```
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string slice of the `RuleId`.
    pub fn raw(&self) -> &str {
        &self.0
    }

    /// True when the identifier is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<String> for RuleId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for RuleId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rule configuration errors, raised at registration time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("Rule has an empty identifier")]
    EmptyId,

    #[error("Rule {rule_id} has no trigger verbs")]
    EmptyTriggerSet { rule_id: RuleId },

    #[error("Rule {rule_id} has a blank trigger verb at position {index}")]
    BlankTriggerVerb { rule_id: RuleId, index: usize },

    #[error("Rule {rule_id} has no patterns")]
    EmptyPatternSet { rule_id: RuleId },

    #[error("Rule {rule_id} has an invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule_id: RuleId,
        pattern: String,
        reason: String,
    },
}

/// MITRE ATT&CK style tagging. Metadata only; never consulted by matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatTag {
    /// Framework name, e.g. `MITRE ATT&CK`
    pub framework: String,
    /// Tactic identifier, e.g. `TA0005`
    pub tactic_id: String,
    /// Tactic name
    #[serde(default)]
    pub tactic_name: String,
    /// Technique identifier, e.g. `T1070`
    pub technique_id: String,
    /// Technique name
    #[serde(default)]
    pub technique_name: String,
}

impl ThreatTag {
    /// Build a MITRE ATT&CK tag.
    pub fn mitre(
        tactic_id: impl Into<String>,
        tactic_name: impl Into<String>,
        technique_id: impl Into<String>,
        technique_name: impl Into<String>,
    ) -> Self {
        Self {
            framework: "MITRE ATT&CK".to_owned(),
            tactic_id: tactic_id.into(),
            tactic_name: tactic_name.into(),
            technique_id: technique_id.into(),
            technique_name: technique_name.into(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Static description of one detection rule.
///
/// Only `id`, `severity`, `trigger_verbs`, `patterns` and `event_kinds`
/// influence matching. The remaining fields are carried into alerts and
/// listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Unique rule identifier
    pub id: RuleId,
    /// Human readable name
    #[serde(default)]
    pub name: String,
    /// Longer description of what the rule detects
    #[serde(default)]
    pub description: String,
    /// Severity assigned to every alert this rule emits
    pub severity: AlertSeverity,
    /// Substrings of the command text that gate the pattern scan
    pub trigger_verbs: Vec<String>,
    /// Glob patterns tested against each argument
    pub patterns: Vec<String>,
    /// Event kinds this rule applies to; empty means any
    #[serde(default)]
    pub event_kinds: Vec<EventKind>,
    /// Threat framework tags
    #[serde(default)]
    pub threat: Vec<ThreatTag>,
    /// Disabled rules are never registered
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl RuleDefinition {
    /// Create an enabled rule with the required matching fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use execsentry_lib::models::{AlertSeverity, RuleDefinition};
    ///
    /// let rule = RuleDefinition::new("tmp-wipe", AlertSeverity::Low, ["rm"], ["/tmp/*"])
    ///     .with_name("Temp wipe");
    /// assert!(rule.validate().is_ok());
    /// ```
    pub fn new<T, P>(
        id: impl Into<RuleId>,
        severity: AlertSeverity,
        trigger_verbs: T,
        patterns: P,
    ) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        let id = id.into();
        Self {
            name: id.raw().to_owned(),
            id,
            description: String::new(),
            severity,
            trigger_verbs: trigger_verbs.into_iter().map(Into::into).collect(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            event_kinds: Vec::new(),
            threat: Vec::new(),
            enabled: true,
        }
    }

    /// Set the human readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Restrict the rule to the given event kinds.
    #[must_use]
    pub fn with_event_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.event_kinds = kinds.into_iter().collect();
        self
    }

    /// Attach a threat tag.
    #[must_use]
    pub fn with_threat(mut self, tag: ThreatTag) -> Self {
        self.threat.push(tag);
        self
    }

    /// Enable or disable the rule.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Name for display, falling back to the identifier.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.id.raw()
        } else {
            &self.name
        }
    }

    /// Validate the definition.
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found: a blank id, an empty
    /// or blank trigger verb set, an empty pattern set, or a pattern the
    /// glob compiler rejects.
    pub fn validate(&self) -> Result<(), RuleError> {
        if self.id.is_blank() {
            return Err(RuleError::EmptyId);
        }

        if self.trigger_verbs.is_empty() {
            return Err(RuleError::EmptyTriggerSet {
                rule_id: self.id.clone(),
            });
        }

        if let Some(index) = self.trigger_verbs.iter().position(|v| v.trim().is_empty()) {
            return Err(RuleError::BlankTriggerVerb {
                rule_id: self.id.clone(),
                index,
            });
        }

        if self.patterns.is_empty() {
            return Err(RuleError::EmptyPatternSet {
                rule_id: self.id.clone(),
            });
        }

        for pattern in &self.patterns {
            glob::Pattern::new(pattern).map_err(|e| RuleError::InvalidPattern {
                rule_id: self.id.clone(),
                pattern: pattern.clone(),
                reason: e.msg.to_owned(),
            })?;
        }

        Ok(())
    }
}
