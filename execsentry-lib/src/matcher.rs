//! Glob-based argument matcher.
//!
//! Matching is two-phase. A cheap substring test looks for any trigger verb
//! in the command text; only when one is present are the arguments scanned
//! against the compiled patterns. The scan stops at the first hit.
//!
//! Patterns follow shell glob rules with separators treated literally: `*`
//! and `?` never match `/`, so `/var/log/*.log` does not reach into
//! subdirectories. Matching is case-sensitive and paths are compared as
//! given, with no normalization of trailing slashes, `..` or symlinks.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EventKind, ProcessEvent, RuleDefinition, RuleError, RuleId};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Runtime failures raised by a detector while inspecting one event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("Unexpected event shape: {0}")]
    UnexpectedEvent(String),
}

impl DetectionError {
    /// Create an unexpected event error
    pub fn unexpected_event(msg: impl Into<String>) -> Self {
        Self::UnexpectedEvent(msg.into())
    }
}

/// What caused a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDetail {
    /// Trigger verb found in the command text
    pub trigger: String,
    /// Argument that matched
    pub argument: String,
    /// Pattern the argument matched
    pub pattern: String,
}

impl MatchDetail {
    /// Alert detail text for a rule with the given display name.
    ///
    /// ```
    /// use execsentry_lib::matcher::MatchDetail;
    /// let detail = MatchDetail {
    ///     trigger: "rm".into(),
    ///     argument: "/var/log/secure".into(),
    ///     pattern: "/var/log/secure".into(),
    /// };
    /// assert_eq!(
    ///     detail.describe("Log wipe"),
    ///     "Log wipe: argument '/var/log/secure' matched pattern '/var/log/secure' (trigger 'rm')"
    /// );
    /// ```
    pub fn describe(&self, rule_name: &str) -> String {
        format!(
            "{rule_name}: argument '{}' matched pattern '{}' (trigger '{}')",
            self.argument, self.pattern, self.trigger
        )
    }
}

/// A compiled-in detection predicate.
///
/// Implementations must be bounded-time and must not block; evaluators call
/// them inline between queue waits.
pub trait Detector: Send + Sync {
    /// Inspect one event.
    ///
    /// # Errors
    ///
    /// An error is logged by the caller and the event is skipped.
    fn evaluate(&self, event: &ProcessEvent) -> Result<Option<MatchDetail>, DetectionError>;
}

/// Trigger-gated glob matcher built from a [`RuleDefinition`].
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    rule_id: RuleId,
    trigger_verbs: Vec<String>,
    patterns: Vec<Pattern>,
    event_kinds: Vec<EventKind>,
}

impl GlobMatcher {
    /// Validate the definition and compile its patterns.
    ///
    /// # Errors
    ///
    /// Returns a [`RuleError`] for any configuration problem, including a
    /// pattern the glob compiler rejects.
    pub fn compile(rule: &RuleDefinition) -> Result<Self, RuleError> {
        rule.validate()?;

        let patterns = rule
            .patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| RuleError::InvalidPattern {
                    rule_id: rule.id.clone(),
                    pattern: p.clone(),
                    reason: e.msg.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rule_id: rule.id.clone(),
            trigger_verbs: rule.trigger_verbs.clone(),
            patterns,
            event_kinds: rule.event_kinds.clone(),
        })
    }

    /// Rule this matcher was compiled from.
    pub fn rule_id(&self) -> &RuleId {
        &self.rule_id
    }

    /// First trigger verb contained in the event's command text.
    pub fn triggered_by(&self, event: &ProcessEvent) -> Option<&str> {
        let text = event.command_text();
        self.trigger_verbs
            .iter()
            .find(|verb| text.contains(verb.as_str()))
            .map(String::as_str)
    }

    /// Match an event, returning the first (argument, pattern) hit.
    pub fn evaluate(&self, event: &ProcessEvent) -> Option<MatchDetail> {
        if event.args.is_empty() {
            return None;
        }

        if !self.event_kinds.is_empty() && !self.event_kinds.contains(&event.kind) {
            return None;
        }

        let trigger = self.triggered_by(event)?;

        for argument in &event.args {
            if let Some(pattern) = self
                .patterns
                .iter()
                .find(|p| p.matches_with(argument, MATCH_OPTIONS))
            {
                return Some(MatchDetail {
                    trigger: trigger.to_owned(),
                    argument: argument.clone(),
                    pattern: pattern.as_str().to_owned(),
                });
            }
        }

        None
    }
}

impl Detector for GlobMatcher {
    fn evaluate(&self, event: &ProcessEvent) -> Result<Option<MatchDetail>, DetectionError> {
        Ok(GlobMatcher::evaluate(self, event))
    }
}
