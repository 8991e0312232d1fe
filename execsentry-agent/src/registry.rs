//! Explicit rule registry.
//!
//! Rules are added by an explicit startup step, never as a side effect of
//! being referenced. Validation happens here, so a rule that fails to
//! register is reported once and never runs as a silent no-op.

use execsentry_lib::matcher::{Detector, GlobMatcher};
use execsentry_lib::models::{RuleDefinition, RuleError, RuleId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Rule registration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Rule already registered: {0}")]
    AlreadyRegistered(RuleId),

    #[error("Invalid rule {rule_id}: {source}")]
    InvalidRule {
        rule_id: RuleId,
        #[source]
        source: RuleError,
    },
}

impl RegistryError {
    /// Rule the error refers to.
    pub fn rule_id(&self) -> &RuleId {
        match self {
            Self::AlreadyRegistered(rule_id) | Self::InvalidRule { rule_id, .. } => rule_id,
        }
    }
}

/// What happened to a definition offered to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Rule added and will be started
    Registered,
    /// Rule is disabled and was skipped
    Disabled,
}

/// A validated rule paired with its compiled predicate.
#[derive(Clone)]
pub struct RegisteredRule {
    pub definition: Arc<RuleDefinition>,
    pub detector: Arc<dyn Detector>,
}

impl RegisteredRule {
    /// Rule identifier.
    pub fn id(&self) -> &RuleId {
        &self.definition.id
    }
}

impl fmt::Debug for RegisteredRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRule")
            .field("id", &self.definition.id)
            .field("severity", &self.definition.severity)
            .finish_non_exhaustive()
    }
}

/// Registered rules, kept in registration order.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<RegisteredRule>,
    index: HashMap<RuleId, usize>,
}

impl RuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, compile and add a glob rule.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidRule`] for a definition the matcher rejects,
    /// [`RegistryError::AlreadyRegistered`] for a duplicate id.
    pub fn register(&mut self, definition: RuleDefinition) -> Result<Registration, RegistryError> {
        if !definition.enabled {
            info!(rule_id = %definition.id, "Skipping disabled rule");
            return Ok(Registration::Disabled);
        }

        let matcher = GlobMatcher::compile(&definition).map_err(|source| {
            RegistryError::InvalidRule {
                rule_id: definition.id.clone(),
                source,
            }
        })?;
        self.insert(definition, Arc::new(matcher))
    }

    /// Add a rule backed by a custom predicate.
    ///
    /// The definition still has to pass validation: the trigger and pattern
    /// sets describe the rule even when the detector does not use them.
    ///
    /// # Errors
    ///
    /// Same as [`Self::register`].
    pub fn register_detector(
        &mut self,
        definition: RuleDefinition,
        detector: Arc<dyn Detector>,
    ) -> Result<Registration, RegistryError> {
        if !definition.enabled {
            info!(rule_id = %definition.id, "Skipping disabled rule");
            return Ok(Registration::Disabled);
        }

        definition
            .validate()
            .map_err(|source| RegistryError::InvalidRule {
                rule_id: definition.id.clone(),
                source,
            })?;
        self.insert(definition, detector)
    }

    /// Register every definition, collecting failures instead of stopping.
    ///
    /// Each failure is logged once here.
    pub fn register_all(
        &mut self,
        definitions: impl IntoIterator<Item = RuleDefinition>,
    ) -> Vec<RegistryError> {
        definitions
            .into_iter()
            .filter_map(|definition| self.register(definition).err())
            .inspect(|e| error!(rule_id = %e.rule_id(), error = %e, "Rule failed to register"))
            .collect()
    }

    fn insert(
        &mut self,
        definition: RuleDefinition,
        detector: Arc<dyn Detector>,
    ) -> Result<Registration, RegistryError> {
        if self.index.contains_key(&definition.id) {
            return Err(RegistryError::AlreadyRegistered(definition.id));
        }

        info!(
            rule_id = %definition.id,
            name = %definition.display_name(),
            severity = %definition.severity,
            patterns = definition.patterns.len(),
            "Rule registered"
        );
        self.index.insert(definition.id.clone(), self.rules.len());
        self.rules.push(RegisteredRule {
            definition: Arc::new(definition),
            detector,
        });
        Ok(Registration::Registered)
    }

    /// Look up a rule by id.
    pub fn get(&self, rule_id: &RuleId) -> Option<&RegisteredRule> {
        self.index.get(rule_id).and_then(|&i| self.rules.get(i))
    }

    /// True if a rule with this id is registered.
    pub fn contains(&self, rule_id: &RuleId) -> bool {
        self.index.contains_key(rule_id)
    }

    /// Rules in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &RegisteredRule> {
        self.rules.iter()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use execsentry_lib::matcher::{DetectionError, MatchDetail};
    use execsentry_lib::models::{AlertSeverity, ProcessEvent};

    fn rule(id: &str) -> RuleDefinition {
        RuleDefinition::new(id, AlertSeverity::Medium, ["rm"], ["/var/log/*"])
    }

    struct Never;

    impl Detector for Never {
        fn evaluate(&self, _event: &ProcessEvent) -> Result<Option<MatchDetail>, DetectionError> {
            Ok(None)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = RuleRegistry::new();
        assert_eq!(registry.register(rule("a")), Ok(Registration::Registered));
        assert_eq!(registry.register(rule("b")), Ok(Registration::Registered));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&RuleId::new("a")));
        let ids: Vec<&str> = registry.rules().map(|r| r.id().raw()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            registry.get(&RuleId::new("b")).expect("present").definition.severity,
            AlertSeverity::Medium
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = RuleRegistry::new();
        registry.register(rule("a")).expect("first");
        assert_eq!(
            registry.register(rule("a")),
            Err(RegistryError::AlreadyRegistered(RuleId::new("a")))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let mut registry = RuleRegistry::new();

        let mut no_triggers = rule("no-triggers");
        no_triggers.trigger_verbs.clear();
        let bad_pattern = RuleDefinition::new("bad-glob", AlertSeverity::Low, ["rm"], ["/var/log/["]);

        let failures = registry.register_all([no_triggers, bad_pattern, rule("good")]);
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            &failures[0],
            RegistryError::InvalidRule { source: RuleError::EmptyTriggerSet { .. }, .. }
        ));
        assert_eq!(failures[1].rule_id().raw(), "bad-glob");
        assert!(failures[1].to_string().contains("/var/log/["));

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&RuleId::new("good")));
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let mut registry = RuleRegistry::new();
        assert_eq!(
            registry.register(rule("off").with_enabled(false)),
            Ok(Registration::Disabled)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_custom_detector() {
        let mut registry = RuleRegistry::new();
        registry
            .register_detector(rule("custom"), Arc::new(Never))
            .expect("valid definition");
        let registered = registry.get(&RuleId::new("custom")).expect("present");
        let result = registered
            .detector
            .evaluate(&ProcessEvent::new("rm", ["/var/log/secure"]))
            .expect("never errors");
        assert!(result.is_none());
    }
}
