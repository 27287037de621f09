//! Policy rule documents and compiled rules

use crate::config::{Effect, Operation};
use crate::error::PolicyLoadError;
use crate::mqtt::{Specificity, TopicMatcher, MAX_TOPIC_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::matcher::{CompiledMatcher, MatchSpec};

/// Highest MQTT QoS level
const MAX_QOS: u8 = 2;

/// Rule set as supplied by a policy source
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PolicyDocument {
    /// Rules; declaration order breaks otherwise complete ties
    pub rules: Vec<RuleDocument>,

    /// Principal (username, else client ID) to extra roles
    pub role_bindings: HashMap<String, Vec<String>>,
}

impl PolicyDocument {
    pub fn from_json(json: &str) -> Result<Self, PolicyLoadError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RuleDocument {
    /// Rule name (for logging and debugging)
    pub name: String,

    /// Topic patterns this rule applies to
    pub topics: Vec<String>,

    /// Operations this rule applies to (empty = all operations)
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Allow or deny
    pub effect: Effect,

    /// Identity matcher (absent = every identity)
    #[serde(default, rename = "match")]
    pub matcher: MatchSpec,

    /// Priority among equally specific rules (higher wins, default = 0)
    #[serde(default)]
    pub priority: i32,

    /// Maximum QoS granted by an allow
    pub max_qos: Option<u8>,
}

/// One (pattern, operation) rule, immutable once inside a snapshot
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub name: Arc<str>,
    pub pattern: String,
    pub operation: Operation,
    pub effect: Effect,
    pub matcher: Arc<CompiledMatcher>,
    pub priority: i32,
    pub max_qos: Option<u8>,
    pub specificity: Specificity,
    /// Position in the expanded rule list
    pub ordinal: usize,
}

impl PolicyRule {
    /// Validate a rule document and expand it into one rule per (topic, operation)
    pub fn expand(
        doc: &RuleDocument,
        first_ordinal: usize,
        topics: &TopicMatcher,
    ) -> Result<Vec<PolicyRule>, PolicyLoadError> {
        let name = doc.name.trim();
        if name.is_empty() {
            return Err(PolicyLoadError::invalid_rule(&doc.name, "rule name must not be empty"));
        }
        if doc.topics.is_empty() {
            return Err(PolicyLoadError::invalid_rule(name, "at least one topic pattern is required"));
        }
        if let Some(qos) = doc.max_qos {
            if qos > MAX_QOS {
                return Err(PolicyLoadError::invalid_rule(
                    name,
                    format!("max-qos {} is out of range (0..=2)", qos),
                ));
            }
        }

        for pattern in &doc.topics {
            if pattern.len() > MAX_TOPIC_LENGTH {
                return Err(PolicyLoadError::invalid_rule(
                    name,
                    format!("topic pattern exceeds {} bytes", MAX_TOPIC_LENGTH),
                ));
            }
            if !topics.is_valid_filter(pattern) {
                return Err(PolicyLoadError::invalid_rule(
                    name,
                    format!("invalid topic pattern '{}'", pattern),
                ));
            }
        }

        let matcher = CompiledMatcher::compile(&doc.matcher)
            .map_err(|e| PolicyLoadError::invalid_rule(name, e))?;
        let matcher = Arc::new(matcher);
        let name: Arc<str> = Arc::from(name);

        let operations: &[Operation] = if doc.operations.is_empty() {
            &Operation::ALL
        } else {
            &doc.operations
        };

        let mut expanded = Vec::with_capacity(doc.topics.len() * operations.len());
        for pattern in &doc.topics {
            for &operation in operations {
                expanded.push(PolicyRule {
                    name: name.clone(),
                    pattern: pattern.clone(),
                    operation,
                    effect: doc.effect,
                    matcher: matcher.clone(),
                    priority: doc.priority,
                    max_qos: doc.max_qos,
                    specificity: topics.specificity(pattern),
                    ordinal: first_ordinal + expanded.len(),
                });
            }
        }

        Ok(expanded)
    }

    /// Precedence key: more specific, then higher priority, then deny, then earlier
    pub(crate) fn precedence(&self) -> (Specificity, i32, bool, std::cmp::Reverse<usize>) {
        (
            self.specificity,
            self.priority,
            self.effect == Effect::Deny,
            std::cmp::Reverse(self.ordinal),
        )
    }
}
