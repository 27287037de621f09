//! Immutable, versioned policy snapshots and rule lookup

use crate::config::{Effect, Operation};
use crate::error::PolicyLoadError;
use crate::identity::ClientIdentity;
use crate::mqtt::TopicMatcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use super::matcher::Subject;
use super::rules::{PolicyDocument, PolicyRule};

/// Maximum rules in a snapshot after expansion
pub const MAX_RULES: usize = 10_000;

/// Rule that decided a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub effect: Effect,
    pub rule: Arc<str>,
    pub max_qos: Option<u8>,
}

/// Trie over literal pattern prefixes; each node holds the rules whose
/// literal prefix ends there
#[derive(Debug, Default)]
struct PrefixNode {
    children: HashMap<String, PrefixNode>,
    rules: Vec<usize>,
}

impl PrefixNode {
    fn insert(&mut self, prefix: &[&str], rule: usize) {
        let mut node = self;
        for level in prefix {
            node = node.children.entry((*level).to_string()).or_default();
        }
        node.rules.push(rule);
    }

    /// Rules whose literal prefix is a prefix of the resource
    fn candidates(&self, resource: &str, out: &mut Vec<usize>) {
        let mut node = self;
        out.extend_from_slice(&node.rules);
        for level in resource.split('/') {
            match node.children.get(level) {
                Some(child) => {
                    node = child;
                    out.extend_from_slice(&node.rules);
                }
                None => break,
            }
        }
    }
}

/// Point-in-time view of the full rule set
#[derive(Debug)]
pub struct PolicySnapshot {
    version: u64,
    rules: Vec<PolicyRule>,
    /// One prefix index per operation
    indexes: [PrefixNode; 3],
    role_bindings: HashMap<String, Vec<String>>,
    topic_matcher: TopicMatcher,
    loaded_at: SystemTime,
    source: String,
}

impl PolicySnapshot {
    /// Empty version-0 snapshot; every lookup returns no match
    pub fn empty() -> Self {
        Self {
            version: 0,
            rules: Vec::new(),
            indexes: Default::default(),
            role_bindings: HashMap::new(),
            topic_matcher: TopicMatcher::new(),
            loaded_at: SystemTime::now(),
            source: "empty".to_string(),
        }
    }

    /// Validate and index a policy document. Fails without side effects if any rule is invalid.
    pub fn compile(
        document: &PolicyDocument,
        version: u64,
        source: impl Into<String>,
    ) -> Result<Self, PolicyLoadError> {
        let topic_matcher = TopicMatcher::new();
        let mut rules = Vec::new();
        let mut names = HashSet::new();

        for doc in &document.rules {
            if !names.insert(doc.name.trim()) {
                return Err(PolicyLoadError::invalid_rule(&doc.name, "duplicate rule name"));
            }
            let expanded = PolicyRule::expand(doc, rules.len(), &topic_matcher)?;
            if rules.len() + expanded.len() > MAX_RULES {
                return Err(PolicyLoadError::TooManyRules {
                    max: MAX_RULES,
                    attempted: rules.len() + expanded.len(),
                });
            }
            rules.extend(expanded);
        }

        let mut indexes: [PrefixNode; 3] = Default::default();
        for (idx, rule) in rules.iter().enumerate() {
            let prefix = topic_matcher.literal_prefix(&rule.pattern);
            indexes[rule.operation.index()].insert(&prefix, idx);
        }

        let mut role_bindings = HashMap::new();
        for (principal, roles) in &document.role_bindings {
            let roles: Vec<String> = roles
                .iter()
                .map(|r| r.trim())
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !roles.is_empty() {
                role_bindings.insert(principal.clone(), roles);
            }
        }

        Ok(Self {
            version,
            rules,
            indexes,
            role_bindings,
            topic_matcher,
            loaded_at: SystemTime::now(),
            source: source.into(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn loaded_at(&self) -> SystemTime {
        self.loaded_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Roles bound to the identity's principal. Anonymous clients get none.
    pub fn bound_roles(&self, identity: &ClientIdentity) -> &[String] {
        if identity.is_anonymous() {
            return &[];
        }
        self.role_bindings
            .get(identity.principal())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Find the deciding rule, or `None` when nothing matches
    ///
    /// Among rules for `operation` whose pattern covers `resource` and whose
    /// matcher accepts the identity, the most specific pattern wins; ties go to
    /// the higher priority, then to DENY, then to the earlier rule.
    pub fn lookup(
        &self,
        identity: &ClientIdentity,
        operation: Operation,
        resource: &str,
    ) -> Option<RuleMatch> {
        let subject = Subject {
            identity,
            bound_roles: self.bound_roles(identity),
        };

        let mut candidates = Vec::new();
        self.indexes[operation.index()].candidates(resource, &mut candidates);

        let winner = candidates
            .into_iter()
            .map(|idx| &self.rules[idx])
            .filter(|rule| self.topic_matcher.matches(resource, &rule.pattern))
            .filter(|rule| rule.matcher.matches(&subject))
            .max_by_key(|rule| rule.precedence())?;

        debug!(
            rule = %winner.name,
            pattern = %winner.pattern,
            resource = %resource,
            operation = %operation,
            effect = ?winner.effect,
            version = self.version,
            "Policy rule matched"
        );

        Some(RuleMatch {
            effect: winner.effect,
            rule: winner.name.clone(),
            max_qos: winner.max_qos,
        })
    }
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
