//! Error types for identity normalization and policy loading

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A credential field was present but structurally invalid
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed credential field `{field}`: {reason}")]
pub struct MalformedCredentialError {
    /// Raw context field that failed to parse
    pub field: &'static str,
    /// What was wrong with it
    pub reason: String,
}

impl MalformedCredentialError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors a credential normalizer can return
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Bad input; recovered by treating the client as anonymous
    #[error(transparent)]
    Malformed(#[from] MalformedCredentialError),

    /// The normalizer could not do its job; the decision fails safe
    #[error("identity normalizer unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while loading or compiling a policy snapshot
#[derive(Debug, Error)]
pub enum PolicyLoadError {
    #[error("failed to read policy file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("policy has too many rules: {attempted} (max {max})")]
    TooManyRules { max: usize, attempted: usize },

    #[error("policy load timed out after {0:?}")]
    Timeout(Duration),

    #[error("policy load was cancelled")]
    Cancelled,

    #[error("policy source error: {0}")]
    Source(String),
}

impl PolicyLoadError {
    pub(crate) fn invalid_rule(rule: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}
