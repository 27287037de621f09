//! Policy module
//!
//! Topic-based authorization rules: documents, matchers, compiled snapshots,
//! sources, and the store holding the active snapshot.

mod matcher;
mod rules;
mod snapshot;
mod source;
mod store;

pub use matcher::{CompiledMatcher, MatchConditions, MatchSpec, Subject, MAX_EXPR_LENGTH};
pub use rules::{PolicyDocument, PolicyRule, RuleDocument};
pub use snapshot::{PolicySnapshot, RuleMatch, MAX_RULES};
pub use source::{
    source_from_config, FilePolicySource, HttpPolicySource, PolicySource, StaticPolicySource,
    DEFAULT_HTTP_TIMEOUT,
};
pub use store::{load, PolicyStore};
