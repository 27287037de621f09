//! MQTT topic handling
//!
//! Topic wildcard matching and pattern ranking for the policy engine.

mod topic;

pub use topic::{Specificity, TopicMatcher, MAX_TOPIC_LENGTH};
