//! MQTT topic matching with wildcards
//!
//! Implements MQTT topic filter matching per the MQTT 3.1.1 and 5.0 specifications.
//! Supports single-level (+) and multi-level (#) wildcards, and ranks patterns
//! by how specific they are.

/// Maximum length of a topic or topic filter (MQTT UTF-8 string limit)
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// How specific a topic pattern is. Greater compares as more specific.
///
/// Ordered by leading literal levels, then total literal levels, then
/// whether the pattern is free of a multi-level wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Specificity {
    pub prefix_levels: usize,
    pub literal_levels: usize,
    pub bounded: bool,
}

/// Topic matcher for MQTT topic filters
#[derive(Debug, Clone)]
pub struct TopicMatcher;

impl TopicMatcher {
    /// Create a new topic matcher
    pub fn new() -> Self {
        Self
    }

    /// Check if a resource is covered by a policy pattern
    ///
    /// # Arguments
    /// * `resource` - A topic name, or a topic filter for SUBSCRIBE
    /// * `pattern` - The policy pattern (may contain + and # wildcards)
    ///
    /// # MQTT Wildcard Rules
    /// * `+` matches exactly one topic level, but never a `#` level of a filter
    /// * `#` matches zero or more topic levels (must be last level)
    /// * A wildcard in the first level does not match topics starting with `$`
    ///
    /// # Examples
    /// ```
    /// use sentinel_mqtt_authz::mqtt::TopicMatcher;
    ///
    /// let matcher = TopicMatcher::new();
    /// assert!(matcher.matches("sensors/temp/living-room", "sensors/+/living-room"));
    /// assert!(matcher.matches("sensors/temp/living-room", "sensors/#"));
    /// assert!(!matcher.matches("sensors/temp/bedroom", "sensors/+/living-room"));
    /// assert!(!matcher.matches("sensors/#", "sensors/+"));
    /// ```
    pub fn matches(&self, resource: &str, pattern: &str) -> bool {
        let resource_levels: Vec<&str> = resource.split('/').collect();
        let pattern_levels: Vec<&str> = pattern.split('/').collect();

        if resource.starts_with('$') && matches!(pattern_levels[0], "+" | "#") {
            return false;
        }

        self.match_levels(&resource_levels, &pattern_levels)
    }

    fn match_levels(&self, resource: &[&str], pattern: &[&str]) -> bool {
        let mut r_idx = 0;
        let mut p_idx = 0;

        while p_idx < pattern.len() {
            match pattern[p_idx] {
                "#" => {
                    // # matches everything remaining (must be last in pattern)
                    return p_idx == pattern.len() - 1;
                }
                "+" => {
                    // + matches exactly one level, and a filter's # spans many
                    if r_idx >= resource.len() || resource[r_idx] == "#" {
                        return false;
                    }
                    r_idx += 1;
                    p_idx += 1;
                }
                level => {
                    if r_idx >= resource.len() || resource[r_idx] != level {
                        return false;
                    }
                    r_idx += 1;
                    p_idx += 1;
                }
            }
        }

        r_idx == resource.len()
    }

    /// Levels of a pattern before its first wildcard
    pub fn literal_prefix<'a>(&self, pattern: &'a str) -> Vec<&'a str> {
        pattern
            .split('/')
            .take_while(|level| !matches!(*level, "+" | "#"))
            .collect()
    }

    /// Rank a pattern for longest-specific-prefix resolution
    pub fn specificity(&self, pattern: &str) -> Specificity {
        let levels: Vec<&str> = pattern.split('/').collect();
        let is_wildcard = |level: &&str| matches!(*level, "+" | "#");

        Specificity {
            prefix_levels: levels.iter().take_while(|l| !is_wildcard(l)).count(),
            literal_levels: levels.iter().filter(|l| !is_wildcard(l)).count(),
            bounded: levels.last().map(|l| *l != "#").unwrap_or(true),
        }
    }

    /// Check if a topic filter is valid
    ///
    /// # Rules
    /// * `#` must be the last character and preceded by `/` (or be the only character)
    /// * `+` must be the entire level (surrounded by `/` or at start/end)
    /// * Empty levels are not allowed (no `//`)
    pub fn is_valid_filter(&self, filter: &str) -> bool {
        if filter.is_empty() || filter.len() > MAX_TOPIC_LENGTH || filter.contains('\0') {
            return false;
        }

        let levels: Vec<&str> = filter.split('/').collect();

        for (i, level) in levels.iter().enumerate() {
            if level.is_empty() {
                return false;
            }

            if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
                return false;
            }

            if level.contains('+') && *level != "+" {
                return false;
            }
        }

        true
    }

    /// Check if a topic name is valid (no wildcards allowed)
    pub fn is_valid_topic(&self, topic: &str) -> bool {
        if topic.is_empty() || topic.len() > MAX_TOPIC_LENGTH || topic.contains('\0') {
            return false;
        }

        if topic.contains('+') || topic.contains('#') {
            return false;
        }

        !topic.split('/').any(|level| level.is_empty())
    }

    /// Check if a topic is a system topic (starts with $)
    pub fn is_system_topic(&self, topic: &str) -> bool {
        topic.starts_with('$')
    }
}

impl Default for TopicMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let matcher = TopicMatcher::new();
        assert!(matcher.matches("sensors/temp", "sensors/temp"));
        assert!(!matcher.matches("sensors/temp", "sensors/humidity"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let matcher = TopicMatcher::new();

        assert!(matcher.matches("sensors/temp", "sensors/+"));
        assert!(matcher.matches("sensors/temp/living", "+/temp/living"));
        assert!(matcher.matches("a/b/c", "a/+/c"));

        assert!(!matcher.matches("sensors", "sensors/+"));
        assert!(!matcher.matches("sensors/temp/extra", "sensors/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let matcher = TopicMatcher::new();

        assert!(matcher.matches("sensors", "sensors/#"));
        assert!(matcher.matches("sensors/temp", "sensors/#"));
        assert!(matcher.matches("sensors/temp/living/zone1", "sensors/#"));
        assert!(matcher.matches("anything", "#"));
        assert!(matcher.matches("a/b/c/d", "#"));
    }

    #[test]
    fn test_filter_resources() {
        let matcher = TopicMatcher::new();

        // Subscribing to a filter is allowed only if the pattern covers it
        assert!(matcher.matches("sensors/+", "sensors/#"));
        assert!(matcher.matches("sensors/#", "sensors/#"));
        assert!(matcher.matches("sensors/+", "sensors/+"));
        assert!(!matcher.matches("sensors/#", "sensors/+"));
        assert!(!matcher.matches("#", "sensors/#"));
        assert!(!matcher.matches("sensors/+", "sensors/temp"));
    }

    #[test]
    fn test_system_topics() {
        let matcher = TopicMatcher::new();

        assert!(matcher.is_system_topic("$SYS/broker/clients"));
        assert!(!matcher.is_system_topic("sensors/temp"));

        assert!(matcher.matches("$SYS/broker", "$SYS/+"));
        assert!(matcher.matches("$SYS/broker", "$SYS/#"));
        assert!(!matcher.matches("$SYS/broker", "#"));
        assert!(!matcher.matches("$SYS/broker", "+/broker"));
    }

    #[test]
    fn test_specificity_ordering() {
        let matcher = TopicMatcher::new();

        let exact = matcher.specificity("sensors/temp1");
        let single = matcher.specificity("sensors/+/data");
        let multi = matcher.specificity("sensors/#");
        let plus = matcher.specificity("sensors/+");
        let root = matcher.specificity("#");

        assert!(exact > single);
        assert!(single > multi);
        assert!(plus > multi);
        assert!(multi > root);
        assert_eq!(matcher.specificity("a/+"), matcher.specificity("b/+"));
    }

    #[test]
    fn test_literal_prefix() {
        let matcher = TopicMatcher::new();
        assert_eq!(matcher.literal_prefix("sensors/+/data"), vec!["sensors"]);
        assert_eq!(matcher.literal_prefix("a/b/c"), vec!["a", "b", "c"]);
        assert!(matcher.literal_prefix("#").is_empty());
    }

    #[test]
    fn test_valid_filters() {
        let matcher = TopicMatcher::new();

        assert!(matcher.is_valid_filter("sensors/temp"));
        assert!(matcher.is_valid_filter("sensors/+"));
        assert!(matcher.is_valid_filter("sensors/#"));
        assert!(matcher.is_valid_filter("+/temp"));
        assert!(matcher.is_valid_filter("#"));
        assert!(matcher.is_valid_filter("+"));

        assert!(!matcher.is_valid_filter(""));
        assert!(!matcher.is_valid_filter("sensors//temp"));
        assert!(!matcher.is_valid_filter("sensors/temp+1"));
        assert!(!matcher.is_valid_filter("sensors/#/temp"));
        assert!(!matcher.is_valid_filter("sensors/temp#"));
    }

    #[test]
    fn test_valid_topics() {
        let matcher = TopicMatcher::new();

        assert!(matcher.is_valid_topic("sensors/temp"));
        assert!(matcher.is_valid_topic("$SYS/broker/clients"));

        assert!(!matcher.is_valid_topic("sensors/+"));
        assert!(!matcher.is_valid_topic("sensors/#"));
        assert!(!matcher.is_valid_topic(""));
        assert!(!matcher.is_valid_topic("sensors//temp"));
    }
}
