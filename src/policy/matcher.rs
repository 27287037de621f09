//! Identity matchers for policy rules
//!
//! A matcher is a conjunction of conditions over identity attributes. It can
//! be written as an expression string or as a structured object:
//!
//! ```text
//! role:"device" && claim.site:"plant-a"
//! username~"^sensor-" && ip:"10.0.0.0/8"
//! anonymous
//! *
//! ```

use crate::config::parse_ip_or_net;
use crate::identity::{AuthMethod, ClientIdentity};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum length of a matcher expression
pub const MAX_EXPR_LENGTH: usize = 1024;

/// Matcher as written in a policy document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MatchSpec {
    /// Expression form, e.g. `role:"device"`
    Expression(String),
    /// Structured form
    Conditions(MatchConditions),
}

impl Default for MatchSpec {
    fn default() -> Self {
        MatchSpec::Conditions(MatchConditions::default())
    }
}

/// Structured matcher (all present conditions must hold)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct MatchConditions {
    /// Match by exact username
    pub username: Option<String>,
    /// Match by username regex
    pub username_regex: Option<String>,
    /// Match by exact client ID
    pub client_id: Option<String>,
    /// Match by client ID regex
    pub client_id_regex: Option<String>,
    /// Match by client IP (CIDR notation supported)
    pub client_ip: Option<String>,
    /// Match if the identity has any of these roles
    pub roles: Option<Vec<String>>,
    /// Match by authentication method
    pub method: Option<AuthMethod>,
    /// Claims that must be present with exactly these values
    pub claims: BTreeMap<String, String>,
    /// Match only anonymous (true) or only identified (false) clients
    pub anonymous: Option<bool>,
}

/// Identity as seen by a matcher: normalized identity plus roles bound by the policy
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub identity: &'a ClientIdentity,
    pub bound_roles: &'a [String],
}

impl<'a> Subject<'a> {
    fn has_role(&self, role: &str) -> bool {
        self.identity.has_role(role) || self.bound_roles.iter().any(|r| r == role)
    }

    fn roles(&self) -> impl Iterator<Item = &'a str> + 'a {
        let identity: &'a ClientIdentity = self.identity;
        let bound_roles: &'a [String] = self.bound_roles;
        identity
            .roles()
            .iter()
            .map(String::as_str)
            .chain(bound_roles.iter().map(String::as_str))
    }
}

/// A single compiled condition
#[derive(Debug, Clone)]
enum Condition {
    Anonymous(bool),
    ClientId(String),
    ClientIdRegex(Regex),
    Username(String),
    UsernameRegex(Regex),
    AnyRole(Vec<String>),
    RoleRegex(Regex),
    Method(AuthMethod),
    ClientIp(IpNet),
    Claim { name: String, value: String },
    ClaimRegex { name: String, regex: Regex },
}

impl Condition {
    fn matches(&self, subject: &Subject<'_>) -> bool {
        let identity = subject.identity;
        match self {
            Condition::Anonymous(expected) => identity.is_anonymous() == *expected,
            Condition::ClientId(id) => identity.client_id() == id,
            Condition::ClientIdRegex(regex) => regex.is_match(identity.client_id()),
            Condition::Username(name) => identity.username() == Some(name.as_str()),
            Condition::UsernameRegex(regex) => {
                identity.username().map(|u| regex.is_match(u)).unwrap_or(false)
            }
            Condition::AnyRole(roles) => roles.iter().any(|r| subject.has_role(r)),
            Condition::RoleRegex(regex) => subject.roles().any(|r| regex.is_match(r)),
            Condition::Method(method) => identity.method() == *method,
            Condition::ClientIp(net) => identity
                .client_ip()
                .map(|addr| net.contains(&addr))
                .unwrap_or(false),
            Condition::Claim { name, value } => identity.claim(name) == Some(value.as_str()),
            Condition::ClaimRegex { name, regex } => identity
                .claim(name)
                .map(|v| regex.is_match(v))
                .unwrap_or(false),
        }
    }
}

/// Compiled matcher for efficient evaluation
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    conditions: Vec<Condition>,
    source: String,
}

impl CompiledMatcher {
    /// Matcher that accepts every identity
    pub fn any() -> Self {
        Self {
            conditions: Vec::new(),
            source: "*".to_string(),
        }
    }

    /// Compile a matcher from its document form
    pub fn compile(spec: &MatchSpec) -> Result<Self, String> {
        match spec {
            MatchSpec::Expression(expr) => Self::parse(expr),
            MatchSpec::Conditions(conditions) => Self::from_conditions(conditions),
        }
    }

    /// Parse an expression string
    pub fn parse(expr: &str) -> Result<Self, String> {
        if expr.len() > MAX_EXPR_LENGTH {
            return Err(format!(
                "expression too long: {} characters (max {})",
                expr.len(),
                MAX_EXPR_LENGTH
            ));
        }

        let trimmed = expr.trim();
        if trimmed == "*" {
            return Ok(Self::any());
        }
        if trimmed.is_empty() {
            return Err("empty matcher expression".to_string());
        }

        let mut parser = ExprParser::new(trimmed);
        let mut conditions = Vec::new();
        loop {
            conditions.push(parser.term()?);
            parser.skip_ws();
            if parser.at_end() {
                break;
            }
            parser.expect("&&")?;
        }

        Ok(Self {
            conditions,
            source: trimmed.to_string(),
        })
    }

    fn from_conditions(spec: &MatchConditions) -> Result<Self, String> {
        let mut conditions = Vec::new();

        // Exact values take precedence over regexes, as in the expression form
        match (&spec.username, &spec.username_regex) {
            (Some(exact), _) => conditions.push(Condition::Username(exact.clone())),
            (None, Some(pattern)) => conditions.push(Condition::UsernameRegex(
                compile_regex(pattern).map_err(|e| format!("Invalid username regex: {}", e))?,
            )),
            (None, None) => {}
        }

        match (&spec.client_id, &spec.client_id_regex) {
            (Some(exact), _) => conditions.push(Condition::ClientId(exact.clone())),
            (None, Some(pattern)) => conditions.push(Condition::ClientIdRegex(
                compile_regex(pattern).map_err(|e| format!("Invalid client_id regex: {}", e))?,
            )),
            (None, None) => {}
        }

        if let Some(ref ip) = spec.client_ip {
            let net = parse_ip_or_net(ip).map_err(|e| e.to_string())?;
            conditions.push(Condition::ClientIp(net));
        }

        if let Some(ref roles) = spec.roles {
            if roles.is_empty() {
                return Err("roles must not be empty".to_string());
            }
            conditions.push(Condition::AnyRole(roles.clone()));
        }

        if let Some(method) = spec.method {
            conditions.push(Condition::Method(method));
        }

        for (name, value) in &spec.claims {
            conditions.push(Condition::Claim {
                name: name.to_ascii_lowercase(),
                value: value.clone(),
            });
        }

        if let Some(anonymous) = spec.anonymous {
            conditions.push(Condition::Anonymous(anonymous));
        }

        let source = if conditions.is_empty() {
            "*".to_string()
        } else {
            format!("{} condition(s)", conditions.len())
        };

        Ok(Self { conditions, source })
    }

    /// Check if every condition holds for the subject
    pub fn matches(&self, subject: &Subject<'_>) -> bool {
        self.conditions.iter().all(|c| c.matches(subject))
    }

    /// Whether this matcher accepts every identity
    pub fn is_any(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Display for CompiledMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(pattern)
}

fn build_condition(key: &str, op: char, value: String) -> Result<Condition, String> {
    let regex = |value: &str| compile_regex(value).map_err(|e| format!("Invalid regex for '{}': {}", key, e));

    match (key, op) {
        ("client-id", ':') => Ok(Condition::ClientId(value)),
        ("client-id", '~') => Ok(Condition::ClientIdRegex(regex(&value)?)),
        ("username", ':') => Ok(Condition::Username(value)),
        ("username", '~') => Ok(Condition::UsernameRegex(regex(&value)?)),
        ("role", ':') => Ok(Condition::AnyRole(vec![value])),
        ("role", '~') => Ok(Condition::RoleRegex(regex(&value)?)),
        ("method", ':') => value.parse().map(Condition::Method),
        ("ip", ':') => parse_ip_or_net(&value)
            .map(Condition::ClientIp)
            .map_err(|e| e.to_string()),
        (claim, op) if claim.starts_with("claim.") && claim.len() > "claim.".len() => {
            let name = claim["claim.".len()..].to_ascii_lowercase();
            if op == '~' {
                Ok(Condition::ClaimRegex {
                    name,
                    regex: regex(&value)?,
                })
            } else {
                Ok(Condition::Claim { name, value })
            }
        }
        ("method", '~') | ("ip", '~') => Err(format!("'{}' does not support regex matching", key)),
        _ => Err(format!("unknown matcher key '{}'", key)),
    }
}

/// Hand-written scanner for the conjunction-only expression grammar
struct ExprParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.bump();
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), String> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(format!("expected '{}' at position {}", token, self.pos))
        }
    }

    fn key(&mut self) -> Result<&'a str, String> {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
            .unwrap_or(false)
        {
            self.bump();
        }
        if self.pos == start {
            return Err(format!("expected attribute name at position {}", start));
        }
        Ok(&self.input[start..self.pos])
    }

    fn quoted(&mut self) -> Result<String, String> {
        self.expect("\"")?;
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some(c) => value.push(c),
                    None => return Err("unterminated escape".to_string()),
                },
                Some(c) => value.push(c),
                None => return Err("unterminated string".to_string()),
            }
        }
    }

    fn term(&mut self) -> Result<Condition, String> {
        self.skip_ws();
        let key = self.key()?;
        self.skip_ws();

        match self.peek() {
            Some(op @ (':' | '~')) => {
                self.bump();
                self.skip_ws();
                let value = self.quoted()?;
                build_condition(key, op, value)
            }
            _ if key == "anonymous" => Ok(Condition::Anonymous(true)),
            _ => Err(format!("expected ':' or '~' after '{}'", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClientIdentity;

    fn device() -> ClientIdentity {
        ClientIdentity::builder("sensor-001", AuthMethod::Password)
            .username("sensor-001")
            .client_ip(Some("10.1.2.3".parse().unwrap()))
            .role("device")
            .claim("site", "plant-a")
            .build()
    }

    fn subject(identity: &ClientIdentity) -> Subject<'_> {
        Subject {
            identity,
            bound_roles: &[],
        }
    }

    #[test]
    fn test_role_expression() {
        let identity = device();
        let matcher = CompiledMatcher::parse(r#"role:"device""#).unwrap();
        assert!(matcher.matches(&subject(&identity)));

        let matcher = CompiledMatcher::parse(r#"role:"admin""#).unwrap();
        assert!(!matcher.matches(&subject(&identity)));
    }

    #[test]
    fn test_conjunction() {
        let identity = device();
        let matcher = CompiledMatcher::parse(
            r#"username~"^sensor-" && ip:"10.0.0.0/8" && claim.site:"plant-a" && method:"password""#,
        )
        .unwrap();
        assert!(matcher.matches(&subject(&identity)));

        let matcher = CompiledMatcher::parse(r#"username~"^sensor-" && claim.site:"plant-b""#).unwrap();
        assert!(!matcher.matches(&subject(&identity)));
    }

    #[test]
    fn test_anonymous_and_wildcard() {
        let anonymous = ClientIdentity::anonymous("c1", None);
        let identity = device();

        let matcher = CompiledMatcher::parse("anonymous").unwrap();
        assert!(matcher.matches(&subject(&anonymous)));
        assert!(!matcher.matches(&subject(&identity)));

        let any = CompiledMatcher::parse(" * ").unwrap();
        assert!(any.is_any());
        assert!(any.matches(&subject(&anonymous)));
    }

    #[test]
    fn test_bound_roles() {
        let identity = device();
        let bound = vec!["admin".to_string()];
        let matcher = CompiledMatcher::parse(r#"role:"admin""#).unwrap();

        assert!(!matcher.matches(&subject(&identity)));
        assert!(matcher.matches(&Subject {
            identity: &identity,
            bound_roles: &bound,
        }));
    }

    #[test]
    fn test_quoted_escapes() {
        let identity = ClientIdentity::builder("a\"b", AuthMethod::Username).build();
        let matcher = CompiledMatcher::parse(r#"client-id:"a\"b""#).unwrap();
        assert!(matcher.matches(&subject(&identity)));
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "",
            "role",
            r#"role:device"#,
            r#"role:"device" ||  role:"x""#,
            r#"colour:"red""#,
            r#"ip~"10\.""#,
            r#"ip:"not-an-ip""#,
            r#"username~"(""#,
            r#"role:"unterminated"#,
            r#"method:"telepathy""#,
        ] {
            assert!(CompiledMatcher::parse(bad).is_err(), "expected error for {:?}", bad);
        }

        let long = format!(r#"role:"{}""#, "x".repeat(MAX_EXPR_LENGTH));
        assert!(CompiledMatcher::parse(&long).is_err());
    }

    #[test]
    fn test_structured_conditions() {
        let identity = device();
        let spec = MatchSpec::Conditions(MatchConditions {
            username_regex: Some("^sensor-.*".to_string()),
            client_ip: Some("10.1.0.0/16".to_string()),
            roles: Some(vec!["admin".to_string(), "device".to_string()]),
            ..Default::default()
        });
        let matcher = CompiledMatcher::compile(&spec).unwrap();
        assert!(matcher.matches(&subject(&identity)));

        let spec = MatchSpec::Conditions(MatchConditions {
            anonymous: Some(true),
            ..Default::default()
        });
        assert!(!CompiledMatcher::compile(&spec).unwrap().matches(&subject(&identity)));

        let bad = MatchSpec::Conditions(MatchConditions {
            roles: Some(vec![]),
            ..Default::default()
        });
        assert!(CompiledMatcher::compile(&bad).is_err());
    }

    #[test]
    fn test_match_spec_deserialization() {
        let expr: MatchSpec = serde_json::from_str(r#""role:\"device\"""#).unwrap();
        assert_eq!(expr, MatchSpec::Expression(r#"role:"device""#.to_string()));

        let structured: MatchSpec =
            serde_json::from_str(r#"{"username-regex": "^sensor-", "claims": {"site": "a"}}"#).unwrap();
        match structured {
            MatchSpec::Conditions(c) => {
                assert_eq!(c.username_regex.as_deref(), Some("^sensor-"));
                assert_eq!(c.claims["site"], "a");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
