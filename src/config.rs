//! Configuration types for the MQTT authorization engine
//!
//! Provides JSON-serializable configuration for identity normalization,
//! the decision cache, policy refresh and the policy source.

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::RuleDocument;

/// MQTT Authorization Engine Configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthzConfig {
    /// Effect applied when no policy rule matches (fail-closed by default)
    pub default_effect: Effect,

    /// Identity normalization settings
    pub identity: IdentityConfig,

    /// Decision cache settings
    pub cache: CacheConfig,

    /// Policy refresh schedule
    pub refresh: RefreshConfig,

    /// Where policy rules come from
    pub policy: PolicySourceConfig,
}

impl AuthzConfig {
    /// Load and validate configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.enabled && self.cache.max_entries == 0 {
            bail!("cache.max-entries must be greater than zero when the cache is enabled");
        }
        if self.cache.shards == 0 {
            bail!("cache.shards must be greater than zero");
        }
        if self.refresh.timeout_ms == 0 {
            bail!("refresh.timeout-ms must be greater than zero");
        }
        if let Some(url) = &self.policy.url {
            if self.policy.file.is_some() {
                bail!("policy.file and policy.url are mutually exclusive");
            }
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("policy.url must be an http:// or https:// URL");
            }
        }
        self.identity
            .allowlist_networks()
            .context("Invalid identity.ip-allowlist")?;
        Ok(())
    }
}

// ============================================================================
// Shared enums
// ============================================================================

/// Effect of a policy rule (and of the no-match default)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    Deny,
    Allow,
}

/// Broker operation being authorized
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Connect,
    Publish,
    Subscribe,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Connect, Operation::Publish, Operation::Subscribe];

    pub(crate) fn index(self) -> usize {
        match self {
            Operation::Connect => 0,
            Operation::Publish => 1,
            Operation::Subscribe => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Publish => "publish",
            Operation::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "connect" => Ok(Operation::Connect),
            "publish" => Ok(Operation::Publish),
            "subscribe" => Ok(Operation::Subscribe),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

// ============================================================================
// Identity Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IdentityConfig {
    /// Client IPs/CIDRs allowed to present credentials (empty = no restriction)
    #[serde(default)]
    pub ip_allowlist: Vec<String>,

    /// Maximum client ID length; longer IDs are treated as malformed
    #[serde(default = "default_max_client_id_len")]
    pub max_client_id_length: usize,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ip_allowlist: Vec::new(),
            max_client_id_length: default_max_client_id_len(),
        }
    }
}

impl IdentityConfig {
    /// Parse the allowlist into networks. Bare addresses become host networks.
    pub fn allowlist_networks(&self) -> Result<Vec<IpNet>> {
        self.ip_allowlist
            .iter()
            .map(|entry| parse_ip_or_net(entry).with_context(|| format!("'{}'", entry)))
            .collect()
    }
}

/// Parse a CIDR or a single IP address into an `IpNet`
pub(crate) fn parse_ip_or_net(value: &str) -> Result<IpNet> {
    let value = value.trim();
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    let addr: std::net::IpAddr = value
        .parse()
        .with_context(|| format!("Invalid IP/CIDR: {}", value))?;
    Ok(IpNet::from(addr))
}

// ============================================================================
// Cache Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Cache decisions at all
    pub enabled: bool,

    /// Maximum cached decisions across all shards
    pub max_entries: usize,

    /// Time-to-live of a cached decision in milliseconds
    pub ttl_ms: u64,

    /// Number of independently locked shards
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl_ms: 60_000,
            shards: 16,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

// ============================================================================
// Refresh Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RefreshConfig {
    /// Seconds between periodic reloads (0 = only on demand)
    pub interval_seconds: u64,

    /// Upper bound for a single policy load
    #[serde(default = "default_refresh_timeout")]
    pub timeout_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            timeout_ms: default_refresh_timeout(),
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_seconds > 0).then(|| Duration::from_secs(self.interval_seconds))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Policy Source Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct PolicySourceConfig {
    /// Load rules from this JSON file (takes precedence over inline rules)
    pub file: Option<PathBuf>,

    /// Fetch rules from this HTTP(S) URL when no file is configured
    pub url: Option<String>,

    /// Inline rules, used when no file is configured
    #[serde(default)]
    pub rules: Vec<RuleDocument>,

    /// Principal to extra roles; merged into file documents (file wins)
    #[serde(default)]
    pub role_bindings: HashMap<String, Vec<String>>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_max_client_id_len() -> usize {
    128
}

fn default_refresh_timeout() -> u64 {
    5000
}
