//! Default credential normalizer
//!
//! Canonicalizes client ID, username/password and certificate claims, and
//! strips credentials from clients outside the configured IP allowlist.

use super::{AuthMethod, ClientIdentity, CredentialNormalizer, RawContext};
use crate::config::IdentityConfig;
use crate::error::{IdentityError, MalformedCredentialError};
use anyhow::Result;
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::debug;

/// Prefix of claims extracted from the client certificate subject
const CERT_CLAIM_PREFIX: &str = "cert.";

/// Default credential normalizer
#[derive(Debug, Clone)]
pub struct Normalizer {
    max_client_id_length: usize,
    ip_allowlist: Vec<IpNet>,
}

impl Normalizer {
    /// Create a normalizer from configuration
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        Ok(Self {
            max_client_id_length: config.max_client_id_length,
            ip_allowlist: config.allowlist_networks()?,
        })
    }

    /// Trimmed client ID, or `None` when absent or unusable
    fn canonical_client_id(&self, raw: Option<&str>) -> Option<String> {
        let id = raw?.trim();
        if id.is_empty() || id.len() > self.max_client_id_length || id.chars().any(char::is_control) {
            return None;
        }
        Some(id.to_string())
    }

    fn parse_ip(raw: &RawContext) -> Option<IpAddr> {
        raw.client_ip
            .as_deref()
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
    }

    fn ip_allowed(&self, ip: Option<IpAddr>) -> bool {
        if self.ip_allowlist.is_empty() {
            return true;
        }
        match ip {
            Some(addr) => self.ip_allowlist.iter().any(|net| net.contains(&addr)),
            None => false,
        }
    }
}

impl CredentialNormalizer for Normalizer {
    fn normalize(&self, raw: &RawContext) -> Result<ClientIdentity, IdentityError> {
        let client_ip = Self::parse_ip(raw);

        let client_id = match self.canonical_client_id(raw.client_id.as_deref()) {
            Some(id) => id,
            None => {
                debug!(client_id = ?raw.client_id, "Missing or malformed client ID, treating as anonymous");
                return Ok(ClientIdentity::anonymous("", client_ip));
            }
        };

        if !self.ip_allowed(client_ip) {
            debug!(client_id = %client_id, client_ip = ?raw.client_ip, "Client IP not in allowlist, discarding credentials");
            return Ok(ClientIdentity::builder(client_id, AuthMethod::Anonymous)
                .client_ip(client_ip)
                .stripped()
                .build());
        }

        let username = canonical_username(raw.username.as_deref())?;

        let mut cert_claims = BTreeMap::new();
        let method = if let Some(subject) = raw.certificate_subject.as_deref() {
            cert_claims = parse_certificate_subject(subject)?;
            AuthMethod::Certificate
        } else if username.is_some() {
            if raw.password.is_some() {
                AuthMethod::Password
            } else {
                AuthMethod::Username
            }
        } else {
            AuthMethod::Anonymous
        };

        // Certificate CN stands in for a missing username
        let username = username.or_else(|| cert_claims.get("cn").cloned());

        let mut builder = ClientIdentity::builder(client_id, method).client_ip(client_ip);
        if !self.ip_allowlist.is_empty() {
            builder = builder.allowlisted();
        }
        if let Some(username) = username {
            builder = builder.username(username);
        }

        for role in &raw.roles {
            let role = role.trim();
            if !role.is_empty() {
                builder = builder.role(role);
            }
        }

        for (name, value) in &raw.attributes {
            let name = name.trim().to_ascii_lowercase();
            // Certificate claims can only come from the certificate
            if name.is_empty() || name.starts_with(CERT_CLAIM_PREFIX) {
                continue;
            }
            builder = builder.claim(name, value.clone());
        }

        for (name, value) in cert_claims {
            builder = builder.claim(format!("{}{}", CERT_CLAIM_PREFIX, name), value);
        }

        Ok(builder.build())
    }

    fn name(&self) -> &str {
        "default"
    }

    fn anonymous_for(&self, raw: &RawContext) -> ClientIdentity {
        let client_id = self
            .canonical_client_id(raw.client_id.as_deref())
            .unwrap_or_default();
        ClientIdentity::anonymous(client_id, Self::parse_ip(raw))
    }
}

fn canonical_username(raw: Option<&str>) -> Result<Option<String>, MalformedCredentialError> {
    let username = match raw.map(str::trim) {
        Some(u) if !u.is_empty() => u,
        _ => return Ok(None),
    };
    if username.chars().any(char::is_control) {
        return Err(MalformedCredentialError::new(
            "username",
            "contains control characters",
        ));
    }
    Ok(Some(username.to_string()))
}

/// Parse an RFC 4514 style subject (`CN=a,O=b\,c`) into lowercase-keyed claims.
///
/// Repeated attributes are joined with `,` in order of appearance.
pub fn parse_certificate_subject(
    subject: &str,
) -> Result<BTreeMap<String, String>, MalformedCredentialError> {
    let malformed = |reason: &str| MalformedCredentialError::new("certificate_subject", reason);

    if subject.trim().is_empty() {
        return Err(malformed("empty subject"));
    }

    let mut claims: BTreeMap<String, String> = BTreeMap::new();
    for component in split_unescaped(subject, ',').map_err(|e| malformed(&e))? {
        let mut parts = split_unescaped(&component, '=').map_err(|e| malformed(&e))?.into_iter();
        let (name, value) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(value), None) => (name, value),
            _ => return Err(malformed(&format!("component '{}' is not NAME=VALUE", component))),
        };

        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            return Err(malformed(&format!("invalid attribute name '{}'", name)));
        }

        let value = unescape(value.trim());
        claims
            .entry(name)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    Ok(claims)
}

/// Split on `sep` unless escaped with a backslash. Escapes are kept.
fn split_unescaped(input: &str, sep: char) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => {
                    current.push('\\');
                    current.push(escaped);
                }
                None => return Err("dangling escape".to_string()),
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    Ok(parts)
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
