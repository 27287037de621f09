//! Client identity module
//!
//! Turns the broker-supplied request context into an immutable
//! [`ClientIdentity`] with a stable canonical key for cache lookups.

mod normalizer;

pub use normalizer::{parse_certificate_subject, Normalizer};

use crate::error::IdentityError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::net::IpAddr;
use std::sync::Arc;

/// Role carried by every anonymous identity
pub const ANONYMOUS_ROLE: &str = "anonymous";

/// Raw, unvalidated context handed over by the broker for one operation
#[derive(Debug, Clone, Default)]
pub struct RawContext {
    /// Client ID from CONNECT
    pub client_id: Option<String>,
    /// Username from CONNECT (if provided)
    pub username: Option<String>,
    /// Password from CONNECT (only its presence is used)
    pub password: Option<Vec<u8>>,
    /// Client IP address as reported by the broker
    pub client_ip: Option<String>,
    /// TLS client certificate subject DN, e.g. `CN=device-1,O=Acme`
    pub certificate_subject: Option<String>,
    /// Roles already resolved by the broker's authentication step
    pub roles: Vec<String>,
    /// Extra attributes from the authentication step
    pub attributes: HashMap<String, String>,
}

impl RawContext {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_certificate_subject(mut self, subject: impl Into<String>) -> Self {
        self.certificate_subject = Some(subject.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// How the client identified itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Anonymous,
    /// Username without a password
    Username,
    /// Username and password
    Password,
    /// TLS client certificate
    Certificate,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Anonymous => "anonymous",
            AuthMethod::Username => "username",
            AuthMethod::Password => "password",
            AuthMethod::Certificate => "certificate",
        }
    }
}

impl std::str::FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anonymous" => Ok(AuthMethod::Anonymous),
            "username" => Ok(AuthMethod::Username),
            "password" => Ok(AuthMethod::Password),
            "certificate" => Ok(AuthMethod::Certificate),
            other => Err(format!("unknown auth method '{}'", other)),
        }
    }
}

/// Canonical identity key. Equal keys imply equal identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(Arc<str>);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, canonicalized client identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    client_id: String,
    username: Option<String>,
    method: AuthMethod,
    anonymous: bool,
    client_ip: Option<IpAddr>,
    roles: BTreeSet<String>,
    claims: BTreeMap<String, String>,
    credentials_stripped: bool,
    allowlisted: bool,
    key: IdentityKey,
}

impl ClientIdentity {
    /// Start building an identity for `client_id`
    pub fn builder(client_id: impl Into<String>, method: AuthMethod) -> IdentityBuilder {
        IdentityBuilder {
            client_id: client_id.into(),
            username: None,
            method,
            client_ip: None,
            roles: BTreeSet::new(),
            claims: BTreeMap::new(),
            credentials_stripped: false,
            allowlisted: false,
        }
    }

    /// Anonymous identity; carries only the `anonymous` role
    pub fn anonymous(client_id: impl Into<String>, client_ip: Option<IpAddr>) -> Self {
        let mut builder = Self::builder(client_id, AuthMethod::Anonymous);
        builder.client_ip = client_ip;
        builder.build()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn claims(&self) -> &BTreeMap<String, String> {
        &self.claims
    }

    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }

    /// Whether credentials were discarded because the client IP was not allowlisted
    pub fn credentials_stripped(&self) -> bool {
        self.credentials_stripped
    }

    /// Whether the client IP passed a configured allowlist
    pub fn allowlisted(&self) -> bool {
        self.allowlisted
    }

    /// Name used for role bindings: username, else client ID
    pub fn principal(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.client_id)
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }
}

/// Builder for [`ClientIdentity`]; computes the canonical key on `build`
#[derive(Debug, Clone)]
pub struct IdentityBuilder {
    client_id: String,
    username: Option<String>,
    method: AuthMethod,
    client_ip: Option<IpAddr>,
    roles: BTreeSet<String>,
    claims: BTreeMap<String, String>,
    credentials_stripped: bool,
    allowlisted: bool,
}

impl IdentityBuilder {
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn client_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.client_ip = ip;
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.insert(name.into(), value.into());
        self
    }

    pub(crate) fn stripped(mut self) -> Self {
        self.credentials_stripped = true;
        self
    }

    pub(crate) fn allowlisted(mut self) -> Self {
        self.allowlisted = true;
        self
    }

    pub fn build(self) -> ClientIdentity {
        let anonymous = self.method == AuthMethod::Anonymous || self.client_id.is_empty();

        let (method, username, roles, claims) = if anonymous {
            let mut roles = BTreeSet::new();
            roles.insert(ANONYMOUS_ROLE.to_string());
            (AuthMethod::Anonymous, None, roles, BTreeMap::new())
        } else {
            (self.method, self.username, self.roles, self.claims)
        };

        let key = canonical_key(
            method,
            &self.client_id,
            username.as_deref(),
            self.client_ip,
            &roles,
            &claims,
        );

        ClientIdentity {
            client_id: self.client_id,
            username,
            method,
            anonymous,
            client_ip: self.client_ip,
            roles,
            claims,
            credentials_stripped: self.credentials_stripped,
            allowlisted: self.allowlisted,
            key,
        }
    }
}

/// Length-prefixed encoding of every attribute a matcher can observe
fn canonical_key(
    method: AuthMethod,
    client_id: &str,
    username: Option<&str>,
    client_ip: Option<IpAddr>,
    roles: &BTreeSet<String>,
    claims: &BTreeMap<String, String>,
) -> IdentityKey {
    fn field(out: &mut String, value: &str) {
        let _ = write!(out, "{}:{}|", value.len(), value);
    }

    let mut out = String::with_capacity(64);
    field(&mut out, method.as_str());
    field(&mut out, client_id);
    match username {
        Some(u) => field(&mut out, u),
        None => out.push_str("-|"),
    }
    match client_ip {
        Some(ip) => field(&mut out, &ip.to_string()),
        None => out.push_str("-|"),
    }
    let _ = write!(out, "r{}|", roles.len());
    for role in roles {
        field(&mut out, role);
    }
    let _ = write!(out, "c{}|", claims.len());
    for (name, value) in claims {
        field(&mut out, name);
        field(&mut out, value);
    }

    IdentityKey(Arc::from(out))
}

/// Credential normalizer trait
pub trait CredentialNormalizer: Send + Sync {
    /// Canonicalize the raw context. Must be deterministic and side-effect free.
    fn normalize(&self, raw: &RawContext) -> Result<ClientIdentity, IdentityError>;

    /// Normalizer name for logging
    fn name(&self) -> &str;

    /// Anonymous identity used when `normalize` reports malformed credentials.
    /// Keeps the client ID and IP so address-based rules still apply.
    fn anonymous_for(&self, raw: &RawContext) -> ClientIdentity {
        let client_id = raw
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.chars().any(char::is_control))
            .unwrap_or_default();
        let client_ip = raw
            .client_ip
            .as_deref()
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        ClientIdentity::anonymous(client_id, client_ip)
    }
}
