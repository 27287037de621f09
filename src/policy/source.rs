//! Policy sources
//!
//! A source supplies a complete [`PolicyDocument`] on every load. Sources may
//! block on I/O; the refresh coordinator runs them off the decision path.
//!
//! Available sources:
//! - [`FilePolicySource`] reads a JSON file
//! - [`HttpPolicySource`] fetches a JSON document from a policy service
//! - [`StaticPolicySource`] holds a document in memory

use crate::config::PolicySourceConfig;
use crate::error::PolicyLoadError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::rules::PolicyDocument;

/// Policy source trait
pub trait PolicySource: Send + Sync {
    /// Load the full rule set
    fn load(&self) -> Result<PolicyDocument, PolicyLoadError>;

    /// Source description for logging
    fn describe(&self) -> String;
}

/// JSON policy file
pub struct FilePolicySource {
    path: PathBuf,
    /// Bindings from configuration; file entries win on conflict
    fallback_bindings: HashMap<String, Vec<String>>,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_bindings: HashMap::new(),
        }
    }

    pub fn with_role_bindings(mut self, bindings: HashMap<String, Vec<String>>) -> Self {
        self.fallback_bindings = bindings;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PolicySource for FilePolicySource {
    fn load(&self) -> Result<PolicyDocument, PolicyLoadError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|source| PolicyLoadError::Io {
            path: self.path.clone(),
            source,
        })?;

        let mut document = PolicyDocument::from_json(&contents)?;
        merge_bindings(&mut document, &self.fallback_bindings);
        Ok(document)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Default request timeout for [`HttpPolicySource`]
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON policy document served over HTTP(S)
///
/// Each load issues one `GET`. The request carries its own timeout so a load
/// abandoned by the refresh coordinator still finishes on its own.
pub struct HttpPolicySource {
    url: String,
    timeout: Duration,
    /// Bindings from configuration; served entries win on conflict
    fallback_bindings: HashMap<String, Vec<String>>,
}

impl HttpPolicySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            fallback_bindings: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_role_bindings(mut self, bindings: HashMap<String, Vec<String>>) -> Self {
        self.fallback_bindings = bindings;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn fetch(&self) -> Result<String, PolicyLoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .build()
            .map_err(|e| PolicyLoadError::Source(format!("failed to build HTTP client: {}", e)))?;

        let response = client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .map_err(|e| PolicyLoadError::Source(format!("GET {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(PolicyLoadError::Source(format!(
                "GET {} returned HTTP {}",
                self.url,
                response.status()
            )));
        }

        response
            .text()
            .map_err(|e| PolicyLoadError::Source(format!("failed to read body from {}: {}", self.url, e)))
    }
}

impl PolicySource for HttpPolicySource {
    fn load(&self) -> Result<PolicyDocument, PolicyLoadError> {
        let body = self.fetch()?;
        let mut document = PolicyDocument::from_json(&body)?;
        merge_bindings(&mut document, &self.fallback_bindings);
        Ok(document)
    }

    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }
}

/// In-memory policy, replaceable at runtime
pub struct StaticPolicySource {
    document: RwLock<PolicyDocument>,
}

impl StaticPolicySource {
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// Replace the document; takes effect on the next refresh
    pub fn replace(&self, document: PolicyDocument) {
        *self.document.write() = document;
    }
}

impl PolicySource for StaticPolicySource {
    fn load(&self) -> Result<PolicyDocument, PolicyLoadError> {
        Ok(self.document.read().clone())
    }

    fn describe(&self) -> String {
        "inline".to_string()
    }
}

fn merge_bindings(document: &mut PolicyDocument, fallback: &HashMap<String, Vec<String>>) {
    for (principal, roles) in fallback {
        document
            .role_bindings
            .entry(principal.clone())
            .or_insert_with(|| roles.clone());
    }
}

/// Build the source selected by configuration: the file if set, then the URL,
/// else inline rules. HTTP requests are bounded by `request_timeout`.
pub fn source_from_config(config: &PolicySourceConfig, request_timeout: Duration) -> Arc<dyn PolicySource> {
    if let Some(path) = &config.file {
        return Arc::new(FilePolicySource::new(path).with_role_bindings(config.role_bindings.clone()));
    }
    if let Some(url) = &config.url {
        return Arc::new(
            HttpPolicySource::new(url)
                .with_timeout(request_timeout)
                .with_role_bindings(config.role_bindings.clone()),
        );
    }
    Arc::new(StaticPolicySource::new(PolicyDocument {
        rules: config.rules.clone(),
        role_bindings: config.role_bindings.clone(),
    }))
}
