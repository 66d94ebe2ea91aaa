//! Configuration for the mock server.
//!
//! Defines the declarative expectation rules posted to `/_expectation`, the
//! response templates they carry, and the YAML server configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration for a mock server process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Listener settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Expectations installed at startup, oldest first
    #[serde(default)]
    pub expectations: Vec<ExpectationDefinition>,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.validate()?;
        for (i, expectation) in self.expectations.iter().enumerate() {
            expectation
                .validate()
                .map_err(|e| anyhow::anyhow!("Expectation {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// Where the server listens and how it is addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Host name or IP address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port; 0 selects any free port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix prepended to every non-control route
    #[serde(default)]
    pub base_path: Option<String>,

    /// Instance name, used to tell servers apart in logs
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    28080
}

fn default_name() -> String {
    "default".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: None,
            name: default_name(),
        }
    }
}

impl ServerSettings {
    /// `host:port`
    pub fn connection_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the settings.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("Host cannot be empty");
        }
        if let Some(base_path) = &self.base_path {
            if !base_path.starts_with('/') || base_path.ends_with('/') {
                anyhow::bail!(
                    "Base path must start with '/' and must not end with '/': {:?}",
                    base_path
                );
            }
        }
        Ok(())
    }
}

/// A single expectation rule, as sent over the control protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectationDefinition {
    /// Predicates that must all hold (empty = any request)
    #[serde(default)]
    pub matcher: Vec<RequestPredicate>,

    /// Response to return
    pub response: ResponseDefinition,

    /// How many times this rule may answer
    #[serde(default)]
    pub limiter: Limiter,
}

impl ExpectationDefinition {
    pub fn new(response: ResponseDefinition) -> Self {
        Self {
            matcher: Vec::new(),
            response,
            limiter: Limiter::Unlimited,
        }
    }

    /// Add a predicate; all predicates must hold.
    pub fn when(mut self, predicate: RequestPredicate) -> Self {
        self.matcher.push(predicate);
        self
    }

    pub fn times(mut self, times: u32) -> Self {
        self.limiter = Limiter::Exactly { times };
        self
    }

    pub fn once(self) -> Self {
        self.times(1)
    }

    /// Decode a `POST /_expectation` body.
    ///
    /// Keys are checked one at a time so the diagnostic names the first
    /// offending key: `matcher`, then `response`, then `limiter`.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ConfigurationError> {
        let value = if payload.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_slice(payload).map_err(|_| ConfigurationError::NotAnObject)?
        };
        let serde_json::Value::Object(mut fields) = value else {
            return Err(ConfigurationError::NotAnObject);
        };

        let matcher = match fields.remove("matcher") {
            Some(value) => serde_json::from_value(value).map_err(ConfigurationError::matcher)?,
            None => Vec::new(),
        };
        let response = match fields.remove("response") {
            Some(value) => serde_json::from_value(value).map_err(ConfigurationError::response)?,
            None => return Err(ConfigurationError::MissingKey("response")),
        };
        let limiter = match fields.remove("limiter") {
            Some(value) => serde_json::from_value(value).map_err(ConfigurationError::limiter)?,
            None => Limiter::Unlimited,
        };
        if let Some(key) = fields.keys().next() {
            return Err(ConfigurationError::UnknownKey(key.clone()));
        }

        let definition = Self {
            matcher,
            response,
            limiter,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Validate patterns and templates without installing the rule.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        crate::matcher::Predicate::compile(&self.matcher).map_err(ConfigurationError::matcher)?;
        self.response
            .validate()
            .map_err(ConfigurationError::response)?;
        Ok(())
    }
}

/// Usage limiter for an expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Limiter {
    /// Matches any number of times
    #[default]
    Unlimited,
    /// Matches exactly this many times, then answers 410
    Exactly { times: u32 },
}

/// A declarative request predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPredicate {
    /// HTTP method, compared case-insensitively
    Method { value: String },
    /// Request path (relative to the base path, if any)
    Path { matcher: PathMatcher },
    /// Header, looked up case-insensitively
    Header { name: String, matcher: HeaderMatcher },
    /// Query parameter
    Query { name: String, matcher: QueryMatcher },
    /// Form field of a url-encoded body
    Form { name: String, matcher: QueryMatcher },
    /// Request body
    Body { matcher: BodyMatcher },
    /// Every nested predicate holds
    All { predicates: Vec<RequestPredicate> },
    /// At least one nested predicate holds
    Any { predicates: Vec<RequestPredicate> },
    /// The nested predicate does not hold
    Not { predicate: Box<RequestPredicate> },
}

impl RequestPredicate {
    pub fn method(method: impl Into<String>) -> Self {
        RequestPredicate::Method {
            value: method.into(),
        }
    }

    pub fn path(path: impl Into<String>) -> Self {
        RequestPredicate::Path {
            matcher: PathMatcher::Exact { value: path.into() },
        }
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        RequestPredicate::Header {
            name: name.into(),
            matcher: HeaderMatcher::Exact {
                value: value.into(),
            },
        }
    }

    pub fn query(name: impl Into<String>, value: impl Into<String>) -> Self {
        RequestPredicate::Query {
            name: name.into(),
            matcher: QueryMatcher::Exact {
                value: value.into(),
            },
        }
    }

    pub fn any_of(predicates: Vec<RequestPredicate>) -> Self {
        RequestPredicate::Any { predicates }
    }

    pub fn negate(predicate: RequestPredicate) -> Self {
        RequestPredicate::Not {
            predicate: Box::new(predicate),
        }
    }
}

/// Path matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatcher {
    /// Exact path match
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

/// Query parameter and form field matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyMatcher {
    /// Exact body match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path matching
    JsonPath {
        /// JSON path expressions and expected values
        expressions: HashMap<String, serde_json::Value>,
    },
    /// Body must contain substring
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be empty
    Empty,
}

/// Response template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Post-processing applied after status, headers and body
    #[serde(default)]
    pub hook: Option<ResponseHook>,
}

fn default_status() -> u16 {
    200
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: None,
            hook: None,
        }
    }
}

impl ResponseDefinition {
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, content: impl Into<String>) -> Self {
        self.body = Some(ResponseBody::Text {
            content: content.into(),
        });
        self
    }

    pub fn with_json(mut self, content: serde_json::Value) -> Self {
        self.body = Some(ResponseBody::Json { content });
        self
    }

    pub fn with_hook(mut self, hook: ResponseHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_status(self.status)?;
        for (name, value) in &self.headers {
            validate_header_name(name)?;
            http::HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("Invalid value for header {:?}: {}", name, e))?;
        }
        if let Some(body) = &self.body {
            body.to_bytes()?;
        }
        if let Some(hook) = &self.hook {
            hook.validate()?;
        }
        Ok(())
    }
}

fn validate_status(status: u16) -> anyhow::Result<()> {
    if !(100..=599).contains(&status) {
        anyhow::bail!("Invalid status code: {}", status);
    }
    Ok(())
}

fn validate_header_name(name: &str) -> anyhow::Result<()> {
    http::HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid header name {:?}: {}", name, e))?;
    Ok(())
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_string(content)?.into_bytes()),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
        }
    }
}

/// Declarative post-processing hook.
///
/// Every field is a Handlebars template rendered against the recorded
/// request; whatever the hook sets overrides the static template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ResponseHook {
    /// Status override
    #[serde(default)]
    pub status: Option<u16>,

    /// Header overrides (values are templates)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Body override (template)
    #[serde(default)]
    pub body: Option<String>,
}

impl ResponseHook {
    /// Validate the hook: status range and template syntax.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(status) = self.status {
            validate_status(status)?;
        }
        for name in self.headers.keys() {
            validate_header_name(name)?;
        }
        for template in self.headers.values().chain(self.body.iter()) {
            handlebars::Template::compile(template)
                .map_err(|e| anyhow::anyhow!("Invalid template: {}", e))?;
        }
        Ok(())
    }
}
