//! Response rendering.
//!
//! Turns the response template of a matched expectation into a concrete
//! response: status, then headers, then body, then the hook overrides.

use crate::config::{ResponseDefinition, ResponseHook};
use crate::matcher::MatchContext;
use crate::request::RecordedRequest;
use crate::template::{TemplateContext, TemplateEngine};
use bytes::Bytes;
use tracing::warn;

/// Content type of every response the server writes itself.
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// A fully materialised response.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MockResponse {
    /// Plain-text response, as used for control replies and diagnostics.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), TEXT_PLAIN.to_string())],
            body: Bytes::from(body.into()),
        }
    }

    /// Empty plain-text response.
    pub fn empty(status: u16) -> Self {
        Self::text(status, String::new())
    }

    /// Render a response template against the request that selected it.
    ///
    /// Never fails: a template that cannot be rendered yields a 500.
    pub fn render(
        engine: &TemplateEngine,
        definition: &ResponseDefinition,
        request: &RecordedRequest,
        match_ctx: &MatchContext,
    ) -> Self {
        match Self::try_render(engine, definition, request, match_ctx) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %e,
                    "Failed to render response"
                );
                Self::text(500, format!("Failed to render response: {e}"))
            }
        }
    }

    fn try_render(
        engine: &TemplateEngine,
        definition: &ResponseDefinition,
        request: &RecordedRequest,
        match_ctx: &MatchContext,
    ) -> anyhow::Result<Self> {
        let mut response = Self {
            status: definition.status,
            headers: Vec::new(),
            body: Bytes::new(),
        };

        let mut headers: Vec<_> = definition.headers.iter().collect();
        headers.sort();
        for (name, value) in headers {
            response.set_header(name, value.clone());
        }

        if let Some(body) = &definition.body {
            response.body = Bytes::from(body.to_bytes()?);
            if response.header("content-type").is_none() {
                response.set_header("Content-Type", body.content_type().to_string());
            }
        }

        if let Some(hook) = &definition.hook {
            response.apply_hook(engine, hook, &TemplateContext::new(request, match_ctx))?;
        }

        Ok(response)
    }

    fn apply_hook(
        &mut self,
        engine: &TemplateEngine,
        hook: &ResponseHook,
        ctx: &TemplateContext,
    ) -> anyhow::Result<()> {
        if let Some(status) = hook.status {
            self.status = status;
        }

        let mut headers: Vec<_> = hook.headers.iter().collect();
        headers.sort();
        for (name, template) in headers {
            let value = engine.render(template, ctx)?;
            http::HeaderValue::from_str(&value)
                .map_err(|e| anyhow::anyhow!("Invalid value for header {name:?}: {e}"))?;
            self.set_header(name, value);
        }

        if let Some(template) = &hook.body {
            self.body = Bytes::from(engine.render(template, ctx)?);
        }

        Ok(())
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any header of the same name, keeping its position.
    pub fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(existing) => existing.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn into_http(self) -> http::Result<http::Response<Bytes>> {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.body(self.body)
    }
}
