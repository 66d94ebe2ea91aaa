//! Template engine for response hooks.
//!
//! Uses Handlebars for template rendering with request context.

use crate::matcher::MatchContext;
use crate::request::RecordedRequest;
use chrono::format::{Item, StrftimeItems};
use handlebars::{
    handlebars_helper, Context, Handlebars, Helper, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use serde::Serialize;
use std::collections::HashMap;

/// Template engine for rendering response hooks.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Context for template rendering.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    /// Path parameters from URL template matching
    pub path: HashMap<String, String>,
    /// Query parameters (first value wins)
    pub query: HashMap<String, String>,
    /// Request headers, keyed by lower-cased name (first value wins)
    pub headers: HashMap<String, String>,
    /// Form fields of a url-encoded body
    pub form: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path, including any base path
    pub request_path: String,
    /// Journal sequence number of the request
    pub sequence: u64,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<serde_json::Value>,
}

fn first_wins<I>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut map = HashMap::new();
    for (key, value) in pairs {
        map.entry(key).or_insert(value);
    }
    map
}

impl TemplateContext {
    pub fn new(request: &RecordedRequest, match_ctx: &MatchContext) -> Self {
        let body = request.body_text().map(String::from);
        let json = body.as_ref().and_then(|s| serde_json::from_str(s).ok());

        Self {
            path: match_ctx.path_params.clone(),
            query: first_wins(request.query_params()),
            headers: first_wins(
                request
                    .headers
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.clone())),
            ),
            form: first_wins(request.form.iter().cloned()),
            captures: match_ctx.captures.clone(),
            method: request.method.clone(),
            request_path: request.path.clone(),
            sequence: request.sequence,
            body,
            json,
        }
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        // Register custom helpers
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Don't escape HTML by default (we're not rendering HTML)
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        ctx: &TemplateContext,
    ) -> Result<String, handlebars::RenderError> {
        self.handlebars.render_template(template, ctx)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

// Custom Handlebars helpers

handlebars_helper!(upper_helper: |value: Json| value.as_str().unwrap_or_default().to_uppercase());
handlebars_helper!(lower_helper: |value: Json| value.as_str().unwrap_or_default().to_lowercase());

// Empty strings and missing values fall back
handlebars_helper!(default_helper: |value: Json, fallback: Json| match value {
    serde_json::Value::Null => fallback.clone(),
    serde_json::Value::String(s) if s.is_empty() => fallback.clone(),
    other => other.clone(),
});

// Pretty-print a value, or a string holding JSON
handlebars_helper!(json_helper: |value: Json| match value {
    serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
        .ok()
        .and_then(|parsed| serde_json::to_string_pretty(&parsed).ok())
        .unwrap_or_else(|| s.clone()),
    other => serde_json::to_string_pretty(other).unwrap_or_default(),
});

fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let (a, b, c, d, e) = (
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffff_ffff_ffff,
    );
    out.write(&format!("{a:08x}-{b:04x}-4{c:03x}-{d:04x}-{e:012x}"))?;
    Ok(())
}

/// `{{now}}` or `{{now "%Y-%m-%d"}}`
fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    // chrono panics while formatting an invalid specifier
    let items: Vec<Item> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(RenderErrorReason::Other(format!("Invalid time format: {format:?}")).into());
    }
    out.write(&chrono::Utc::now().format_with_items(items.iter()).to_string())?;
    Ok(())
}

/// `{{random min max}}`, inclusive, defaulting to 0..=100
fn random_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    use rand::Rng;
    let bound = |i: usize, fallback: i64| h.param(i).and_then(|v| v.value().as_i64()).unwrap_or(fallback);
    let (min, max) = (bound(0, 0), bound(1, 100));
    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}
