//! Request matching logic.
//!
//! Compiles declarative [`RequestPredicate`]s once, at insertion time, and
//! evaluates them against recorded requests.

use crate::config::{BodyMatcher, HeaderMatcher, PathMatcher, QueryMatcher, RequestPredicate};
use crate::request::RecordedRequest;
use jsonpath_rust::JsonPath;
use regex::Regex;
use std::collections::HashMap;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// A compiled predicate list. Every check must hold.
#[derive(Debug)]
pub struct Predicate {
    checks: Vec<Check>,
}

#[derive(Debug)]
enum Check {
    Method(String),
    Path(CompiledPathMatcher),
    Header {
        name: String,
        matcher: CompiledHeaderMatcher,
    },
    Query {
        name: String,
        matcher: CompiledValueMatcher,
    },
    Form {
        name: String,
        matcher: CompiledValueMatcher,
    },
    Body(CompiledBodyMatcher),
    All(Vec<Check>),
    Any(Vec<Check>),
    Not(Box<Check>),
}

#[derive(Debug)]
enum CompiledPathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
    Template(PathTemplate),
}

#[derive(Debug)]
enum CompiledValueMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
}

#[derive(Debug)]
enum CompiledHeaderMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

#[derive(Debug)]
enum CompiledBodyMatcher {
    Exact(String),
    Regex(Regex),
    JsonPath(Vec<(JsonPath, serde_json::Value)>),
    Contains(String),
    Json,
    Empty,
}

#[derive(Debug)]
struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Debug)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut param_name: Option<String> = None;

        for ch in template.chars() {
            match param_name.take() {
                Some(name) if ch == '}' => {
                    if name.is_empty() {
                        return Err(format!("Empty parameter name in template {template:?}"));
                    }
                    segments.push(TemplateSegment::Param(name));
                }
                Some(mut name) => {
                    name.push(ch);
                    param_name = Some(name);
                }
                None if ch == '{' => {
                    if !current.is_empty() {
                        segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
                    }
                    param_name = Some(String::new());
                }
                None => current.push(ch),
            }
        }

        if param_name.is_some() {
            return Err(format!("Unclosed parameter in template {template:?}"));
        }
        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        Ok(Self { segments })
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut remaining = path;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => {
                    remaining = remaining.strip_prefix(lit.as_str())?;
                }
                TemplateSegment::Param(name) => {
                    // A parameter runs up to the next literal, or to the
                    // next slash when nothing follows it.
                    let end_pos = match self.segments.get(i + 1) {
                        Some(TemplateSegment::Literal(next_lit)) => remaining.find(next_lit.as_str())?,
                        _ => remaining.find('/').unwrap_or(remaining.len()),
                    };

                    if end_pos == 0 {
                        return None;
                    }

                    params.insert(name.clone(), remaining[..end_pos].to_string());
                    remaining = &remaining[end_pos..];
                }
            }
        }

        // Must consume entire path
        if remaining.is_empty() {
            Some(params)
        } else {
            None
        }
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, String> {
    Regex::new(pattern).map_err(|e| format!("Invalid regex: {}", e))
}

impl Predicate {
    /// Compile a predicate list, validating every pattern it contains.
    pub fn compile(predicates: &[RequestPredicate]) -> Result<Self, String> {
        let checks = predicates
            .iter()
            .map(compile_check)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { checks })
    }

    /// Evaluate against a request. `path` is the request path as rules see
    /// it, i.e. with any base path removed.
    pub fn matches(&self, request: &RecordedRequest, path: &str) -> Option<MatchContext> {
        let mut context = MatchContext::default();
        if self
            .checks
            .iter()
            .all(|check| check.evaluate(request, path, &mut context))
        {
            Some(context)
        } else {
            None
        }
    }
}

fn compile_check(predicate: &RequestPredicate) -> Result<Check, String> {
    Ok(match predicate {
        RequestPredicate::Method { value } => Check::Method(value.clone()),
        RequestPredicate::Path { matcher } => Check::Path(match matcher {
            PathMatcher::Exact { value } => CompiledPathMatcher::Exact(value.clone()),
            PathMatcher::Prefix { value } => CompiledPathMatcher::Prefix(value.clone()),
            PathMatcher::Regex { pattern } => CompiledPathMatcher::Regex(compile_regex(pattern)?),
            PathMatcher::Glob { pattern } => {
                let glob =
                    globset::Glob::new(pattern).map_err(|e| format!("Invalid glob: {}", e))?;
                CompiledPathMatcher::Glob(glob.compile_matcher())
            }
            PathMatcher::Template { template } => {
                CompiledPathMatcher::Template(PathTemplate::parse(template)?)
            }
        }),
        RequestPredicate::Header { name, matcher } => Check::Header {
            name: name.clone(),
            matcher: match matcher {
                HeaderMatcher::Exact { value } => CompiledHeaderMatcher::Exact(value.clone()),
                HeaderMatcher::Regex { pattern } => {
                    CompiledHeaderMatcher::Regex(compile_regex(pattern)?)
                }
                HeaderMatcher::Present => CompiledHeaderMatcher::Present,
                HeaderMatcher::Absent => CompiledHeaderMatcher::Absent,
                HeaderMatcher::Contains { value } => {
                    CompiledHeaderMatcher::Contains(value.clone())
                }
            },
        },
        RequestPredicate::Query { name, matcher } => Check::Query {
            name: name.clone(),
            matcher: compile_value_matcher(matcher)?,
        },
        RequestPredicate::Form { name, matcher } => Check::Form {
            name: name.clone(),
            matcher: compile_value_matcher(matcher)?,
        },
        RequestPredicate::Body { matcher } => Check::Body(match matcher {
            BodyMatcher::Exact { value } => CompiledBodyMatcher::Exact(value.clone()),
            BodyMatcher::Regex { pattern } => CompiledBodyMatcher::Regex(compile_regex(pattern)?),
            BodyMatcher::JsonPath { expressions } => {
                let mut compiled = Vec::with_capacity(expressions.len());
                for (expr, expected) in expressions {
                    let path = JsonPath::try_from(expr.as_str())
                        .map_err(|e| format!("Invalid JSON path {:?}: {}", expr, e))?;
                    compiled.push((path, expected.clone()));
                }
                CompiledBodyMatcher::JsonPath(compiled)
            }
            BodyMatcher::Contains { value } => CompiledBodyMatcher::Contains(value.clone()),
            BodyMatcher::Json => CompiledBodyMatcher::Json,
            BodyMatcher::Empty => CompiledBodyMatcher::Empty,
        }),
        RequestPredicate::All { predicates } => Check::All(
            predicates
                .iter()
                .map(compile_check)
                .collect::<Result<_, _>>()?,
        ),
        RequestPredicate::Any { predicates } => Check::Any(
            predicates
                .iter()
                .map(compile_check)
                .collect::<Result<_, _>>()?,
        ),
        RequestPredicate::Not { predicate } => Check::Not(Box::new(compile_check(predicate)?)),
    })
}

fn compile_value_matcher(matcher: &QueryMatcher) -> Result<CompiledValueMatcher, String> {
    Ok(match matcher {
        QueryMatcher::Exact { value } => CompiledValueMatcher::Exact(value.clone()),
        QueryMatcher::Regex { pattern } => CompiledValueMatcher::Regex(compile_regex(pattern)?),
        QueryMatcher::Present => CompiledValueMatcher::Present,
        QueryMatcher::Absent => CompiledValueMatcher::Absent,
    })
}

impl Check {
    fn evaluate(&self, request: &RecordedRequest, path: &str, context: &mut MatchContext) -> bool {
        match self {
            Check::Method(method) => request.method.eq_ignore_ascii_case(method),
            Check::Path(matcher) => matches_path(matcher, path, context),
            Check::Header { name, matcher } => matches_header(request, name, matcher),
            Check::Query { name, matcher } => {
                matches_value(request.query_param(name).as_deref(), matcher)
            }
            Check::Form { name, matcher } => matches_value(request.form_field(name), matcher),
            Check::Body(matcher) => matches_body(&request.body, matcher),
            Check::All(checks) => checks
                .iter()
                .all(|check| check.evaluate(request, path, context)),
            Check::Any(checks) => checks.iter().any(|check| {
                let mut scratch = context.clone();
                if check.evaluate(request, path, &mut scratch) {
                    *context = scratch;
                    true
                } else {
                    false
                }
            }),
            Check::Not(check) => !check.evaluate(request, path, &mut MatchContext::default()),
        }
    }
}

fn matches_path(matcher: &CompiledPathMatcher, path: &str, context: &mut MatchContext) -> bool {
    match matcher {
        CompiledPathMatcher::Exact(value) => path == value,
        CompiledPathMatcher::Prefix(value) => path.starts_with(value.as_str()),
        CompiledPathMatcher::Regex(regex) => {
            if let Some(captures) = regex.captures(path) {
                for (i, cap) in captures.iter().enumerate().skip(1) {
                    if let Some(m) = cap {
                        context.captures.insert(i.to_string(), m.as_str().to_string());
                    }
                }
                for name in regex.capture_names().flatten() {
                    if let Some(m) = captures.name(name) {
                        context.captures.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                true
            } else {
                false
            }
        }
        CompiledPathMatcher::Glob(glob) => glob.is_match(path),
        CompiledPathMatcher::Template(template) => {
            if let Some(params) = template.matches(path) {
                context.path_params.extend(params);
                true
            } else {
                false
            }
        }
    }
}

fn matches_value(value: Option<&str>, matcher: &CompiledValueMatcher) -> bool {
    match matcher {
        CompiledValueMatcher::Exact(expected) => value == Some(expected.as_str()),
        CompiledValueMatcher::Regex(regex) => value.map(|v| regex.is_match(v)).unwrap_or(false),
        CompiledValueMatcher::Present => value.is_some(),
        CompiledValueMatcher::Absent => value.is_none(),
    }
}

fn matches_header(request: &RecordedRequest, name: &str, matcher: &CompiledHeaderMatcher) -> bool {
    let mut values = request.header_values(name);

    match matcher {
        CompiledHeaderMatcher::Exact(expected) => values.any(|v| v == expected),
        CompiledHeaderMatcher::Regex(regex) => values.any(|v| regex.is_match(v)),
        CompiledHeaderMatcher::Present => values.next().is_some(),
        CompiledHeaderMatcher::Absent => values.next().is_none(),
        CompiledHeaderMatcher::Contains(needle) => values.any(|v| v.contains(needle.as_str())),
    }
}

fn matches_body(body: &[u8], matcher: &CompiledBodyMatcher) -> bool {
    let body_str = std::str::from_utf8(body).ok();

    match matcher {
        CompiledBodyMatcher::Exact(value) => body_str == Some(value.as_str()),
        CompiledBodyMatcher::Regex(regex) => body_str.map(|bs| regex.is_match(bs)).unwrap_or(false),
        CompiledBodyMatcher::JsonPath(expressions) => body_str
            .and_then(|bs| serde_json::from_str::<serde_json::Value>(bs).ok())
            .map(|json| matches_json_paths(&json, expressions))
            .unwrap_or(false),
        CompiledBodyMatcher::Contains(value) => {
            body_str.map(|bs| bs.contains(value.as_str())).unwrap_or(false)
        }
        CompiledBodyMatcher::Json => body_str
            .map(|bs| serde_json::from_str::<serde_json::Value>(bs).is_ok())
            .unwrap_or(false),
        CompiledBodyMatcher::Empty => body.is_empty(),
    }
}

fn matches_json_paths(json: &serde_json::Value, expressions: &[(JsonPath, serde_json::Value)]) -> bool {
    expressions.iter().all(|(path, expected)| {
        // Matches come back wrapped in an array
        let results = match path.find(json) {
            serde_json::Value::Array(found) => found,
            serde_json::Value::Null => Vec::new(),
            single => vec![single],
        };

        // A null expectation only asks for the path to resolve
        if expected.is_null() {
            !results.is_empty()
        } else {
            results.iter().any(|found| found == expected)
        }
    })
}
