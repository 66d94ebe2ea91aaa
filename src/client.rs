//! Blocking control client.
//!
//! Talks to a running mock server over its control endpoints. Every reply is
//! checked against the expected status and a `text/plain` content type before
//! it is interpreted.
//!
//! The client drives its own Tokio runtime, so it must not be used (or
//! dropped) from inside an async context.

use crate::config::ExpectationDefinition;
use crate::error::ClientError;
use crate::journal::{JournalEnd, JournalSelector};
use crate::request::RecordedRequest;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A journal query result.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalReply {
    Request(Box<RecordedRequest>),
    Count(usize),
}

/// Synchronous client for the control protocol.
pub struct ControlClient {
    base_url: String,
    runtime: Runtime,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl ControlClient {
    /// Client for the server at `base_url`, e.g. `http://127.0.0.1:28080`.
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = normalize_base_url(base_url)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mock-control-client")
            .enable_all()
            .build()?;

        // One request at a time, and no connection reuse across server restarts
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build_http();

        Ok(Self {
            base_url,
            runtime,
            client,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Install an expectation. The server answers 201 with an empty body, or
    /// 417 with a diagnostic when the rule is malformed.
    pub fn configure_expectation(&self, definition: &ExpectationDefinition) -> Result<(), ClientError> {
        const PATH: &str = "/_expectation";

        let payload = serde_json::to_vec(definition)?;
        let response = self.request(Method::POST, PATH, payload)?;

        check_configured(PATH, &response)
    }

    /// Query the journal.
    pub fn query_journal(&self, selector: JournalSelector) -> Result<JournalReply, ClientError> {
        match selector {
            JournalSelector::Count => self.count().map(JournalReply::Count),
            selector => self
                .entry(selector)
                .map(|request| JournalReply::Request(Box::new(request))),
        }
    }

    pub fn first(&self) -> Result<RecordedRequest, ClientError> {
        self.entry(JournalSelector::First)
    }

    pub fn last(&self) -> Result<RecordedRequest, ClientError> {
        self.entry(JournalSelector::Last)
    }

    /// Alias of [`last`](Self::last).
    pub fn latest(&self) -> Result<RecordedRequest, ClientError> {
        self.last()
    }

    /// Entry at a 0-based live position.
    pub fn at(&self, position: usize) -> Result<RecordedRequest, ClientError> {
        self.entry(JournalSelector::Index(position))
    }

    /// Live number of journal entries.
    pub fn count(&self) -> Result<usize, ClientError> {
        let path = format!("/_request/{}", JournalSelector::Count);
        let response = self.request(Method::GET, &path, Bytes::new())?;
        let body = check_reply(&path, &response, StatusCode::OK)?;

        let parsed = body.trim().parse::<usize>();
        parsed.map_err(|e| ClientError::Malformed {
            path,
            body,
            reason: e.to_string(),
        })
    }

    fn entry(&self, selector: JournalSelector) -> Result<RecordedRequest, ClientError> {
        let path = format!("/_request/{selector}");
        let response = self.request(Method::GET, &path, Bytes::new())?;
        parse_entry(path, &response)
    }

    /// Remove and return the entry at one end of the journal.
    pub fn pop_journal(&self, end: JournalEnd) -> Result<RecordedRequest, ClientError> {
        let path = format!("/_request/{end}");
        let response = self.request(Method::DELETE, &path, Bytes::new())?;
        parse_entry(path, &response)
    }

    /// Remove the newest entry.
    pub fn pop(&self) -> Result<RecordedRequest, ClientError> {
        self.pop_journal(JournalEnd::Last)
    }

    /// Remove the oldest entry.
    pub fn shift(&self) -> Result<RecordedRequest, ClientError> {
        self.pop_journal(JournalEnd::First)
    }

    /// Drop every expectation and journal entry.
    pub fn reset_all(&self) -> Result<(), ClientError> {
        const PATH: &str = "/_all";
        let response = self.request(Method::DELETE, PATH, Bytes::new())?;
        check_reply(PATH, &response, StatusCode::OK)?;
        Ok(())
    }

    /// Readiness probe.
    pub fn probe(&self) -> Result<(), ClientError> {
        const PATH: &str = "/_me";
        let response = self.request(Method::HEAD, PATH, Bytes::new())?;
        check_reply(PATH, &response, StatusCode::OK)?;
        Ok(())
    }

    /// Send ordinary traffic; the response is returned unvalidated.
    pub fn get(&self, path: &str) -> Result<Response<Bytes>, ClientError> {
        self.request(Method::GET, path, Bytes::new())
    }

    pub fn post(&self, path: &str, body: impl Into<Bytes>) -> Result<Response<Bytes>, ClientError> {
        self.request(Method::POST, path, body)
    }

    pub fn request(
        &self,
        method: Method,
        path: &str,
        body: impl Into<Bytes>,
    ) -> Result<Response<Bytes>, ClientError> {
        let request = Request::builder()
            .method(method)
            .uri(path)
            .body(body.into())
            .map_err(|e| ClientError::Transport {
                path: path.to_string(),
                source: Box::new(e),
            })?;
        self.send(request)
    }

    /// Send a request whose URI is a path (and query) on this server.
    pub fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ClientError> {
        let (mut parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        parts.uri = format!("{}{}", self.base_url, path)
            .parse::<Uri>()
            .map_err(|e| ClientError::Transport {
                path: path.clone(),
                source: Box::new(e),
            })?;
        let request = Request::from_parts(parts, Full::new(body));

        debug!(method = %request.method(), path = %path, "Sending control client request");

        let client = self.client.clone();
        let timeout = self.timeout;
        let result = self
            .runtime
            .block_on(async move { tokio::time::timeout(timeout, fetch(client, request)).await });

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(ClientError::Transport { path, source }),
            Err(_) => Err(ClientError::Timeout { path, timeout }),
        }
    }
}

async fn fetch(
    client: Client<HttpConnector, Full<Bytes>>,
    request: Request<Full<Bytes>>,
) -> Result<Response<Bytes>, BoxError> {
    let response = client.request(request).await?;
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, body))
}

fn normalize_base_url(base_url: &str) -> Result<String, ClientError> {
    let invalid = |reason: &str| ClientError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: reason.to_string(),
    };

    let uri: Uri = base_url.parse().map_err(|e| invalid(&format!("{e}")))?;
    if uri.scheme_str() != Some("http") {
        return Err(invalid("scheme must be http"));
    }
    let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
    if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
        return Err(invalid("control endpoints live at the server root"));
    }

    Ok(format!("http://{authority}"))
}

/// Check status and content type, returning the body text.
fn check_reply(path: &str, response: &Response<Bytes>, expected: StatusCode) -> Result<String, ClientError> {
    let body = String::from_utf8_lossy(response.body()).into_owned();

    if response.status() != expected {
        return Err(ClientError::UnexpectedStatus {
            path: path.to_string(),
            expected: expected.as_u16(),
            actual: response.status().as_u16(),
            body,
        });
    }

    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default();
    if !content_type.starts_with("text/plain") {
        return Err(ClientError::UnexpectedContentType {
            path: path.to_string(),
            actual: content_type,
            body,
        });
    }

    Ok(body)
}

/// 201 means installed; a 417 carries the server's diagnostic.
fn check_configured(path: &str, response: &Response<Bytes>) -> Result<(), ClientError> {
    if response.status() == StatusCode::EXPECTATION_FAILED {
        let message = check_reply(path, response, StatusCode::EXPECTATION_FAILED)?;
        return Err(ClientError::Configuration {
            status: response.status().as_u16(),
            message,
        });
    }
    check_reply(path, response, StatusCode::CREATED)?;
    Ok(())
}

fn parse_entry(path: String, response: &Response<Bytes>) -> Result<RecordedRequest, ClientError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound { path });
    }

    let body = check_reply(&path, response, StatusCode::OK)?;
    RecordedRequest::from_payload(&body).map_err(|e| ClientError::Malformed {
        path,
        body,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u16, content_type: Option<&str>, body: &str) -> Response<Bytes> {
        let mut builder = Response::builder().status(status);
        if let Some(content_type) = content_type {
            builder = builder.header("Content-Type", content_type);
        }
        builder.body(Bytes::from(body.to_string())).unwrap()
    }

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(
            normalize_base_url("http://127.0.0.1:28080/").unwrap(),
            "http://127.0.0.1:28080"
        );
        assert_eq!(
            normalize_base_url("http://localhost:9000").unwrap(),
            "http://localhost:9000"
        );
        assert!(matches!(
            normalize_base_url("https://localhost:9000"),
            Err(ClientError::InvalidBaseUrl { .. })
        ));
        assert!(normalize_base_url("localhost:9000").is_err());
        assert!(normalize_base_url("http://localhost:9000/base").is_err());
    }

    #[test]
    fn test_check_reply_accepts_text_plain() {
        let response = reply(200, Some("text/plain; charset=utf-8"), "3");
        assert_eq!(check_reply("/_request/count", &response, StatusCode::OK).unwrap(), "3");
    }

    #[test]
    fn test_check_reply_rejects_wrong_status() {
        let response = reply(500, Some("text/plain"), "boom");
        let err = check_reply("/_request/last", &response, StatusCode::OK).unwrap_err();

        assert!(err.is_protocol_error());
        assert_eq!(
            err.to_string(),
            r#"Expected status code 200 from "/_request/last", got 500"#
        );
        match err {
            ClientError::UnexpectedStatus { body, .. } => assert_eq!(body, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_check_reply_rejects_wrong_content_type() {
        let response = reply(200, Some("application/json"), "{}");
        let err = check_reply("/_request/first", &response, StatusCode::OK).unwrap_err();
        assert!(matches!(
            err,
            ClientError::UnexpectedContentType { ref actual, .. } if actual == "application/json"
        ));

        let response = reply(200, None, "");
        assert!(check_reply("/_all", &response, StatusCode::OK).is_err());
    }

    #[test]
    fn test_configuration_rejection() {
        let err = check_configured(
            "/_expectation",
            &reply(417, Some("text/plain; charset=utf-8"), "POST data must be a JSON object"),
        )
        .unwrap_err();
        match err {
            ClientError::Configuration { status, message } => {
                assert_eq!(status, 417);
                assert_eq!(message, "POST data must be a JSON object");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = check_configured("/_expectation", &reply(417, Some("text/html"), "<p>no</p>"))
            .unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedContentType { .. }), "{err}");

        assert!(check_configured("/_expectation", &reply(201, Some("text/plain"), "")).is_ok());
        assert!(check_configured("/_expectation", &reply(200, Some("text/plain"), ""))
            .unwrap_err()
            .is_protocol_error());
    }

    #[test]
    fn test_parse_entry() {
        assert!(parse_entry("/_request/0".to_string(), &reply(404, Some("text/plain"), ""))
            .unwrap_err()
            .is_not_found());

        let err = parse_entry(
            "/_request/0".to_string(),
            &reply(200, Some("text/plain"), "not json"),
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::Malformed { .. }));
    }

    #[test]
    fn test_unreachable_server_is_transport_error() {
        // Port 9 (discard) is closed on test machines
        let client = ControlClient::new("http://127.0.0.1:9")
            .unwrap()
            .with_timeout(Duration::from_secs(2));

        let err = client.probe().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport { .. } | ClientError::Timeout { .. }
        ));
    }
}
