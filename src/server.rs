//! HTTP front end.
//!
//! Serves the control endpoints and routes every other request through the
//! journal and the expectation store.

use crate::config::{ExpectationDefinition, MockServerConfig, ServerSettings};
use crate::journal::{JournalEnd, JournalSelector};
use crate::request::RecordedRequest;
use crate::response::MockResponse;
use crate::state::{MockState, SharedState};
use crate::store::MatchOutcome;
use crate::template::TemplateEngine;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub const EXHAUSTED_MESSAGE: &str = "Expectation no longer applicable";
pub const NO_MATCH_MESSAGE: &str = "No matching expectation found";
pub const NOT_RECORDED_MESSAGE: &str = "No recorded request found";

/// Everything a connection needs to answer requests.
struct ServerContext {
    state: SharedState,
    engine: TemplateEngine,
    base_path: Option<String>,
    name: String,
    local_addr: SocketAddr,
}

/// A bound, not yet running, mock server.
pub struct MockServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
}

impl MockServer {
    /// Bind the listener. Port 0 picks any free port.
    pub async fn bind(settings: &ServerSettings) -> anyhow::Result<Self> {
        Self::bind_with_state(settings, MockState::new()).await
    }

    /// Bind and preload the expectations of a configuration file.
    ///
    /// Expectations are installed in file order, so later entries take
    /// precedence over earlier ones.
    pub async fn from_config(config: MockServerConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let mut state = MockState::new();
        for definition in config.expectations {
            state.configure(definition)?;
        }

        Self::bind_with_state(&config.server, state).await
    }

    async fn bind_with_state(settings: &ServerSettings, state: MockState) -> anyhow::Result<Self> {
        settings.validate()?;

        let listener = TcpListener::bind(settings.connection_string()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            name = %settings.name,
            address = %local_addr,
            base_path = settings.base_path.as_deref().unwrap_or(""),
            expectations = state.expectations.len(),
            "Mock server bound"
        );

        Ok(Self {
            listener,
            context: Arc::new(ServerContext {
                state: state.shared(),
                engine: TemplateEngine::new(),
                base_path: settings.base_path.clone(),
                name: settings.name.clone(),
                local_addr,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.context.local_addr
    }

    /// Handle to the live state, e.g. for in-process assertions.
    pub fn state(&self) -> SharedState {
        self.context.state.clone()
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted are
    /// left to finish on their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!(name = %self.context.name, "Mock server shutting down");
                    return Ok(());
                }
            };

            let context = self.context.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| {
                    let context = context.clone();
                    async move { Ok::<_, Infallible>(context.handle(request).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "Connection closed with error");
                }
            });
        }
    }
}

impl ServerContext {
    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        let response = match body.collect().await {
            Ok(collected) => self.respond(&parts, collected.to_bytes()).await,
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                MockResponse::text(400, format!("Failed to read request body: {e}"))
            }
        };

        into_http_or_500(response).map(Full::new)
    }

    /// Route one request. Control endpoints are served at the root whatever
    /// the base path; everything else is mock traffic.
    async fn respond(&self, parts: &http::request::Parts, body: Bytes) -> MockResponse {
        let path = parts.uri.path();

        match (&parts.method, path) {
            (&Method::POST, "/_expectation") => return self.configure(&body).await,
            (&Method::DELETE, "/_all") => {
                self.state.lock().await.reset();
                return MockResponse::empty(200);
            }
            (&Method::HEAD, "/_me") => return MockResponse::empty(200),
            _ => {}
        }

        if let Some(selector) = path.strip_prefix("/_request/") {
            if parts.method == Method::GET {
                return self.query_journal(selector).await;
            }
            if parts.method == Method::DELETE {
                return self.pop_journal(selector).await;
            }
        }

        self.mock(parts, &body).await
    }

    async fn configure(&self, body: &[u8]) -> MockResponse {
        let installed = match ExpectationDefinition::from_payload(body) {
            Ok(definition) => self.state.lock().await.configure(definition),
            Err(e) => Err(e),
        };

        match installed {
            Ok(id) => {
                info!(name = %self.name, expectation_id = id, "Expectation configured");
                MockResponse::empty(201)
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "Rejected expectation");
                MockResponse::text(417, e.to_string())
            }
        }
    }

    async fn query_journal(&self, selector: &str) -> MockResponse {
        let selector: JournalSelector = match selector.parse() {
            Ok(selector) => selector,
            Err(e) => return MockResponse::text(404, e),
        };

        let state = self.state.lock().await;
        if selector == JournalSelector::Count {
            return MockResponse::text(200, state.journal.count().to_string());
        }
        serialize_entry(state.journal.get(selector))
    }

    async fn pop_journal(&self, end: &str) -> MockResponse {
        let end: JournalEnd = match end.parse() {
            Ok(end) => end,
            Err(e) => return MockResponse::text(404, e),
        };

        let popped = self.state.lock().await.journal.pop(end);
        serialize_entry(popped.as_ref())
    }

    async fn mock(&self, parts: &http::request::Parts, body: &[u8]) -> MockResponse {
        let request = RecordedRequest::capture(parts, body, self.local_addr);
        let match_path = strip_base_path(self.base_path.as_deref(), &request.path).map(String::from);

        // Journal, match and consume under one lock; render after releasing it
        let dispatch = self
            .state
            .lock()
            .await
            .dispatch(request, match_path.as_deref());
        let request = &dispatch.request;

        match dispatch.outcome {
            MatchOutcome::Matched {
                expectation_id,
                response,
                context,
            } => {
                info!(
                    name = %self.name,
                    expectation_id,
                    sequence = request.sequence,
                    method = %request.method,
                    path = %request.path,
                    "Request matched expectation"
                );
                MockResponse::render(&self.engine, &response, request, &context)
            }
            MatchOutcome::Exhausted { expectation_id } => {
                info!(
                    name = %self.name,
                    expectation_id,
                    method = %request.method,
                    path = %request.path,
                    "Expectation exhausted"
                );
                MockResponse::text(410, EXHAUSTED_MESSAGE)
            }
            MatchOutcome::Miss => {
                warn!(
                    name = %self.name,
                    method = %request.method,
                    path = %request.path,
                    "No matching expectation found"
                );
                MockResponse::text(404, NO_MATCH_MESSAGE)
            }
        }
    }
}

/// Convert to an HTTP response, answering a plain-text 500 when the
/// response cannot be expressed in HTTP.
fn into_http_or_500(response: MockResponse) -> Response<Bytes> {
    response.into_http().unwrap_or_else(|e| {
        error!(error = %e, "Rendered response is not valid HTTP");
        let fallback = MockResponse::text(500, format!("Rendered response is not valid HTTP: {e}"));
        fallback.into_http().unwrap_or_else(|_| {
            let mut bare = Response::new(Bytes::new());
            *bare.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            bare
        })
    })
}

fn serialize_entry(entry: Option<&RecordedRequest>) -> MockResponse {
    match entry.map(RecordedRequest::to_payload) {
        Some(Ok(payload)) => MockResponse::text(200, payload),
        Some(Err(e)) => MockResponse::text(500, format!("Failed to serialize request: {e}")),
        None => MockResponse::text(404, NOT_RECORDED_MESSAGE),
    }
}

/// The path rules see, or `None` when the request lies outside the base path.
fn strip_base_path<'a>(base_path: Option<&str>, path: &'a str) -> Option<&'a str> {
    let Some(base) = base_path else {
        return Some(path);
    };
    match path.strip_prefix(base)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}
