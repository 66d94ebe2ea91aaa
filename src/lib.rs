//! HTTP Mock Server
//!
//! An out-of-process HTTP test double. The server records every request it
//! receives in a journal and answers according to expectations configured
//! over a small control protocol; tests drive it through a blocking client
//! and a process supervisor.
//!
//! # Features
//!
//! - **Ordered Expectations**: Newest rule first, declarative predicates on
//!   method, path, headers, query, form fields and body
//! - **Usage Limits**: `Unlimited` or `Exactly(n)`; an exhausted rule answers
//!   410 and shadows older rules
//! - **Request Journal**: Query and pop recorded requests by position
//! - **Response Hooks**: Handlebars templates over the recorded request
//! - **Process Supervision**: Start, probe, reset and stop server processes
//!
//! # Control Protocol
//!
//! | Method | Path | Reply |
//! |---|---|---|
//! | POST | `/_expectation` | 201, or 417 with a diagnostic |
//! | GET | `/_request/{first,last,latest,count,<n>}` | 200 or 404 |
//! | DELETE | `/_request/{first,last,latest}` | 200 or 404 |
//! | DELETE | `/_all` | 200 |
//! | HEAD | `/_me` | 200 |
//!
//! # Example
//!
//! ```no_run
//! use http_mock_server::{
//!     ExpectationDefinition, RequestPredicate, ResponseDefinition, Supervisor, SupervisorConfig,
//! };
//!
//! let mut server = Supervisor::new(SupervisorConfig::new("http-mock-server"));
//! server.clean()?;
//!
//! let client = server.client().expect("server is running");
//! client.configure_expectation(
//!     &ExpectationDefinition::new(ResponseDefinition::default().with_text("foo body"))
//!         .when(RequestPredicate::path("/foo")),
//! )?;
//!
//! // ... exercise the system under test against server.base_url() ...
//!
//! assert_eq!(client.latest()?.path, "/foo");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod journal;
pub mod matcher;
pub mod request;
pub mod response;
pub mod server;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod template;

pub use client::{ControlClient, JournalReply};
pub use config::{
    ExpectationDefinition, Limiter, MockServerConfig, RequestPredicate, ResponseBody,
    ResponseDefinition, ResponseHook, ServerSettings,
};
pub use error::{ClientError, ConfigurationError, ProcessError};
pub use journal::{Journal, JournalEnd, JournalSelector};
pub use request::RecordedRequest;
pub use server::MockServer;
pub use state::{MockState, SharedState};
pub use store::{ExpectationStore, MatchOutcome};
pub use supervisor::{
    MockServerSet, ProcessState, ReadinessPolicy, StopSignal, Supervisor, SupervisorConfig,
};
