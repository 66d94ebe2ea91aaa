//! Mock server state.
//!
//! The expectation store and the journal live together behind one mutex, so
//! recording a request, evaluating the store and decrementing a limiter are a
//! single atomic step, and a reset can never be observed half-done.

use crate::config::ExpectationDefinition;
use crate::error::ConfigurationError;
use crate::journal::Journal;
use crate::request::RecordedRequest;
use crate::store::{ExpectationStore, MatchOutcome};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// State shared by every connection of one server.
pub type SharedState = Arc<Mutex<MockState>>;

/// Rule store plus journal of one mock server.
#[derive(Default)]
pub struct MockState {
    pub expectations: ExpectationStore,
    pub journal: Journal,
}

/// What happened to a mock request.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// The journaled request, with its sequence number
    pub request: RecordedRequest,
    pub outcome: MatchOutcome,
}

impl MockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the state for sharing between connections.
    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Install an expectation ahead of all existing ones.
    pub fn configure(&mut self, definition: ExpectationDefinition) -> Result<u64, ConfigurationError> {
        self.expectations.insert(definition)
    }

    /// Journal a request, then match it.
    ///
    /// `match_path` is the path rules see; `None` means the request lies
    /// outside the base path and can only miss.
    pub fn dispatch(&mut self, request: RecordedRequest, match_path: Option<&str>) -> Dispatch {
        let request = self.journal.record(request).clone();
        let outcome = match match_path {
            Some(path) => self.expectations.evaluate(&request, path),
            None => MatchOutcome::Miss,
        };
        Dispatch { request, outcome }
    }

    /// Drop every rule and every journal entry.
    pub fn reset(&mut self) {
        let (rules, requests) = (self.expectations.len(), self.journal.count());
        self.expectations.clear();
        self.journal.clear();
        info!(rules, requests, "State reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RequestPredicate, ResponseDefinition};

    fn request(method: &str, path: &str) -> RecordedRequest {
        let (parts, _) = http::Request::builder()
            .method(method)
            .uri(path)
            .body(())
            .unwrap()
            .into_parts();
        RecordedRequest::capture(&parts, b"", "127.0.0.1:28080".parse().unwrap())
    }

    #[test]
    fn test_every_outcome_is_journaled() {
        let mut state = MockState::new();
        state
            .configure(
                ExpectationDefinition::new(ResponseDefinition::default())
                    .when(RequestPredicate::path("/hit"))
                    .once(),
            )
            .unwrap();

        let hit = state.dispatch(request("GET", "/hit"), Some("/hit"));
        let gone = state.dispatch(request("GET", "/hit"), Some("/hit"));
        let miss = state.dispatch(request("GET", "/miss"), Some("/miss"));
        let outside = state.dispatch(request("GET", "/elsewhere/hit"), None);

        assert!(matches!(hit.outcome, MatchOutcome::Matched { .. }));
        assert!(matches!(gone.outcome, MatchOutcome::Exhausted { .. }));
        assert!(matches!(miss.outcome, MatchOutcome::Miss));
        assert!(matches!(outside.outcome, MatchOutcome::Miss));

        assert_eq!(state.journal.count(), 4);
        assert_eq!(outside.request.sequence, 3);
        assert_eq!(state.journal.last().unwrap().path, "/elsewhere/hit");
    }

    #[test]
    fn test_reset_wipes_rules_and_journal() {
        let mut state = MockState::new();
        state
            .configure(ExpectationDefinition::new(ResponseDefinition::default()))
            .unwrap();
        state.dispatch(request("GET", "/"), Some("/"));

        state.reset();

        assert!(state.expectations.is_empty());
        assert_eq!(state.journal.count(), 0);
        let after = state.dispatch(request("GET", "/"), Some("/"));
        assert!(matches!(after.outcome, MatchOutcome::Miss));
        // Sequence numbers keep counting across resets
        assert_eq!(after.request.sequence, 1);
    }

    #[test]
    fn test_shared_state_blocking() {
        let state = MockState::new().shared();
        tokio_test::block_on(async {
            state.lock().await.dispatch(request("GET", "/"), Some("/"));
        });
        assert_eq!(state.try_lock().unwrap().journal.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_overconsume() {
        let state = MockState::new().shared();
        state
            .lock()
            .await
            .configure(ExpectationDefinition::new(ResponseDefinition::default()).times(5))
            .unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let state = state.clone();
                tokio::spawn(async move {
                    state.lock().await.dispatch(request("GET", "/"), Some("/")).outcome
                })
            })
            .collect();

        let mut matched = 0;
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                MatchOutcome::Matched { .. } => matched += 1,
                MatchOutcome::Exhausted { .. } => exhausted += 1,
                MatchOutcome::Miss => panic!("unexpected miss"),
            }
        }

        assert_eq!(matched, 5);
        assert_eq!(exhausted, 45);
        assert_eq!(state.lock().await.journal.count(), 50);
    }
}
