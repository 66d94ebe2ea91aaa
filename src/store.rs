//! Expectation store.
//!
//! Rules are kept newest first. Evaluation walks them in that order and stops
//! at the first rule whose predicate holds: it either answers (consuming one
//! unit of budget) or, when its budget is spent, ends the search with an
//! exhaustion outcome. An exhausted rule therefore shadows every older rule.

use crate::config::{ExpectationDefinition, Limiter, ResponseDefinition};
use crate::error::ConfigurationError;
use crate::matcher::{MatchContext, Predicate};
use crate::request::RecordedRequest;
use std::collections::VecDeque;
use tracing::debug;

/// Remaining budget of an installed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Unlimited,
    Remaining(u32),
}

impl From<Limiter> for Budget {
    fn from(limiter: Limiter) -> Self {
        match limiter {
            Limiter::Unlimited => Budget::Unlimited,
            Limiter::Exactly { times } => Budget::Remaining(times),
        }
    }
}

impl Budget {
    /// Take one unit of budget, if any is left.
    fn consume(&mut self) -> bool {
        match self {
            Budget::Unlimited => true,
            Budget::Remaining(0) => false,
            Budget::Remaining(n) => {
                *n -= 1;
                true
            }
        }
    }
}

/// An installed expectation rule.
pub struct Expectation {
    /// Insertion id; higher ids are newer and rank higher
    pub id: u64,
    predicate: Predicate,
    pub response: ResponseDefinition,
    pub budget: Budget,
}

/// Result of evaluating a request against the store.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched {
        expectation_id: u64,
        response: ResponseDefinition,
        context: MatchContext,
    },
    Exhausted {
        expectation_id: u64,
    },
    Miss,
}

/// Ordered collection of expectation rules, newest first.
#[derive(Default)]
pub struct ExpectationStore {
    rules: VecDeque<Expectation>,
    next_id: u64,
}

impl ExpectationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and install a rule ahead of every existing one.
    pub fn insert(&mut self, definition: ExpectationDefinition) -> Result<u64, ConfigurationError> {
        let predicate =
            Predicate::compile(&definition.matcher).map_err(ConfigurationError::matcher)?;
        definition
            .response
            .validate()
            .map_err(ConfigurationError::response)?;

        let id = self.next_id;
        self.next_id += 1;
        self.rules.push_front(Expectation {
            id,
            predicate,
            response: definition.response,
            budget: definition.limiter.into(),
        });

        debug!(expectation_id = id, rules = self.rules.len(), "Expectation installed");
        Ok(id)
    }

    /// Find the rule answering `request`, consuming budget on a match.
    ///
    /// `path` is the request path as rules see it (base path removed).
    pub fn evaluate(&mut self, request: &RecordedRequest, path: &str) -> MatchOutcome {
        for rule in self.rules.iter_mut() {
            let Some(context) = rule.predicate.matches(request, path) else {
                continue;
            };

            return if rule.budget.consume() {
                MatchOutcome::Matched {
                    expectation_id: rule.id,
                    response: rule.response.clone(),
                    context,
                }
            } else {
                MatchOutcome::Exhausted {
                    expectation_id: rule.id,
                }
            };
        }

        MatchOutcome::Miss
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &Expectation> {
        self.rules.iter()
    }

    pub fn clear(&mut self) {
        self.rules.clear();
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

    fn text(body: &str) -> ResponseDefinition {
        ResponseDefinition::default().with_text(body)
    }

    fn body_of(outcome: &MatchOutcome) -> Option<String> {
        match outcome {
            MatchOutcome::Matched { response, .. } => response
                .body
                .as_ref()
                .map(|b| String::from_utf8(b.to_bytes().unwrap()).unwrap()),
            _ => None,
        }
    }

    fn evaluate(store: &mut ExpectationStore, method: &str, path: &str) -> MatchOutcome {
        store.evaluate(&request(method, path), path)
    }

    #[test]
    fn test_empty_store_misses() {
        let mut store = ExpectationStore::new();
        assert!(matches!(evaluate(&mut store, "GET", "/"), MatchOutcome::Miss));
    }

    #[test]
    fn test_newest_expectation_is_evaluated_first() {
        let mut store = ExpectationStore::new();
        store.insert(ExpectationDefinition::new(text("first"))).unwrap();
        assert_eq!(body_of(&evaluate(&mut store, "GET", "/")).as_deref(), Some("first"));

        store.insert(ExpectationDefinition::new(text("second"))).unwrap();
        assert_eq!(body_of(&evaluate(&mut store, "GET", "/")).as_deref(), Some("second"));

        let ids: Vec<u64> = store.iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn test_non_matching_newer_rule_falls_through() {
        let mut store = ExpectationStore::new();
        store
            .insert(ExpectationDefinition::new(text("foo")).when(RequestPredicate::path("/foo")))
            .unwrap();
        store
            .insert(ExpectationDefinition::new(text("bar")).when(RequestPredicate::path("/bar")))
            .unwrap();

        assert_eq!(body_of(&evaluate(&mut store, "GET", "/foo")).as_deref(), Some("foo"));
        assert_eq!(body_of(&evaluate(&mut store, "GET", "/bar")).as_deref(), Some("bar"));
        assert!(matches!(evaluate(&mut store, "GET", "/baz"), MatchOutcome::Miss));
    }

    #[test]
    fn test_exactly_n_then_exhausted_permanently() {
        let mut store = ExpectationStore::new();
        let id = store
            .insert(
                ExpectationDefinition::new(text("X"))
                    .when(RequestPredicate::method("POST"))
                    .times(2),
            )
            .unwrap();

        for _ in 0..2 {
            assert_eq!(body_of(&evaluate(&mut store, "POST", "/")).as_deref(), Some("X"));
        }
        for _ in 0..3 {
            match evaluate(&mut store, "POST", "/") {
                MatchOutcome::Exhausted { expectation_id } => assert_eq!(expectation_id, id),
                other => panic!("expected exhaustion, got {:?}", other),
            }
        }
        // Requests the rule does not match are unaffected
        assert!(matches!(evaluate(&mut store, "GET", "/"), MatchOutcome::Miss));
    }

    #[test]
    fn test_exactly_zero_is_exhausted_immediately() {
        let mut store = ExpectationStore::new();
        store
            .insert(ExpectationDefinition::new(text("never")).times(0))
            .unwrap();
        assert!(matches!(
            evaluate(&mut store, "GET", "/"),
            MatchOutcome::Exhausted { .. }
        ));
    }

    #[test]
    fn test_unlimited_matches_without_bound() {
        let mut store = ExpectationStore::new();
        store.insert(ExpectationDefinition::new(text("any"))).unwrap();
        for _ in 0..1000 {
            assert!(matches!(
                evaluate(&mut store, "GET", "/"),
                MatchOutcome::Matched { .. }
            ));
        }
    }

    #[test]
    fn test_exhausted_newer_rule_shadows_older_rule() {
        let mut store = ExpectationStore::new();
        store
            .insert(ExpectationDefinition::new(text("older")).when(RequestPredicate::method("POST")))
            .unwrap();
        store
            .insert(
                ExpectationDefinition::new(text("newer"))
                    .when(RequestPredicate::method("POST"))
                    .once(),
            )
            .unwrap();

        assert_eq!(body_of(&evaluate(&mut store, "POST", "/")).as_deref(), Some("newer"));
        // The older unlimited rule would match, but the exhausted newer rule wins
        assert!(matches!(
            evaluate(&mut store, "POST", "/"),
            MatchOutcome::Exhausted { expectation_id: 1 }
        ));
    }

    #[test]
    fn test_matching_does_not_reorder_rules() {
        let mut store = ExpectationStore::new();
        store
            .insert(ExpectationDefinition::new(text("a")).when(RequestPredicate::path("/a")))
            .unwrap();
        store
            .insert(ExpectationDefinition::new(text("b")).when(RequestPredicate::path("/b")))
            .unwrap();

        for _ in 0..5 {
            evaluate(&mut store, "GET", "/a");
        }
        let ids: Vec<u64> = store.iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn test_invalid_rule_is_rejected_and_not_installed() {
        let mut store = ExpectationStore::new();
        let err = store
            .insert(ExpectationDefinition::new(ResponseDefinition::default().with_status(1000)))
            .unwrap_err();

        assert!(matches!(err, ConfigurationError::InvalidKey { key: "response", .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut store = ExpectationStore::new();
        store.insert(ExpectationDefinition::new(text("a"))).unwrap();
        store.clear();
        assert!(store.is_empty());
        assert!(matches!(evaluate(&mut store, "GET", "/"), MatchOutcome::Miss));
    }
}
