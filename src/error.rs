//! Error types shared by the server, the control client and the supervisor.

use std::time::Duration;
use thiserror::Error;

/// A rule payload posted to `/_expectation` was rejected.
///
/// The `Display` output is the exact diagnostic the server sends back with
/// its 417 response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("POST data must be a JSON object")]
    NotAnObject,

    #[error("POST data key \"{0}\" not found in POST data")]
    MissingKey(&'static str),

    #[error("POST data key \"{key}\" must be {expected}: {reason}")]
    InvalidKey {
        key: &'static str,
        expected: &'static str,
        reason: String,
    },

    #[error("POST data key \"{0}\" is not recognised")]
    UnknownKey(String),
}

impl ConfigurationError {
    pub(crate) fn matcher(reason: impl ToString) -> Self {
        Self::InvalidKey {
            key: "matcher",
            expected: "a list of request predicates",
            reason: reason.to_string(),
        }
    }

    pub(crate) fn response(reason: impl ToString) -> Self {
        Self::InvalidKey {
            key: "response",
            expected: "a response definition",
            reason: reason.to_string(),
        }
    }

    pub(crate) fn limiter(reason: impl ToString) -> Self {
        Self::InvalidKey {
            key: "limiter",
            expected: "a usage limiter",
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by the [`ControlClient`](crate::client::ControlClient).
///
/// `UnexpectedStatus`, `UnexpectedContentType` and `Malformed` are protocol
/// violations: the server answered outside the documented contract.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("cannot encode expectation: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not configure expectation (status {status}): {message}")]
    Configuration { status: u16, message: String },

    #[error("no recorded request at \"{path}\"")]
    NotFound { path: String },

    #[error("Expected status code {expected} from \"{path}\", got {actual}")]
    UnexpectedStatus {
        path: String,
        expected: u16,
        actual: u16,
        body: String,
    },

    #[error("Expected content type \"text/plain\" from \"{path}\", got \"{actual}\"")]
    UnexpectedContentType {
        path: String,
        actual: String,
        body: String,
    },

    #[error("Cannot deserialize response from \"{path}\": \"{body}\"")]
    Malformed {
        path: String,
        body: String,
        reason: String,
    },

    #[error("cannot send request to \"{path}\": {source}")]
    Transport {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("request to \"{path}\" timed out after {timeout:?}")]
    Timeout { path: String, timeout: Duration },

    #[error("cannot build client runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl ClientError {
    /// Whether the server answered outside the control protocol contract.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ClientError::UnexpectedStatus { .. }
                | ClientError::UnexpectedContentType { .. }
                | ClientError::Malformed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }
}

/// Errors raised by the [`Supervisor`](crate::supervisor::Supervisor).
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot reserve a free port on {host}: {source}")]
    PortUnavailable {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mock server at {address} not ready after {attempts} probes in {elapsed:?}")]
    NotReady {
        address: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("mock server exited while starting: {status}")]
    Exited { status: std::process::ExitStatus },

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("control request failed: {0}")]
    Control(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_messages() {
        assert_eq!(
            ConfigurationError::MissingKey("response").to_string(),
            r#"POST data key "response" not found in POST data"#
        );
        assert_eq!(
            ConfigurationError::limiter("unknown variant `twice`").to_string(),
            r#"POST data key "limiter" must be a usage limiter: unknown variant `twice`"#
        );
    }

    #[test]
    fn test_protocol_classification() {
        let err = ClientError::UnexpectedStatus {
            path: "/_request/last".to_string(),
            expected: 200,
            actual: 500,
            body: String::new(),
        };
        assert!(err.is_protocol_error());
        assert_eq!(
            err.to_string(),
            r#"Expected status code 200 from "/_request/last", got 500"#
        );

        let err = ClientError::NotFound {
            path: "/_request/first".to_string(),
        };
        assert!(!err.is_protocol_error());
        assert!(err.is_not_found());
    }
}
