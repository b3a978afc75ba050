//! Error types for the web adapter.
//!
//! Covers encoding a profile for the response, rendering the viewer
//! templates, and failures of the store or of the blocking task that calls
//! it. All of them turn into a 500 response; a missing profile is not an
//! error here but a plain 404.

use std::backtrace::Backtrace;
use std::fmt;

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use miniprof_core::StorageError;
use tracing::error;

/// Errors that can occur while serving profiler resources.
///
/// Why: lets handlers use `?` while keeping every failure a logged 500.
#[derive(Debug)]
pub struct WebError {
    kind: WebErrorKind,
    backtrace: Backtrace,
}

/// Internal error variants. Not exposed publicly; use `is_xxx()` methods.
#[derive(Debug)]
enum WebErrorKind {
    /// Failed to encode a profile as JSON.
    Serialization(serde_json::Error),
    /// Failed to render an askama template.
    Template(askama::Error),
    /// The profile store failed.
    Storage(StorageError),
    /// The blocking task running a store call failed.
    Task(tokio::task::JoinError),
}

impl WebError {
    fn new(kind: WebErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    pub(crate) fn serialize(err: serde_json::Error) -> Self {
        Self::new(WebErrorKind::Serialization(err))
    }

    pub(crate) fn template(err: askama::Error) -> Self {
        Self::new(WebErrorKind::Template(err))
    }

    pub(crate) fn storage(err: StorageError) -> Self {
        Self::new(WebErrorKind::Storage(err))
    }

    pub(crate) fn task(err: tokio::task::JoinError) -> Self {
        Self::new(WebErrorKind::Task(err))
    }

    /// Returns true if encoding a profile failed.
    pub fn is_serialization(&self) -> bool {
        matches!(self.kind, WebErrorKind::Serialization(_))
    }

    /// Returns true if template rendering failed.
    pub fn is_template(&self) -> bool {
        matches!(self.kind, WebErrorKind::Template(_))
    }

    /// Returns true if the profile store failed.
    pub fn is_storage(&self) -> bool {
        matches!(self.kind, WebErrorKind::Storage(_))
    }

    /// Returns true if a blocking store task panicked or was cancelled.
    pub fn is_task(&self) -> bool {
        matches!(self.kind, WebErrorKind::Task(_))
    }

    /// Returns the backtrace captured when this error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Display for WebErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebErrorKind::Serialization(e) => {
                write!(f, "failed to serialize profile: {e}")
            }
            WebErrorKind::Template(e) => write!(f, "failed to render template: {e}"),
            WebErrorKind::Storage(e) => write!(f, "profile storage failed: {e}"),
            WebErrorKind::Task(e) => write!(f, "storage task failed: {e}"),
        }
    }
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;

        // Backtrace (will be empty unless RUST_BACKTRACE is set).
        write!(f, "{}", self.backtrace)
    }
}

impl std::error::Error for WebError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            WebErrorKind::Serialization(e) => Some(e),
            WebErrorKind::Template(e) => Some(e),
            WebErrorKind::Storage(e) => Some(e),
            WebErrorKind::Task(e) => Some(e),
        }
    }
}

impl IntoResponse for WebError {
    /// Logs the error and answers 500 with the one-line summary.
    ///
    /// Why: the backtrace belongs in logs, not in the response body.
    fn into_response(self) -> Response {
        error!(error = %self.kind, "profiler resource request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.kind.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn test_serialization() {
        let json_err = serde_json::from_str::<String>("nope").unwrap_err();
        let err = WebError::serialize(json_err);
        assert!(err.is_serialization());
        assert!(!err.is_template());
        assert!(!err.is_storage());
        assert!(!err.is_task());
        assert!(err.to_string().contains("failed to serialize profile"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_storage() {
        let err = WebError::storage(StorageError::backend("down"));
        assert!(err.is_storage());
        assert!(err.to_string().contains("storage backend error: down"));
    }

    #[test]
    fn test_into_response_is_500() {
        let err = WebError::storage(StorageError::backend("down"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_backtrace_captured() {
        let err = WebError::storage(StorageError::backend("down"));
        let _ = err.backtrace();
        assert!(format!("{err:?}").contains("WebError"));
    }
}
