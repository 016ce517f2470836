use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

/// Language-neutral failure tags surfaced by every public operation. The
/// HTTP boundary translates these once; nothing below it maps errors ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    AlreadyRunning,
    AlreadyInitialized,
    Denied,
    Precondition,
    External,
    Timeout,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::AlreadyRunning => "ALREADY_RUNNING",
            ErrorKind::AlreadyInitialized => "ALREADY_INITIALIZED",
            ErrorKind::Denied => "DENIED",
            ErrorKind::Precondition => "PRECONDITION",
            ErrorKind::External => "EXTERNAL",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        };
        write!(f, "{tag}")
    }
}

/// What callers of the core see on failure: kind, message, and an optional
/// safe details payload. `INTERNAL` errors carry a correlation id and are
/// the only kind logged with full context.
#[derive(Debug, Error, Serialize, TS)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[ts(type = "unknown")]
    pub details: Option<serde_json::Value>,
    pub correlation_id: Option<Uuid>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            correlation_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what)
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Denied, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    /// Bug-shaped failures get a correlation id and an error-level trace.
    pub fn internal(message: impl Into<String>) -> Self {
        let correlation_id = Uuid::new_v4();
        let message = message.into();
        tracing::error!(%correlation_id, "internal error: {message}");
        Self {
            kind: ErrorKind::Internal,
            message,
            details: None,
            correlation_id: Some(correlation_id),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::not_found("row not found"),
            other => CoreError::internal(format!("database error: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_as_wire_tags() {
        assert_eq!(ErrorKind::NotFound.to_string(), "NOT_FOUND");
        assert_eq!(ErrorKind::AlreadyRunning.to_string(), "ALREADY_RUNNING");
        assert_eq!(ErrorKind::Internal.to_string(), "INTERNAL");
    }

    #[test]
    fn internal_errors_carry_a_correlation_id() {
        let err = CoreError::internal("boom");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.correlation_id.is_some());

        let err = CoreError::denied("nope");
        assert!(err.correlation_id.is_none());
    }
}
