//! Error types for the SQAaaS API

use thiserror::Error;

/// Result type alias using the SQAaaS Error
pub type Result<T> = std::result::Result<T, Error>;

/// SQAaaS error taxonomy
///
/// Every failure that can cross the orchestrator boundary maps to exactly
/// one variant; the HTTP layer renders variants with `http_status`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("Pipeline not found: {0}")]
    NotFound(String),

    #[error("Concurrent operation on pipeline {0}")]
    Conflict(String),

    #[error("Upstream error: {reason}")]
    Upstream { status: Option<u16>, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Upstream failure without a known HTTP status (connection refused,
    /// timeouts, subprocess failures).
    pub fn upstream<S: Into<String>>(reason: S) -> Self {
        Error::Upstream {
            status: None,
            reason: reason.into(),
        }
    }

    /// Upstream failure carrying the status code returned by the collaborator.
    pub fn upstream_status<S: Into<String>>(status: u16, reason: S) -> Self {
        Error::Upstream {
            status: Some(status),
            reason: reason.into(),
        }
    }

    /// HTTP status code this error renders as.
    ///
    /// An upstream 422 is a client-class failure (the collaborator rejected
    /// the request content) and surfaces as 422; every other upstream
    /// failure becomes 502.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Unprocessable(_) => 422,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Upstream {
                status: Some(422), ..
            } => 422,
            Error::Upstream { .. } => 502,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("bad name".into()).http_status(), 400);
        assert_eq!(Error::Unprocessable("not run".into()).http_status(), 422);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::Conflict("x".into()).http_status(), 409);
        assert_eq!(Error::upstream("boom").http_status(), 502);
        assert_eq!(Error::Internal("bug".into()).http_status(), 500);
    }

    #[test]
    fn test_upstream_422_is_client_class() {
        // A collaborator rejecting the request content renders as 422, not
        // as a gateway failure
        assert_eq!(Error::upstream_status(422, "rejected").http_status(), 422);
        assert_eq!(Error::upstream_status(500, "down").http_status(), 502);
        assert_eq!(Error::upstream_status(404, "gone").http_status(), 502);
    }

    #[test]
    fn test_upstream_reason_preserved() {
        let e = Error::upstream_status(503, "jenkins down");
        assert!(e.to_string().contains("jenkins down"));
        match e {
            Error::Upstream { status, .. } => assert_eq!(status, Some(503)),
            _ => panic!("wrong variant"),
        }
    }
}
