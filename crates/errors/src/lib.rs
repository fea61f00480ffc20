//! Shared error taxonomy for the agent.
//!
//! [`ErrorMetadata`] is attached to an [`anyhow::Error`] chain via
//! `.context(...)` anywhere in the codebase that wants to classify a failure
//! for logging, the health endpoint, or retry/DLQ routing. Code that doesn't
//! care about classification just propagates `anyhow::Error` with `?` as
//! usual; only the call sites that need to *decide* something based on the
//! error kind downcast through [`ErrorMetadataAnyhowExt`].

use std::borrow::Cow;

use http::StatusCode;
use serde::Serialize;

mod report;

pub use report::{
    report_error,
    report_error_sync,
};

/// Tags an `anyhow` error chain with a classification used across the agent
/// to decide retry behavior, DLQ routing, and `/health` status.
///
/// `short_msg` is a stable, ScreamingCamelCase tag suitable for metrics and
/// test assertions (e.g. `SinkQueueFull`). `msg` is the longer,
/// developer-facing description that ends up in logs.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// Malformed or missing-required-key configuration. Fails startup.
    BadConfig,
    /// The record/entry this call refers to does not exist (e.g. DLQ entry
    /// already reprocessed).
    NotFound,
    /// Caller should back off and retry later: queue full, sink saturated,
    /// circuit open. Never indicates the caller's request was invalid.
    Overloaded,
    /// The downstream collaborator (container runtime, remote sink) is
    /// unreachable or returned a 5xx. Distinct from `Overloaded` in that it's
    /// about the callee, not about agent-side saturation.
    Unavailable,
    /// The downstream collaborator rejected the request as malformed and a
    /// retry would not help (4xx-style). Routes straight to DLQ.
    PermanentRejection,
    /// Catch-all for bugs / unexpected states that aren't the operator's
    /// fault. Maps to "unhealthy" in `/health` when seen on the hot path.
    OperationalInternalServerError,
}

impl ErrorMetadata {
    pub fn bad_config(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadConfig,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn unavailable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unavailable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn permanent_rejection(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::PermanentRejection,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: "InternalError".into(),
            msg: "An internal error occurred.".into(),
        }
    }

    /// True for errors a retry will not fix: these should be routed straight
    /// to the DLQ rather than consuming a retry attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::PermanentRejection | ErrorCode::BadConfig | ErrorCode::NotFound
        )
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn http_status(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadConfig => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::PermanentRejection => StatusCode::BAD_REQUEST,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify an HTTP status code returned by a sink's wire transport.
    /// 4xx (other than 429) is a permanent rejection; 429 and 5xx are
    /// transient and worth retrying.
    pub fn from_sink_response_status(status: StatusCode) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Some(Self::unavailable(
                "SinkResponseError",
                format!("sink responded with {status}"),
            ));
        }
        if status.is_client_error() {
            return Some(Self::permanent_rejection(
                "SinkRejected",
                format!("sink rejected batch with {status}"),
            ));
        }
        None
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn is_permanent(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> Option<&str>;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn is_permanent(&self) -> bool {
        self.error_metadata().is_some_and(ErrorMetadata::is_permanent)
    }

    fn is_overloaded(&self) -> bool {
        self.error_metadata().is_some_and(ErrorMetadata::is_overloaded)
    }

    fn user_facing_message(&self) -> String {
        match self.error_metadata() {
            Some(e) => e.msg.to_string(),
            None => "An internal error occurred.".to_string(),
        }
    }

    fn short_msg(&self) -> Option<&str> {
        self.error_metadata().map(|e| e.short_msg.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_skip_retry() {
        let e: anyhow::Error =
            anyhow::Error::from(ErrorMetadata::permanent_rejection("Bad", "bad payload"));
        assert!(e.is_permanent());
        assert!(!e.is_overloaded());
    }

    #[test]
    fn sink_response_classification() {
        assert!(ErrorMetadata::from_sink_response_status(StatusCode::OK).is_none());
        assert_eq!(
            ErrorMetadata::from_sink_response_status(StatusCode::BAD_REQUEST)
                .unwrap()
                .code,
            ErrorCode::PermanentRejection
        );
        assert_eq!(
            ErrorMetadata::from_sink_response_status(StatusCode::SERVICE_UNAVAILABLE)
                .unwrap()
                .code,
            ErrorCode::Unavailable
        );
        assert_eq!(
            ErrorMetadata::from_sink_response_status(StatusCode::TOO_MANY_REQUESTS)
                .unwrap()
                .code,
            ErrorCode::Unavailable
        );
    }
}
