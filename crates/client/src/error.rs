//! Typed failures returned by the backend client.

use std::fmt;

use thiserror::Error;

/// Result of a backend call.
pub type ApiResult<T> = Result<T, ApiError>;

/// Machine-readable error code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `api_timeout`
    Timeout,
    /// `api_unreachable`: DNS or connect failure.
    Unreachable,
    /// `server_error`
    ServerError,
    /// `endpoint_not_found`: the backend has no such route.
    EndpointNotFound,
    /// `auth_required`: the caller must log in again.
    AuthRequired,
    /// `api_error`: anything else.
    Api,
    /// A code chosen by the backend (`quota_exceeded`, `invalid_license`, ...).
    Backend(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Timeout => "api_timeout",
            ErrorCode::Unreachable => "api_unreachable",
            ErrorCode::ServerError => "server_error",
            ErrorCode::EndpointNotFound => "endpoint_not_found",
            ErrorCode::AuthRequired => "auth_required",
            ErrorCode::Api => "api_error",
            ErrorCode::Backend(code) => code,
        }
    }

    /// Map a code found in a response body; empty means `api_error`.
    pub fn from_backend(code: &str) -> Self {
        match code {
            "" | "api_error" => ErrorCode::Api,
            "api_timeout" => ErrorCode::Timeout,
            "api_unreachable" => ErrorCode::Unreachable,
            "server_error" => ErrorCode::ServerError,
            "endpoint_not_found" => ErrorCode::EndpointNotFound,
            "auth_required" => ErrorCode::AuthRequired,
            other => ErrorCode::Backend(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification for choosing user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying later (timeouts, unreachable backend, 5xx).
    Transient,
    /// Will fail again as-is.
    Client,
    /// Needs a fresh login.
    AuthRequired,
}

/// A normalized backend failure.
///
/// `message` is meant for end users; `code` is for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    status: Option<u16>,
    requires_auth: bool,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            requires_auth: false,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Terminal error after a failed token refresh.
    pub fn auth_required() -> Self {
        Self {
            code: ErrorCode::AuthRequired,
            message: "Your session has expired. Please log in again.".to_string(),
            status: Some(401),
            requires_auth: true,
        }
    }

    pub fn code(&self) -> &ErrorCode {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    /// Timeouts, unreachable backend, `server_error` and any 5xx.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Timeout | ErrorCode::Unreachable | ErrorCode::ServerError
        ) || self.status.is_some_and(|s| (500..600).contains(&s))
    }

    pub fn class(&self) -> ErrorClass {
        if self.requires_auth || self.code == ErrorCode::AuthRequired {
            ErrorClass::AuthRequired
        } else if self.is_retryable() {
            ErrorClass::Transient
        } else {
            ErrorClass::Client
        }
    }
}
