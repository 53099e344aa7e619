//! Client-facing error types

use std::fmt;

use serde::Serialize;

/// Error categories exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request payload is malformed
    BadRequest,
    /// Missing or unknown action
    BadAction,
    /// Sequence number missing or not positive
    BadSeq,
    /// Session missing, expired or revoked
    NotAuthenticated,
    /// Authenticated but not allowed
    Forbidden,
    /// Referenced object does not exist
    NotFound,
    /// Anything else
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::BadAction => "bad_action",
            ErrorKind::BadSeq => "bad_seq",
            ErrorKind::NotAuthenticated => "not_authenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error returned to a client in reply to a request.
///
/// `detail` carries internal context for logs and never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach internal context
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn not_authenticated() -> Self {
        Self::new(ErrorKind::NotAuthenticated, "session is missing or expired")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Internal failure; the public message is fixed so internal text cannot leak
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "internal server error").with_detail(detail)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::bad_request("invalid request payload").with_detail(e.to_string())
    }
}
