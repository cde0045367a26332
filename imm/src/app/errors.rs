// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::time::Duration;

use thiserror::Error as ThisError;

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication-failure";
    pub const CONNECTION_LOST: &str = "connection-lost";
    pub const NETWORK_ERROR: &str = "network-error";
    pub const TIMEOUT: &str = "timeout";
    pub const MALFORMED_COMMAND: &str = "malformed-command";
    pub const UNEXPECTED_RESPONSE: &str = "unexpected-response";
    pub const REMOTE_REJECTED: &str = "remote-rejected";
    pub const AMBIGUOUS_OUTCOME: &str = "ambiguous-outcome";
    pub const VALIDATION_BLOCKED: &str = "validation-blocked";
    pub const VALIDATION_CHECK_UNAVAILABLE: &str = "validation-check-unavailable";
    pub const JOB_TIMEOUT: &str = "job-timeout";
    pub const JOB_FAILED: &str = "job-failed";
    pub const CANCELLATION_NOT_CONFIRMED: &str = "cancellation-not-confirmed";
    pub const CANCELLED: &str = "cancelled";
    pub const INVALID_ARGUMENT: &str = "invalid-argument";
    pub const NOT_FOUND: &str = "not-found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal-error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Internal,
    /// The remote service or the channel to it failed.
    Remote,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// Terminal failures surfaced by the session manager.
///
/// Connectivity problems that the manager can recover from locally (expired
/// sessions, reconnect attempts) never show up here; only what is left after
/// recovery gave up or was not allowed.
#[derive(Debug, Clone, ThisError)]
pub enum SessionError {
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),
    #[error("connection lost after {attempts} attempt(s): {reason}")]
    ConnectionLost { attempts: u32, reason: String },
    #[error("network failure: {reason}")]
    Transient { reason: String, request_sent: bool },
    #[error("remote call timed out after {}ms", after.as_millis())]
    Timeout { after: Duration, request_sent: bool },
    #[error("malformed command {command}: {reason}")]
    Malformed { command: String, reason: String },
    #[error("unexpected failure running {command}: {reason}")]
    Unexpected { command: String, reason: String },
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::AuthenticationFailure(_) => codes::AUTHENTICATION_FAILURE,
            SessionError::ConnectionLost { .. } => codes::CONNECTION_LOST,
            SessionError::Transient { .. } => codes::NETWORK_ERROR,
            SessionError::Timeout { .. } => codes::TIMEOUT,
            SessionError::Malformed { .. } => codes::MALFORMED_COMMAND,
            SessionError::Unexpected { .. } => codes::UNEXPECTED_RESPONSE,
        }
    }

    /// Network and timeout class failures. Safe to retry for reads only
    /// unless `outcome_unknown` is false.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Transient { .. } | SessionError::Timeout { .. }
        )
    }

    /// True when the request may have reached the remote side before the
    /// failure, so its side effect may already have happened.
    pub fn outcome_unknown(&self) -> bool {
        match self {
            SessionError::Transient { request_sent, .. }
            | SessionError::Timeout { request_sent, .. } => *request_sent,
            _ => false,
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        AppError::with_message(AppErrorKind::Remote, err.code(), err.to_string())
    }
}
