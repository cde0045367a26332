// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::app::types::{
    CancelOutcome, CommandResult, CommandSpec, Credential, JobHandle, JobStatusReport,
};

/// Failures below the level of a remote answer. A remote answer that says
/// "no" is a `CommandResult::ImmediateFailure`, not one of these.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("remote session expired: {0}")]
    SessionExpired(String),
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("network error: {message}")]
    Network { message: String, request_sent: bool },
    #[error("transport timed out after {}ms", elapsed.as_millis())]
    Timeout { elapsed: Duration, request_sent: bool },
    #[error("command rejected as malformed: {0}")]
    Malformed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
/// Remote command service boundary: one logical channel that runs read and
/// mutating commands and reports on long-running jobs.
pub trait RemoteCommandPort: Send + Sync {
    /// Opens (or re-opens) the channel with the given credential.
    async fn open(&self, credential: &Credential) -> Result<(), TransportError>;

    async fn send(&self, command: &CommandSpec) -> Result<CommandResult, TransportError>;

    async fn poll_job(&self, handle: &JobHandle) -> Result<JobStatusReport, TransportError>;

    async fn cancel_job(&self, handle: &JobHandle) -> Result<CancelOutcome, TransportError>;

    /// Releases channel resources. Never fails from the caller's view.
    async fn close(&self);
}
