// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::app::commands;
use crate::app::errors::SessionError;
use crate::app::services::session::SessionManager;
use crate::app::types::{CommandResult, CommandSpec, EntitySnapshot, JobStatus};

const NOT_FOUND_MARKERS: [&str; 4] = [
    "couldn't be found",
    "could not be found",
    "doesn't exist",
    "not found",
];

#[derive(Debug, Error)]
pub enum LookupError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{command} was rejected: {message}")]
    Rejected { command: String, message: String },
    #[error("{command} unexpectedly started a background job")]
    Deferred { command: String },
    #[error("unreadable {command} payload: {source}")]
    Payload {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Read-only directory queries used by validation checks. Every query goes
/// through the shared session.
#[derive(Clone)]
pub struct DirectoryLookup {
    session: Arc<SessionManager>,
}

impl DirectoryLookup {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Inactive source mailbox, `None` when the directory has no such entity.
    pub async fn source_snapshot(
        &self,
        identity: &str,
    ) -> Result<Option<EntitySnapshot>, LookupError> {
        self.snapshot(commands::preflight(identity)).await
    }

    /// Any mailbox, active or inactive.
    pub async fn mailbox(&self, identity: &str) -> Result<Option<EntitySnapshot>, LookupError> {
        self.snapshot(commands::mailbox_lookup(identity)).await
    }

    pub async fn address_in_use(&self, address: &str) -> Result<bool, LookupError> {
        let payload = self.query(&commands::recipient_lookup(address)).await?;
        Ok(!is_empty(&payload))
    }

    /// True when a restore between the two mailboxes is already queued or
    /// running. Finished or failed requests don't count.
    pub async fn restore_request_pending(
        &self,
        source: &str,
        target: &str,
    ) -> Result<bool, LookupError> {
        let payload = self
            .query(&commands::restore_requests(source, target))
            .await?;
        let requests = match payload {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(requests.iter().any(|request| {
            let status = request
                .get("Status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            !matches!(
                status.parse::<JobStatus>(),
                Ok(JobStatus::Completed) | Ok(JobStatus::Failed)
            )
        }))
    }

    async fn snapshot(&self, command: CommandSpec) -> Result<Option<EntitySnapshot>, LookupError> {
        let payload = self.query(&command).await?;
        EntitySnapshot::from_payload(&payload).map_err(|source| LookupError::Payload {
            command: command.name.clone(),
            source,
        })
    }

    /// Transient failures are retried with the session's backoff policy
    /// before the lookup is reported as failed.
    async fn query(&self, command: &CommandSpec) -> Result<Value, LookupError> {
        let policy = self.session.settings().backoff;
        let mut attempt = 0u32;
        let result = loop {
            match self.session.execute(command).await {
                Err(err) if retryable(&err, command) && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    tracing::debug!(
                        command = %command.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other?,
            }
        };
        match result {
            CommandResult::ImmediateSuccess(payload) => Ok(payload),
            CommandResult::ImmediateFailure { message, .. } if is_not_found(&message) => {
                Ok(Value::Null)
            }
            CommandResult::ImmediateFailure { code, message } => Err(LookupError::Rejected {
                command: command.name.clone(),
                message: if code.is_empty() {
                    message
                } else {
                    format!("{code}: {message}")
                },
            }),
            CommandResult::Deferred(_) => Err(LookupError::Deferred {
                command: command.name.clone(),
            }),
        }
    }
}

fn retryable(err: &SessionError, command: &CommandSpec) -> bool {
    err.is_transient() && (!err.outcome_unknown() || !command.is_mutating())
}

fn is_not_found(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    NOT_FOUND_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_empty(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
