// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;

use crate::app::errors::SessionError;
use crate::app::ports::{ClockPort, CredentialProvider, RemoteCommandPort, TransportError};
use crate::app::services::backoff::BackoffPolicy;
use crate::app::services::redact::{redacted, scrub};
use crate::app::types::{
    CancelOutcome, CommandResult, CommandSpec, Credential, JobHandle, JobStatusReport,
    RemoteSession, SessionState,
};

const SESSION_EXPIRED_PATTERNS: [&str; 6] = [
    "session has expired",
    "session is no longer valid",
    "runspace is not in the opened state",
    "connection has been closed",
    "remote session was closed",
    "token has expired",
];

const THROTTLED_PATTERNS: [&str; 3] = ["throttl", "rate limit", "server busy"];

/// How a remote `ImmediateFailure` should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFailure {
    /// The channel is dead; reconnect and resend.
    SessionExpired,
    /// Refused before being applied; retryable even for mutating commands.
    Throttled,
    Rejected,
}

pub fn classify_remote_failure(code: &str, message: &str) -> RemoteFailure {
    let haystack = format!("{code} {message}").to_ascii_lowercase();
    if SESSION_EXPIRED_PATTERNS
        .iter()
        .any(|pattern| haystack.contains(pattern))
    {
        RemoteFailure::SessionExpired
    } else if THROTTLED_PATTERNS
        .iter()
        .any(|pattern| haystack.contains(pattern))
    {
        RemoteFailure::Throttled
    } else {
        RemoteFailure::Rejected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub backoff: BackoffPolicy,
    /// Default per-call timeout; a command's own timeout wins.
    pub command_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

struct SessionInner {
    state: SessionState,
    credential: Option<Credential>,
    last_error: Option<String>,
    attempt: u32,
    /// Bumped on every successful (re)connect so concurrent callers can tell
    /// whether the channel they saw fail has already been replaced.
    generation: u64,
    connected_at: Option<String>,
}

/// Owner of the single logical channel to the remote command service.
pub struct SessionManager {
    remote: Arc<dyn RemoteCommandPort>,
    credentials: Arc<dyn CredentialProvider>,
    clock: Arc<dyn ClockPort>,
    settings: SessionSettings,
    inner: std::sync::Mutex<SessionInner>,
    // Held for the duration of connect, reconnect and disconnect.
    transition: Mutex<()>,
}

impl SessionManager {
    pub fn new(
        remote: Arc<dyn RemoteCommandPort>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn ClockPort>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            remote,
            credentials,
            clock,
            settings,
            inner: std::sync::Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                credential: None,
                last_error: None,
                attempt: 0,
                generation: 0,
                connected_at: None,
            }),
            transition: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> RemoteSession {
        let inner = self.inner();
        RemoteSession {
            state: inner.state,
            last_error: inner.last_error.clone(),
            attempt: inner.attempt,
            connected_at: inner.connected_at.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    /// Single connection attempt. Failure leaves the session in `Error`;
    /// nothing is retried.
    pub async fn connect(
        &self,
        credential: Option<Credential>,
    ) -> Result<RemoteSession, SessionError> {
        let _guard = self.transition.lock().await;
        self.set_state(SessionState::Connecting);
        let credential = match credential {
            Some(credential) => {
                self.inner().credential = Some(credential.clone());
                credential
            }
            None => match self.usable_credential().await {
                Ok(credential) => credential,
                Err(err) => return Err(self.fail_connect(err)),
            },
        };
        match self.open(&credential).await {
            Ok(()) => {
                self.mark_connected();
                Ok(self.snapshot())
            }
            Err(err) => {
                let err = match err {
                    TransportError::Authentication(reason)
                    | TransportError::SessionExpired(reason) => {
                        SessionError::AuthenticationFailure(reason)
                    }
                    TransportError::Network { message, .. } => SessionError::Transient {
                        reason: message,
                        request_sent: false,
                    },
                    TransportError::Timeout { elapsed, .. } => SessionError::Timeout {
                        after: elapsed,
                        request_sent: false,
                    },
                    TransportError::Malformed(reason) | TransportError::Protocol(reason) => {
                        SessionError::Unexpected {
                            command: "connect".to_string(),
                            reason,
                        }
                    }
                };
                Err(self.fail_connect(err))
            }
        }
    }

    /// Returns immediately when connected; otherwise (re)connects with the
    /// backoff policy. Concurrent callers share one connection attempt.
    pub async fn ensure_connected(&self) -> Result<u64, SessionError> {
        if let Some(generation) = self.connected_generation() {
            return Ok(generation);
        }
        let _guard = self.transition.lock().await;
        if let Some(generation) = self.connected_generation() {
            return Ok(generation);
        }
        self.recover_locked().await
    }

    /// Always succeeds.
    pub async fn disconnect(&self) {
        let _guard = self.transition.lock().await;
        self.remote.close().await;
        let mut inner = self.inner();
        inner.state = SessionState::Disconnected;
        inner.credential = None;
        inner.attempt = 0;
        inner.connected_at = None;
        tracing::info!("remote session disconnected");
    }

    pub async fn execute(&self, command: &CommandSpec) -> Result<CommandResult, SessionError> {
        let timeout = command.timeout.unwrap_or(self.settings.command_timeout);
        let remote = &self.remote;
        let result = self
            .run_with_recovery(Some(command), &command.name, timeout, move || async move {
                match remote.send(command).await? {
                    CommandResult::ImmediateFailure { code, message }
                        if classify_remote_failure(&code, &message)
                            == RemoteFailure::SessionExpired =>
                    {
                        Err(TransportError::SessionExpired(message))
                    }
                    other => Ok(other),
                }
            })
            .await?;
        if let CommandResult::ImmediateFailure { code, message } = &result {
            self.inner().last_error = Some(format!("{code}: {}", scrub(message, command)));
        }
        Ok(result)
    }

    pub async fn poll_job(&self, handle: &JobHandle) -> Result<JobStatusReport, SessionError> {
        let remote = &self.remote;
        self.run_with_recovery(None, "poll-job", self.settings.command_timeout, move || {
            remote.poll_job(handle)
        })
        .await
    }

    pub async fn cancel_job(&self, handle: &JobHandle) -> Result<CancelOutcome, SessionError> {
        let remote = &self.remote;
        self.run_with_recovery(None, "cancel-job", self.settings.command_timeout, move || {
            remote.cancel_job(handle)
        })
        .await
    }

    async fn run_with_recovery<T, F, Fut>(
        &self,
        command: Option<&CommandSpec>,
        label: &str,
        timeout: Duration,
        call: F,
    ) -> Result<T, SessionError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut generation = self.ensure_connected().await?;
        let mut expiries = 0u32;
        loop {
            let outcome = match tokio::time::timeout(timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout {
                    elapsed: timeout,
                    request_sent: true,
                }),
            };
            let reason = match outcome {
                Ok(value) => {
                    self.inner().last_error = None;
                    return Ok(value);
                }
                // An expired session never ran the command, so resending is
                // safe even for mutating commands.
                Err(TransportError::SessionExpired(reason)) => reason,
                Err(err) => return Err(self.command_failed(err, command, label)),
            };
            expiries += 1;
            tracing::warn!(command = label, expiries, reason = %reason, "remote session expired");
            if expiries > self.settings.backoff.max_attempts {
                let err = SessionError::ConnectionLost {
                    attempts: expiries,
                    reason,
                };
                return Err(self.fail_connect(err));
            }
            generation = self.reconnect(generation, reason).await?;
        }
    }

    async fn reconnect(&self, observed: u64, reason: String) -> Result<u64, SessionError> {
        let _guard = self.transition.lock().await;
        {
            let mut inner = self.inner();
            if inner.state == SessionState::Connected && inner.generation != observed {
                return Ok(inner.generation);
            }
            inner.state = SessionState::Reconnecting;
            inner.last_error = Some(reason);
        }
        self.recover_locked().await
    }

    /// Reconnect loop. Caller holds the transition guard.
    async fn recover_locked(&self) -> Result<u64, SessionError> {
        let policy = self.settings.backoff;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_reason = String::from("not connected");
        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = policy.delay(attempt - 1);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::time::sleep(delay).await;
            }
            {
                let mut inner = self.inner();
                inner.attempt = attempt + 1;
                inner.state = if inner.generation == 0 {
                    SessionState::Connecting
                } else {
                    SessionState::Reconnecting
                };
            }
            let credential = match self.usable_credential().await {
                Ok(credential) => credential,
                Err(err) => return Err(self.fail_connect(err)),
            };
            match self.open(&credential).await {
                Ok(()) => return Ok(self.mark_connected()),
                Err(TransportError::Authentication(reason)) => {
                    return Err(self.fail_connect(SessionError::AuthenticationFailure(reason)));
                }
                Err(TransportError::Malformed(reason)) | Err(TransportError::Protocol(reason)) => {
                    let err = SessionError::Unexpected {
                        command: "connect".to_string(),
                        reason,
                    };
                    return Err(self.fail_connect(err));
                }
                Err(TransportError::SessionExpired(reason)) => {
                    // Rejected credential: fetch a fresh one next time round.
                    self.inner().credential = None;
                    last_reason = reason;
                }
                Err(err) => last_reason = err.to_string(),
            }
            tracing::warn!(attempt = attempt + 1, max_attempts, reason = %last_reason, "reconnect attempt failed");
        }
        Err(self.fail_connect(SessionError::ConnectionLost {
            attempts: max_attempts,
            reason: last_reason,
        }))
    }

    async fn open(&self, credential: &Credential) -> Result<(), TransportError> {
        let timeout = self.settings.command_timeout;
        match tokio::time::timeout(timeout, self.remote.open(credential)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                elapsed: timeout,
                request_sent: false,
            }),
        }
    }

    async fn usable_credential(&self) -> Result<Credential, SessionError> {
        let cached = self.inner().credential.clone();
        if let Some(credential) = cached {
            if !credential.is_expired(self.clock.now_utc()) {
                return Ok(credential);
            }
            tracing::debug!("cached credential expired; refreshing");
        }
        let fresh = self
            .credentials
            .get_credential()
            .await
            .map_err(|err| SessionError::AuthenticationFailure(err.to_string()))?;
        self.inner().credential = Some(fresh.clone());
        Ok(fresh)
    }

    fn command_failed(
        &self,
        err: TransportError,
        command: Option<&CommandSpec>,
        label: &str,
    ) -> SessionError {
        let describe = || command.map(redacted).unwrap_or_else(|| label.to_string());
        let clean = |text: String| match command {
            Some(command) => scrub(&text, command),
            None => text,
        };
        let err = match err {
            TransportError::Authentication(reason) => {
                return self.fail_connect(SessionError::AuthenticationFailure(reason));
            }
            TransportError::SessionExpired(reason) => SessionError::ConnectionLost {
                attempts: 0,
                reason,
            },
            TransportError::Network {
                message,
                request_sent,
            } => {
                // Force a reconnect on next use.
                self.inner().state = SessionState::Error;
                SessionError::Transient {
                    reason: clean(message),
                    request_sent,
                }
            }
            TransportError::Timeout {
                elapsed,
                request_sent,
            } => SessionError::Timeout {
                after: elapsed,
                request_sent,
            },
            TransportError::Malformed(reason) => SessionError::Malformed {
                command: describe(),
                reason: clean(reason),
            },
            TransportError::Protocol(reason) => SessionError::Unexpected {
                command: describe(),
                reason: clean(reason),
            },
        };
        tracing::warn!(command = %describe(), code = err.code(), error = %err, "remote call failed");
        self.inner().last_error = Some(err.to_string());
        err
    }

    fn fail_connect(&self, err: SessionError) -> SessionError {
        let mut inner = self.inner();
        inner.state = SessionState::Error;
        inner.last_error = Some(err.to_string());
        tracing::error!(code = err.code(), error = %err, "remote session unavailable");
        err
    }

    fn mark_connected(&self) -> u64 {
        let now = self.clock.now_utc().format(&Rfc3339).ok();
        let mut inner = self.inner();
        inner.state = SessionState::Connected;
        inner.attempt = 0;
        inner.generation += 1;
        inner.connected_at = now;
        tracing::info!(generation = inner.generation, "remote session connected");
        inner.generation
    }

    fn connected_generation(&self) -> Option<u64> {
        let inner = self.inner();
        (inner.state == SessionState::Connected).then_some(inner.generation)
    }

    fn set_state(&self, state: SessionState) {
        self.inner().state = state;
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
