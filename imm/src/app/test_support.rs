// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Scripted fakes for the remote command service, credential provider,
//! clock and progress sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use time::macros::datetime;

use crate::app::ports::{
    BatchEvent, ClockPort, CredentialProvider, CredentialUnavailable, ProgressSink,
    RemoteCommandPort, TransportError,
};
use crate::app::services::session::{SessionManager, SessionSettings};
use crate::app::types::{
    BatchId, BatchOperationItem, CancelOutcome, CommandResult, CommandSpec, Credential, ItemStatus,
    JobHandle, JobStatus, JobStatusReport,
};

type SendResponder = dyn Fn(&CommandSpec) -> Result<CommandResult, TransportError> + Send + Sync;
type PollResponder =
    dyn Fn(&JobHandle, usize) -> Result<JobStatusReport, TransportError> + Send + Sync;

pub struct ScriptedRemote {
    opens: Mutex<VecDeque<Result<(), TransportError>>>,
    sends: Mutex<VecDeque<Result<CommandResult, TransportError>>>,
    responder: Mutex<Option<Arc<SendResponder>>>,
    poll_responder: Mutex<Option<Arc<PollResponder>>>,
    cancel_outcome: Mutex<Result<CancelOutcome, TransportError>>,
    open_delay: Mutex<Option<Duration>>,
    send_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<CommandSpec>>,
    open_count: AtomicUsize,
    close_count: AtomicUsize,
    poll_count: AtomicUsize,
    cancel_count: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self {
            opens: Mutex::new(VecDeque::new()),
            sends: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
            poll_responder: Mutex::new(None),
            cancel_outcome: Mutex::new(Ok(CancelOutcome::Requested)),
            open_delay: Mutex::new(None),
            send_delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            open_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            poll_count: AtomicUsize::new(0),
            cancel_count: AtomicUsize::new(0),
        }
    }

    pub fn push_open(&self, result: Result<(), TransportError>) {
        self.opens.lock().unwrap().push_back(result);
    }

    /// Queued results are consumed before the responder is consulted.
    pub fn push_send(&self, result: Result<CommandResult, TransportError>) {
        self.sends.lock().unwrap().push_back(result);
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&CommandSpec) -> Result<CommandResult, TransportError> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Arc::new(responder));
    }

    pub fn set_poll_responder<F>(&self, responder: F)
    where
        F: Fn(&JobHandle, usize) -> Result<JobStatusReport, TransportError>
            + Send
            + Sync
            + 'static,
    {
        *self.poll_responder.lock().unwrap() = Some(Arc::new(responder));
    }

    pub fn set_cancel_outcome(&self, outcome: Result<CancelOutcome, TransportError>) {
        *self.cancel_outcome.lock().unwrap() = outcome;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn sent(&self) -> Vec<CommandSpec> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_named(&self, name: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.name == name)
            .count()
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteCommandPort for ScriptedRemote {
    async fn open(&self, _credential: &Credential) -> Result<(), TransportError> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.opens.lock().unwrap().pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn send(&self, command: &CommandSpec) -> Result<CommandResult, TransportError> {
        self.sent.lock().unwrap().push(command.clone());
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self.sends.lock().unwrap().pop_front();
        if let Some(result) = queued {
            return result;
        }
        let responder = self.responder.lock().unwrap().clone();
        match responder {
            Some(responder) => responder(command),
            None => Ok(CommandResult::ImmediateSuccess(Value::Null)),
        }
    }

    async fn poll_job(&self, handle: &JobHandle) -> Result<JobStatusReport, TransportError> {
        let index = self.poll_count.fetch_add(1, Ordering::SeqCst);
        let responder = self.poll_responder.lock().unwrap().clone();
        match responder {
            Some(responder) => responder(handle, index),
            None => Ok(JobStatusReport {
                status: JobStatus::Running,
                progress_percent: None,
                message: None,
            }),
        }
    }

    async fn cancel_job(&self, _handle: &JobHandle) -> Result<CancelOutcome, TransportError> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        self.cancel_outcome.lock().unwrap().clone()
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct StaticCredentials {
    credential: Option<Credential>,
    calls: AtomicUsize,
}

impl StaticCredentials {
    pub fn new(secret: &str) -> Self {
        Self {
            credential: Some(Credential::new(secret, None)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn expiring(secret: &str, expires_at: OffsetDateTime) -> Self {
        Self {
            credential: Some(Credential::new(secret, Some(expires_at))),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            credential: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_credential(&self) -> Result<Credential, CredentialUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.credential
            .clone()
            .ok_or_else(|| CredentialUnavailable::new("no token configured"))
    }
}

pub struct TestClock {
    now: Mutex<OffsetDateTime>,
}

impl TestClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }
}

impl ClockPort for TestClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

pub fn session_with(remote: Arc<ScriptedRemote>) -> SessionManager {
    SessionManager::new(
        remote,
        Arc::new(StaticCredentials::new("test-token")),
        Arc::new(TestClock::new(datetime!(2026-03-01 09:00 UTC))),
        SessionSettings::default(),
    )
}

/// Records every transition as `(item index, status)` plus batch events.
#[derive(Default)]
pub struct RecordingProgress {
    pub transitions: Mutex<Vec<(usize, ItemStatus)>>,
    pub events: Mutex<Vec<BatchEvent>>,
}

impl RecordingProgress {
    pub fn transitions_for(&self, index: usize) -> Vec<ItemStatus> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn item_changed(&self, _batch: BatchId, item: &BatchOperationItem) {
        self.transitions
            .lock()
            .unwrap()
            .push((item.index, item.status));
    }

    fn batch_event(&self, _batch: BatchId, event: &BatchEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
