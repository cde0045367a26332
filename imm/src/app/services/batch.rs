// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::app::commands;
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{BatchEvent, ClockPort, NoopProgress, ProgressSink};
use crate::app::services::jobs::{JobMonitor, JobObserver};
use crate::app::services::session::{RemoteFailure, SessionManager, classify_remote_failure};
use crate::app::services::validation::ValidationPipeline;
use crate::app::types::{
    AsyncJob, BatchId, BatchOperationItem, BatchOperationResult, CommandResult, ItemError,
    ItemStatus, JobHandle, JobStatus, OperationRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchMode {
    #[default]
    Execute,
    /// Validate every item; executable items complete without any remote
    /// mutation.
    ValidateOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub concurrency: usize,
    pub stop_on_first_blocker: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Overrides the timeout of each remote call made for the operation.
    pub per_item_timeout: Option<Duration>,
    pub mode: BatchMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            stop_on_first_blocker: false,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            per_item_timeout: None,
            mode: BatchMode::Execute,
        }
    }
}

struct BatchRun {
    id: BatchId,
    config: BatchConfig,
    items: Vec<Mutex<BatchOperationItem>>,
    cursor: AtomicUsize,
    started: AtomicBool,
    cancel: watch::Sender<bool>,
    // Items currently InProgress, deferred jobs included.
    in_flight: watch::Sender<usize>,
    sink: RwLock<Arc<dyn ProgressSink>>,
    clock: Arc<dyn ClockPort>,
}

impl BatchRun {
    fn item(&self, index: usize) -> MutexGuard<'_, BatchOperationItem> {
        self.items[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(&self) -> Arc<dyn ProgressSink> {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn now(&self) -> Option<String> {
        self.clock.now_utc().format(&Rfc3339).ok()
    }

    /// Applies `change` to a non-terminal item and reports it while the item
    /// lock is still held, so one item's callbacks never reorder.
    fn update<F>(&self, index: usize, change: F) -> bool
    where
        F: FnOnce(&mut BatchOperationItem),
    {
        let mut item = self.item(index);
        if item.status.is_terminal() {
            return false;
        }
        let before = item.status;
        change(&mut item);
        self.after_change(before, &mut item);
        true
    }

    /// Pending -> InProgress, unless the batch is being cancelled.
    fn claim(&self, index: usize) -> bool {
        let mut item = self.item(index);
        if item.status != ItemStatus::Pending || self.is_cancelled() {
            return false;
        }
        item.status = ItemStatus::InProgress;
        self.after_change(ItemStatus::Pending, &mut item);
        true
    }

    fn after_change(&self, before: ItemStatus, item: &mut BatchOperationItem) {
        let after = item.status;
        if before != after {
            if after == ItemStatus::InProgress {
                item.started_at = self.now();
                self.in_flight.send_modify(|n| *n += 1);
            }
            if after.is_terminal() {
                item.finished_at = self.now();
            }
            if before == ItemStatus::InProgress {
                self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
            }
        }
        self.sink().item_changed(self.id, item);
    }

    fn finish(&self, index: usize, status: ItemStatus, error: Option<ItemError>) {
        self.update(index, |item| {
            item.status = status;
            if error.is_some() {
                item.last_error = error;
            }
        });
    }

    /// Raises the cancel flag and cancels every item nobody has claimed.
    fn request_cancel(&self, reason: &str) {
        if self.cancel.send_replace(true) {
            return;
        }
        tracing::warn!(batch = %self.id, reason, "batch cancellation requested");
        self.sink().batch_event(self.id, &BatchEvent::Cancelling);
        for index in 0..self.items.len() {
            let mut item = self.item(index);
            if item.status == ItemStatus::Pending {
                item.status = ItemStatus::Cancelled;
                item.last_error = Some(ItemError::new(codes::CANCELLED, reason));
                self.after_change(ItemStatus::Pending, &mut item);
            }
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    async fn drained(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn items(&self) -> Vec<BatchOperationItem> {
        (0..self.items.len())
            .map(|index| self.item(index).clone())
            .collect()
    }

    fn all_terminal(&self) -> bool {
        (0..self.items.len()).all(|index| self.item(index).status.is_terminal())
    }
}

struct ExecutorInner {
    session: Arc<SessionManager>,
    pipeline: Arc<ValidationPipeline>,
    monitor: JobMonitor,
    clock: Arc<dyn ClockPort>,
    next_id: AtomicU64,
    batches: Mutex<HashMap<BatchId, Arc<BatchRun>>>,
}

/// Drives batches of independent operations through validation and the
/// shared session with bounded concurrency. Cheap to clone.
#[derive(Clone)]
pub struct BatchExecutor {
    inner: Arc<ExecutorInner>,
}

impl BatchExecutor {
    pub fn new(
        session: Arc<SessionManager>,
        pipeline: Arc<ValidationPipeline>,
        monitor: JobMonitor,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                session,
                pipeline,
                monitor,
                clock,
                next_id: AtomicU64::new(1),
                batches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn submit(
        &self,
        items: Vec<BatchOperationItem>,
        config: BatchConfig,
    ) -> AppResult<BatchId> {
        if config.concurrency == 0 {
            return Err(AppError::with_message(
                AppErrorKind::InvalidArgument,
                codes::INVALID_ARGUMENT,
                "concurrency must be at least 1",
            ));
        }
        let id = BatchId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let items = items
            .into_iter()
            .enumerate()
            .map(|(index, mut item)| {
                item.index = index;
                item.status = ItemStatus::Pending;
                Mutex::new(item)
            })
            .collect::<Vec<_>>();
        tracing::info!(batch = %id, items = items.len(), concurrency = config.concurrency, mode = ?config.mode, "batch submitted");
        let run = BatchRun {
            id,
            config,
            items,
            cursor: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            cancel: watch::Sender::new(false),
            in_flight: watch::Sender::new(0),
            sink: RwLock::new(Arc::new(NoopProgress)),
            clock: self.inner.clock.clone(),
        };
        self.inner.batches().insert(id, Arc::new(run));
        Ok(id)
    }

    /// Submits requests without pre-supplied snapshots.
    pub fn submit_requests(
        &self,
        requests: Vec<OperationRequest>,
        config: BatchConfig,
    ) -> AppResult<BatchId> {
        self.submit(
            requests.into_iter().map(BatchOperationItem::new).collect(),
            config,
        )
    }

    /// Runs the batch to completion. Returns once every item is terminal,
    /// deferred remote jobs included.
    pub async fn run(
        &self,
        id: BatchId,
        progress: Arc<dyn ProgressSink>,
    ) -> AppResult<BatchOperationResult> {
        let run = self.inner.get(id)?;
        if run.started.swap(true, Ordering::SeqCst) {
            return Err(AppError::with_message(
                AppErrorKind::Conflict,
                codes::CONFLICT,
                format!("{id} has already been started"),
            ));
        }
        *run.sink.write().unwrap_or_else(PoisonError::into_inner) = progress;
        run.sink().batch_event(
            id,
            &BatchEvent::Started {
                total: run.items.len(),
            },
        );

        let workers = run.config.concurrency.min(run.items.len());
        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(self.inner.clone().worker(run.clone()));
        }
        let mut panicked = false;
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                tracing::error!(batch = %id, error = %err, "batch worker died");
                panicked = true;
            }
        }
        if panicked {
            self.inner.fail_orphans(&run);
        }
        run.drained().await;

        let result = BatchOperationResult::from_items(id, run.items());
        run.sink().batch_event(
            id,
            &BatchEvent::Finished {
                succeeded: result.succeeded,
                failed: result.failed,
                skipped: result.skipped,
                cancelled: result.cancelled,
            },
        );
        tracing::info!(
            batch = %id,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "batch finished"
        );
        Ok(result)
    }

    /// Cooperative: in-flight items finish their current attempt, pending
    /// ones are cancelled. Returns once nothing is in progress.
    pub async fn cancel(&self, id: BatchId) -> AppResult<()> {
        let run = self.inner.get(id)?;
        run.request_cancel("batch cancelled");
        let deferred: Vec<JobHandle> = run
            .items()
            .into_iter()
            .filter(|item| item.status == ItemStatus::InProgress)
            .filter_map(|item| item.remote_job_handle)
            .collect();
        for handle in deferred {
            self.inner.monitor.cancel(&handle).await;
        }
        run.drained().await;
        Ok(())
    }

    pub fn result(&self, id: BatchId) -> AppResult<BatchOperationResult> {
        let run = self.inner.get(id)?;
        if !run.all_terminal() {
            return Err(AppError::with_message(
                AppErrorKind::Conflict,
                codes::CONFLICT,
                format!("{id} still has unfinished items"),
            ));
        }
        Ok(BatchOperationResult::from_items(id, run.items()))
    }

    pub fn snapshot(&self, id: BatchId) -> AppResult<Vec<BatchOperationItem>> {
        Ok(self.inner.get(id)?.items())
    }

    /// Submits a new batch holding the failed items of a finished one, with
    /// fresh state. Items whose remote outcome is unknown or that the remote
    /// side rejected outright are left out.
    pub fn resubmit_failed(&self, id: BatchId, config: BatchConfig) -> AppResult<BatchId> {
        let previous = self.result(id)?;
        let items: Vec<BatchOperationItem> = previous
            .items
            .into_iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .filter(|item| {
                !item.last_error.as_ref().is_some_and(|err| {
                    matches!(err.code, codes::AMBIGUOUS_OUTCOME | codes::REMOTE_REJECTED)
                })
            })
            .map(|item| BatchOperationItem::new(item.request))
            .collect();
        if items.is_empty() {
            return Err(AppError::with_message(
                AppErrorKind::Conflict,
                codes::CONFLICT,
                format!("{id} has no failed items that can be resubmitted"),
            ));
        }
        tracing::info!(batch = %id, items = items.len(), "resubmitting failed items");
        self.submit(items, config)
    }

    /// Drops a finished batch from the registry.
    pub fn release(&self, id: BatchId) -> AppResult<BatchOperationResult> {
        let result = self.result(id)?;
        self.inner.batches().remove(&id);
        Ok(result)
    }
}

impl ExecutorInner {
    fn batches(&self) -> MutexGuard<'_, HashMap<BatchId, Arc<BatchRun>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: BatchId) -> AppResult<Arc<BatchRun>> {
        self.batches().get(&id).cloned().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::NotFound,
                codes::NOT_FOUND,
                format!("unknown batch {id}"),
            )
        })
    }

    async fn worker(self: Arc<Self>, run: Arc<BatchRun>) {
        loop {
            let index = run.cursor.fetch_add(1, Ordering::SeqCst);
            if index >= run.items.len() || run.is_cancelled() {
                break;
            }
            if run.claim(index) {
                self.process_item(&run, index).await;
            }
        }
    }

    async fn process_item(&self, run: &Arc<BatchRun>, index: usize) {
        let (request, snapshot) = {
            let item = run.item(index);
            (item.request.clone(), item.snapshot.clone())
        };
        let (validation, fetched) = self
            .pipeline
            .validate_request(&request, snapshot.as_ref())
            .await;
        let executable = validation.is_executable();
        let blockers = validation.blocker_summary();
        run.update(index, |item| {
            item.validation_result = Some(validation);
            if item.snapshot.is_none() {
                item.snapshot = fetched;
            }
        });

        if !executable {
            run.finish(
                index,
                ItemStatus::Skipped,
                Some(ItemError::new(codes::VALIDATION_BLOCKED, blockers)),
            );
            if run.config.stop_on_first_blocker {
                run.request_cancel("stopped after a validation blocker");
            }
            return;
        }
        if run.config.mode == BatchMode::ValidateOnly {
            run.finish(index, ItemStatus::Completed, None);
            return;
        }
        if run.is_cancelled() {
            run.finish(
                index,
                ItemStatus::Cancelled,
                Some(ItemError::new(codes::CANCELLED, "batch cancelled before execution")),
            );
            return;
        }
        self.execute(run, index, &request).await;
    }

    async fn execute(&self, run: &Arc<BatchRun>, index: usize, request: &OperationRequest) {
        let mut command = commands::for_operation(request);
        if let Some(timeout) = run.config.per_item_timeout {
            command.timeout = Some(timeout);
        }
        let mutating = command.is_mutating();

        loop {
            let mut attempt = 0;
            run.update(index, |item| {
                item.attempt_count += 1;
                attempt = item.attempt_count;
            });

            let retryable = match self.session.execute(&command).await {
                Ok(CommandResult::ImmediateSuccess(payload)) => {
                    run.update(index, |item| {
                        item.payload = Some(payload);
                        item.last_error = None;
                        item.status = ItemStatus::Completed;
                    });
                    return;
                }
                Ok(CommandResult::Deferred(handle)) => {
                    self.follow_job(run, index, handle);
                    return;
                }
                Ok(CommandResult::ImmediateFailure { code, message }) => {
                    let error = ItemError::new(codes::REMOTE_REJECTED, rejection(&code, &message));
                    if classify_remote_failure(&code, &message) != RemoteFailure::Throttled {
                        run.finish(index, ItemStatus::Failed, Some(error));
                        return;
                    }
                    error
                }
                Err(err) if mutating && err.outcome_unknown() => {
                    tracing::warn!(
                        batch = %run.id,
                        identity = %request.identity,
                        error = %err,
                        "mutating command may have been applied; not retrying"
                    );
                    let error = ItemError::new(
                        codes::AMBIGUOUS_OUTCOME,
                        format!("outcome unknown, verify remotely before resubmitting: {err}"),
                    );
                    run.finish(index, ItemStatus::Failed, Some(error));
                    return;
                }
                Err(err) if err.is_transient() => ItemError::new(err.code(), err.to_string()),
                Err(err) => {
                    run.finish(
                        index,
                        ItemStatus::Failed,
                        Some(ItemError::new(err.code(), err.to_string())),
                    );
                    return;
                }
            };

            if attempt > run.config.max_retries {
                run.finish(index, ItemStatus::Failed, Some(retryable));
                return;
            }
            tracing::info!(
                batch = %run.id,
                identity = %request.identity,
                attempt,
                code = retryable.code,
                "transient failure; retrying"
            );
            run.update(index, |item| item.last_error = Some(retryable));
            if !run.is_cancelled() {
                tokio::select! {
                    _ = tokio::time::sleep(run.config.retry_delay) => {}
                    _ = run.cancelled() => {}
                }
            }
            if run.is_cancelled() {
                run.finish(
                    index,
                    ItemStatus::Cancelled,
                    Some(ItemError::new(codes::CANCELLED, "batch cancelled between retries")),
                );
                return;
            }
        }
    }

    fn follow_job(&self, run: &Arc<BatchRun>, index: usize, handle: JobHandle) {
        run.update(index, |item| {
            item.remote_job_handle = Some(handle.clone());
            item.job_status = Some(JobStatus::Queued);
        });
        let observer = Arc::new(ItemJobObserver {
            run: run.clone(),
            index,
        });
        if let Err(err) = self.monitor.track(handle.clone(), observer) {
            run.finish(
                index,
                ItemStatus::Failed,
                Some(ItemError::new(err.code(), err.to_string())),
            );
            return;
        }
        // The batch may have been cancelled while the request was in flight.
        if run.is_cancelled() {
            let monitor = self.monitor.clone();
            tokio::spawn(async move {
                monitor.cancel(&handle).await;
            });
        }
    }

    fn fail_orphans(&self, run: &BatchRun) {
        for index in 0..run.items.len() {
            let orphaned = {
                let item = run.item(index);
                item.status == ItemStatus::InProgress && item.remote_job_handle.is_none()
            };
            if orphaned {
                run.finish(
                    index,
                    ItemStatus::Failed,
                    Some(ItemError::new(codes::INTERNAL_ERROR, "worker stopped unexpectedly")),
                );
            }
        }
    }
}

fn rejection(code: &str, message: &str) -> String {
    if code.is_empty() {
        message.to_string()
    } else {
        format!("{code}: {message}")
    }
}

/// Maps a tracked job's progress onto the item that started it.
struct ItemJobObserver {
    run: Arc<BatchRun>,
    index: usize,
}

impl JobObserver for ItemJobObserver {
    fn job_updated(&self, job: &AsyncJob) {
        self.run.update(self.index, |item| {
            item.job_status = Some(job.status);
            item.job_progress_percent = job.progress_percent;
            let reason = || {
                job.message
                    .clone()
                    .unwrap_or_else(|| format!("remote job {}", job.status.as_str()))
            };
            match job.status {
                JobStatus::Completed => {
                    item.status = ItemStatus::Completed;
                    item.last_error = None;
                }
                JobStatus::Failed => {
                    item.status = ItemStatus::Failed;
                    item.last_error = Some(ItemError::new(
                        job.error_code.unwrap_or(codes::JOB_FAILED),
                        reason(),
                    ));
                }
                JobStatus::Cancelled => {
                    item.status = ItemStatus::Cancelled;
                    item.last_error = Some(ItemError::new(
                        job.error_code.unwrap_or(codes::CANCELLED),
                        reason(),
                    ));
                }
                JobStatus::Queued | JobStatus::Running => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::TransportError;
    use crate::app::services::jobs::MonitorSettings;
    use crate::app::test_support::{RecordingProgress, ScriptedRemote, TestClock, session_with};
    use crate::app::types::{
        CancelOutcome, CommandSpec, EntitySnapshot, JobStatusReport, OperationKind,
        RecoveryParams, RestoreParams,
    };
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicU32;
    use time::macros::datetime;
    use tokio::time::Instant;

    fn executor(remote: Arc<ScriptedRemote>) -> BatchExecutor {
        let session = Arc::new(session_with(remote));
        let pipeline = Arc::new(ValidationPipeline::standard(session.clone()));
        let monitor = JobMonitor::new(
            session.clone(),
            MonitorSettings {
                poll_interval: Duration::from_secs(5),
                jitter: Duration::ZERO,
                max_wait: Duration::from_secs(60),
            },
        );
        let clock = Arc::new(TestClock::new(datetime!(2026-03-01 09:00 UTC)));
        BatchExecutor::new(session, pipeline, monitor, clock)
    }

    fn inactive(identity: &str) -> EntitySnapshot {
        EntitySnapshot {
            identity: identity.into(),
            is_inactive_mailbox: true,
            ..EntitySnapshot::default()
        }
    }

    fn inspect(identity: &str) -> BatchOperationItem {
        BatchOperationItem::new(OperationRequest::new(identity, OperationKind::Inspect))
            .with_snapshot(inactive(identity))
    }

    fn recovery(identity: &str) -> BatchOperationItem {
        BatchOperationItem::new(OperationRequest::new(
            identity,
            OperationKind::Recovery(RecoveryParams {
                target_upn: format!("{identity}@contoso.com"),
                display_name: identity.to_uppercase(),
                ..RecoveryParams::default()
            }),
        ))
        .with_snapshot(inactive(identity))
    }

    fn restore(identity: &str) -> BatchOperationItem {
        BatchOperationItem::new(OperationRequest::new(
            identity,
            OperationKind::Restore(RestoreParams {
                target_mailbox: "target@contoso.com".into(),
                ..RestoreParams::default()
            }),
        ))
        .with_snapshot(inactive(identity))
    }

    /// Restore target exists and every restore request starts a remote job.
    fn deferred_restore(command: &CommandSpec) -> Result<CommandResult, TransportError> {
        if let Some(result) = free_directory(command) {
            return result;
        }
        Ok(match command.name.as_str() {
            "Get-EXOMailbox" => CommandResult::ImmediateSuccess(json!({"Identity": "target"})),
            "New-MailboxRestoreRequest" => CommandResult::Deferred(JobHandle::new("req-1")),
            _ => CommandResult::ImmediateSuccess(Value::Null),
        })
    }

    fn config() -> BatchConfig {
        BatchConfig {
            concurrency: 2,
            retry_delay: Duration::from_secs(1),
            ..BatchConfig::default()
        }
    }

    fn param<'a>(command: &'a CommandSpec, key: &str) -> &'a str {
        command
            .parameters
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Recipient lookups find nothing; everything else succeeds.
    fn free_directory(command: &CommandSpec) -> Option<Result<CommandResult, TransportError>> {
        match command.name.as_str() {
            "Get-EXORecipient" | "Get-MailboxRestoreRequest" => {
                Some(Ok(CommandResult::ImmediateSuccess(json!([]))))
            }
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_read_failures_then_success() {
        let remote = Arc::new(ScriptedRemote::new());
        let failures = Arc::new(AtomicU32::new(0));
        let seen = failures.clone();
        remote.set_responder(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Network {
                    message: "connection reset".into(),
                    request_sent: true,
                })
            } else {
                Ok(CommandResult::ImmediateSuccess(json!({"ItemCount": 42})))
            }
        });
        let executor = executor(remote);
        let id = executor.submit(vec![inspect("a")], config()).unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.attempt_count, 3);
        assert_eq!(item.payload, Some(json!({"ItemCount": 42})));
        assert_eq!(item.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_retries() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(|_| {
            Err(TransportError::Network {
                message: "connection reset".into(),
                request_sent: true,
            })
        });
        let executor = executor(remote.clone());
        let id = executor.submit(vec![inspect("a")], config()).unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempt_count, 4);
        assert_eq!(item.last_error.as_ref().unwrap().code, codes::NETWORK_ERROR);
        assert_eq!(remote.sent_named("Get-EXOMailboxStatistics"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn mutating_timeout_is_ambiguous_and_sent_once() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(|command| {
            free_directory(command).unwrap_or(Err(TransportError::Timeout {
                elapsed: Duration::from_secs(300),
                request_sent: true,
            }))
        });
        let executor = executor(remote.clone());
        let id = executor.submit(vec![recovery("jane")], config()).unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(
            item.last_error.as_ref().unwrap().code,
            codes::AMBIGUOUS_OUTCOME
        );
        assert_eq!(remote.sent_named("New-Mailbox"), 1);
    }

    #[tokio::test]
    async fn blocked_item_is_skipped_without_mutation() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(|command| {
            free_directory(command).unwrap_or(Ok(CommandResult::ImmediateSuccess(json!({}))))
        });
        let executor = executor(remote.clone());
        let mut item = recovery("jane");
        item.snapshot = Some(EntitySnapshot {
            is_inactive_mailbox: false,
            ..inactive("jane")
        });
        let id = executor.submit(vec![item], config()).unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Skipped);
        assert!(!item.validation_result.as_ref().unwrap().is_executable());
        assert_eq!(
            item.last_error.as_ref().unwrap().code,
            codes::VALIDATION_BLOCKED
        );
        assert_eq!(remote.sent_named("New-Mailbox"), 0);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn one_rejection_does_not_abort_the_batch() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(|command| {
            if let Some(result) = free_directory(command) {
                return result;
            }
            if param(command, "InactiveMailbox") == "item2" {
                Ok(CommandResult::ImmediateFailure {
                    code: "".into(),
                    message: "identifier already exists".into(),
                })
            } else {
                Ok(CommandResult::ImmediateSuccess(json!({"Guid": "new"})))
            }
        });
        let executor = executor(remote);
        let id = executor
            .submit(
                vec![recovery("item1"), recovery("item2"), recovery("item3")],
                config(),
            )
            .unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        let statuses: Vec<ItemStatus> = result.items.iter().map(|i| i.status).collect();
        assert_eq!(
            statuses,
            vec![ItemStatus::Completed, ItemStatus::Failed, ItemStatus::Completed]
        );
        let failed = &result.items[1];
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_error.as_ref().unwrap().code, codes::REMOTE_REJECTED);
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_mutation_is_retried() {
        let remote = Arc::new(ScriptedRemote::new());
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        remote.set_responder(move |command| {
            if let Some(result) = free_directory(command) {
                return result;
            }
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(CommandResult::ImmediateFailure {
                    code: "ServerBusyException".into(),
                    message: "Server busy, back off".into(),
                })
            } else {
                Ok(CommandResult::ImmediateSuccess(json!({})))
            }
        });
        let executor = executor(remote.clone());
        let id = executor.submit(vec![recovery("jane")], config()).unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        assert_eq!(result.items[0].status, ItemStatus::Completed);
        assert_eq!(result.items[0].attempt_count, 2);
        assert_eq!(remote.sent_named("New-Mailbox"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_lets_in_flight_items_finish() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_send_delay(Duration::from_secs(10));
        let executor = executor(remote);
        let items = (0..5).map(|i| inspect(&format!("m{i}"))).collect();
        let id = executor.submit(items, config()).unwrap();

        let runner = executor.clone();
        let run = tokio::spawn(async move { runner.run(id, Arc::new(NoopProgress)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        executor.cancel(id).await.unwrap();

        let snapshot = executor.snapshot(id).unwrap();
        assert!(snapshot.iter().all(|item| item.status.is_terminal()));
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.total, 5);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.cancelled, 3);
        assert_eq!(executor.result(id).unwrap().cancelled, 3);
    }

    #[tokio::test]
    async fn stop_on_first_blocker_cancels_the_rest() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(|command| {
            free_directory(command).unwrap_or(Ok(CommandResult::ImmediateSuccess(json!({}))))
        });
        let executor = executor(remote.clone());
        let mut blocked = recovery("first");
        blocked.snapshot = Some(EntitySnapshot {
            is_aux_primary: true,
            ..inactive("first")
        });
        let id = executor
            .submit(
                vec![blocked, recovery("second"), recovery("third")],
                BatchConfig {
                    concurrency: 1,
                    stop_on_first_blocker: true,
                    ..config()
                },
            )
            .unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(result.cancelled, 2);
        assert_eq!(remote.sent_named("New-Mailbox"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_job_completes_the_item() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(deferred_restore);
        remote.set_poll_responder(|_, index| {
            Ok(JobStatusReport {
                status: if index == 0 {
                    JobStatus::Running
                } else {
                    JobStatus::Completed
                },
                progress_percent: Some(if index == 0 { 50.0 } else { 100.0 }),
                message: None,
            })
        });
        let executor = executor(remote);
        let progress = Arc::new(RecordingProgress::default());
        let id = executor.submit(vec![restore("src")], config()).unwrap();
        let result = executor.run(id, progress.clone()).await.unwrap();
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.remote_job_handle, Some(JobHandle::new("req-1")));
        assert_eq!(item.job_status, Some(JobStatus::Completed));
        assert_eq!(item.job_progress_percent, Some(100.0));
        let transitions = progress.transitions_for(0);
        assert_eq!(transitions.first(), Some(&ItemStatus::InProgress));
        assert_eq!(transitions.last(), Some(&ItemStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_job_fails_the_item_at_max_wait() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(deferred_restore);
        let executor = executor(remote);
        let id = executor.submit(vec![restore("src")], config()).unwrap();
        let started = Instant::now();
        let runner = executor.clone();
        let run = tokio::spawn(async move { runner.run(id, Arc::new(NoopProgress)).await });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(executor.snapshot(id).unwrap()[0].status, ItemStatus::InProgress);

        let result = run.await.unwrap().unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.last_error.as_ref().unwrap().code, codes::JOB_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_send_still_cancels_the_started_job() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(deferred_restore);
        remote.set_send_delay(Duration::from_secs(10));
        remote.set_cancel_outcome(Ok(CancelOutcome::Unsupported));
        let executor = executor(remote.clone());
        let id = executor.submit(vec![restore("src")], config()).unwrap();
        let runner = executor.clone();
        let run = tokio::spawn(async move { runner.run(id, Arc::new(NoopProgress)).await });

        while remote.sent_named("New-MailboxRestoreRequest") == 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let started = Instant::now();
        executor.cancel(id).await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(10));
        assert_eq!(remote.cancel_count(), 1);

        let result = run.await.unwrap().unwrap();
        let item = &result.items[0];
        assert_eq!(item.status, ItemStatus::Cancelled);
        assert_eq!(item.remote_job_handle, Some(JobHandle::new("req-1")));
        assert_eq!(
            item.last_error.as_ref().unwrap().code,
            codes::CANCELLATION_NOT_CONFIRMED
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resubmit_failed_takes_only_safe_failures_with_fresh_state() {
        let remote = Arc::new(ScriptedRemote::new());
        let healed = Arc::new(AtomicBool::new(false));
        let network_up = healed.clone();
        remote.set_responder(move |command| {
            if let Some(result) = free_directory(command) {
                return result;
            }
            if command.name == "Get-EXOMailbox" {
                let identity = param(command, "Identity");
                return Ok(CommandResult::ImmediateSuccess(
                    json!({"Identity": identity, "IsInactiveMailbox": true}),
                ));
            }
            match param(command, "InactiveMailbox") {
                "lost" if !network_up.load(Ordering::SeqCst) => Err(TransportError::Network {
                    message: "connection refused".into(),
                    request_sent: false,
                }),
                "unknown" => Err(TransportError::Timeout {
                    elapsed: Duration::from_secs(300),
                    request_sent: true,
                }),
                "taken" => Ok(CommandResult::ImmediateFailure {
                    code: "".into(),
                    message: "identifier already exists".into(),
                }),
                _ => Ok(CommandResult::ImmediateSuccess(json!({}))),
            }
        });
        let executor = executor(remote.clone());
        let no_retries = BatchConfig {
            max_retries: 0,
            ..config()
        };
        let id = executor
            .submit(
                vec![
                    recovery("lost"),
                    recovery("unknown"),
                    recovery("taken"),
                    recovery("fine"),
                ],
                no_retries,
            )
            .unwrap();
        assert_eq!(
            executor.resubmit_failed(id, no_retries).unwrap_err().kind(),
            AppErrorKind::Conflict
        );
        let first = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        assert_eq!(first.failed, 3);
        assert_eq!(first.succeeded, 1);

        healed.store(true, Ordering::SeqCst);
        let retry = executor.resubmit_failed(id, no_retries).unwrap();
        assert_ne!(retry, id);
        let pending = executor.snapshot(retry).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identifier, "lost");
        assert_eq!(pending[0].status, ItemStatus::Pending);
        assert_eq!(pending[0].attempt_count, 0);
        assert!(pending[0].snapshot.is_none());
        assert!(pending[0].last_error.is_none());

        let second = executor.run(retry, Arc::new(NoopProgress)).await.unwrap();
        assert_eq!(second.succeeded, 1);
        assert_eq!(remote.sent_named("Get-EXOMailbox"), 1);

        let err = executor.resubmit_failed(retry, no_retries).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Conflict);
    }

    #[tokio::test]
    async fn validate_only_never_mutates() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_responder(|command| {
            free_directory(command).unwrap_or(Ok(CommandResult::ImmediateSuccess(json!({}))))
        });
        let executor = executor(remote.clone());
        let mut blocked = recovery("b");
        blocked.snapshot = Some(EntitySnapshot::default());
        let id = executor
            .submit(
                vec![recovery("a"), blocked],
                BatchConfig {
                    mode: BatchMode::ValidateOnly,
                    ..config()
                },
            )
            .unwrap();
        let result = executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        assert_eq!(result.items[0].status, ItemStatus::Completed);
        assert_eq!(result.items[0].attempt_count, 0);
        assert_eq!(result.items[1].status, ItemStatus::Skipped);
        assert_eq!(remote.sent_named("New-Mailbox"), 0);
    }

    #[tokio::test]
    async fn progress_sees_batch_events_and_item_order() {
        let remote = Arc::new(ScriptedRemote::new());
        let executor = executor(remote);
        let progress = Arc::new(RecordingProgress::default());
        let id = executor
            .submit(vec![inspect("a"), inspect("b")], config())
            .unwrap();
        executor.run(id, progress.clone()).await.unwrap();
        for index in 0..2 {
            let transitions = progress.transitions_for(index);
            assert_eq!(transitions.first(), Some(&ItemStatus::InProgress));
            assert_eq!(transitions.last(), Some(&ItemStatus::Completed));
        }
        let events = progress.events.lock().unwrap().clone();
        assert_eq!(events.first(), Some(&BatchEvent::Started { total: 2 }));
        assert!(matches!(events.last(), Some(BatchEvent::Finished { succeeded: 2, .. })));
    }

    #[tokio::test]
    async fn registry_errors() {
        let remote = Arc::new(ScriptedRemote::new());
        let executor = executor(remote);
        let err = executor.result(BatchId(99)).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::NotFound);

        let id = executor.submit(vec![inspect("a")], config()).unwrap();
        assert_eq!(executor.result(id).unwrap_err().kind(), AppErrorKind::Conflict);
        executor.run(id, Arc::new(NoopProgress)).await.unwrap();
        let again = executor.run(id, Arc::new(NoopProgress)).await.unwrap_err();
        assert_eq!(again.kind(), AppErrorKind::Conflict);
        assert_eq!(executor.release(id).unwrap().succeeded, 1);
        assert!(executor.snapshot(id).is_err());

        let zero = BatchConfig {
            concurrency: 0,
            ..config()
        };
        assert!(executor.submit(vec![], zero).is_err());
    }
}
