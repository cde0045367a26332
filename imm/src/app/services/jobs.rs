// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::random::jitter;
use crate::app::services::session::SessionManager;
use crate::app::types::{AsyncJob, CancelOutcome, JobHandle, JobStatus};

/// Receives every observed change of a tracked job, then its terminal state.
pub trait JobObserver: Send + Sync {
    fn job_updated(&self, job: &AsyncJob);
}

impl JobObserver for mpsc::UnboundedSender<AsyncJob> {
    fn job_updated(&self, job: &AsyncJob) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.send(job.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each poll interval.
    pub jitter: Duration,
    pub max_wait: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            jitter: Duration::from_secs(5),
            max_wait: Duration::from_secs(4 * 60 * 60),
        }
    }
}

struct MonitorInner {
    session: Arc<SessionManager>,
    settings: MonitorSettings,
    // Stop signal per actively polled job.
    active: Mutex<HashMap<JobHandle, watch::Sender<bool>>>,
}

/// Polls deferred remote jobs until they finish, fail, time out or are
/// abandoned. Cheap to clone.
#[derive(Clone)]
pub struct JobMonitor {
    inner: Arc<MonitorInner>,
}

impl JobMonitor {
    pub fn new(session: Arc<SessionManager>, settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                session,
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    pub fn is_tracking(&self, handle: &JobHandle) -> bool {
        self.inner.active().contains_key(handle)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Starts polling `handle`. The returned task resolves to the terminal
    /// job state, which is also the observer's last update.
    pub fn track(
        &self,
        handle: JobHandle,
        observer: Arc<dyn JobObserver>,
    ) -> AppResult<JoinHandle<AsyncJob>> {
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut active = self.inner.active();
            if active.contains_key(&handle) {
                return Err(AppError::with_message(
                    AppErrorKind::Conflict,
                    codes::CONFLICT,
                    format!("job {handle} is already tracked"),
                ));
            }
            active.insert(handle.clone(), stop_tx);
        }
        tracing::info!(job = %handle, "tracking remote job");
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let job = inner.poll_until_done(handle.clone(), stop_rx, &*observer).await;
            inner.active().remove(&handle);
            tracing::info!(
                job = %handle,
                status = job.status.as_str(),
                error_code = job.error_code.unwrap_or(""),
                polls = job.polls,
                "remote job finished tracking"
            );
            observer.job_updated(&job);
            job
        }))
    }

    /// Best effort. When the remote side can't confirm the request, polling
    /// stops and the job ends as `cancellation-not-confirmed`.
    pub async fn cancel(&self, handle: &JobHandle) -> CancelOutcome {
        let outcome = match self.inner.session.cancel_job(handle).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(job = %handle, error = %err, "job cancellation failed");
                CancelOutcome::Unsupported
            }
        };
        match outcome {
            CancelOutcome::Requested => {
                tracing::info!(job = %handle, "job cancellation requested");
            }
            CancelOutcome::Unsupported => {
                if let Some(stop) = self.inner.active().get(handle) {
                    let _ = stop.send(true);
                }
            }
        }
        outcome
    }
}

impl MonitorInner {
    fn active(&self) -> MutexGuard<'_, HashMap<JobHandle, watch::Sender<bool>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn poll_until_done(
        &self,
        handle: JobHandle,
        mut stop: watch::Receiver<bool>,
        observer: &dyn JobObserver,
    ) -> AsyncJob {
        let settings = self.settings;
        let started = Instant::now();
        let deadline = started + settings.max_wait;
        let mut job = AsyncJob::new(handle);

        loop {
            let next_poll = Instant::now() + settings.poll_interval + jitter(settings.jitter);
            tokio::select! {
                _ = tokio::time::sleep_until(next_poll.min(deadline)) => {}
                _ = stop.changed() => {
                    job.status = JobStatus::Cancelled;
                    job.error_code = Some(codes::CANCELLATION_NOT_CONFIRMED);
                    job.message = Some("cancellation requested but not confirmed by the remote service".into());
                    job.observed_for = started.elapsed();
                    return job;
                }
            }
            if Instant::now() >= deadline {
                return timed_out(job, settings.max_wait);
            }

            let report = match tokio::time::timeout_at(deadline, self.session.poll_job(&job.handle)).await {
                Err(_) => return timed_out(job, settings.max_wait),
                Ok(Err(err)) => {
                    tracing::warn!(job = %job.handle, error = %err, "job poll failed; will retry");
                    continue;
                }
                Ok(Ok(report)) => report,
            };
            job.polls += 1;
            job.observed_for = started.elapsed();
            let changed = job.status != report.status
                || job.progress_percent != report.progress_percent
                || job.message != report.message;
            job.status = report.status;
            job.progress_percent = report.progress_percent;
            job.message = report.message;
            if job.status.is_terminal() {
                if job.status == JobStatus::Failed {
                    job.error_code = Some(codes::JOB_FAILED);
                }
                return job;
            }
            if changed {
                tracing::debug!(job = %job.handle, status = job.status.as_str(), progress = ?job.progress_percent, "job progress");
                observer.job_updated(&job);
            }
        }
    }
}

fn timed_out(mut job: AsyncJob, max_wait: Duration) -> AsyncJob {
    job.status = JobStatus::Failed;
    job.error_code = Some(codes::JOB_TIMEOUT);
    job.message = Some(format!(
        "job did not finish within {}s",
        max_wait.as_secs()
    ));
    job.observed_for = max_wait;
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ports::TransportError;
    use crate::app::test_support::{ScriptedRemote, session_with};
    use crate::app::types::JobStatusReport;

    fn monitor(remote: Arc<ScriptedRemote>, settings: MonitorSettings) -> JobMonitor {
        JobMonitor::new(Arc::new(session_with(remote)), settings)
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_secs(10),
            jitter: Duration::from_secs(2),
            max_wait: Duration::from_secs(120),
        }
    }

    fn report(status: JobStatus, progress: Option<f32>) -> JobStatusReport {
        JobStatusReport {
            status,
            progress_percent: progress,
            message: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_job_times_out_after_exactly_max_wait() {
        let remote = Arc::new(ScriptedRemote::new());
        let monitor = monitor(remote.clone(), settings());
        let (tx, _rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let task = monitor
            .track(JobHandle::new("job-1"), Arc::new(tx))
            .unwrap();
        let job = task.await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code, Some(codes::JOB_TIMEOUT));
        assert_eq!(job.observed_for, Duration::from_secs(120));
        assert!(remote.poll_count() >= 9);
        assert_eq!(monitor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_flow_through_channel_until_completed() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_poll_responder(|_, index| {
            Ok(match index {
                0 => report(JobStatus::Queued, None),
                1 => report(JobStatus::Running, Some(40.0)),
                _ => report(JobStatus::Completed, Some(100.0)),
            })
        });
        let monitor = monitor(remote, settings());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = monitor
            .track(JobHandle::new("job-2"), Arc::new(tx))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.error_code, None);

        let mut seen = Vec::new();
        while let Ok(update) = rx.try_recv() {
            seen.push((update.status, update.progress_percent));
        }
        assert_eq!(
            seen,
            vec![
                (JobStatus::Running, Some(40.0)),
                (JobStatus::Completed, Some(100.0)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_do_not_stop_tracking() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_poll_responder(|_, index| {
            if index == 0 {
                Err(TransportError::Protocol("bad json".into()))
            } else {
                Ok(report(JobStatus::Failed, None))
            }
        });
        let monitor = monitor(remote.clone(), settings());
        let (tx, _rx) = mpsc::unbounded_channel();
        let job = monitor
            .track(JobHandle::new("job-3"), Arc::new(tx))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code, Some(codes::JOB_FAILED));
        assert_eq!(remote.poll_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_cancel_stops_polling_unconfirmed() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.set_cancel_outcome(Ok(CancelOutcome::Unsupported));
        let monitor = monitor(remote.clone(), settings());
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = JobHandle::new("job-4");
        let task = monitor.track(handle.clone(), Arc::new(tx)).unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(monitor.cancel(&handle).await, CancelOutcome::Unsupported);
        let job = task.await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_code, Some(codes::CANCELLATION_NOT_CONFIRMED));
        assert!(!monitor.is_tracking(&handle));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_cancel_keeps_polling_until_remote_reports_it() {
        let remote = Arc::new(ScriptedRemote::new());
        let handle = JobHandle::new("job-5");
        remote.set_poll_responder(|_, index| {
            Ok(if index < 2 {
                report(JobStatus::Running, None)
            } else {
                report(JobStatus::Cancelled, None)
            })
        });
        let monitor = monitor(remote.clone(), settings());
        let (tx, _rx) = mpsc::unbounded_channel();
        let task = monitor.track(handle.clone(), Arc::new(tx)).unwrap();
        assert_eq!(monitor.cancel(&handle).await, CancelOutcome::Requested);
        let job = task.await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_code, None);
        assert_eq!(remote.cancel_count(), 1);
    }

    #[tokio::test]
    async fn same_handle_cannot_be_tracked_twice() {
        let remote = Arc::new(ScriptedRemote::new());
        let monitor = monitor(remote, settings());
        let (tx, _rx) = mpsc::unbounded_channel::<AsyncJob>();
        let observer: Arc<dyn JobObserver> = Arc::new(tx);
        let handle = JobHandle::new("job-6");
        let _task = monitor.track(handle.clone(), observer.clone()).unwrap();
        let err = monitor.track(handle, observer).unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Conflict);
    }
}
