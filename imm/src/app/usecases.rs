// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, CredentialProvider, ProgressSink, RemoteCommandPort};
use crate::app::services::batch::{BatchConfig, BatchExecutor};
use crate::app::services::jobs::{JobMonitor, JobObserver, MonitorSettings};
use crate::app::services::session::{SessionManager, SessionSettings};
use crate::app::services::validation::ValidationPipeline;
use crate::app::types::{
    AsyncJob, BatchId, BatchOperationItem, BatchOperationResult, CancelOutcome, EntitySnapshot,
    JobHandle, OperationRequest, RemoteSession, ValidationResult,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreSettings {
    pub session: SessionSettings,
    pub monitor: MonitorSettings,
}

/// Caller boundary of the orchestration core. Persists nothing.
#[derive(Clone)]
pub struct UseCases {
    session: Arc<SessionManager>,
    pipeline: Arc<ValidationPipeline>,
    monitor: JobMonitor,
    executor: BatchExecutor,
}

impl UseCases {
    pub fn new(
        remote: Arc<dyn RemoteCommandPort>,
        credentials: Arc<dyn CredentialProvider>,
        clock: Arc<dyn ClockPort>,
        settings: CoreSettings,
    ) -> Self {
        let session = Arc::new(SessionManager::new(
            remote,
            credentials,
            clock.clone(),
            settings.session,
        ));
        let pipeline = Arc::new(ValidationPipeline::standard(session.clone()));
        let monitor = JobMonitor::new(session.clone(), settings.monitor);
        let executor = BatchExecutor::new(
            session.clone(),
            pipeline.clone(),
            monitor.clone(),
            clock,
        );
        Self {
            session,
            pipeline,
            monitor,
            executor,
        }
    }

    pub async fn connect(&self) -> AppResult<RemoteSession> {
        Ok(self.session.connect(None).await?)
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub fn session(&self) -> RemoteSession {
        self.session.snapshot()
    }

    pub async fn validate(&self, request: &OperationRequest) -> ValidationResult {
        self.pipeline.validate_request(request, None).await.0
    }

    pub async fn validate_snapshot(
        &self,
        snapshot: &EntitySnapshot,
        request: &OperationRequest,
    ) -> ValidationResult {
        self.pipeline.validate(snapshot, request).await
    }

    pub fn submit_batch(
        &self,
        items: Vec<BatchOperationItem>,
        config: BatchConfig,
    ) -> AppResult<BatchId> {
        self.executor.submit(items, config)
    }

    pub async fn run(
        &self,
        id: BatchId,
        progress: Arc<dyn ProgressSink>,
    ) -> AppResult<BatchOperationResult> {
        self.executor.run(id, progress).await
    }

    pub async fn cancel(&self, id: BatchId) -> AppResult<()> {
        self.executor.cancel(id).await
    }

    pub fn result(&self, id: BatchId) -> AppResult<BatchOperationResult> {
        self.executor.result(id)
    }

    /// New batch with the failed items of a finished one that are safe to try
    /// again.
    pub fn resubmit_failed(&self, id: BatchId, config: BatchConfig) -> AppResult<BatchId> {
        self.executor.resubmit_failed(id, config)
    }

    pub fn items(&self, id: BatchId) -> AppResult<Vec<BatchOperationItem>> {
        self.executor.snapshot(id)
    }

    /// Single operation through the same gate and retry rules as a batch.
    pub async fn execute_one(
        &self,
        request: OperationRequest,
        config: BatchConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> AppResult<BatchOperationItem> {
        let id = self
            .executor
            .submit(vec![BatchOperationItem::new(request)], config)?;
        self.executor.run(id, progress).await?;
        let mut result = self.executor.release(id)?;
        result.items.pop().ok_or_else(|| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::INTERNAL_ERROR,
                format!("{id} lost its only item"),
            )
        })
    }

    pub fn track_job(
        &self,
        handle: JobHandle,
        observer: Arc<dyn JobObserver>,
    ) -> AppResult<JoinHandle<AsyncJob>> {
        self.monitor.track(handle, observer)
    }

    pub async fn cancel_job(&self, handle: &JobHandle) -> CancelOutcome {
        self.monitor.cancel(handle).await
    }
}
