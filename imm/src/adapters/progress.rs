// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use tokio::sync::mpsc;

use crate::app::ports::{BatchEvent, ProgressSink};
use crate::app::types::{BatchId, BatchOperationItem};

/// One structured log line per item transition.
#[derive(Clone, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn item_changed(&self, batch: BatchId, item: &BatchOperationItem) {
        let error_code = item.last_error.as_ref().map(|err| err.code);
        let error = item.last_error.as_ref().map(|err| err.message.as_str());
        if item.status.is_terminal() {
            tracing::info!(
                target: "imm::progress",
                batch = %batch,
                index = item.index,
                identity = %item.identifier,
                status = item.status.as_str(),
                attempts = item.attempt_count,
                error_code,
                error,
            );
        } else {
            tracing::debug!(
                target: "imm::progress",
                batch = %batch,
                index = item.index,
                identity = %item.identifier,
                status = item.status.as_str(),
                attempts = item.attempt_count,
                job = item.remote_job_handle.as_ref().map(|h| h.as_str()),
                job_progress = item.job_progress_percent,
            );
        }
    }

    fn batch_event(&self, batch: BatchId, event: &BatchEvent) {
        tracing::info!(target: "imm::progress", batch = %batch, event = ?event);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Item {
        batch: BatchId,
        item: Box<BatchOperationItem>,
    },
    Batch {
        batch: BatchId,
        event: BatchEvent,
    },
}

/// Forwards every event to an unbounded channel for subscribers such as
/// audit writers or terminal renderers.
#[derive(Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn item_changed(&self, batch: BatchId, item: &BatchOperationItem) {
        let _ = self.tx.send(ProgressEvent::Item {
            batch,
            item: Box::new(item.clone()),
        });
    }

    fn batch_event(&self, batch: BatchId, event: &BatchEvent) {
        let _ = self.tx.send(ProgressEvent::Batch {
            batch,
            event: event.clone(),
        });
    }
}
