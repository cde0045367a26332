// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::types::{BatchId, BatchOperationItem};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Started { total: usize },
    Cancelling,
    Finished {
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
    },
}

/// Receives every item transition synchronously with the state change, in
/// order for any single item. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn item_changed(&self, batch: BatchId, item: &BatchOperationItem);

    fn batch_event(&self, batch: BatchId, event: &BatchEvent);
}

#[derive(Clone, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn item_changed(&self, _batch: BatchId, _item: &BatchOperationItem) {}

    fn batch_event(&self, _batch: BatchId, _event: &BatchEvent) {}
}
