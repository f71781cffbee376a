// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry and eviction rules.
//!
//! A record moves `Pending -> InFlight` when dispatched. Every completion then
//! lands it in exactly one of:
//!
//! - `Delivered`: success status, row deleted.
//! - `Cancelled`: the transfer was cancelled, row deleted, not a failure.
//! - `Retrying`: back to `Pending` with `retry_count + 1`.
//! - `Abandoned`: retries exhausted, row deleted, failure reported.

use std::collections::BTreeSet;

use tracing::{debug, error};

use crate::config::DEFAULT_MAX_RETRIES;
use crate::errors::TransferError;
use crate::record::LogRecord;
use crate::store::{RecordFilter, RecordStore};
use crate::transport::TransferCompletion;

/// Why a transfer did not deliver its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The collector answered with a status outside the success set.
    Status(u16),
    /// No usable response arrived.
    Transport(TransferError),
}

impl FailureCause {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            FailureCause::Status(status) => Some(*status),
            FailureCause::Transport(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&TransferError> {
        match self {
            FailureCause::Status(_) => None,
            FailureCause::Transport(error) => Some(error),
        }
    }
}

/// How a single completion is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Delivered { status: u16 },
    Cancelled,
    Failed(FailureCause),
}

/// Classifies a completion. Cancellation wins over any status that came with it.
#[must_use]
pub fn classify(completion: &TransferCompletion, success_codes: &BTreeSet<u16>) -> Classification {
    if completion
        .error
        .as_ref()
        .is_some_and(TransferError::is_cancellation)
    {
        return Classification::Cancelled;
    }
    match (completion.status, &completion.error) {
        (Some(status), None) if success_codes.contains(&status) => {
            Classification::Delivered { status }
        }
        (Some(status), None) => Classification::Failed(FailureCause::Status(status)),
        (_, Some(error)) => Classification::Failed(FailureCause::Transport(error.clone())),
        (None, None) => Classification::Failed(FailureCause::Transport(TransferError::Request(
            "transfer finished without a response".to_string(),
        ))),
    }
}

/// What to do with a record after one of its transfers finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Delete the row and report delivery.
    Delivered,
    /// Delete the row silently.
    Cancelled,
    /// Persist the updated record and dispatch it again.
    Retry(LogRecord),
    /// Delete the row and report permanent failure.
    Abandon(LogRecord, FailureCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated per record; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: Some(DEFAULT_MAX_RETRIES),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: Option<u32>) -> Self {
        RetryPolicy { max_retries }
    }

    /// Decides the next state of `record` for an already classified completion.
    ///
    /// The failure that brings `retry_count` up to `max_retries` abandons the
    /// record, so `Some(3)` allows exactly three unsuccessful completions.
    #[must_use]
    pub fn on_completion(&self, record: &LogRecord, classification: Classification) -> Transition {
        match classification {
            Classification::Delivered { .. } => Transition::Delivered,
            Classification::Cancelled => Transition::Cancelled,
            Classification::Failed(cause) => {
                let mut next = record.clone();
                next.correlation_id = None;
                next.retry_count = record.retry_count.saturating_add(1);
                match self.max_retries {
                    Some(max) if next.retry_count >= max => Transition::Abandon(next, cause),
                    _ => Transition::Retry(next),
                }
            }
        }
    }
}

/// Deletes the oldest records until at most `max_records` remain.
///
/// Returns the evicted records. Failures are logged and never block ingestion.
pub fn enforce_capacity(store: &RecordStore, max_records: usize) -> Vec<LogRecord> {
    let excess = match store.count(RecordFilter::All) {
        Ok(count) => count.saturating_sub(max_records),
        Err(e) => {
            error!("RELAY | Failed to count records for eviction: {e}");
            return Vec::new();
        }
    };
    if excess == 0 {
        return Vec::new();
    }

    let oldest = match store.fetch_oldest(excess) {
        Ok(oldest) => oldest,
        Err(e) => {
            error!("RELAY | Failed to select records for eviction: {e}");
            return Vec::new();
        }
    };

    let mut evicted = Vec::with_capacity(oldest.len());
    for record in oldest {
        match store.delete(&record) {
            Ok(true) => {
                debug!("RELAY | Evicted record {} over capacity", record.id);
                evicted.push(record);
            }
            Ok(false) => {}
            Err(e) => error!("RELAY | Failed to evict record {}: {e}", record.id),
        }
    }
    evicted
}
