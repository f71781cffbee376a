// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::TransferError;
use crate::record::LogRecord;

/// Why a record left the store without being delivered or abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Dropped to keep the store within capacity.
    Evicted,
    /// Its transfer was cancelled.
    Cancelled,
}

/// Receives per-record outcomes.
///
/// Callbacks run on the relay task after the record was removed from the
/// store, so they must return quickly and must not wait on the relay handle.
pub trait RelayObserver: Send + Sync {
    /// The collector acknowledged the record.
    fn on_delivered(&self, record: &LogRecord);

    /// The record exhausted its retries and was deleted.
    fn on_failed_permanently(
        &self,
        record: &LogRecord,
        error: Option<&TransferError>,
        status: Option<u16>,
    );

    fn on_discarded(&self, _record: &LogRecord, _reason: DiscardReason) {}
}
