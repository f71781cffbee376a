// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolves transfer completions to their records and applies the retry policy.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::RelayConfiguration;
use crate::dispatcher::Dispatcher;
use crate::observer::{DiscardReason, RelayObserver};
use crate::policy::{classify, RetryPolicy, Transition};
use crate::record::LogRecord;
use crate::store::{RecordFilter, RecordStore};
use crate::transport::{TransferCompletion, Transport};

/// Result of routing one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No record owns the transfer any more.
    Unowned,
    Delivered,
    Cancelled,
    Retried,
    Abandoned,
    /// The store rejected the change; the record is left as it was.
    StorageFailed,
}

pub struct CompletionRouter<'a> {
    store: &'a RecordStore,
    transport: &'a dyn Transport,
    configuration: &'a RelayConfiguration,
    policy: RetryPolicy,
    observer: Option<&'a Arc<dyn RelayObserver>>,
}

impl<'a> CompletionRouter<'a> {
    pub fn new(
        store: &'a RecordStore,
        transport: &'a dyn Transport,
        configuration: &'a RelayConfiguration,
        policy: RetryPolicy,
        observer: Option<&'a Arc<dyn RelayObserver>>,
    ) -> Self {
        CompletionRouter {
            store,
            transport,
            configuration,
            policy,
            observer,
        }
    }

    /// Applies one terminal transfer outcome.
    ///
    /// Safe to call for transfers whose record is already gone.
    pub fn on_transfer_completed(&self, completion: &TransferCompletion) -> RouteOutcome {
        let owner = match self
            .store
            .fetch_one(RecordFilter::CorrelationId(completion.correlation_id))
        {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                debug!(
                    "RELAY | No record owns transfer {}, ignoring completion",
                    completion.correlation_id
                );
                return RouteOutcome::Unowned;
            }
            Err(e) => {
                error!(
                    "RELAY | Failed to look up owner of transfer {}: {e}",
                    completion.correlation_id
                );
                return RouteOutcome::StorageFailed;
            }
        };

        let classification = classify(completion, self.configuration.successful_status_codes());
        match self.policy.on_completion(&owner, classification) {
            Transition::Delivered => {
                if !self.remove(&owner) {
                    return RouteOutcome::StorageFailed;
                }
                debug!("RELAY | Record {} delivered", owner.id);
                if let Some(observer) = self.observer {
                    observer.on_delivered(&owner);
                }
                RouteOutcome::Delivered
            }
            Transition::Cancelled => {
                if !self.remove(&owner) {
                    return RouteOutcome::StorageFailed;
                }
                debug!("RELAY | Record {} dropped after cancellation", owner.id);
                if let Some(observer) = self.observer {
                    observer.on_discarded(&owner, DiscardReason::Cancelled);
                }
                RouteOutcome::Cancelled
            }
            Transition::Retry(record) => {
                match self.store.update(&record) {
                    Ok(true) => {}
                    Ok(false) => return RouteOutcome::Unowned,
                    Err(e) => {
                        error!("RELAY | Failed to persist retry of {}: {e}", record.id);
                        return RouteOutcome::StorageFailed;
                    }
                }
                debug!(
                    "RELAY | Retrying record {} (attempt {})",
                    record.id, record.retry_count
                );
                let dispatcher =
                    Dispatcher::new(self.store, self.transport, self.configuration);
                if let Err(e) = dispatcher.dispatch(&record) {
                    // Left pending; the next flush picks it up.
                    error!("RELAY | Failed to redispatch record {}: {e}", record.id);
                }
                RouteOutcome::Retried
            }
            Transition::Abandon(record, cause) => {
                if !self.remove(&record) {
                    return RouteOutcome::StorageFailed;
                }
                warn!(
                    "RELAY | Abandoning record {} after {} failed uploads",
                    record.id, record.retry_count
                );
                if let Some(observer) = self.observer {
                    observer.on_failed_permanently(&record, cause.error(), cause.status());
                }
                RouteOutcome::Abandoned
            }
        }
    }

    fn remove(&self, record: &LogRecord) -> bool {
        match self.store.delete(record) {
            Ok(_) => true,
            Err(e) => {
                error!("RELAY | Failed to delete record {}: {e}", record.id);
                false
            }
        }
    }
}
