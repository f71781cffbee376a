// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Keeps persisted in-flight state and the transport's transfers consistent.

use std::collections::HashSet;

use tracing::{debug, error, info};

use crate::config::RelayConfiguration;
use crate::dispatcher::Dispatcher;
use crate::record::CorrelationId;
use crate::store::{RecordFilter, RecordStore};
use crate::transport::{OutstandingTransfer, Transport};

/// What a reconciliation pass repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// In-flight records whose transfer no longer existed.
    pub orphans_redispatched: usize,
    /// Transfers cancelled because their request no longer matched.
    pub stale_redispatched: usize,
}

pub struct Reconciler<'a> {
    store: &'a RecordStore,
    transport: &'a dyn Transport,
    configuration: &'a RelayConfiguration,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        store: &'a RecordStore,
        transport: &'a dyn Transport,
        configuration: &'a RelayConfiguration,
    ) -> Self {
        Reconciler {
            store,
            transport,
            configuration,
        }
    }

    fn dispatcher(&self) -> Dispatcher<'a> {
        Dispatcher::new(self.store, self.transport, self.configuration)
    }

    /// Runs orphan repair then staleness repair against one transport snapshot.
    pub async fn reconcile(&self) -> ReconcileReport {
        let outstanding = self.transport.outstanding().await;
        let report = ReconcileReport {
            orphans_redispatched: self.repair_orphans(&outstanding),
            stale_redispatched: self.repair_stale(&outstanding),
        };
        if report != ReconcileReport::default() {
            info!(
                "RELAY | Reconciled {} orphaned and {} stale transfers",
                report.orphans_redispatched, report.stale_redispatched
            );
        }
        report
    }

    /// Redispatches in-flight records whose transfer the transport no longer has.
    ///
    /// An empty `outstanding` list makes every in-flight record an orphan.
    pub fn repair_orphans(&self, outstanding: &[OutstandingTransfer]) -> usize {
        let live: HashSet<CorrelationId> = outstanding.iter().map(|t| t.correlation_id).collect();
        let in_flight = match self.store.fetch_all(RecordFilter::InFlight) {
            Ok(records) => records,
            Err(e) => {
                error!("RELAY | Failed to select in-flight records: {e}");
                return 0;
            }
        };

        let dispatcher = self.dispatcher();
        let mut repaired = 0;
        for mut record in in_flight {
            let Some(correlation_id) = record.correlation_id else {
                continue;
            };
            if live.contains(&correlation_id) {
                continue;
            }

            debug!(
                "RELAY | Record {} lost transfer {correlation_id}, redispatching",
                record.id
            );
            record.correlation_id = None;
            match self.store.update(&record) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("RELAY | Failed to release orphaned record {}: {e}", record.id);
                    continue;
                }
            }
            match dispatcher.dispatch(&record) {
                Ok(_) => repaired += 1,
                Err(e) => error!("RELAY | Failed to redispatch orphan {}: {e}", record.id),
            }
        }
        repaired
    }

    /// Cancels transfers whose request no longer reflects the configuration and
    /// redispatches their records under it.
    ///
    /// The record is released before its transfer is cancelled, so the
    /// cancellation later finds no owner and is dropped by the router. When the
    /// redispatch is refused the record stays pending for the next flush.
    pub fn repair_stale(&self, outstanding: &[OutstandingTransfer]) -> usize {
        let dispatcher = self.dispatcher();
        let mut repaired = 0;
        for transfer in outstanding {
            if self.configuration.matches(&transfer.request) {
                continue;
            }
            let mut owner = match self
                .store
                .fetch_one(RecordFilter::CorrelationId(transfer.correlation_id))
            {
                Ok(Some(owner)) => owner,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        "RELAY | Failed to look up owner of transfer {}: {e}",
                        transfer.correlation_id
                    );
                    continue;
                }
            };

            debug!(
                "RELAY | Transfer {} for record {} targets an old configuration",
                transfer.correlation_id, owner.id
            );
            // Released before cancelling: the cancellation must resolve to no
            // owner, and a refused redispatch leaves the record pending.
            owner.correlation_id = None;
            match self.store.update(&owner) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("RELAY | Failed to release stale record {}: {e}", owner.id);
                    continue;
                }
            }
            self.transport.cancel(transfer.correlation_id);
            match dispatcher.dispatch(&owner) {
                Ok(_) => repaired += 1,
                Err(e) => error!("RELAY | Failed to redispatch stale record {}: {e}", owner.id),
            }
        }
        repaired
    }
}
