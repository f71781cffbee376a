// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns persisted records into running transfers.
//!
//! The correlation id is written to the store before the transfer starts. A
//! crash in between leaves an in-flight record without a transfer, which the
//! reconciler later redispatches.

use tracing::{debug, error};

use crate::config::RelayConfiguration;
use crate::errors::DispatchError;
use crate::record::{CorrelationId, LogRecord};
use crate::store::{RecordFilter, RecordStore};
use crate::transport::Transport;

pub struct Dispatcher<'a> {
    store: &'a RecordStore,
    transport: &'a dyn Transport,
    configuration: &'a RelayConfiguration,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        store: &'a RecordStore,
        transport: &'a dyn Transport,
        configuration: &'a RelayConfiguration,
    ) -> Self {
        Dispatcher {
            store,
            transport,
            configuration,
        }
    }

    /// Starts exactly one transfer carrying `record`.
    ///
    /// On success the stored record holds the returned correlation id. On
    /// failure no transfer is left running and the record is pending again,
    /// unless it was deleted meanwhile.
    pub fn dispatch(&self, record: &LogRecord) -> Result<CorrelationId, DispatchError> {
        let body = record.wire_body()?;
        let request = self.configuration.request_for();
        let correlation_id = self.transport.prepare(&request, body)?;

        let mut in_flight = record.clone();
        in_flight.correlation_id = Some(correlation_id);
        match self.store.update(&in_flight) {
            Ok(true) => {}
            Ok(false) => {
                self.transport.cancel(correlation_id);
                return Err(DispatchError::Vanished(record.id.clone()));
            }
            Err(e) => {
                self.transport.cancel(correlation_id);
                return Err(e.into());
            }
        }

        if let Err(e) = self.transport.start(correlation_id) {
            self.transport.cancel(correlation_id);
            let mut pending = in_flight;
            pending.correlation_id = None;
            if let Err(store_error) = self.store.update(&pending) {
                error!(
                    "RELAY | Failed to release record {} after start failure: {store_error}",
                    record.id
                );
            }
            return Err(e.into());
        }

        debug!(
            "RELAY | Dispatched record {} as transfer {correlation_id}",
            record.id
        );
        Ok(correlation_id)
    }

    /// Dispatches every pending record, oldest first.
    ///
    /// Returns how many transfers were started. Records already in flight are
    /// never selected, so repeated flushes do not duplicate transfers.
    pub fn flush(&self) -> usize {
        let pending = match self.store.fetch_all(RecordFilter::Pending) {
            Ok(pending) => pending,
            Err(e) => {
                error!("RELAY | Failed to select pending records: {e}");
                return 0;
            }
        };

        let mut dispatched = 0;
        for record in &pending {
            match self.dispatch(record) {
                Ok(_) => dispatched += 1,
                Err(e) => error!("RELAY | Failed to dispatch record {}: {e}", record.id),
            }
        }
        if dispatched > 0 {
            debug!("RELAY | Flushed {dispatched} pending records");
        }
        dispatched
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::TransferError;
    use crate::record::{LogPayload, Severity};
    use crate::test_support::FakeTransport;

    fn configuration() -> RelayConfiguration {
        RelayConfiguration::parse("http://collector.test/logs").unwrap()
    }

    fn store_with(n: usize) -> (RecordStore, Vec<LogRecord>) {
        let store = RecordStore::open_ephemeral("relay").unwrap();
        let records = (0..n)
            .map(|i| {
                store
                    .insert(LogPayload::new(Severity::Info, format!("log {i}")))
                    .unwrap()
            })
            .collect();
        (store, records)
    }

    #[tokio::test]
    async fn test_dispatch_persists_correlation_id_and_starts_transfer() {
        let (store, records) = store_with(1);
        let transport = FakeTransport::new();
        let config = configuration();
        let dispatcher = Dispatcher::new(&store, &transport, &config);

        let id = dispatcher.dispatch(&records[0]).unwrap();

        let stored = store.fetch_one(RecordFilter::All).unwrap().unwrap();
        assert_eq!(stored.correlation_id, Some(id));
        assert_eq!(transport.started(), vec![id]);
        let outstanding = transport.outstanding().await;
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].request, config.request_for());

        let body: serde_json::Value =
            serde_json::from_slice(&transport.body(id).unwrap()).unwrap();
        assert_eq!(body["uuid"], records[0].id.as_str());
        assert_eq!(body["message"], "log 0");
    }

    #[tokio::test]
    async fn test_flush_dispatches_pending_in_creation_order() {
        let (store, records) = store_with(3);
        let transport = FakeTransport::new();
        let config = configuration();
        let dispatcher = Dispatcher::new(&store, &transport, &config);

        assert_eq!(dispatcher.flush(), 3);

        let started = transport.started();
        assert_eq!(started.len(), 3);
        for (record, id) in records.iter().zip(&started) {
            let body: serde_json::Value =
                serde_json::from_slice(&transport.body(*id).unwrap()).unwrap();
            assert_eq!(body["uuid"], record.id.as_str());
        }
        assert!(store.fetch_all(RecordFilter::Pending).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_twice_does_not_duplicate() {
        let (store, _) = store_with(4);
        let transport = FakeTransport::new();
        let config = configuration();
        let dispatcher = Dispatcher::new(&store, &transport, &config);

        assert_eq!(dispatcher.flush(), 4);
        assert_eq!(dispatcher.flush(), 0);
        assert_eq!(transport.outstanding().await.len(), 4);
    }

    #[tokio::test]
    async fn test_vanished_record_cancels_transfer() {
        let (store, records) = store_with(1);
        store.delete(&records[0]).unwrap();
        let transport = FakeTransport::new();
        let config = configuration();
        let dispatcher = Dispatcher::new(&store, &transport, &config);

        let result = dispatcher.dispatch(&records[0]);
        assert!(matches!(result, Err(DispatchError::Vanished(_))));
        assert!(transport.started().is_empty());
        assert!(transport.outstanding().await.is_empty());
    }

    #[tokio::test]
    async fn test_refused_transfer_leaves_record_pending() {
        let (store, records) = store_with(1);
        let transport = FakeTransport::new();
        transport.refuse_prepare(TransferError::InvalidRequest("no".into()));
        let config = configuration();
        let dispatcher = Dispatcher::new(&store, &transport, &config);

        assert!(matches!(
            dispatcher.dispatch(&records[0]),
            Err(DispatchError::Transfer(_))
        ));
        let stored = store.fetch_one(RecordFilter::All).unwrap().unwrap();
        assert_eq!(stored.correlation_id, None);
    }
}
