// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted transport and recording observer for tests.
//!
//! Compiled for unit tests and, behind the `test-harness` feature, for the
//! integration tests under `tests/`.

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::errors::TransferError;
use crate::observer::{DiscardReason, RelayObserver};
use crate::record::{CorrelationId, LogRecord};
use crate::transport::{
    CompletionSink, OutstandingTransfer, TransferCompletion, TransferRequest, Transport,
};

#[derive(Default)]
struct FakeState {
    next_id: CorrelationId,
    ops: BTreeMap<CorrelationId, TransferRequest>,
    started: Vec<CorrelationId>,
    cancelled: Vec<CorrelationId>,
    bodies: BTreeMap<CorrelationId, Vec<u8>>,
    refuse_prepare: Option<TransferError>,
    scripted: VecDeque<u16>,
    respond_with: Option<u16>,
}

/// In-memory transport.
///
/// Transfers stay outstanding until the test finishes them, unless statuses
/// were scripted with [`FakeTransport::script`] or
/// [`FakeTransport::respond_with`], in which case each start answers at once.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
    sink: Mutex<Option<CompletionSink>>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids passed to `start`, in call order.
    pub fn started(&self) -> Vec<CorrelationId> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn cancelled(&self) -> Vec<CorrelationId> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn was_cancelled(&self, id: CorrelationId) -> bool {
        self.state.lock().unwrap().cancelled.contains(&id)
    }

    pub fn body(&self, id: CorrelationId) -> Option<Vec<u8>> {
        self.state.lock().unwrap().bodies.get(&id).cloned()
    }

    /// Every later `prepare` fails with `error` until [`Self::accept_prepare`].
    pub fn refuse_prepare(&self, error: TransferError) {
        self.state.lock().unwrap().refuse_prepare = Some(error);
    }

    pub fn accept_prepare(&self) {
        self.state.lock().unwrap().refuse_prepare = None;
    }

    /// Every started transfer without a scripted status completes with `status`.
    pub fn respond_with(&self, status: u16) {
        self.state.lock().unwrap().respond_with = Some(status);
    }

    /// The next starts complete with these statuses, in order.
    pub fn script<I: IntoIterator<Item = u16>>(&self, statuses: I) {
        self.state.lock().unwrap().scripted.extend(statuses);
    }

    /// Synchronous snapshot of the outstanding transfers.
    pub fn outstanding_now(&self) -> Vec<OutstandingTransfer> {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .map(|(id, request)| OutstandingTransfer {
                correlation_id: *id,
                request: request.clone(),
            })
            .collect()
    }

    /// Finishes a transfer with a response status.
    pub fn complete(&self, id: CorrelationId, status: u16) {
        self.finish(TransferCompletion::response(id, status));
    }

    pub fn fail(&self, id: CorrelationId, error: TransferError) {
        self.finish(TransferCompletion::failed(id, error));
    }

    /// Loses a transfer without ever reporting it.
    pub fn forget(&self, id: CorrelationId) {
        self.state.lock().unwrap().ops.remove(&id);
    }

    fn finish(&self, completion: TransferCompletion) {
        self.state
            .lock()
            .unwrap()
            .ops
            .remove(&completion.correlation_id);
        self.report(completion);
    }

    fn report(&self, completion: TransferCompletion) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.report(completion);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn attach(&self, sink: CompletionSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn prepare(
        &self,
        request: &TransferRequest,
        body: Vec<u8>,
    ) -> Result<CorrelationId, TransferError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.refuse_prepare.clone() {
            return Err(error);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.bodies.insert(id, body);
        state.ops.insert(id, request.clone());
        Ok(id)
    }

    fn start(&self, id: CorrelationId) -> Result<(), TransferError> {
        let status = {
            let mut state = self.state.lock().unwrap();
            if !state.ops.contains_key(&id) {
                return Err(TransferError::UnknownTransfer(id));
            }
            state.started.push(id);
            state.scripted.pop_front().or(state.respond_with)
        };
        if let Some(status) = status {
            self.complete(id, status);
        }
        Ok(())
    }

    fn cancel(&self, id: CorrelationId) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state.ops.remove(&id).is_some();
            if removed {
                state.cancelled.push(id);
            }
            removed
        };
        if removed {
            self.report(TransferCompletion::cancelled(id));
        }
    }

    async fn outstanding(&self) -> Vec<OutstandingTransfer> {
        self.outstanding_now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    Delivered(String),
    FailedPermanently {
        id: String,
        status: Option<u16>,
        error: Option<TransferError>,
    },
    Discarded(String, DiscardReason),
}

/// Observer that remembers every callback.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
    notify: Notify,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> usize {
        self.count(|e| matches!(e, ObserverEvent::Delivered(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|e| matches!(e, ObserverEvent::FailedPermanently { .. }))
    }

    fn count(&self, predicate: impl Fn(&ObserverEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Waits until at least `count` events arrived, for up to five seconds.
    pub async fn wait_for(&self, count: usize) -> Vec<ObserverEvent> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                let events = self.events();
                if events.len() >= count {
                    return events;
                }
                notified.await;
            }
        })
        .await
        .unwrap()
    }

    fn push(&self, event: ObserverEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }
}

impl RelayObserver for RecordingObserver {
    fn on_delivered(&self, record: &LogRecord) {
        self.push(ObserverEvent::Delivered(record.id.clone()));
    }

    fn on_failed_permanently(
        &self,
        record: &LogRecord,
        error: Option<&TransferError>,
        status: Option<u16>,
    ) {
        self.push(ObserverEvent::FailedPermanently {
            id: record.id.clone(),
            status,
            error: error.cloned(),
        });
    }

    fn on_discarded(&self, record: &LogRecord, reason: DiscardReason) {
        self.push(ObserverEvent::Discarded(record.id.clone(), reason));
    }
}
