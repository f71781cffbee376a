// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`Transport`] backed by a shared `reqwest` client.
//!
//! Each started transfer runs on its own tokio task and races the request
//! against a cancellation token. The transfer leaves the outstanding set
//! before its completion is reported.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CompletionSink, OutstandingTransfer, TransferCompletion, TransferRequest, Transport,
};
use crate::errors::TransferError;
use crate::record::CorrelationId;

enum TransferState {
    Prepared(Vec<u8>),
    Running(CancellationToken),
}

struct Transfer {
    request: TransferRequest,
    state: TransferState,
}

type Transfers = Arc<Mutex<HashMap<CorrelationId, Transfer>>>;

pub struct HttpTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
    transfers: Transfers,
    sink: Mutex<Option<CompletionSink>>,
}

impl HttpTransport {
    /// Builds a transport whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(270))
            .tcp_keepalive(Duration::from_secs(120))
            .build()?;
        Ok(Self::with_client(client))
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        HttpTransport {
            client,
            next_id: AtomicU64::new(1),
            transfers: Arc::new(Mutex::new(HashMap::new())),
            sink: Mutex::new(None),
        }
    }

    fn sink(&self) -> Option<CompletionSink> {
        lock(&self.sink).clone()
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn header_map(request: &TransferRequest) -> Result<HeaderMap, TransferError> {
    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransferError::InvalidRequest(format!("header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransferError::InvalidRequest(format!("header '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl Transport for HttpTransport {
    fn attach(&self, sink: CompletionSink) {
        *lock(&self.sink) = Some(sink);
    }

    fn prepare(
        &self,
        request: &TransferRequest,
        body: Vec<u8>,
    ) -> Result<CorrelationId, TransferError> {
        // Reject requests reqwest could never send before they become outstanding.
        header_map(request)?;
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.transfers).insert(
            correlation_id,
            Transfer {
                request: request.clone(),
                state: TransferState::Prepared(body),
            },
        );
        Ok(correlation_id)
    }

    fn start(&self, correlation_id: CorrelationId) -> Result<(), TransferError> {
        let token = CancellationToken::new();
        let (request, body) = {
            let mut transfers = lock(&self.transfers);
            let transfer = transfers
                .get_mut(&correlation_id)
                .ok_or(TransferError::UnknownTransfer(correlation_id))?;
            let TransferState::Prepared(body) = std::mem::replace(
                &mut transfer.state,
                TransferState::Running(token.clone()),
            ) else {
                debug!("RELAY | Transfer {correlation_id} already started");
                return Ok(());
            };
            (transfer.request.clone(), body)
        };

        let headers = header_map(&request)?;
        let builder = self
            .client
            .request(request.method, request.url)
            .headers(headers)
            .body(body);
        let transfers = Arc::clone(&self.transfers);
        let sink = self.sink();

        tokio::spawn(async move {
            let completion = tokio::select! {
                () = token.cancelled() => TransferCompletion::cancelled(correlation_id),
                result = builder.send() => match result {
                    Ok(response) => TransferCompletion::response(correlation_id, response.status().as_u16()),
                    Err(e) => {
                        debug!("RELAY | Transfer {correlation_id} failed: {e}");
                        TransferCompletion::failed(correlation_id, e.into())
                    }
                },
            };
            lock(&transfers).remove(&correlation_id);
            match sink {
                Some(sink) => {
                    if !sink.report(completion) {
                        debug!("RELAY | Relay stopped before transfer {correlation_id} completed");
                    }
                }
                None => warn!("RELAY | Transfer {correlation_id} finished with no relay attached"),
            }
        });
        Ok(())
    }

    fn cancel(&self, correlation_id: CorrelationId) {
        let mut transfers = lock(&self.transfers);
        let running = match transfers.get(&correlation_id).map(|t| &t.state) {
            None => return,
            Some(TransferState::Running(token)) => Some(token.clone()),
            Some(TransferState::Prepared(_)) => None,
        };
        if running.is_none() {
            transfers.remove(&correlation_id);
        }
        drop(transfers);

        match running {
            // The transfer task reports the cancellation once it observes the token.
            Some(token) => token.cancel(),
            None => {
                if let Some(sink) = self.sink() {
                    sink.report(TransferCompletion::cancelled(correlation_id));
                }
            }
        }
    }

    async fn outstanding(&self) -> Vec<OutstandingTransfer> {
        let mut outstanding: Vec<_> = lock(&self.transfers)
            .iter()
            .map(|(id, transfer)| OutstandingTransfer {
                correlation_id: *id,
                request: transfer.request.clone(),
            })
            .collect();
        outstanding.sort_by_key(|t| t.correlation_id);
        outstanding
    }
}
