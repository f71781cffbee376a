// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upload transport abstraction.
//!
//! A transport owns transfers from the moment they are prepared until it
//! reports their completion. Completions are delivered asynchronously through
//! the [`CompletionSink`] handed over by [`Transport::attach`], never from
//! inside a call made by the relay.

pub mod http;

use async_trait::async_trait;
use reqwest::{Method, Url};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::errors::TransferError;
use crate::record::CorrelationId;
use crate::service::RelayCommand;

pub use http::HttpTransport;

/// The request an outstanding transfer was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
}

/// A transfer the transport still owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingTransfer {
    pub correlation_id: CorrelationId,
    pub request: TransferRequest,
}

/// Outcome of one transfer.
///
/// `status` is set whenever a response arrived, even when `error` is too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub correlation_id: CorrelationId,
    pub status: Option<u16>,
    pub error: Option<TransferError>,
}

impl TransferCompletion {
    #[must_use]
    pub fn response(correlation_id: CorrelationId, status: u16) -> Self {
        Self {
            correlation_id,
            status: Some(status),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(correlation_id: CorrelationId, error: TransferError) -> Self {
        Self {
            correlation_id,
            status: None,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn cancelled(correlation_id: CorrelationId) -> Self {
        Self::failed(correlation_id, TransferError::Cancelled)
    }
}

/// Where a transport reports finished transfers.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    tx: mpsc::UnboundedSender<RelayCommand>,
}

impl CompletionSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<RelayCommand>) -> Self {
        Self { tx }
    }

    /// Hands a completion to the relay. Returns `false` once the relay stopped.
    pub fn report(&self, completion: TransferCompletion) -> bool {
        self.tx
            .send(RelayCommand::TransferCompleted(completion))
            .is_ok()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers where completions go. Called once when the relay starts.
    fn attach(&self, sink: CompletionSink);

    /// Creates a suspended transfer for `body` and returns its id.
    fn prepare(
        &self,
        request: &TransferRequest,
        body: Vec<u8>,
    ) -> Result<CorrelationId, TransferError>;

    /// Starts a prepared transfer.
    fn start(&self, correlation_id: CorrelationId) -> Result<(), TransferError>;

    /// Cancels a transfer. Cancelling an unknown or finished transfer is a no-op.
    /// A cancelled transfer still reports a completion carrying
    /// [`TransferError::Cancelled`].
    fn cancel(&self, correlation_id: CorrelationId);

    /// Lists the transfers the transport still owns.
    async fn outstanding(&self) -> Vec<OutstandingTransfer>;
}
