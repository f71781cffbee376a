// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the relay.
//!
//! Storage failures live next to the store in [`crate::store::StoreError`].
//! Everything here is either surfaced by the public handle ([`RelayError`]),
//! reported by a transport ([`TransferError`]) or produced while turning a
//! record into an outbound transfer ([`DispatchError`]).

use crate::store::StoreError;

/// Errors returned by the relay service and its handle.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),

    #[error("Identifier '{0}' is already owned by a running relay")]
    IdentifierInUse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransferError),

    #[error("Relay service is not running")]
    ServiceStopped,
}

/// Failures reported by a [`crate::transport::Transport`].
///
/// Cancellation is its own variant so the completion router never counts it
/// against a record's retry budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer was cancelled")]
    Cancelled,

    #[error("transfer timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown transfer {0}")]
    UnknownTransfer(u64),
}

impl TransferError {
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout
        } else if err.is_builder() {
            TransferError::InvalidRequest(err.to_string())
        } else {
            TransferError::Request(err.to_string())
        }
    }
}

/// Reasons a single record could not be put in flight.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport refused transfer: {0}")]
    Transfer(#[from] TransferError),

    #[error("failed to persist correlation id: {0}")]
    Storage(#[from] StoreError),

    #[error("record {0} no longer exists")]
    Vanished(String),
}
