// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable, at-least-once log shipping.
//!
//! Records are persisted before anything else happens, uploaded in the
//! background and deleted once the collector acknowledges them. Failed uploads
//! are retried up to a bound, the store is capped by evicting its oldest
//! records, and in-flight bookkeeping is reconciled against the transport at
//! startup and whenever the network configuration changes.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod logger;
pub mod observer;
pub mod policy;
pub mod reconciler;
pub mod record;
pub mod router;
pub mod service;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_support;

pub use config::{RelayConfiguration, RelaySettings};
pub use errors::{RelayError, TransferError};
pub use observer::{DiscardReason, RelayObserver};
pub use record::{CorrelationId, LogPayload, LogRecord, Severity};
pub use service::{RelayHandle, RelayService};
pub use transport::{HttpTransport, Transport};
