// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persisted log records and the payload they carry.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier tying a persisted record to one transfer at the transport.
pub type CorrelationId = u64;

/// Severity of a log event.
///
/// Flags and levels follow the lumberjack convention: every severity owns one
/// flag bit and its level is the mask of that flag and every more severe one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl Severity {
    #[must_use]
    pub fn flag(self) -> i32 {
        match self {
            Severity::Error => 1,
            Severity::Warning => 1 << 1,
            Severity::Info => 1 << 2,
            Severity::Debug => 1 << 3,
            Severity::Verbose => 1 << 4,
        }
    }

    #[must_use]
    pub fn level(self) -> i32 {
        (self.flag() << 1) - 1
    }

    #[must_use]
    pub fn from_tracing(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Severity::Error,
            tracing::Level::WARN => Severity::Warning,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::TRACE => Severity::Verbose,
        }
    }
}

/// The log message and its metadata, opaque to the queue beyond encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub message: String,
    pub flag: i32,
    pub level: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub file: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
    pub context: Option<i64>,
}

impl LogPayload {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            flag: severity.flag(),
            level: severity.level(),
            timestamp: OffsetDateTime::now_utc(),
            file: None,
            function: None,
            line: None,
            context: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, file: Option<&str>, line: Option<u32>) -> Self {
        self.file = file.map(str::to_owned);
        self.line = line;
        self
    }

    #[must_use]
    pub fn with_function(mut self, function: Option<&str>) -> Self {
        self.function = function.map(str::to_owned);
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: i64) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One persisted, not-yet-delivered log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Stable unique identifier, never reused.
    pub id: String,
    /// Creation order within the owning store.
    pub sequence: u64,
    pub payload: LogPayload,
    /// Transfer currently carrying this record, `None` when pending.
    pub correlation_id: Option<CorrelationId>,
    /// Number of retryable failures seen so far.
    pub retry_count: u32,
}

/// JSON body posted to the collector.
#[derive(Serialize)]
struct WirePayload<'a> {
    uuid: &'a str,
    message: &'a str,
    flag: i32,
    level: i32,
    #[serde(with = "time::serde::rfc3339")]
    date: OffsetDateTime,
}

impl LogRecord {
    pub(crate) fn new(sequence: u64, payload: LogPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sequence,
            payload,
            correlation_id: None,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.correlation_id.is_some()
    }

    /// Encodes the record into the collector wire format.
    pub fn wire_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WirePayload {
            uuid: &self.id,
            message: &self.payload.message,
            flag: self.payload.flag,
            level: self.payload.level,
            date: self.payload.timestamp,
        })
    }
}
