// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing integration.
//!
//! [`Formatter`] prints the relay's own diagnostics as
//! `LOG_RELAY | LEVEL | [span{fields}: ]message fields`. [`RelayLayer`] is the
//! ingestion hook: installed next to the application's subscriber, it turns
//! every application event into a [`LogPayload`] and queues it on a relay.
//!
//! ```rust,ignore
//! use tracing_subscriber::prelude::*;
//!
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer().event_format(Formatter))
//!     .with(RelayLayer::new(handle))
//!     .init();
//! ```

use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::record::{LogPayload, Severity};
use crate::service::RelayHandle;

/// Targets whose events never become records: the relay itself and the
/// crates it drives while uploading.
const IGNORED_TARGETS: [&str; 8] = [
    "relay", "hyper", "h2", "reqwest", "rustls", "sled", "mio", "tokio",
];

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "LOG_RELAY | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Collects an event's message and its remaining fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn into_message(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value:?}", field.name());
    }
}

/// Ships application events to a relay.
#[derive(Debug, Clone)]
pub struct RelayLayer {
    handle: RelayHandle,
    ignored_targets: Vec<String>,
}

impl RelayLayer {
    #[must_use]
    pub fn new(handle: RelayHandle) -> Self {
        RelayLayer {
            handle,
            ignored_targets: IGNORED_TARGETS.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    /// Also skips events from `target` and its submodules.
    #[must_use]
    pub fn ignore_target(mut self, target: impl Into<String>) -> Self {
        self.ignored_targets.push(target.into());
        self
    }

    fn is_ignored(&self, target: &str) -> bool {
        self.ignored_targets.iter().any(|ignored| {
            target
                .strip_prefix(ignored.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
        })
    }
}

impl<S: Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if self.is_ignored(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let payload = LogPayload::new(Severity::from_tracing(metadata.level()), visitor.into_message())
            .with_location(metadata.file(), metadata.line())
            .with_function(metadata.module_path());

        // Nothing to report to once the relay stopped.
        let _ = self.handle.log(payload);
    }
}
