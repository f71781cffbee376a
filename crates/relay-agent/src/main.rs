// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{error::Error, sync::Arc};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    signal,
    time::{interval, sleep, timeout, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use relay::{
    logger::Formatter, HttpTransport, LogPayload, RelayHandle, RelayService, RelaySettings,
    Severity, Transport,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
pub async fn main() {
    let settings = RelaySettings::from_env();
    let log_level = settings
        .as_ref()
        .map(|s| s.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());

    #[allow(clippy::expect_used)]
    init_logging(&log_level).expect("setting default subscriber failed");

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid relay configuration: {e}. Shutting down.");
            return;
        }
    };

    let transport: Arc<dyn Transport> = match HttpTransport::new(settings.request_timeout) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Unable to build HTTP client: {e}. Shutting down.");
            return;
        }
    };

    let flush_every = settings.flush_interval;
    let (service, handle) = match RelayService::new(settings, transport) {
        Ok(started) => started,
        Err(e) => {
            error!("Unable to start relay: {e}. Shutting down.");
            return;
        }
    };
    let service_task = tokio::spawn(service.run());
    info!("Relay '{}' ready, reading stdin", handle.identifier());

    forward_stdin(&handle, flush_every).await;
    drain(&handle).await;

    if handle.shutdown().is_ok() {
        if let Err(e) = service_task.await {
            error!("Relay service task failed: {e}");
        }
    }
}

/// Installs the global subscriber. Records from crates logging through `log`,
/// such as sled, are bridged into it and filtered the same way.
fn init_logging(log_level: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    let env_filter = EnvFilter::try_new(format!("h2=off,hyper=off,rustls=off,{log_level}"))?;
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .event_format(Formatter)
        .try_init()
}

/// Ships every non-empty stdin line until EOF or Ctrl-C, flushing on a timer.
async fn forward_stdin(handle: &RelayHandle, flush_every: Duration) {
    let mut lines = BufReader::new(stdin()).lines();
    let mut flush_interval = interval(flush_every);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Err(e) = handle.log(LogPayload::new(Severity::Info, line)) {
                        error!("Dropping input, relay unavailable: {e}");
                        return;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    return;
                }
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    return;
                }
            },
            _ = flush_interval.tick() => match handle.flush_logs().await {
                Ok(0) => {}
                Ok(dispatched) => debug!("Periodic flush dispatched {dispatched} records"),
                Err(e) => {
                    error!("Periodic flush failed: {e}");
                    return;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupted, draining relay");
                return;
            }
        }
    }
}

/// Gives outstanding uploads a bounded amount of time to finish.
async fn drain(handle: &RelayHandle) {
    if let Err(e) = handle.flush_logs().await {
        warn!("Final flush failed: {e}");
        return;
    }
    let drained = timeout(DRAIN_TIMEOUT, async {
        loop {
            match handle.count().await {
                Ok(0) | Err(_) => return,
                Ok(_) => sleep(DRAIN_POLL_INTERVAL).await,
            }
        }
    })
    .await;

    match (drained, handle.count().await) {
        (Ok(()), _) => debug!("All records delivered"),
        (Err(_), Ok(remaining)) => warn!(
            "{remaining} records still stored after {}s, they ship on next start",
            DRAIN_TIMEOUT.as_secs()
        ),
        (Err(_), Err(e)) => warn!("Relay stopped while draining: {e}"),
    }
}
