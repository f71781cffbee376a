// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for spawning relays in integration tests

#![allow(dead_code)]

use relay::{
    LogPayload, RelayConfiguration, RelayHandle, RelayService, RelaySettings, Severity, Transport,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const TEST_HOST: &str = "http://collector.test/v1/input";

pub fn create_test_settings(identifier: &str) -> RelaySettings {
    RelaySettings::new(
        identifier,
        RelayConfiguration::parse(TEST_HOST).expect("valid host"),
    )
}

/// Builds and spawns a relay, returning its handle and task.
pub fn spawn_relay(
    settings: RelaySettings,
    transport: Arc<dyn Transport>,
) -> (RelayHandle, JoinHandle<()>) {
    let (service, handle) = RelayService::new(settings, transport).expect("relay starts");
    let task = tokio::spawn(service.run());
    (handle, task)
}

/// Stops a relay and waits until its store is closed.
pub async fn stop_relay(handle: &RelayHandle, task: JoinHandle<()>) {
    handle.shutdown().expect("relay running");
    task.await.expect("relay task completes");
}

pub fn info(message: &str) -> LogPayload {
    LogPayload::new(Severity::Info, message)
}
