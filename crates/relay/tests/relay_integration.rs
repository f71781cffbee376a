// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end behavior of a relay driven through its handle

mod common;

use common::helpers::{create_test_settings, info, spawn_relay, stop_relay};
use relay::test_support::{FakeTransport, ObserverEvent, RecordingObserver};
use relay::{
    DiscardReason, HttpTransport, RelayConfiguration, RelayError, Transport, TransferError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_single_record_under_capacity() {
    let transport = Arc::new(FakeTransport::new());
    let mut settings = create_test_settings("it-capacity-one");
    settings.max_records = 10;
    let (handle, task) = spawn_relay(settings, transport.clone());

    handle.log(info("only one")).unwrap();
    assert_eq!(handle.count().await.unwrap(), 1);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_capacity_evicts_two_oldest() {
    let transport = Arc::new(FakeTransport::new());
    let mut settings = create_test_settings("it-capacity-twelve");
    settings.max_records = 10;
    let (handle, task) = spawn_relay(settings, transport.clone());

    for i in 0..12 {
        handle.log(info(&format!("log {i}"))).unwrap();
    }

    let records = handle.records().await.unwrap();
    assert_eq!(records.len(), 10);
    let messages: Vec<_> = records.iter().map(|r| r.payload.message.clone()).collect();
    assert!(!messages.contains(&"log 0".to_string()));
    assert!(!messages.contains(&"log 1".to_string()));
    assert_eq!(messages.first().map(String::as_str), Some("log 2"));
    assert_eq!(messages.last().map(String::as_str), Some("log 11"));

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_flush_dispatches_each_pending_record_once() {
    let transport = Arc::new(FakeTransport::new());
    transport.refuse_prepare(TransferError::Request("offline".to_string()));
    let (handle, task) = spawn_relay(create_test_settings("it-flush"), transport.clone());

    for i in 0..5 {
        handle.log(info(&format!("{i}"))).unwrap();
    }
    let pending = handle.records().await.unwrap();
    assert!(pending.iter().all(|r| r.correlation_id.is_none()));

    transport.accept_prepare();
    assert_eq!(handle.flush_logs().await.unwrap(), 5);
    assert_eq!(handle.flush_logs().await.unwrap(), 0);

    let records = handle.records().await.unwrap();
    let ids: HashSet<_> = records.iter().map(|r| r.correlation_id.unwrap()).collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(transport.started().len(), 5);
    assert_eq!(transport.outstanding_now().len(), 5);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_success_deletes_record_and_notifies_once() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond_with(200);
    let (handle, task) = spawn_relay(create_test_settings("it-success"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("delivered")).unwrap();
    let events = observer.wait_for(1).await;

    assert!(matches!(events.as_slice(), [ObserverEvent::Delivered(_)]));
    assert_eq!(handle.count().await.unwrap(), 0);
    assert_eq!(observer.delivered(), 1);
    assert_eq!(observer.failed(), 0);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_server_errors_abandon_after_three_failures() {
    let transport = Arc::new(FakeTransport::new());
    transport.respond_with(500);
    let (handle, task) = spawn_relay(create_test_settings("it-abandon"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("doomed")).unwrap();
    let events = observer.wait_for(1).await;

    assert!(matches!(
        events.as_slice(),
        [ObserverEvent::FailedPermanently {
            status: Some(500),
            error: None,
            ..
        }]
    ));
    // Every queued completion has been processed by now.
    assert_eq!(handle.count().await.unwrap(), 0);
    assert_eq!(transport.started().len(), 3);
    assert_eq!(observer.failed(), 1);
    assert_eq!(observer.delivered(), 0);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_transport_failure_is_retried_then_delivered() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-retry"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("flaky")).unwrap();
    let first = handle.records().await.unwrap()[0].correlation_id.unwrap();
    transport.fail(first, TransferError::Timeout);

    let record = handle.records().await.unwrap().remove(0);
    assert_eq!(record.retry_count, 1);
    let second = record.correlation_id.unwrap();
    assert_ne!(first, second);

    transport.complete(second, 200);
    observer.wait_for(1).await;
    assert_eq!(observer.delivered(), 1);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_unbounded_retries_keep_going() {
    let transport = Arc::new(FakeTransport::new());
    transport.script(std::iter::repeat(503).take(50));
    transport.respond_with(200);
    let mut settings = create_test_settings("it-unbounded");
    settings.max_retries = None;
    let (handle, task) = spawn_relay(settings, transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("persistent")).unwrap();
    observer.wait_for(1).await;

    assert_eq!(observer.delivered(), 1);
    assert_eq!(observer.failed(), 0);
    assert_eq!(transport.started().len(), 51);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_cancellation_is_silent() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-cancel"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("cancel me")).unwrap();
    let id = handle.records().await.unwrap()[0].correlation_id.unwrap();
    transport.cancel(id);

    let events = observer.wait_for(1).await;
    assert!(matches!(
        events.as_slice(),
        [ObserverEvent::Discarded(_, DiscardReason::Cancelled)]
    ));
    assert_eq!(handle.count().await.unwrap(), 0);
    assert_eq!(observer.delivered(), 0);
    assert_eq!(observer.failed(), 0);
    assert_eq!(transport.started().len(), 1);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_cleanup_redispatches_orphans() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-orphan"), transport.clone());

    handle.log(info("orphan")).unwrap();
    let lost = handle.records().await.unwrap()[0].correlation_id.unwrap();
    transport.forget(lost);

    let report = handle.cleanup().await.unwrap();
    assert_eq!(report.orphans_redispatched, 1);

    let record = handle.records().await.unwrap().remove(0);
    let replacement = record.correlation_id.unwrap();
    assert_ne!(replacement, lost);
    assert_eq!(record.retry_count, 0);
    assert_eq!(transport.started(), vec![lost, replacement]);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_host_change_moves_every_transfer() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-host-change"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    for i in 0..3 {
        handle.log(info(&format!("{i}"))).unwrap();
    }
    let before = handle.records().await.unwrap();

    let moved = RelayConfiguration::parse("https://other.test/intake").unwrap();
    let report = handle.set_configuration(moved.clone()).await.unwrap();
    assert_eq!(report.stale_redispatched, 3);

    // Cancellations of the old transfers are routed before this answers.
    let after = handle.records().await.unwrap();
    assert_eq!(after.len(), 3);
    assert_eq!(
        after.iter().map(|r| &r.id).collect::<Vec<_>>(),
        before.iter().map(|r| &r.id).collect::<Vec<_>>()
    );
    for record in &before {
        assert!(transport.cancelled().contains(&record.correlation_id.unwrap()));
    }

    let outstanding = transport.outstanding_now();
    assert_eq!(outstanding.len(), 3);
    assert!(outstanding.iter().all(|t| moved.matches(&t.request)));
    assert!(outstanding
        .iter()
        .all(|t| t.request.url.host_str() == Some("other.test")));
    assert!(observer.events().is_empty());
    assert_eq!(handle.configuration().await.unwrap(), moved);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_header_change_is_stale() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-header-change"), transport.clone());
    handle.log(info("x")).unwrap();
    handle.count().await.unwrap();

    let rekeyed = RelayConfiguration::with_headers(
        reqwest::Url::parse(common::helpers::TEST_HOST).unwrap(),
        [("X-Api-Key", "rotated")],
    );
    let report = handle.set_configuration(rekeyed).await.unwrap();
    assert_eq!(report.stale_redispatched, 1);
    let outstanding = transport.outstanding_now();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].request.headers["X-Api-Key"], "rotated");

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_restart_redispatches_in_flight_records() {
    let dir = TempDir::new().unwrap();
    let mut settings = create_test_settings("it-restart");
    settings.storage_dir = Some(dir.path().to_path_buf());

    let first = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(settings.clone(), first.clone());
    handle.log(info("survives")).unwrap();
    handle.log(info("also survives")).unwrap();
    let before = handle.records().await.unwrap();
    assert!(before.iter().all(|r| r.correlation_id.is_some()));
    stop_relay(&handle, task).await;

    // A fresh transport knows nothing about the previous process.
    let second = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(settings, second.clone());
    let after = handle.records().await.unwrap();

    assert_eq!(
        after.iter().map(|r| &r.id).collect::<Vec<_>>(),
        before.iter().map(|r| &r.id).collect::<Vec<_>>()
    );
    assert_eq!(second.started().len(), 2);
    let live: HashSet<_> = second
        .outstanding_now()
        .iter()
        .map(|t| t.correlation_id)
        .collect();
    assert!(after.iter().all(|r| live.contains(&r.correlation_id.unwrap())));

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_reset_leaves_transfers_and_ignores_their_completions() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-reset"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("a")).unwrap();
    handle.log(info("b")).unwrap();
    assert_eq!(handle.reset().await.unwrap(), 2);
    assert_eq!(transport.outstanding_now().len(), 2);

    for id in transport.started() {
        transport.complete(id, 200);
    }
    assert_eq!(handle.count().await.unwrap(), 0);
    assert!(observer.events().is_empty());

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_background_events_run_after_reported_completions() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-background"), transport.clone());
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();
    assert_eq!(handle.identifier(), "it-background");
    assert!(!handle.handle_background_events("elsewhere", || {}));

    handle.log(info("finished while suspended")).unwrap();
    handle.log(info("still uploading")).unwrap();
    let id = handle.records().await.unwrap()[0].correlation_id.unwrap();
    transport.complete(id, 200);

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let seen = observer.clone();
    assert!(handle.handle_background_events("it-background", move || {
        let _ = done_tx.send(seen.delivered());
    }));

    let delivered_before_done = tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered_before_done, 1);
    assert_eq!(transport.outstanding_now().len(), 1);

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_second_relay_with_same_identifier_is_rejected() {
    let transport = Arc::new(FakeTransport::new());
    let (handle, task) = spawn_relay(create_test_settings("it-unique"), transport.clone());

    let duplicate =
        relay::RelayService::new(create_test_settings("it-unique"), transport.clone());
    assert!(matches!(duplicate, Err(RelayError::IdentifierInUse(_))));

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_http_transport_delivers_to_collector() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/input")
        .match_header("content-type", "application/json")
        .match_header("x-api-key", "secret")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let host = reqwest::Url::parse(&format!("{}/v1/input", server.url())).unwrap();
    let mut settings = create_test_settings("it-http-ok");
    settings.configuration = RelayConfiguration::with_headers(host, [("X-Api-Key", "secret")]);
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
    let (handle, task) = spawn_relay(settings, transport);
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("over the wire")).unwrap();
    observer.wait_for(1).await;

    assert_eq!(observer.delivered(), 1);
    assert_eq!(handle.count().await.unwrap(), 0);
    mock.assert_async().await;

    stop_relay(&handle, task).await;
}

#[tokio::test]
async fn test_http_transport_abandons_after_retries() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(500)
        .expect(2)
        .create_async()
        .await;

    let mut settings = create_test_settings("it-http-500");
    settings.configuration = RelayConfiguration::parse(&server.url()).unwrap();
    settings.max_retries = Some(2);
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(Duration::from_secs(5)).unwrap());
    let (handle, task) = spawn_relay(settings, transport);
    let observer = Arc::new(RecordingObserver::default());
    handle.set_observer(observer.clone()).unwrap();

    handle.log(info("rejected")).unwrap();
    let events = observer.wait_for(1).await;

    assert!(matches!(
        events.as_slice(),
        [ObserverEvent::FailedPermanently {
            status: Some(500),
            ..
        }]
    ));
    mock.assert_async().await;

    stop_relay(&handle, task).await;
}
