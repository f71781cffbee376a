// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialized relay service.
//!
//! Every store mutation happens on the single task running
//! [`RelayService::run`]. Callers hold a cloneable [`RelayHandle`] that sends
//! [`RelayCommand`]s over an unbounded channel; transports report completions
//! through the same channel, so ingestion, flushes, completions and
//! reconciliation never interleave.
//!
//! ```rust,ignore
//! let transport = Arc::new(HttpTransport::new(settings.request_timeout)?);
//! let (service, handle) = RelayService::new(settings, transport)?;
//! tokio::spawn(service.run());
//!
//! handle.log(LogPayload::new(Severity::Info, "hello"))?;
//! let dispatched = handle.flush_logs().await?;
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::{RelayConfiguration, RelaySettings};
use crate::dispatcher::Dispatcher;
use crate::errors::RelayError;
use crate::observer::{DiscardReason, RelayObserver};
use crate::policy::{enforce_capacity, RetryPolicy};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::record::{LogPayload, LogRecord};
use crate::router::CompletionRouter;
use crate::store::{RecordFilter, RecordStore, StoreError};
use crate::transport::{CompletionSink, TransferCompletion, Transport};

/// Callback run once the completions queued before it have been routed.
pub type BackgroundDone = Box<dyn FnOnce() + Send>;

/// Commands processed by the relay service task.
pub enum RelayCommand {
    /// Persist a record, enforce capacity and flush.
    Log(LogPayload),
    /// Dispatch every pending record, answering with how many were started.
    Flush(oneshot::Sender<usize>),
    /// A transport finished a transfer.
    TransferCompleted(TransferCompletion),
    /// Run orphan and staleness repair.
    Cleanup(oneshot::Sender<ReconcileReport>),
    SetConfiguration(RelayConfiguration, oneshot::Sender<ReconcileReport>),
    GetConfiguration(oneshot::Sender<RelayConfiguration>),
    SetMaxRecords(usize),
    SetMaxRetries(Option<u32>),
    SetObserver(Option<Arc<dyn RelayObserver>>),
    /// Delete every record without touching running transfers.
    Reset(oneshot::Sender<Result<usize, StoreError>>),
    Records(oneshot::Sender<Result<Vec<LogRecord>, StoreError>>),
    Count(oneshot::Sender<Result<usize, StoreError>>),
    BackgroundEvents(BackgroundDone),
    Shutdown,
}

static LIVE_IDENTIFIERS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Exclusive claim on an identifier for the lifetime of one service.
struct IdentifierLease(String);

impl IdentifierLease {
    fn acquire(identifier: &str) -> Result<Self, RelayError> {
        let mut live = LIVE_IDENTIFIERS
            .get_or_init(|| Mutex::new(HashSet::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !live.insert(identifier.to_owned()) {
            return Err(RelayError::IdentifierInUse(identifier.to_owned()));
        }
        Ok(IdentifierLease(identifier.to_owned()))
    }
}

impl Drop for IdentifierLease {
    fn drop(&mut self) {
        if let Some(live) = LIVE_IDENTIFIERS.get() {
            live.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.0);
        }
    }
}

/// Handle for sending commands to the relay service.
#[derive(Clone, Debug)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
    identifier: Arc<str>,
}

impl RelayHandle {
    fn send(&self, command: RelayCommand) -> Result<(), RelayError> {
        self.tx
            .send(command)
            .map_err(|_| RelayError::ServiceStopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RelayCommand,
    ) -> Result<T, RelayError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(command(response_tx))?;
        response_rx.await.map_err(|_| RelayError::ServiceStopped)
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Queues a log record. Returns as soon as the command is enqueued.
    pub fn log(&self, payload: LogPayload) -> Result<(), RelayError> {
        self.send(RelayCommand::Log(payload))
    }

    /// Dispatches every pending record and returns how many transfers started.
    pub async fn flush_logs(&self) -> Result<usize, RelayError> {
        self.request(RelayCommand::Flush).await
    }

    /// Deletes every record, returning how many were removed.
    ///
    /// Transfers already running are left alone; their completions find no
    /// owner and are ignored.
    pub async fn reset(&self) -> Result<usize, RelayError> {
        Ok(self.request(RelayCommand::Reset).await??)
    }

    /// Repairs orphaned and stale transfers.
    pub async fn cleanup(&self) -> Result<ReconcileReport, RelayError> {
        self.request(RelayCommand::Cleanup).await
    }

    /// Replaces the network configuration. A different configuration moves
    /// every outstanding transfer onto it. An invalid one is rejected and the
    /// current configuration stays in place.
    pub async fn set_configuration(
        &self,
        configuration: RelayConfiguration,
    ) -> Result<ReconcileReport, RelayError> {
        configuration.validate()?;
        self.request(|tx| RelayCommand::SetConfiguration(configuration, tx))
            .await
    }

    pub async fn configuration(&self) -> Result<RelayConfiguration, RelayError> {
        self.request(RelayCommand::GetConfiguration).await
    }

    /// Changes the capacity; excess records are evicted immediately.
    pub fn set_max_records(&self, max_records: usize) -> Result<(), RelayError> {
        if max_records == 0 {
            return Err(RelayError::InvalidConfig(
                "max_records must be greater than 0".to_string(),
            ));
        }
        self.send(RelayCommand::SetMaxRecords(max_records))
    }

    /// Changes the retry budget of future failures. `None` retries forever.
    pub fn set_max_retries(&self, max_retries: Option<u32>) -> Result<(), RelayError> {
        self.send(RelayCommand::SetMaxRetries(max_retries))
    }

    /// Registers the single observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn RelayObserver>) -> Result<(), RelayError> {
        self.send(RelayCommand::SetObserver(Some(observer)))
    }

    pub fn clear_observer(&self) -> Result<(), RelayError> {
        self.send(RelayCommand::SetObserver(None))
    }

    /// Snapshot of stored records in creation order.
    pub async fn records(&self) -> Result<Vec<LogRecord>, RelayError> {
        Ok(self.request(RelayCommand::Records).await??)
    }

    pub async fn count(&self) -> Result<usize, RelayError> {
        Ok(self.request(RelayCommand::Count).await??)
    }

    /// Host hook for background transfer events.
    ///
    /// Returns `false` and drops `done` when `identifier` names another relay.
    /// Otherwise `done` runs on the service task after every completion the
    /// transport reported before this call has been routed. It never waits for
    /// transfers still running, including retries started while routing.
    pub fn handle_background_events<F>(&self, identifier: &str, done: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if identifier != &*self.identifier {
            return false;
        }
        self.send(RelayCommand::BackgroundEvents(Box::new(done)))
            .is_ok()
    }

    /// Sink a custom transport can report completions to.
    #[must_use]
    pub fn completion_sink(&self) -> CompletionSink {
        CompletionSink::new(self.tx.clone())
    }

    /// Stops the service after the commands already queued.
    pub fn shutdown(&self) -> Result<(), RelayError> {
        self.send(RelayCommand::Shutdown)
    }
}

/// Relay service that owns the store and processes commands.
pub struct RelayService {
    store: RecordStore,
    transport: Arc<dyn Transport>,
    configuration: RelayConfiguration,
    policy: RetryPolicy,
    max_records: usize,
    observer: Option<Arc<dyn RelayObserver>>,
    rx: mpsc::UnboundedReceiver<RelayCommand>,
    _lease: IdentifierLease,
}

impl RelayService {
    /// Validates `settings`, opens the store and attaches `transport`.
    ///
    /// Returns the service (to be spawned) and a handle (to send commands).
    pub fn new(
        settings: RelaySettings,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, RelayHandle), RelayError> {
        settings.validate()?;
        let lease = IdentifierLease::acquire(&settings.identifier)?;
        let store = match &settings.storage_dir {
            Some(dir) => RecordStore::open(dir, &settings.identifier)?,
            None => RecordStore::open_ephemeral(&settings.identifier)?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        transport.attach(CompletionSink::new(tx.clone()));

        let service = RelayService {
            store,
            transport,
            configuration: settings.configuration,
            policy: RetryPolicy::new(settings.max_retries),
            max_records: settings.max_records,
            observer: None,
            rx,
            _lease: lease,
        };
        let handle = RelayHandle {
            tx,
            identifier: Arc::from(settings.identifier.as_str()),
        };
        Ok((service, handle))
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.store, self.transport.as_ref(), &self.configuration)
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.store, self.transport.as_ref(), &self.configuration)
    }

    /// Runs the service until a shutdown command arrives.
    ///
    /// Reconciles against the transport before the first command, so records
    /// left in flight by a previous process are redispatched.
    pub async fn run(mut self) {
        info!(
            "RELAY | Relay '{}' started with {} stored records",
            self.store.identifier(),
            self.store.count(RecordFilter::All).unwrap_or_default()
        );
        self.reconciler().reconcile().await;
        self.dispatcher().flush();

        while let Some(command) = self.rx.recv().await {
            match command {
                RelayCommand::Log(payload) => self.ingest(payload),
                RelayCommand::Flush(response_tx) => {
                    let dispatched = self.dispatcher().flush();
                    let _ = response_tx.send(dispatched);
                }
                RelayCommand::TransferCompleted(completion) => {
                    self.router().on_transfer_completed(&completion);
                }
                RelayCommand::Cleanup(response_tx) => {
                    let report = self.reconciler().reconcile().await;
                    let _ = response_tx.send(report);
                }
                RelayCommand::SetConfiguration(configuration, response_tx) => {
                    let report = self.apply_configuration(configuration).await;
                    let _ = response_tx.send(report);
                }
                RelayCommand::GetConfiguration(response_tx) => {
                    let _ = response_tx.send(self.configuration.clone());
                }
                RelayCommand::SetMaxRecords(max_records) => {
                    self.max_records = max_records;
                    self.evict_over_capacity();
                }
                RelayCommand::SetMaxRetries(max_retries) => {
                    self.policy = RetryPolicy::new(max_retries);
                }
                RelayCommand::SetObserver(observer) => self.observer = observer,
                RelayCommand::Reset(response_tx) => {
                    let result = self.store.delete_all();
                    match &result {
                        Ok(deleted) => info!("RELAY | Reset removed {deleted} records"),
                        Err(e) => error!("RELAY | Reset failed: {e}"),
                    }
                    let _ = response_tx.send(result);
                }
                RelayCommand::Records(response_tx) => {
                    let _ = response_tx.send(self.store.fetch_all(RecordFilter::All));
                }
                RelayCommand::Count(response_tx) => {
                    let _ = response_tx.send(self.store.count(RecordFilter::All));
                }
                RelayCommand::BackgroundEvents(done) => {
                    debug!("RELAY | Background completions routed");
                    done();
                }
                RelayCommand::Shutdown => {
                    debug!("RELAY | Relay service shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.store.flush() {
            error!("RELAY | Failed to flush store on shutdown: {e}");
        }
    }

    fn router(&self) -> CompletionRouter<'_> {
        CompletionRouter::new(
            &self.store,
            self.transport.as_ref(),
            &self.configuration,
            self.policy,
            self.observer.as_ref(),
        )
    }

    fn ingest(&mut self, payload: LogPayload) {
        match self.store.insert(payload) {
            Ok(record) => debug!("RELAY | Stored record {}", record.id),
            Err(e) => {
                error!("RELAY | Failed to store log record: {e}");
                return;
            }
        }
        self.evict_over_capacity();
        self.dispatcher().flush();
    }

    fn evict_over_capacity(&self) {
        let evicted = enforce_capacity(&self.store, self.max_records);
        if let Some(observer) = &self.observer {
            for record in &evicted {
                observer.on_discarded(record, DiscardReason::Evicted);
            }
        }
    }

    async fn apply_configuration(&mut self, configuration: RelayConfiguration) -> ReconcileReport {
        if configuration == self.configuration {
            return ReconcileReport::default();
        }
        info!(
            "RELAY | Configuration changed, uploads now target {}",
            configuration.host()
        );
        self.configuration = configuration;
        self.reconciler().reconcile().await
    }
}
