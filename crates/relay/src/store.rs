// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sled-backed persistence for log records.
//!
//! Every relay identifier owns one database at `<dir>/<identifier>.relay`.
//! Records live in a single tree keyed by their big-endian sequence number so
//! iteration order is creation order. A metadata record guards the layout: a
//! store written by an incompatible schema, owned by another identifier or
//! damaged on disk is discarded and recreated empty.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sled::{Config as SledConfig, Db, IVec, Tree};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::record::{CorrelationId, LogPayload, LogRecord};

/// Tree name dedicated to store metadata records.
const META_TREE: &str = "__meta";
/// Key for the JSON-encoded [`Metadata`] record.
const META_KEY: &[u8] = b"meta.json";
/// Tree holding one entry per record.
const RECORDS_TREE: &str = "records";
/// Bumped whenever the persisted record layout changes.
pub const SCHEMA_VERSION: u32 = 1;
/// Extension of the on-disk database directory.
const STORE_EXTENSION: &str = "relay";

/// Metadata persisted alongside the embedded database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub schema_version: u32,
    pub identifier: String,
    pub creation_time: OffsetDateTime,
}

/// Errors emitted by the [`RecordStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("metadata missing from relay store")]
    MissingMetadata,
}

/// Predicate selecting which records a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    /// Records without a transfer.
    Pending,
    /// Records with a transfer assigned.
    InFlight,
    CorrelationId(CorrelationId),
}

impl RecordFilter {
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::Pending => record.correlation_id.is_none(),
            RecordFilter::InFlight => record.correlation_id.is_some(),
            RecordFilter::CorrelationId(id) => record.correlation_id == Some(*id),
        }
    }
}

/// Durable, ordered collection of [`LogRecord`]s.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Db,
    records: Tree,
    path: PathBuf,
    identifier: String,
}

impl RecordStore {
    /// Opens (or creates) the store for `identifier` inside `dir`.
    ///
    /// Existing records survive a reopen. A corrupted store, or one whose
    /// metadata is unreadable or mismatched, is rebuilt from scratch and the
    /// records it held are lost. Any other open failure is returned.
    pub fn open(dir: impl AsRef<Path>, identifier: &str) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        // sled does not create intermediate directories automatically.
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{identifier}.{STORE_EXTENSION}"));

        match sled_config(&path).open() {
            Ok(db) => {
                let store = RecordStore::from_db(db, path.clone(), identifier)?;
                match store.validate_or_write_metadata()? {
                    MetadataState::Valid | MetadataState::Written => Ok(store),
                    MetadataState::Mismatch => {
                        warn!(
                            "RELAY | Store at {} belongs to another schema or identifier, recreating it",
                            path.display()
                        );
                        drop(store);
                        RecordStore::rebuild(path, identifier)
                    }
                }
            }
            // Io failures (a held lock, EACCES, EMFILE) may be transient and
            // must never discard the queue.
            Err(err @ sled::Error::Corruption { .. }) => {
                warn!(
                    "RELAY | Store at {} could not be opened ({err}), recreating it",
                    path.display()
                );
                RecordStore::rebuild(path, identifier)
            }
            Err(other) => Err(StoreError::Db(other)),
        }
    }

    /// Opens an in-memory store (ephemeral across restarts).
    pub fn open_ephemeral(identifier: &str) -> Result<Self, StoreError> {
        let db = SledConfig::new().temporary(true).open()?;
        let store = RecordStore::from_db(db, PathBuf::new(), identifier)?;
        store.write_metadata()?;
        Ok(store)
    }

    fn from_db(db: Db, path: PathBuf, identifier: &str) -> Result<Self, StoreError> {
        let records = db.open_tree(RECORDS_TREE)?;
        Ok(RecordStore {
            db,
            records,
            path,
            identifier: identifier.to_owned(),
        })
    }

    fn rebuild(path: PathBuf, identifier: &str) -> Result<Self, StoreError> {
        reset_path(&path)?;
        let db = sled_config(&path).open()?;
        let store = RecordStore::from_db(db, path, identifier)?;
        store.write_metadata()?;
        Ok(store)
    }

    /// Returns the filesystem path backing the store.
    ///
    /// Ephemeral stores return an empty path because data resides in memory only.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Fetches the store metadata.
    pub fn metadata(&self) -> Result<Metadata, StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        let Some(bytes) = tree.get(META_KEY)? else {
            return Err(StoreError::MissingMetadata);
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Persists a new pending record built from `payload`.
    pub fn insert(&self, payload: LogPayload) -> Result<LogRecord, StoreError> {
        let sequence = self.db.generate_id()?;
        let record = LogRecord::new(sequence, payload);
        self.records
            .insert(sequence_key(sequence), serde_json::to_vec(&record)?)?;
        Ok(record)
    }

    /// Overwrites a stored record. Returns `false` when it no longer exists.
    pub fn update(&self, record: &LogRecord) -> Result<bool, StoreError> {
        let key = sequence_key(record.sequence);
        if !self.records.contains_key(key)? {
            return Ok(false);
        }
        self.records.insert(key, serde_json::to_vec(record)?)?;
        Ok(true)
    }

    /// Removes a record. Returns `false` when it was already gone.
    pub fn delete(&self, record: &LogRecord) -> Result<bool, StoreError> {
        Ok(self.records.remove(sequence_key(record.sequence))?.is_some())
    }

    /// Removes every record, returning how many were dropped.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let count = self.records.len();
        self.records.clear()?;
        Ok(count)
    }

    /// Returns the matching records in creation order.
    pub fn fetch_all(&self, filter: RecordFilter) -> Result<Vec<LogRecord>, StoreError> {
        let mut matching = Vec::new();
        for entry in self.records.iter() {
            let (key, value) = entry?;
            if let Some(record) = self.decode(&key, &value) {
                if filter.matches(&record) {
                    matching.push(record);
                }
            }
        }
        Ok(matching)
    }

    /// Returns the oldest matching record.
    pub fn fetch_one(&self, filter: RecordFilter) -> Result<Option<LogRecord>, StoreError> {
        for entry in self.records.iter() {
            let (key, value) = entry?;
            if let Some(record) = self.decode(&key, &value) {
                if filter.matches(&record) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Returns up to `limit` records, oldest first.
    pub fn fetch_oldest(&self, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        let mut oldest = Vec::with_capacity(limit.min(self.records.len()));
        for entry in self.records.iter() {
            if oldest.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            if let Some(record) = self.decode(&key, &value) {
                oldest.push(record);
            }
        }
        Ok(oldest)
    }

    /// Counts the matching records.
    pub fn count(&self, filter: RecordFilter) -> Result<usize, StoreError> {
        if filter == RecordFilter::All {
            return Ok(self.records.len());
        }
        Ok(self.fetch_all(filter)?.len())
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Decodes a stored row, dropping rows that no longer parse.
    fn decode(&self, key: &IVec, value: &IVec) -> Option<LogRecord> {
        match serde_json::from_slice(value) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("RELAY | Dropping unreadable record: {err}");
                if let Err(err) = self.records.remove(key) {
                    debug!("RELAY | Failed to remove unreadable record: {err}");
                }
                None
            }
        }
    }

    /// Validates existing metadata or writes a new record if none exist.
    fn validate_or_write_metadata(&self) -> Result<MetadataState, StoreError> {
        let tree = self.db.open_tree(META_TREE)?;
        match tree.get(META_KEY)? {
            None => {
                self.write_metadata()?;
                Ok(MetadataState::Written)
            }
            Some(bytes) => match serde_json::from_slice::<Metadata>(&bytes) {
                Ok(metadata)
                    if metadata.schema_version == SCHEMA_VERSION
                        && metadata.identifier == self.identifier =>
                {
                    Ok(MetadataState::Valid)
                }
                _ => Ok(MetadataState::Mismatch),
            },
        }
    }

    fn write_metadata(&self) -> Result<(), StoreError> {
        let metadata = Metadata {
            schema_version: SCHEMA_VERSION,
            identifier: self.identifier.clone(),
            creation_time: OffsetDateTime::now_utc(),
        };
        let tree = self.db.open_tree(META_TREE)?;
        tree.insert(META_KEY, serde_json::to_vec(&metadata)?)?;
        tree.flush()?;
        Ok(())
    }
}

/// Classification of metadata validation outcomes.
#[derive(Debug)]
enum MetadataState {
    Valid,
    Written,
    Mismatch,
}

fn sequence_key(sequence: u64) -> [u8; 8] {
    sequence.to_be_bytes()
}

/// Builds a sled configuration using the provided filesystem path.
fn sled_config(path: &Path) -> SledConfig {
    SledConfig::new()
        .path(path)
        .cache_capacity(16 * 1024 * 1024)
}

/// Deletes the database file or directory to start from a clean slate.
fn reset_path(path: &Path) -> Result<(), StoreError> {
    if path.exists() {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}
