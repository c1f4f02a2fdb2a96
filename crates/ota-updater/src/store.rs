//! Update record store and its persistence.
//!
//! [`RecordStore`] is the in-memory map of records, owned by the controller
//! and only touched under its lock. Durable copies go through a
//! [`RecordPersistence`] backend; the controller never writes from inside the
//! lock but hands snapshots to a background writer that coalesces them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::UpdateError;
use crate::progress::percent;
use crate::record::{restore_status, PersistentStatus, UpdateRecord};

/// Format version written to the store file.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Durable storage for update records.
pub trait RecordPersistence: Send + Sync {
    /// Load every stored record. An absent store is an empty list.
    fn load(&self) -> Result<Vec<UpdateRecord>, UpdateError>;

    /// Replace the stored records with `records`.
    fn save(&self, records: &[UpdateRecord]) -> Result<(), UpdateError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    saved_at: DateTime<Utc>,
    records: Vec<UpdateRecord>,
}

/// Records kept in a single JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordPersistence for JsonFilePersistence {
    fn load(&self) -> Result<Vec<UpdateRecord>, UpdateError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No record store found, starting empty");
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let file: StoreFile = serde_json::from_str(&content).map_err(|e| {
            UpdateError::PersistenceError(format!(
                "corrupt record store {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if file.version > STORE_FORMAT_VERSION {
            return Err(UpdateError::PersistenceError(format!(
                "record store version {} is newer than supported version {}",
                file.version, STORE_FORMAT_VERSION
            )));
        }

        debug!(
            path = %self.path.display(),
            count = file.records.len(),
            saved_at = %file.saved_at,
            "Loaded record store"
        );
        Ok(file.records)
    }

    fn save(&self, records: &[UpdateRecord]) -> Result<(), UpdateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = StoreFile {
            version: STORE_FORMAT_VERSION,
            saved_at: Utc::now(),
            records: records.to_vec(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let tmp = crate::download::part_path(&self.path);
        {
            use std::io::Write;
            let mut out = std::fs::File::create(&tmp)?;
            out.write_all(content.as_bytes())?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), count = records.len(), "Saved record store");
        Ok(())
    }
}

/// Records kept in memory; useful for embedding without a filesystem and
/// for tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<UpdateRecord>>,
    saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<UpdateRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Records as of the last save.
    pub fn stored(&self) -> Vec<UpdateRecord> {
        self.records.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl RecordPersistence for MemoryPersistence {
    fn load(&self) -> Result<Vec<UpdateRecord>, UpdateError> {
        Ok(self.records.lock().clone())
    }

    fn save(&self, records: &[UpdateRecord]) -> Result<(), UpdateError> {
        *self.records.lock() = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory map of update records keyed by `download_id`.
#[derive(Debug, Default, Clone)]
pub struct RecordStore {
    records: HashMap<String, UpdateRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from persisted records, bringing each one back to a
    /// state that is valid after a restart.
    ///
    /// Nothing comes back active: interrupted downloads are paused, an
    /// interrupted install is failed, and the downloaded byte count is
    /// re-read from the file on disk.
    pub fn restore(records: Vec<UpdateRecord>) -> Self {
        let mut store = Self::new();
        for mut record in records {
            reconcile_record(&mut record);
            if store.records.contains_key(&record.download_id) {
                warn!(download_id = %record.download_id, "Duplicate record in store, keeping the last one");
            }
            store.insert(record);
        }
        info!(count = store.len(), "Restored update records");
        store
    }

    pub fn get(&self, download_id: &str) -> Option<&UpdateRecord> {
        self.records.get(download_id)
    }

    pub fn get_mut(&mut self, download_id: &str) -> Option<&mut UpdateRecord> {
        self.records.get_mut(download_id)
    }

    pub fn contains(&self, download_id: &str) -> bool {
        self.records.contains_key(download_id)
    }

    pub fn insert(&mut self, record: UpdateRecord) -> Option<UpdateRecord> {
        self.records.insert(record.download_id.clone(), record)
    }

    pub fn remove(&mut self, download_id: &str) -> Option<UpdateRecord> {
        self.records.remove(download_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut UpdateRecord> {
        self.records.values_mut()
    }

    /// All records ordered by `download_id`.
    pub fn snapshot(&self) -> Vec<UpdateRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.download_id.cmp(&b.download_id));
        records
    }
}

/// Apply [`restore_status`] to one record using what is actually on disk.
fn reconcile_record(record: &mut UpdateRecord) {
    let file_len = record
        .local_file
        .as_deref()
        .and_then(|p| std::fs::metadata(p).ok())
        .filter(|m| m.is_file())
        .map(|m| m.len());

    let before = (record.status, record.persistent_status);
    let (status, persistent) = restore_status(record.status, record.persistent_status, file_len);
    record.status = status;
    record.persistent_status = persistent;

    record.downloaded_bytes = file_len.unwrap_or(0);
    if persistent == PersistentStatus::Unknown && file_len.unwrap_or(0) == 0 {
        record.local_file = None;
    }
    record.progress_percent = percent(record.downloaded_bytes, record.file_size);
    record.eta_seconds = None;
    record.clear_install_progress();

    if before != (status, persistent) {
        info!(
            download_id = %record.download_id,
            from = %before.0,
            to = %status,
            downloaded = record.downloaded_bytes,
            "Reconciled record after restart"
        );
    }
}

enum PersistCommand {
    Save(Vec<UpdateRecord>),
    Flush(oneshot::Sender<Result<(), UpdateError>>),
}

/// Handle to the background writer.
#[derive(Clone)]
pub(crate) struct PersistWriter {
    tx: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistWriter {
    /// Spawn the writer on `runtime`.
    pub(crate) fn spawn(
        persistence: Arc<dyn RecordPersistence>,
        runtime: &tokio::runtime::Handle,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = runtime.spawn(writer_loop(persistence, rx));
        (Self { tx }, task)
    }

    /// Queue a snapshot. Snapshots queued back to back are coalesced.
    pub(crate) fn save(&self, snapshot: Vec<UpdateRecord>) {
        if self.tx.send(PersistCommand::Save(snapshot)).is_err() {
            warn!("Record writer has stopped, snapshot dropped");
        }
    }

    /// Wait until every snapshot queued so far has been written.
    pub(crate) async fn flush(&self) -> Result<(), UpdateError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(PersistCommand::Flush(done_tx))
            .map_err(|_| UpdateError::ShutDown)?;
        done_rx.await.map_err(|_| UpdateError::ShutDown)?
    }
}

async fn writer_loop(
    persistence: Arc<dyn RecordPersistence>,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
) {
    // Error of the most recent save, reported to flushes until a save succeeds
    let mut last_failure: Option<String> = None;

    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut waiters = Vec::new();

        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                PersistCommand::Save(snapshot) => latest = Some(snapshot),
                PersistCommand::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if let Some(snapshot) = latest {
            let persistence = persistence.clone();
            let result = tokio::task::spawn_blocking(move || persistence.save(&snapshot))
                .await
                .unwrap_or_else(|e| {
                    Err(UpdateError::PersistenceError(format!(
                        "record writer task failed: {}",
                        e
                    )))
                });
            last_failure = match result {
                Ok(()) => None,
                Err(e) => {
                    error!(error = %e, "Failed to save update records");
                    Some(e.to_string())
                }
            };
        }

        for done in waiters {
            let reply = match &last_failure {
                Some(message) => Err(UpdateError::PersistenceError(message.clone())),
                None => Ok(()),
            };
            let _ = done.send(reply);
        }
    }
    debug!("Record writer stopped");
}
