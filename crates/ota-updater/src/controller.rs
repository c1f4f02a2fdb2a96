//! Update lifecycle controller - orchestrates download, verification and install.
//!
//! The [`UpdateController`] combines all update components:
//! - [`RecordStore`] holding every known update, persisted in the background
//! - [`Downloader`] for resumable package downloads
//! - [`PackageVerifier`] for size, digest and archive checks
//! - [`InstallerBridge`] for handing verified packages to the platform
//!
//! All public operations return immediately; long work runs on tokio tasks
//! and is reported through [`UpdateEvent`]s. One lock guards the store and
//! the download/install slots, so "is anything else running?" and "claim
//! the slot" happen atomically.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelFlag;
use crate::config::{StalePolicy, UpdaterConfig};
use crate::download::{DownloadFailure, DownloadRequest, Downloader};
use crate::error::{ActiveRole, UpdateError, VerifyFailure};
use crate::events::{EventBus, UpdateEvent};
use crate::install::{
    InstallOutcome, InstallProgress, InstallProgressSink, InstallRequest, InstallerBridge,
    PlatformInstaller,
};
use crate::lifecycle::{next_status, LifecycleEvent};
use crate::policy::{evaluate_eligibility, merged_listing};
use crate::progress::{percent, DownloadProgress};
use crate::record::{
    Eligibility, FeedEntry, PackageType, PersistentStatus, UpdateRecord, UpdateStatus,
};
use crate::store::{JsonFilePersistence, PersistWriter, RecordPersistence, RecordStore};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::verify::{PackageVerifier, VerifiedPackage};

/// How long `shutdown` waits for background work to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct ActiveDownload {
    download_id: String,
    /// Distinguishes this run from earlier runs of the same record
    session: u64,
    cancel: Arc<CancelFlag>,
}

struct ActiveInstall {
    download_id: String,
    cancel: Arc<CancelFlag>,
}

#[derive(Default)]
struct ControllerState {
    store: RecordStore,
    active_download: Option<ActiveDownload>,
    active_install: Option<ActiveInstall>,
    verifying: Option<String>,
    next_session: u64,
}

impl ControllerState {
    fn owns_download(&self, download_id: &str, session: u64) -> bool {
        self.active_download
            .as_ref()
            .is_some_and(|a| a.download_id == download_id && a.session == session)
    }

    fn owns_install(&self, download_id: &str) -> bool {
        self.active_install
            .as_ref()
            .is_some_and(|a| a.download_id == download_id)
    }
}

struct VerifyJob {
    download_id: String,
    path: PathBuf,
    expected_size: u64,
    expected_sha256: String,
}

struct Inner {
    config: UpdaterConfig,
    state: Mutex<ControllerState>,
    downloader: Downloader,
    verifier: PackageVerifier,
    installer: InstallerBridge,
    events: EventBus,
    writer: PersistWriter,
    /// Serializes writers of one record's payload file
    file_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    runtime: tokio::runtime::Handle,
    shut_down: AtomicBool,
}

/// Handle to the update lifecycle controller.
///
/// Cheap to clone; all clones share one controller.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use ota_updater::{RecoveryStagingInstaller, UpdateController, UpdaterConfig};
///
/// let config = UpdaterConfig::load_from_file(path)?;
/// let installer = Arc::new(RecoveryStagingInstaller::new("/cache/recovery", "/cache/recovery/command"));
/// let controller = UpdateController::open_with_defaults(config, installer)?;
///
/// if controller.merge_feed(&entries)? {
///     controller.start_download(&entries[0].download_id)?;
/// }
/// ```
#[derive(Clone)]
pub struct UpdateController {
    inner: Arc<Inner>,
}

impl UpdateController {
    /// Open the controller.
    ///
    /// Loads persisted records, reconciles them with the files on disk,
    /// recomputes eligibility against the running build and starts the
    /// background record writer. Updates waiting for a reboot that the
    /// running build already includes become INSTALLED, and with
    /// `feed.auto_delete_installed` their package files are removed.
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid or no runtime is available
    /// - The download directory cannot be created
    /// - The record store cannot be loaded
    pub fn open(
        config: UpdaterConfig,
        transport: Arc<dyn HttpTransport>,
        installer: Arc<dyn PlatformInstaller>,
        persistence: Arc<dyn RecordPersistence>,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            UpdateError::ConfigError(
                "update controller must be opened inside a tokio runtime".to_string(),
            )
        })?;
        std::fs::create_dir_all(&config.download_dir)?;

        let mut store = RecordStore::restore(persistence.load()?);
        let mut installed_packages = Vec::new();
        for record in store.iter_mut() {
            record.eligibility = evaluate_eligibility(record, &config.build);

            // The running build already contains this update
            if record.timestamp > config.build.timestamp {
                continue;
            }
            if record.status == UpdateStatus::WaitingForReboot {
                advance(record, LifecycleEvent::RebootCompleted);
            }
            if config.feed.auto_delete_installed && record.status == UpdateStatus::Installed {
                if let Some(path) = record.local_file.take() {
                    info!(download_id = %record.download_id, "Removing installed package");
                    record.persistent_status = PersistentStatus::Unknown;
                    record.clear_progress();
                    installed_packages.push((record.download_id.clone(), path));
                }
            }
        }

        let (writer, _writer_task) = PersistWriter::spawn(persistence, &runtime);
        writer.save(store.snapshot());

        let installer = InstallerBridge::new(installer);
        info!(
            records = store.len(),
            download_dir = %config.download_dir.display(),
            install_mode = ?installer.install_mode(),
            "Update controller opened"
        );

        let inner = Inner {
            downloader: Downloader::new(transport, config.download.clone()),
            verifier: PackageVerifier::new(),
            installer,
            events: EventBus::new(config.event_capacity),
            writer,
            state: Mutex::new(ControllerState {
                store,
                ..ControllerState::default()
            }),
            file_guards: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            runtime,
            shut_down: AtomicBool::new(false),
            config,
        };
        let inner = Arc::new(inner);
        for (download_id, path) in installed_packages {
            inner.remove_payload(&download_id, path);
        }
        Ok(Self { inner })
    }

    /// Open with the `reqwest` transport and the JSON record file from
    /// `config.state_file`.
    pub fn open_with_defaults(
        config: UpdaterConfig,
        installer: Arc<dyn PlatformInstaller>,
    ) -> Result<Self, UpdateError> {
        let transport = Arc::new(ReqwestTransport::new(&config.network)?);
        let persistence = Arc::new(JsonFilePersistence::new(config.state_file.clone()));
        Self::open(config, transport, installer, persistence)
    }

    /// Get the configuration.
    pub fn config(&self) -> &UpdaterConfig {
        &self.inner.config
    }

    /// Receive change notifications. Re-read state after subscribing; events
    /// sent before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.inner.events.subscribe()
    }

    /// Merge one feed fetch into the store.
    ///
    /// Unseen ids become new records; known ids get their metadata refreshed
    /// and keep their lifecycle state. Records missing from `entries` are
    /// flagged as no longer available online, or dropped when the stale
    /// policy allows it. Returns `true` when at least one new installable
    /// update appeared.
    pub fn merge_feed(&self, entries: &[FeedEntry]) -> Result<bool, UpdateError> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let mut events = Vec::new();
        let mut new_installable = false;
        {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let mut changed = false;
            let mut seen = HashSet::new();

            for entry in entries {
                seen.insert(entry.download_id.as_str());
                match state.store.get_mut(&entry.download_id) {
                    Some(record) => {
                        let mut record_changed = record.apply_feed(entry);
                        if !record.available_online {
                            record.available_online = true;
                            record_changed = true;
                        }
                        let eligibility = evaluate_eligibility(record, &inner.config.build);
                        if record.eligibility != eligibility {
                            record.eligibility = eligibility;
                            record_changed = true;
                        }
                        if record_changed {
                            changed = true;
                            events.push(UpdateEvent::StatusChanged(record.download_id.clone()));
                        }
                    }
                    None => {
                        let mut record = UpdateRecord::from_feed(entry);
                        record.eligibility = evaluate_eligibility(&record, &inner.config.build);
                        match &record.eligibility {
                            Eligibility::Installable => new_installable = true,
                            Eligibility::InfoOnly(reason) => debug!(
                                download_id = %record.download_id,
                                %reason,
                                "New update is info-only on this build"
                            ),
                        }
                        info!(
                            download_id = %record.download_id,
                            version_name = %record.version_name,
                            timestamp = record.timestamp,
                            "New update discovered"
                        );
                        events.push(UpdateEvent::StatusChanged(record.download_id.clone()));
                        state.store.insert(record);
                        changed = true;
                    }
                }
            }

            let stale: Vec<String> = state
                .store
                .iter()
                .filter(|r| !seen.contains(r.download_id.as_str()))
                .map(|r| r.download_id.clone())
                .collect();
            for id in stale {
                let disposable = inner.config.feed.stale_policy == StalePolicy::RemoveIdle
                    && state.store.get(&id).is_some_and(is_disposable);
                if disposable {
                    state.store.remove(&id);
                    debug!(download_id = %id, "Dropped update no longer in feed");
                    events.push(UpdateEvent::RecordRemoved(id));
                    changed = true;
                } else if let Some(record) = state.store.get_mut(&id) {
                    if record.available_online {
                        record.available_online = false;
                        changed = true;
                        events.push(UpdateEvent::StatusChanged(id));
                    }
                }
            }

            if changed {
                inner.persist(state);
            }
        }

        inner.emit(events);
        Ok(new_installable)
    }

    /// Start downloading an update, or resume it if it is paused.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::ConcurrencyConflict`] if another update is downloading
    /// - [`UpdateError::InvalidState`] if the record cannot start a download
    pub fn start_download(&self, download_id: &str) -> Result<(), UpdateError> {
        self.begin_download(download_id, false)
    }

    /// Resume a paused download from the bytes already on disk.
    pub fn resume_download(&self, download_id: &str) -> Result<(), UpdateError> {
        self.begin_download(download_id, true)
    }

    fn begin_download(&self, download_id: &str, resume_only: bool) -> Result<(), UpdateError> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let (request, session, fresh, cancel) = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;

            let record = state
                .store
                .get_mut(download_id)
                .ok_or_else(|| UpdateError::NotFound(download_id.to_string()))?;
            if let Some(active) = &state.active_download {
                if active.download_id != download_id {
                    return Err(UpdateError::ConcurrencyConflict {
                        role: ActiveRole::Download,
                        active: active.download_id.clone(),
                    });
                }
            }

            let paused = matches!(
                record.status,
                UpdateStatus::Paused | UpdateStatus::PausedError
            );
            if resume_only && !paused {
                return Err(invalid_state(record, "resume"));
            }
            if record.download_url.trim().is_empty() {
                return Err(UpdateError::NotInstallable(download_id.to_string()));
            }
            require(record, LifecycleEvent::StartDownload)?;

            let fresh = !paused;
            if fresh {
                record.clear_progress();
            }
            let path = inner.config.download_dir.join(local_file_name(record));
            record.local_file = Some(path.clone());
            record.persistent_status = PersistentStatus::Incomplete;
            record.eta_seconds = None;

            let request = DownloadRequest {
                url: record.download_url.clone(),
                dest: path,
                expected_size: record.file_size,
            };
            info!(
                download_id,
                resume = !fresh,
                offset = record.downloaded_bytes,
                "Download requested"
            );

            let session = state.next_session;
            state.next_session += 1;
            let cancel = Arc::new(CancelFlag::new());
            state.active_download = Some(ActiveDownload {
                download_id: download_id.to_string(),
                session,
                cancel: cancel.clone(),
            });
            inner.persist(state);
            (request, session, fresh, cancel)
        };

        inner.emit(vec![UpdateEvent::StatusChanged(download_id.to_string())]);

        let task = inner.clone();
        let id = download_id.to_string();
        inner.spawn(async move {
            task.run_download(id, session, request, fresh, cancel).await;
        });
        Ok(())
    }

    /// Pause the running download. Bytes already written are kept.
    pub fn pause_download(&self, download_id: &str) -> Result<(), UpdateError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let record = state
                .store
                .get_mut(download_id)
                .ok_or_else(|| UpdateError::NotFound(download_id.to_string()))?;

            let owns = state
                .active_download
                .as_ref()
                .is_some_and(|a| a.download_id == download_id);
            if !owns {
                return Err(invalid_state(record, "pause"));
            }
            require(record, LifecycleEvent::PauseRequested)?;
            record.eta_seconds = None;
            if let Some(active) = state.active_download.take() {
                active.cancel.cancel();
            }
            info!(download_id, downloaded = record.downloaded_bytes, "Download paused");
            inner.persist(state);
        }
        inner.emit(vec![UpdateEvent::StatusChanged(download_id.to_string())]);
        Ok(())
    }

    /// Delete an update's local file and reset it.
    ///
    /// Any download, verification or install of the record is stopped. The
    /// record goes back to UNKNOWN, or disappears entirely when the feed no
    /// longer lists it.
    pub fn delete_update(&self, download_id: &str) -> Result<(), UpdateError> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let (file, removed, cancel_install) = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            if !state.store.contains(download_id) {
                return Err(UpdateError::NotFound(download_id.to_string()));
            }

            if state
                .active_download
                .as_ref()
                .is_some_and(|a| a.download_id == download_id)
            {
                if let Some(active) = state.active_download.take() {
                    active.cancel.cancel();
                }
            }
            if state.verifying.as_deref() == Some(download_id) {
                state.verifying = None;
            }
            // The install slot stays claimed until the platform installer
            // returns; finish_install releases it
            let cancel_install = match &state.active_install {
                Some(active) if active.download_id == download_id => {
                    active.cancel.cancel();
                    true
                }
                _ => false,
            };

            let Some(record) = state.store.get_mut(download_id) else {
                return Err(UpdateError::NotFound(download_id.to_string()));
            };
            require(record, LifecycleEvent::Deleted)?;
            let file = record.local_file.take();
            record.clear_progress();
            record.persistent_status = PersistentStatus::Unknown;
            let removed = !record.available_online;
            if removed {
                state.store.remove(download_id);
            }
            info!(download_id, removed, "Update deleted");
            inner.persist(state);
            (file, removed, cancel_install)
        };

        if cancel_install {
            inner.installer.cancel();
        }
        if let Some(file) = file {
            inner.remove_payload(download_id, file);
        }
        let event = if removed {
            UpdateEvent::RecordRemoved(download_id.to_string())
        } else {
            UpdateEvent::StatusChanged(download_id.to_string())
        };
        inner.emit(vec![event]);
        Ok(())
    }

    /// Hand a verified update to the platform installer.
    ///
    /// # Errors
    ///
    /// - [`UpdateError::NotInstallable`] if the update is info-only on this build
    /// - [`UpdateError::ConcurrencyConflict`] if another update is installing
    /// - [`UpdateError::InvalidState`] unless the update is VERIFIED (or a
    ///   failed install is being retried)
    pub fn start_install(&self, download_id: &str) -> Result<(), UpdateError> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let (package, package_type, cancel) = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            let record = state
                .store
                .get_mut(download_id)
                .ok_or_else(|| UpdateError::NotFound(download_id.to_string()))?;

            if let Some(active) = &state.active_install {
                if active.download_id != download_id {
                    return Err(UpdateError::ConcurrencyConflict {
                        role: ActiveRole::Install,
                        active: active.download_id.clone(),
                    });
                }
                return Err(invalid_state(record, "install"));
            }
            if !record.eligibility.is_installable() {
                return Err(UpdateError::NotInstallable(download_id.to_string()));
            }
            let package = match (&record.local_file, record.persistent_status) {
                (Some(path), PersistentStatus::Verified) => path.clone(),
                _ => return Err(invalid_state(record, "install")),
            };
            require(record, LifecycleEvent::InstallRequested)?;
            record.clear_install_progress();
            record.install_indeterminate = true;
            let package_type = record.package_type;

            let cancel = Arc::new(CancelFlag::new());
            state.active_install = Some(ActiveInstall {
                download_id: download_id.to_string(),
                cancel: cancel.clone(),
            });
            info!(download_id, package = %package.display(), "Install requested");
            inner.persist(state);
            (package, package_type, cancel)
        };

        inner.emit(vec![UpdateEvent::StatusChanged(download_id.to_string())]);

        let task = inner.clone();
        let id = download_id.to_string();
        inner.spawn(async move {
            let result = task.install(&id, package, package_type, &cancel).await;
            task.finish_install(&id, result);
        });
        Ok(())
    }

    /// Cancel the running install. Returns `false` if there was nothing to
    /// cancel; calling it twice is harmless.
    pub fn cancel_install(&self) -> bool {
        let inner = &self.inner;
        let cancelled = {
            let state = inner.state.lock();
            match &state.active_install {
                Some(active) => {
                    info!(download_id = %active.download_id, "Install cancellation requested");
                    active.cancel.cancel()
                }
                None => false,
            }
        };
        if cancelled {
            inner.installer.cancel();
        }
        cancelled
    }

    /// Current state of one record, exactly as stored.
    pub fn get_update(&self, download_id: &str) -> Option<UpdateRecord> {
        self.inner.state.lock().store.get(download_id).cloned()
    }

    /// User-facing listing: newest first, changelogs of pending updates
    /// folded into the newest one per device.
    pub fn get_updates(&self) -> Vec<UpdateRecord> {
        let snapshot = self.inner.state.lock().store.snapshot();
        merged_listing(
            snapshot,
            self.inner.config.build.timestamp,
            self.inner.config.feed.changelog_order,
        )
    }

    pub fn is_download_active(&self) -> bool {
        self.inner.state.lock().active_download.is_some()
    }

    pub fn is_install_active(&self) -> bool {
        self.inner.state.lock().active_install.is_some()
    }

    pub fn is_verifying(&self) -> bool {
        self.inner.state.lock().verifying.is_some()
    }

    /// Any download, verification or install in flight.
    pub fn is_busy(&self) -> bool {
        let state = self.inner.state.lock();
        state.active_download.is_some()
            || state.active_install.is_some()
            || state.verifying.is_some()
    }

    /// Remove files in the download directory that no record points at,
    /// including `.part` leftovers. Returns how many were removed.
    pub async fn cleanup_download_dir(&self) -> Result<usize, UpdateError> {
        let inner = &self.inner;
        inner.ensure_open()?;

        let dir = &inner.config.download_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if inner.is_referenced(&path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed orphaned download");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(removed, dir = %dir.display(), "Cleaned download directory");
        Ok(removed)
    }

    /// Wait until every state change so far is written to the record store.
    pub async fn flush(&self) -> Result<(), UpdateError> {
        self.inner.writer.flush().await
    }

    /// Stop the controller.
    ///
    /// A running download is paused and a running install is cancelled.
    /// Waits briefly for background work, then flushes the record store.
    /// Later operations fail with [`UpdateError::ShutDown`].
    pub async fn shutdown(&self) -> Result<(), UpdateError> {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut events = Vec::new();
        let cancel_install = {
            let mut guard = inner.state.lock();
            let state = &mut *guard;
            if let Some(active) = state.active_download.take() {
                active.cancel.cancel();
                if let Some(record) = state.store.get_mut(&active.download_id) {
                    if advance(record, LifecycleEvent::PauseRequested) {
                        record.eta_seconds = None;
                        events.push(UpdateEvent::StatusChanged(active.download_id.clone()));
                    }
                }
            }
            let cancel_install = state
                .active_install
                .as_ref()
                .map(|a| a.cancel.cancel())
                .is_some();
            inner.persist(state);
            cancel_install
        };
        if cancel_install {
            inner.installer.cancel();
        }
        inner.emit(events);

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        let pending = futures_util::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, pending).await.is_err() {
            warn!("Background update work still running after shutdown grace period");
        }

        inner.writer.flush().await?;
        info!("Update controller shut down");
        Ok(())
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<(), UpdateError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(UpdateError::ShutDown);
        }
        Ok(())
    }

    fn persist(&self, state: &ControllerState) {
        self.writer.save(state.store.snapshot());
    }

    fn emit(&self, events: Vec<UpdateEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn file_guard(&self, download_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.file_guards
            .lock()
            .entry(download_id.to_string())
            .or_default()
            .clone()
    }

    fn is_referenced(&self, path: &Path) -> bool {
        self.state
            .lock()
            .store
            .iter()
            .any(|r| r.local_file.as_deref() == Some(path))
    }

    // ---- download -------------------------------------------------------

    async fn run_download(
        self: Arc<Self>,
        download_id: String,
        session: u64,
        request: DownloadRequest,
        fresh: bool,
        cancel: Arc<CancelFlag>,
    ) {
        // Wait for an earlier writer of the same file to flush and exit
        let _held = self.file_guard(&download_id).lock_owned().await;

        if fresh {
            if let Err(e) = remove_if_exists(&request.dest).await {
                let failure = DownloadFailure {
                    cancelled: false,
                    downloaded: 0,
                    error: e.into(),
                };
                self.finish_download(&download_id, session, Err(failure));
                return;
            }
        }

        let on_progress = {
            let inner = self.clone();
            let id = download_id.clone();
            move |progress: DownloadProgress| inner.on_download_progress(&id, session, progress)
        };
        let result = self
            .downloader
            .download(&request, &cancel, &on_progress)
            .await;
        self.finish_download(&download_id, session, result);
    }

    fn on_download_progress(&self, download_id: &str, session: u64, progress: DownloadProgress) {
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.owns_download(download_id, session) {
                return;
            }
            let Some(record) = state.store.get_mut(download_id) else {
                return;
            };

            let connected = record.status == UpdateStatus::Starting
                && advance(record, LifecycleEvent::DownloadConnected);
            record.downloaded_bytes = progress.downloaded;
            record.progress_percent = progress.percent();
            record.eta_seconds = progress.eta_seconds;
            debug!(download_id, %progress, "Download progress");

            if connected {
                events.push(UpdateEvent::StatusChanged(download_id.to_string()));
                self.persist(state);
            }
            events.push(UpdateEvent::DownloadProgress(download_id.to_string()));
        }
        self.emit(events);
    }

    fn finish_download(
        self: &Arc<Self>,
        download_id: &str,
        session: u64,
        result: Result<u64, DownloadFailure>,
    ) {
        let mut events = Vec::new();
        let mut verify = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let downloaded = match &result {
                Ok(n) => *n,
                Err(failure) => failure.downloaded,
            };

            if !state.owns_download(download_id, session) {
                // Paused or deleted while the writer was still running
                if let Some(record) = state.store.get_mut(download_id) {
                    if matches!(
                        record.status,
                        UpdateStatus::Paused | UpdateStatus::PausedError
                    ) && record.local_file.is_some()
                    {
                        record.downloaded_bytes = downloaded;
                        record.progress_percent = percent(downloaded, record.file_size);
                        events.push(UpdateEvent::DownloadProgress(download_id.to_string()));
                    }
                }
            } else {
                state.active_download = None;
                if let Some(record) = state.store.get_mut(download_id) {
                    record.downloaded_bytes = downloaded;
                    record.progress_percent = percent(downloaded, record.file_size);
                    record.eta_seconds = None;

                    match result {
                        Ok(_) if downloaded >= record.file_size => {
                            if record.status == UpdateStatus::Starting {
                                advance(record, LifecycleEvent::DownloadConnected);
                            }
                            let path = record.local_file.clone();
                            match path {
                                Some(path) => {
                                    if advance(record, LifecycleEvent::DownloadCompleted) {
                                        info!(download_id, downloaded, "Download complete, verifying");
                                        state.verifying = Some(download_id.to_string());
                                        verify = Some(VerifyJob {
                                            download_id: download_id.to_string(),
                                            path,
                                            expected_size: record.file_size,
                                            expected_sha256: record.expected_sha256().to_string(),
                                        });
                                    }
                                }
                                None => {
                                    advance(record, LifecycleEvent::TransportFailed);
                                }
                            }
                        }
                        Ok(_) => {
                            warn!(
                                download_id,
                                downloaded,
                                expected = record.file_size,
                                "Download ended short of the declared size"
                            );
                            advance(record, LifecycleEvent::TransportFailed);
                        }
                        Err(failure) if failure.cancelled => {
                            advance(record, LifecycleEvent::PauseRequested);
                        }
                        Err(failure) => {
                            warn!(download_id, downloaded, error = %failure.error, "Download failed");
                            advance(record, LifecycleEvent::TransportFailed);
                        }
                    }
                    events.push(UpdateEvent::StatusChanged(download_id.to_string()));
                }
                self.persist(state);
            }
        }
        self.emit(events);

        if let Some(job) = verify {
            let inner = self.clone();
            self.spawn(async move { inner.run_verify(job).await });
        }
    }

    // ---- verification ---------------------------------------------------

    async fn run_verify(self: Arc<Self>, job: VerifyJob) {
        let result = {
            // No writer may touch the file while it is checked or removed
            let _held = self.file_guard(&job.download_id).lock_owned().await;

            let verifier = self.verifier.clone();
            let mode = self.installer.install_mode();
            let (path, size, sha) = (
                job.path.clone(),
                job.expected_size,
                job.expected_sha256.clone(),
            );
            let result =
                tokio::task::spawn_blocking(move || verifier.verify(&path, size, &sha, mode))
                    .await
                    .unwrap_or_else(|e| {
                        Err(VerifyFailure::NotAnArchive(format!(
                            "verifier task failed: {}",
                            e
                        )))
                    });
            if let Err(failure) = &result {
                error!(
                    download_id = %job.download_id,
                    reason = ?failure.reason(),
                    error = %failure,
                    "Package verification failed"
                );
                remove_file_logged(&job.path).await;
            }
            result
        };

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.verifying.as_deref() != Some(job.download_id.as_str()) {
                debug!(download_id = %job.download_id, "Verification result discarded");
                return;
            }
            state.verifying = None;

            if let Some(record) = state.store.get_mut(&job.download_id) {
                match result {
                    Ok(_) => {
                        if advance(record, LifecycleEvent::VerificationPassed) {
                            record.persistent_status = PersistentStatus::Verified;
                            record.progress_percent = 100;
                        }
                    }
                    Err(_) => {
                        if advance(record, LifecycleEvent::VerificationFailed) {
                            record.local_file = None;
                            record.persistent_status = PersistentStatus::Unknown;
                            record.clear_progress();
                        }
                    }
                }
                self.persist(state);
            }
        }

        self.emit(vec![UpdateEvent::StatusChanged(job.download_id)]);
    }

    // ---- install ---------------------------------------------------------

    async fn install(
        self: &Arc<Self>,
        download_id: &str,
        package: PathBuf,
        package_type: PackageType,
        cancel: &CancelFlag,
    ) -> Result<InstallOutcome, UpdateError> {
        // Re-read the archive layout; the file may have changed since verification
        let mode = self.installer.install_mode();
        let verifier = self.verifier.clone();
        let path = package.clone();
        let payload = tokio::task::spawn_blocking(move || verifier.check_structure(&path, mode))
            .await
            .map_err(|e| UpdateError::InstallationFailed(format!("package check failed: {}", e)))?
            .map_err(|e| UpdateError::InstallationFailed(format!("package no longer valid: {}", e)))?;

        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }

        let request = InstallRequest {
            download_id: download_id.to_string(),
            package,
            package_type,
            verified: VerifiedPackage { mode, payload },
        };
        let sink: InstallProgressSink = {
            let inner = self.clone();
            let id = download_id.to_string();
            Arc::new(move |progress: InstallProgress| inner.on_install_progress(&id, progress))
        };

        let handle = self.installer.start(request, sink)?;
        // Cancellation that raced with the bridge taking over
        if cancel.is_cancelled() {
            self.installer.cancel();
        }
        handle
            .await
            .map_err(|e| UpdateError::InstallationFailed(format!("install task failed: {}", e)))?
    }

    fn on_install_progress(&self, download_id: &str, progress: InstallProgress) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.owns_install(download_id) {
                return;
            }
            let Some(record) = state.store.get_mut(download_id) else {
                return;
            };
            if record.status != UpdateStatus::Installing {
                return;
            }
            let unchanged = record.install_progress_percent == progress.percent
                && record.install_indeterminate == progress.indeterminate
                && record.finalizing == progress.finalizing;
            if unchanged {
                return;
            }
            record.install_progress_percent = progress.percent;
            record.install_indeterminate = progress.indeterminate;
            record.finalizing = progress.finalizing;
        }
        self.events
            .publish(UpdateEvent::InstallProgress(download_id.to_string()));
    }

    fn finish_install(&self, download_id: &str, result: Result<InstallOutcome, UpdateError>) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.owns_install(download_id) {
                debug!(download_id, "Install result discarded");
                return;
            }
            state.active_install = None;

            let Some(record) = state.store.get_mut(download_id) else {
                return;
            };
            if record.status != UpdateStatus::Installing {
                return;
            }

            match result {
                Ok(outcome) => {
                    let event = if outcome.reboot_required {
                        LifecycleEvent::InstalledPendingReboot
                    } else {
                        LifecycleEvent::Installed
                    };
                    advance(record, event);
                    record.clear_install_progress();
                    record.install_progress_percent = 100;
                }
                Err(UpdateError::Cancelled) => {
                    advance(record, LifecycleEvent::InstallCancelled);
                    record.clear_install_progress();
                }
                Err(e) => {
                    error!(download_id, error = %e, "Installation failed");
                    advance(record, LifecycleEvent::InstallFailed);
                    record.clear_install_progress();
                }
            }
            self.persist(state);
        }
        self.emit(vec![UpdateEvent::StatusChanged(download_id.to_string())]);
    }

    // ---- file removal ----------------------------------------------------

    /// Remove a payload in the background once no writer holds it.
    fn remove_payload(self: &Arc<Self>, download_id: &str, path: PathBuf) {
        let guard = self.file_guard(download_id);
        let inner = self.clone();
        self.spawn(async move {
            let _held = guard.lock_owned().await;
            // A new download of the same record may have claimed the path
            if !inner.is_referenced(&path) {
                remove_file_logged(&path).await;
            }
        });
    }
}

/// Apply a lifecycle event raised by the controller itself.
///
/// Background callbacks can race with caller operations, so a disallowed
/// event is logged and dropped.
fn advance(record: &mut UpdateRecord, event: LifecycleEvent) -> bool {
    match next_status(record.status, event) {
        Some(to) => {
            info!(
                download_id = %record.download_id,
                from = %record.status,
                to = %to,
                ?event,
                "Update status changed"
            );
            record.status = to;
            true
        }
        None => {
            warn!(
                download_id = %record.download_id,
                status = %record.status,
                ?event,
                "Ignoring lifecycle event not allowed in current state"
            );
            false
        }
    }
}

/// Apply a caller-requested lifecycle event or explain why it is not allowed.
fn require(record: &mut UpdateRecord, event: LifecycleEvent) -> Result<(), UpdateError> {
    if next_status(record.status, event).is_none() {
        return Err(invalid_state(record, event.action()));
    }
    advance(record, event);
    Ok(())
}

fn invalid_state(record: &UpdateRecord, action: &'static str) -> UpdateError {
    UpdateError::InvalidState {
        download_id: record.download_id.clone(),
        action,
        status: record.status,
    }
}

/// Records that can be dropped without losing anything.
fn is_disposable(record: &UpdateRecord) -> bool {
    record.local_file.is_none()
        && record.status.is_idle()
        && record.persistent_status == PersistentStatus::Unknown
}

/// File name for a record's payload, confined to the download directory.
fn local_file_name(record: &UpdateRecord) -> String {
    Path::new(&record.file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}.zip", record.download_id))
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_file_logged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed update package"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove update package"),
    }
}
