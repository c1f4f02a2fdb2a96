//! Installer hand-off.
//!
//! The platform installer applies a verified package. It decides whether the
//! device uses staged (A/B) or legacy recovery updates; the rest of the
//! crate only asks it via [`PlatformInstaller::install_mode`].
//!
//! [`InstallerBridge`] runs one install at a time on a background task and
//! owns its cancellation flag. [`RecoveryStagingInstaller`] is a legacy
//! installer that stages the package for the recovery environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::error::{ActiveRole, UpdateError};
use crate::record::PackageType;
use crate::verify::VerifiedPackage;

/// How the device applies updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    /// Payload streamed into the inactive slot while the system runs
    Staged,
    /// Package handed to the recovery environment on next boot
    Legacy,
}

/// Everything the platform installer needs to apply one package.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub download_id: String,
    pub package: PathBuf,
    pub package_type: PackageType,
    pub verified: VerifiedPackage,
}

/// Install progress as reported to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallProgress {
    pub percent: u8,
    /// No real progress reported by the platform yet
    pub indeterminate: bool,
    /// Last phase: writing boot control or recovery commands
    pub finalizing: bool,
}

impl InstallProgress {
    pub fn indeterminate() -> Self {
        Self {
            percent: 0,
            indeterminate: true,
            finalizing: false,
        }
    }

    pub fn at(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
            indeterminate: false,
            finalizing: false,
        }
    }

    pub fn finalizing(percent: u8) -> Self {
        Self {
            finalizing: true,
            ..Self::at(percent)
        }
    }
}

/// Result of a successful install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    /// The update takes effect only after a reboot
    pub reboot_required: bool,
}

/// Install progress sink.
pub type InstallProgressSink = Arc<dyn Fn(InstallProgress) + Send + Sync>;

/// Platform-specific update installer.
#[async_trait]
pub trait PlatformInstaller: Send + Sync {
    /// Staged (A/B) or legacy recovery updates.
    fn install_mode(&self) -> InstallMode;

    /// Apply a verified package.
    ///
    /// Implementations should poll `cancel` and return
    /// [`UpdateError::Cancelled`] when it is set.
    async fn apply(
        &self,
        request: &InstallRequest,
        progress: &(dyn Fn(InstallProgress) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<InstallOutcome, UpdateError>;
}

struct ActiveInstall {
    download_id: String,
    cancel: Arc<CancelFlag>,
}

/// Runs platform installs one at a time.
pub struct InstallerBridge {
    installer: Arc<dyn PlatformInstaller>,
    active: Arc<Mutex<Option<ActiveInstall>>>,
}

impl InstallerBridge {
    pub fn new(installer: Arc<dyn PlatformInstaller>) -> Self {
        Self {
            installer,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn install_mode(&self) -> InstallMode {
        self.installer.install_mode()
    }

    /// Id of the running install, if any.
    pub fn active(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.download_id.clone())
    }

    /// Start applying `request` on a background task.
    ///
    /// An indeterminate progress report is sent before the platform installer
    /// runs. If the install was cancelled, any error the platform returns is
    /// reported as [`UpdateError::Cancelled`].
    pub fn start(
        &self,
        request: InstallRequest,
        on_progress: InstallProgressSink,
    ) -> Result<JoinHandle<Result<InstallOutcome, UpdateError>>, UpdateError> {
        let cancel = Arc::new(CancelFlag::new());
        {
            let mut active = self.active.lock();
            if let Some(current) = active.as_ref() {
                return Err(UpdateError::ConcurrencyConflict {
                    role: ActiveRole::Install,
                    active: current.download_id.clone(),
                });
            }
            *active = Some(ActiveInstall {
                download_id: request.download_id.clone(),
                cancel: cancel.clone(),
            });
        }

        let installer = self.installer.clone();
        let active = self.active.clone();
        let handle = tokio::spawn(async move {
            info!(download_id = %request.download_id, package = %request.package.display(), "Starting install");
            on_progress(InstallProgress::indeterminate());

            let result = installer
                .apply(&request, on_progress.as_ref(), &cancel)
                .await;
            active.lock().take();

            match result {
                Ok(outcome) => {
                    info!(download_id = %request.download_id, reboot_required = outcome.reboot_required, "Install finished");
                    Ok(outcome)
                }
                Err(e) if cancel.is_cancelled() => {
                    debug!(download_id = %request.download_id, error = %e, "Install cancelled");
                    Err(UpdateError::Cancelled)
                }
                Err(e) => {
                    warn!(download_id = %request.download_id, error = %e, "Install failed");
                    Err(e)
                }
            }
        });
        Ok(handle)
    }

    /// Cancel the running install. Returns `false` when nothing was running
    /// or it was already cancelled.
    pub fn cancel(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(current) => current.cancel.cancel(),
            None => false,
        }
    }
}

/// Read size for staging copies.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Legacy installer that hands the package to the recovery environment.
///
/// The package is copied into `staging_dir`, then a recovery command file
/// pointing at the copy is written. The device applies it on next boot.
#[derive(Debug, Clone)]
pub struct RecoveryStagingInstaller {
    staging_dir: PathBuf,
    command_file: PathBuf,
}

impl RecoveryStagingInstaller {
    pub fn new(staging_dir: impl Into<PathBuf>, command_file: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            command_file: command_file.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn command_file(&self) -> &Path {
        &self.command_file
    }

    async fn copy_with_progress(
        &self,
        src: &Path,
        dest: &Path,
        progress: &(dyn Fn(InstallProgress) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<(), UpdateError> {
        let total = tokio::fs::metadata(src).await?.len();
        let mut reader = tokio::fs::File::open(src).await?;
        let mut writer = tokio::fs::File::create(dest).await?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        let mut last_percent = None;

        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            copied += n as u64;

            // Copying is the bulk of the work; keep the last 10% for finalizing
            let percent = (crate::progress::percent(copied, total) as u32 * 90 / 100) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                progress(InstallProgress::at(percent));
            }
        }

        writer.flush().await?;
        writer.sync_all().await?;
        Ok(())
    }

    async fn write_command(&self, staged: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = self.command_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = crate::download::part_path(&self.command_file);
        let command = format!("--update_package={}\n", staged.display());
        tokio::fs::write(&tmp, command).await?;
        tokio::fs::rename(&tmp, &self.command_file).await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformInstaller for RecoveryStagingInstaller {
    fn install_mode(&self) -> InstallMode {
        InstallMode::Legacy
    }

    async fn apply(
        &self,
        request: &InstallRequest,
        progress: &(dyn Fn(InstallProgress) + Send + Sync),
        cancel: &CancelFlag,
    ) -> Result<InstallOutcome, UpdateError> {
        let file_name = request.package.file_name().ok_or_else(|| {
            UpdateError::InstallationFailed(format!(
                "package path has no file name: {}",
                request.package.display()
            ))
        })?;
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| {
                UpdateError::InstallationFailed(format!("Failed to create staging dir: {}", e))
            })?;
        let staged = self.staging_dir.join(file_name);

        if let Err(e) = self
            .copy_with_progress(&request.package, &staged, progress, cancel)
            .await
        {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(match e {
                UpdateError::Cancelled => UpdateError::Cancelled,
                other => UpdateError::InstallationFailed(format!("Failed to stage package: {}", other)),
            });
        }

        if cancel.is_cancelled() {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(UpdateError::Cancelled);
        }

        progress(InstallProgress::finalizing(90));
        self.write_command(&staged).await.map_err(|e| {
            UpdateError::InstallationFailed(format!("Failed to write recovery command: {}", e))
        })?;
        progress(InstallProgress::finalizing(100));

        info!(staged = %staged.display(), "Package staged for recovery");
        Ok(InstallOutcome {
            reboot_required: true,
        })
    }
}
