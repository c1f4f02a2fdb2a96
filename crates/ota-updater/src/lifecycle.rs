//! Lifecycle transition table.
//!
//! Every status change the controller makes goes through [`next_status`], so
//! the allowed transitions live in one `match` instead of being spread over
//! the controller's callbacks.

use crate::record::UpdateStatus;

/// Events that move a record through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Caller asked to start or resume a download.
    StartDownload,
    /// The transport answered and bytes are flowing.
    DownloadConnected,
    /// Caller paused the download.
    PauseRequested,
    /// Network or IO failure while downloading.
    TransportFailed,
    /// Byte count reached the declared size.
    DownloadCompleted,
    VerificationPassed,
    VerificationFailed,
    InstallRequested,
    InstallFailed,
    /// Caller cancelled a running install.
    InstallCancelled,
    /// Install finished and needs a reboot to take effect.
    InstalledPendingReboot,
    Installed,
    /// The device booted into the installed build.
    RebootCompleted,
    /// Caller deleted the update.
    Deleted,
}

impl LifecycleEvent {
    /// Verb used in error messages for caller-initiated events.
    pub fn action(self) -> &'static str {
        match self {
            LifecycleEvent::StartDownload => "download",
            LifecycleEvent::PauseRequested => "pause",
            LifecycleEvent::InstallRequested => "install",
            LifecycleEvent::InstallCancelled => "cancel install of",
            LifecycleEvent::Deleted => "delete",
            _ => "update",
        }
    }
}

/// Status reached from `from` on `event`, or `None` if the event is not
/// allowed in that state.
pub fn next_status(from: UpdateStatus, event: LifecycleEvent) -> Option<UpdateStatus> {
    use LifecycleEvent as E;
    use UpdateStatus as S;

    let to = match (from, event) {
        (
            S::Unknown | S::Paused | S::PausedError | S::VerificationFailed,
            E::StartDownload,
        ) => S::Starting,
        (S::Starting | S::Downloading, E::DownloadConnected) => S::Downloading,
        (S::Starting | S::Downloading, E::PauseRequested) => S::Paused,
        (S::Starting | S::Downloading, E::TransportFailed) => S::PausedError,
        (S::Starting | S::Downloading, E::DownloadCompleted) => S::Verifying,

        (S::Verifying, E::VerificationPassed) => S::Verified,
        (S::Verifying, E::VerificationFailed) => S::VerificationFailed,

        (S::Verified | S::InstallationFailed, E::InstallRequested) => S::Installing,
        (S::Installing, E::InstallFailed) => S::InstallationFailed,
        (S::Installing, E::InstallCancelled) => S::Verified,
        (S::Installing, E::InstalledPendingReboot) => S::WaitingForReboot,
        (S::Installing, E::Installed) => S::Installed,
        (S::WaitingForReboot, E::RebootCompleted) => S::Installed,

        (_, E::Deleted) => S::Unknown,
        _ => return None,
    };
    Some(to)
}
