//! # ota-updater
//!
//! Lifecycle controller for over-the-air system updates.
//!
//! This crate handles:
//! - Merging update feed entries into a persistent record store
//! - Eligibility of each update against the running build
//! - Resumable, cancellable package download with progress and ETA
//! - Size, SHA-256 and archive structure verification
//! - Hand-off of verified packages to a platform installer
//! - Change notifications for any number of observers
//!
//! ## Lifecycle
//!
//! Every update moves through a fixed state machine (see [`lifecycle`]).
//! At most one download and one install run at a time, and nothing is
//! installed before it has been verified. State survives restarts: on
//! open, interrupted work comes back paused or failed, never running.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod download;
pub mod error;
pub mod events;
pub mod install;
pub mod lifecycle;
pub mod policy;
pub mod progress;
#[cfg(test)]
mod proptests;
pub mod record;
pub mod store;
pub mod transport;
pub mod verify;

// Re-export main types for convenience
pub use cancel::CancelFlag;
pub use config::{
    BuildInfo, ChangelogOrder, DownloadConfig, FeedPolicy, NetworkConfig, StalePolicy,
    UpdaterConfig,
};
pub use controller::UpdateController;
pub use download::{DownloadFailure, DownloadRequest, Downloader};
pub use error::{ActiveRole, UpdateError, VerifyFailure, VerifyReason};
pub use events::{EventBus, UpdateEvent};
pub use install::{
    InstallMode, InstallOutcome, InstallProgress, InstallProgressSink, InstallRequest,
    InstallerBridge, PlatformInstaller, RecoveryStagingInstaller,
};
pub use lifecycle::{next_status, LifecycleEvent};
pub use progress::DownloadProgress;
pub use record::{
    Eligibility, FeedEntry, IneligibleReason, PackageType, PersistentStatus, UpdateRecord,
    UpdateStatus,
};
pub use store::{JsonFilePersistence, MemoryPersistence, RecordPersistence, RecordStore};
pub use transport::{HttpTransport, ReqwestTransport, TransportResponse};
pub use verify::{PackageVerifier, PayloadInfo, VerifiedPackage};
