//! Update records and their status variants.
//!
//! An [`UpdateRecord`] is keyed by `download_id`, the content hash assigned by
//! the feed. Two orthogonal status fields describe it:
//!
//! - [`UpdateStatus`]: the fine-grained lifecycle state, partly transient
//! - [`PersistentStatus`]: the coarse durable state that tells what is on disk
//!
//! [`restore_status`] is the single table mapping a persisted pair back to
//! what the record looks like after a process restart.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Fine-grained lifecycle state of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
    Unknown,
    Starting,
    Downloading,
    Paused,
    PausedError,
    Verifying,
    VerificationFailed,
    Verified,
    Installing,
    InstallationFailed,
    Installed,
    WaitingForReboot,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

impl UpdateStatus {
    /// Holds the download slot.
    pub fn is_download_active(self) -> bool {
        matches!(self, Self::Starting | Self::Downloading)
    }

    /// Holds the install slot.
    pub fn is_install_active(self) -> bool {
        matches!(self, Self::Installing)
    }

    /// No background work is attached to the record.
    pub fn is_idle(self) -> bool {
        !self.is_download_active() && !self.is_install_active() && self != Self::Verifying
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Starting => "STARTING",
            Self::Downloading => "DOWNLOADING",
            Self::Paused => "PAUSED",
            Self::PausedError => "PAUSED_ERROR",
            Self::Verifying => "VERIFYING",
            Self::VerificationFailed => "VERIFICATION_FAILED",
            Self::Verified => "VERIFIED",
            Self::Installing => "INSTALLING",
            Self::InstallationFailed => "INSTALLATION_FAILED",
            Self::Installed => "INSTALLED",
            Self::WaitingForReboot => "WAITING_FOR_REBOOT",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse durable status, independent of the transient lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistentStatus {
    /// Nothing usable on disk.
    Unknown,
    /// A download was started; the local file may be partial.
    Incomplete,
    /// The local file passed verification.
    Verified,
}

impl Default for PersistentStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Kind of package the feed advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    /// Full image, applicable on top of any build.
    Full,
    /// Delta against a specific prior build, gated by `requirement`.
    Incremental,
}

impl Default for PackageType {
    fn default() -> Self {
        Self::Full
    }
}

/// Why a record is info-only on the running build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IneligibleReason {
    /// The feed gave no download URL.
    MissingUrl,
    /// The package targets another platform version.
    VersionMismatch { expected: String, actual: String },
    /// An incremental package built against a newer base than the running build.
    RequirementNotMet { requirement: i64, build_timestamp: i64 },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingUrl => f.write_str("no download url"),
            Self::VersionMismatch { expected, actual } => {
                write!(f, "built for version {}, running {}", actual, expected)
            }
            Self::RequirementNotMet {
                requirement,
                build_timestamp,
            } => write!(
                f,
                "requires build {} or newer, running {}",
                requirement, build_timestamp
            ),
        }
    }
}

/// Install eligibility, computed when feed data is merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Eligibility {
    Installable,
    InfoOnly(IneligibleReason),
}

impl Default for Eligibility {
    fn default() -> Self {
        Self::Installable
    }
}

impl Eligibility {
    pub fn is_installable(&self) -> bool {
        matches!(self, Self::Installable)
    }
}

/// Plain metadata for one candidate update, as produced by the feed parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Content hash identifying the package
    pub download_id: String,
    /// File name of the package on the server
    pub file_name: String,
    /// Human-readable version name
    pub version_name: String,
    /// Platform version the package applies to
    pub version: String,
    /// Release type (e.g. "release", "nightly")
    #[serde(default)]
    pub rom_type: String,
    /// Device codename
    pub device: String,
    /// Full or incremental
    #[serde(default)]
    pub package_type: PackageType,
    /// Minimum build timestamp for incremental packages
    #[serde(default)]
    pub requirement: i64,
    /// Build timestamp (seconds since epoch)
    pub timestamp: i64,
    /// Package size in bytes
    pub file_size: u64,
    /// Download URL, may be empty for info-only entries
    #[serde(default)]
    pub download_url: String,
    /// Release notes
    #[serde(default)]
    pub changelog: String,
    /// Explicit SHA-256 digest (hex); the download id is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Metadata and lifecycle state of one known update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub download_id: String,
    pub file_name: String,
    pub version_name: String,
    pub version: String,
    pub rom_type: String,
    pub device: String,
    pub package_type: PackageType,
    pub requirement: i64,
    pub timestamp: i64,
    pub file_size: u64,
    pub download_url: String,
    pub changelog: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Payload path; absent until a download starts
    #[serde(default)]
    pub local_file: Option<PathBuf>,
    #[serde(default)]
    pub status: UpdateStatus,
    #[serde(default)]
    pub persistent_status: PersistentStatus,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default = "default_true")]
    pub available_online: bool,
    #[serde(default)]
    pub eligibility: Eligibility,

    // Download-only, never persisted
    #[serde(skip)]
    pub progress_percent: u8,
    #[serde(skip)]
    pub eta_seconds: Option<u64>,

    // Install-only, never persisted
    #[serde(skip)]
    pub install_progress_percent: u8,
    #[serde(skip)]
    pub install_indeterminate: bool,
    #[serde(skip)]
    pub finalizing: bool,
}

fn default_true() -> bool {
    true
}

impl UpdateRecord {
    /// Create a fresh record from feed metadata.
    pub fn from_feed(entry: &FeedEntry) -> Self {
        Self {
            download_id: entry.download_id.clone(),
            file_name: entry.file_name.clone(),
            version_name: entry.version_name.clone(),
            version: entry.version.clone(),
            rom_type: entry.rom_type.clone(),
            device: entry.device.clone(),
            package_type: entry.package_type,
            requirement: entry.requirement,
            timestamp: entry.timestamp,
            file_size: entry.file_size,
            download_url: entry.download_url.clone(),
            changelog: entry.changelog.clone(),
            sha256: entry.sha256.clone(),
            local_file: None,
            status: UpdateStatus::Unknown,
            persistent_status: PersistentStatus::Unknown,
            downloaded_bytes: 0,
            available_online: true,
            eligibility: Eligibility::Installable,
            progress_percent: 0,
            eta_seconds: None,
            install_progress_percent: 0,
            install_indeterminate: false,
            finalizing: false,
        }
    }

    /// Overwrite the metadata fields from a newer feed fetch.
    ///
    /// The id and all lifecycle fields are left alone. Returns whether
    /// anything changed.
    pub fn apply_feed(&mut self, entry: &FeedEntry) -> bool {
        debug_assert_eq!(self.download_id, entry.download_id);
        let before = self.clone();

        self.file_name = entry.file_name.clone();
        self.version_name = entry.version_name.clone();
        self.version = entry.version.clone();
        self.rom_type = entry.rom_type.clone();
        self.device = entry.device.clone();
        self.package_type = entry.package_type;
        self.requirement = entry.requirement;
        self.timestamp = entry.timestamp;
        self.file_size = entry.file_size;
        self.download_url = entry.download_url.clone();
        self.changelog = entry.changelog.clone();
        self.sha256 = entry.sha256.clone();

        *self != before
    }

    /// Expected SHA-256 digest, hex encoded.
    pub fn expected_sha256(&self) -> &str {
        self.sha256.as_deref().unwrap_or(&self.download_id)
    }

    /// Reset download and install progress to zero.
    pub fn clear_progress(&mut self) {
        self.downloaded_bytes = 0;
        self.progress_percent = 0;
        self.eta_seconds = None;
        self.clear_install_progress();
    }

    pub fn clear_install_progress(&mut self) {
        self.install_progress_percent = 0;
        self.install_indeterminate = false;
        self.finalizing = false;
    }
}

/// Map a persisted status pair onto its post-restart value.
///
/// `file_len` is the length of `local_file` on disk, `None` when the file is
/// missing or empty. Nothing comes back in an active state: interrupted
/// downloads are paused and interrupted installs are failed.
pub fn restore_status(
    status: UpdateStatus,
    persistent: PersistentStatus,
    file_len: Option<u64>,
) -> (UpdateStatus, PersistentStatus) {
    use PersistentStatus as P;
    use UpdateStatus as S;

    let has_file = file_len.is_some_and(|len| len > 0);
    match (persistent, has_file) {
        (P::Verified, true) => match status {
            S::Installed | S::WaitingForReboot | S::InstallationFailed => (status, P::Verified),
            S::Installing => (S::InstallationFailed, P::Verified),
            _ => (S::Verified, P::Verified),
        },
        (P::Verified, false) => match status {
            S::Installed | S::WaitingForReboot => (status, P::Unknown),
            _ => (S::Unknown, P::Unknown),
        },
        (P::Incomplete | P::Unknown, true) => match status {
            S::PausedError => (S::PausedError, P::Incomplete),
            _ => (S::Paused, P::Incomplete),
        },
        (P::Incomplete | P::Unknown, false) => match status {
            S::VerificationFailed | S::Installed | S::WaitingForReboot => (status, P::Unknown),
            _ => (S::Unknown, P::Unknown),
        },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn feed_entry(id: &str, timestamp: i64) -> FeedEntry {
        FeedEntry {
            download_id: id.to_string(),
            file_name: format!("{}.zip", id),
            version_name: format!("build-{}", timestamp),
            version: "14".to_string(),
            rom_type: "release".to_string(),
            device: "walleye".to_string(),
            package_type: PackageType::Full,
            requirement: 0,
            timestamp,
            file_size: 1000,
            download_url: format!("https://updates.example.com/{}.zip", id),
            changelog: format!("changes in {}", timestamp),
            sha256: None,
        }
    }

    #[test]
    fn test_status_roles() {
        assert!(UpdateStatus::Starting.is_download_active());
        assert!(UpdateStatus::Downloading.is_download_active());
        assert!(!UpdateStatus::Paused.is_download_active());
        assert!(UpdateStatus::Installing.is_install_active());
        assert!(!UpdateStatus::Verifying.is_idle());
        assert!(UpdateStatus::VerificationFailed.is_idle());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&UpdateStatus::WaitingForReboot).unwrap();
        assert_eq!(json, "\"WAITING_FOR_REBOOT\"");
        assert_eq!(UpdateStatus::PausedError.to_string(), "PAUSED_ERROR");
    }

    #[test]
    fn test_apply_feed_keeps_lifecycle_state() {
        let entry = feed_entry("abc", 100);
        let mut record = UpdateRecord::from_feed(&entry);
        record.status = UpdateStatus::Paused;
        record.persistent_status = PersistentStatus::Incomplete;
        record.downloaded_bytes = 400;

        let mut newer = entry.clone();
        newer.changelog = "rewritten".to_string();
        assert!(record.apply_feed(&newer));
        assert_eq!(record.changelog, "rewritten");
        assert_eq!(record.status, UpdateStatus::Paused);
        assert_eq!(record.downloaded_bytes, 400);

        assert!(!record.apply_feed(&newer));
    }

    #[test]
    fn test_expected_sha256_falls_back_to_id() {
        let mut entry = feed_entry("deadbeef", 1);
        assert_eq!(UpdateRecord::from_feed(&entry).expected_sha256(), "deadbeef");
        entry.sha256 = Some("cafe".to_string());
        assert_eq!(UpdateRecord::from_feed(&entry).expected_sha256(), "cafe");
    }

    #[test]
    fn test_transient_fields_not_persisted() {
        let mut record = UpdateRecord::from_feed(&feed_entry("abc", 1));
        record.progress_percent = 40;
        record.eta_seconds = Some(12);
        record.finalizing = true;
        record.downloaded_bytes = 400;

        let json = serde_json::to_string(&record).unwrap();
        let back: UpdateRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.progress_percent, 0);
        assert_eq!(back.eta_seconds, None);
        assert!(!back.finalizing);
        assert_eq!(back.downloaded_bytes, 400);
    }

    #[test]
    fn test_restore_interrupted_download_is_paused() {
        let restored = restore_status(
            UpdateStatus::Downloading,
            PersistentStatus::Incomplete,
            Some(512),
        );
        assert_eq!(restored, (UpdateStatus::Paused, PersistentStatus::Incomplete));

        let restored = restore_status(UpdateStatus::Starting, PersistentStatus::Incomplete, None);
        assert_eq!(restored, (UpdateStatus::Unknown, PersistentStatus::Unknown));
    }

    #[test]
    fn test_restore_interrupted_install_is_failed() {
        let restored = restore_status(
            UpdateStatus::Installing,
            PersistentStatus::Verified,
            Some(1000),
        );
        assert_eq!(
            restored,
            (UpdateStatus::InstallationFailed, PersistentStatus::Verified)
        );
    }

    #[test]
    fn test_restore_unverified_file_is_incomplete() {
        let restored = restore_status(UpdateStatus::Unknown, PersistentStatus::Unknown, Some(10));
        assert_eq!(restored, (UpdateStatus::Paused, PersistentStatus::Incomplete));

        let restored = restore_status(UpdateStatus::Verified, PersistentStatus::Verified, None);
        assert_eq!(restored, (UpdateStatus::Unknown, PersistentStatus::Unknown));
    }
}
