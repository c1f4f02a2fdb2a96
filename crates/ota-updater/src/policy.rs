//! Install eligibility and changelog merging.
//!
//! Both are pure functions of record metadata and the running build, so they
//! can be applied to snapshots without holding the controller lock.

use std::collections::BTreeMap;

use crate::config::{BuildInfo, ChangelogOrder};
use crate::record::{Eligibility, IneligibleReason, PackageType, UpdateRecord, UpdateStatus};

/// Decide whether `record` may be installed on `build`.
///
/// A record is installable when it has a download URL, targets the running
/// platform version, and, for incremental packages, does not require a newer
/// base build than the one running.
pub fn evaluate_eligibility(record: &UpdateRecord, build: &BuildInfo) -> Eligibility {
    if record.download_url.trim().is_empty() {
        return Eligibility::InfoOnly(IneligibleReason::MissingUrl);
    }
    if !record.version.eq_ignore_ascii_case(&build.version) {
        return Eligibility::InfoOnly(IneligibleReason::VersionMismatch {
            expected: build.version.clone(),
            actual: record.version.clone(),
        });
    }
    if record.package_type == PackageType::Incremental && record.requirement > build.timestamp {
        return Eligibility::InfoOnly(IneligibleReason::RequirementNotMet {
            requirement: record.requirement,
            build_timestamp: build.timestamp,
        });
    }
    Eligibility::Installable
}

/// Build the user-facing listing: newest first, with the changelogs of
/// pending updates folded into the newest one per device.
///
/// A record is pending when it is newer than the running build. For each
/// device the pending records are walked oldest to newest; the newest
/// installable one ends up carrying the changelogs up to and including its
/// own, and the older ones are dropped from the listing unless something is
/// happening to them (a download, a verified file, an install). Records that
/// are not pending pass through untouched.
///
/// Equal timestamps are ordered by `download_id` so the result does not
/// depend on input order.
pub fn merged_listing(
    records: Vec<UpdateRecord>,
    build_timestamp: i64,
    order: ChangelogOrder,
) -> Vec<UpdateRecord> {
    let (mut pending, mut listing): (Vec<_>, Vec<_>) = records
        .into_iter()
        .partition(|r| r.timestamp > build_timestamp);

    pending.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.download_id.cmp(&b.download_id))
    });

    let mut by_device: BTreeMap<String, Vec<UpdateRecord>> = BTreeMap::new();
    for record in pending {
        by_device.entry(record.device.clone()).or_default().push(record);
    }

    for (_, group) in by_device {
        listing.extend(fold_device_group(group, order));
    }

    listing.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.download_id.cmp(&b.download_id))
    });
    listing
}

/// Fold one device's pending records (sorted oldest first).
///
/// The changelogs go to the newest installable record, or to the newest
/// record when none is installable. Info-only records newer than that
/// target stay listed with their own changelog.
fn fold_device_group(group: Vec<UpdateRecord>, order: ChangelogOrder) -> Vec<UpdateRecord> {
    let target = group
        .iter()
        .rposition(|r| r.eligibility.is_installable())
        .unwrap_or_else(|| group.len().saturating_sub(1));

    let sections: Vec<&str> = group
        .iter()
        .take(target + 1)
        .map(|r| r.changelog.as_str())
        .filter(|c| !c.is_empty())
        .collect();
    let merged = match order {
        ChangelogOrder::OldestFirst => sections.join("\n"),
        ChangelogOrder::NewestFirst => {
            sections.iter().rev().copied().collect::<Vec<_>>().join("\n")
        }
    };

    group
        .into_iter()
        .enumerate()
        .filter_map(|(idx, mut record)| {
            if idx == target {
                record.changelog = merged.clone();
                Some(record)
            } else if idx < target && is_superseded(&record) {
                None
            } else {
                Some(record)
            }
        })
        .collect()
}

/// An older pending record can be hidden only when nothing depends on it.
fn is_superseded(record: &UpdateRecord) -> bool {
    record.local_file.is_none()
        && matches!(
            record.status,
            UpdateStatus::Unknown | UpdateStatus::VerificationFailed
        )
}
