//! Property-based tests for ota-updater.
//!
//! These tests use proptest to check invariants across randomly generated
//! inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Progress percent is floored and bounded
//! - Property 2: Lifecycle transitions never skip verification
//! - Property 3: Restored records are never active
//! - Property 4: Feed merge is idempotent
//! - Property 5: Changelog folding keeps every pending changelog

#![cfg(test)]

use proptest::prelude::*;

use crate::config::ChangelogOrder;
use crate::lifecycle::{next_status, LifecycleEvent};
use crate::policy::merged_listing;
use crate::progress::percent;
use crate::record::tests::feed_entry;
use crate::record::{restore_status, PersistentStatus, UpdateRecord, UpdateStatus};

// =============================================================================
// Generators
// =============================================================================

fn arb_status() -> impl Strategy<Value = UpdateStatus> {
    prop_oneof![
        Just(UpdateStatus::Unknown),
        Just(UpdateStatus::Starting),
        Just(UpdateStatus::Downloading),
        Just(UpdateStatus::Paused),
        Just(UpdateStatus::PausedError),
        Just(UpdateStatus::Verifying),
        Just(UpdateStatus::VerificationFailed),
        Just(UpdateStatus::Verified),
        Just(UpdateStatus::Installing),
        Just(UpdateStatus::InstallationFailed),
        Just(UpdateStatus::Installed),
        Just(UpdateStatus::WaitingForReboot),
    ]
}

fn arb_persistent() -> impl Strategy<Value = PersistentStatus> {
    prop_oneof![
        Just(PersistentStatus::Unknown),
        Just(PersistentStatus::Incomplete),
        Just(PersistentStatus::Verified),
    ]
}

fn arb_event() -> impl Strategy<Value = LifecycleEvent> {
    prop_oneof![
        Just(LifecycleEvent::StartDownload),
        Just(LifecycleEvent::DownloadConnected),
        Just(LifecycleEvent::PauseRequested),
        Just(LifecycleEvent::TransportFailed),
        Just(LifecycleEvent::DownloadCompleted),
        Just(LifecycleEvent::VerificationPassed),
        Just(LifecycleEvent::VerificationFailed),
        Just(LifecycleEvent::InstallRequested),
        Just(LifecycleEvent::InstallFailed),
        Just(LifecycleEvent::InstallCancelled),
        Just(LifecycleEvent::InstalledPendingReboot),
        Just(LifecycleEvent::Installed),
        Just(LifecycleEvent::RebootCompleted),
        Just(LifecycleEvent::Deleted),
    ]
}

/// Pending records for one device with distinct timestamps above 100.
fn arb_pending_records() -> impl Strategy<Value = Vec<UpdateRecord>> {
    prop::collection::btree_set(101i64..10_000, 1..8).prop_map(|timestamps| {
        timestamps
            .into_iter()
            .map(|ts| UpdateRecord::from_feed(&feed_entry(&format!("id-{}", ts), ts)))
            .collect()
    })
}

// =============================================================================
// Property 1: Progress percent is floored and bounded
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// For any byte counts, the percent never exceeds 100 and equals the
    /// floor of the exact ratio while the download is in range.
    #[test]
    fn prop_percent_is_floored(total in 1u64..u64::MAX, frac in 0.0f64..=1.0) {
        let downloaded = ((total as f64) * frac) as u64;
        let downloaded = downloaded.min(total);
        let p = percent(downloaded, total);

        prop_assert!(p <= 100);
        let exact = (downloaded as u128 * 100) / total as u128;
        prop_assert_eq!(p as u128, exact);
    }

    /// Percent is monotonic in the number of downloaded bytes.
    #[test]
    fn prop_percent_monotonic(total in 1u64..1_000_000, a in 0u64..2_000_000, b in 0u64..2_000_000) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(percent(lo, total) <= percent(hi, total));
    }
}

// =============================================================================
// Property 2: Lifecycle transitions never skip verification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// VERIFIED is only entered after a verification pass or a cancelled
    /// install of an already verified package.
    #[test]
    fn prop_verified_only_after_verification(from in arb_status(), event in arb_event()) {
        if next_status(from, event) == Some(UpdateStatus::Verified) {
            prop_assert!(
                (from == UpdateStatus::Verifying && event == LifecycleEvent::VerificationPassed)
                    || (from == UpdateStatus::Installing && event == LifecycleEvent::InstallCancelled),
                "{} -> VERIFIED on {:?}", from, event
            );
        }
    }

    /// Installing only starts from a verified package or a failed install
    /// of one.
    #[test]
    fn prop_install_requires_verified(from in arb_status(), event in arb_event()) {
        if next_status(from, event) == Some(UpdateStatus::Installing) {
            prop_assert!(matches!(
                from,
                UpdateStatus::Verified | UpdateStatus::InstallationFailed
            ));
        }
    }

    /// Deleting is allowed from every state and always resets to UNKNOWN.
    #[test]
    fn prop_delete_always_resets(from in arb_status()) {
        prop_assert_eq!(
            next_status(from, LifecycleEvent::Deleted),
            Some(UpdateStatus::Unknown)
        );
    }

    /// Any walk through the machine that reaches INSTALLED went through
    /// VERIFYING first.
    #[test]
    fn prop_walk_installs_only_after_verifying(events in prop::collection::vec(arb_event(), 1..40)) {
        let mut status = UpdateStatus::Unknown;
        let mut verified_since_reset = false;
        for event in events {
            let Some(next) = next_status(status, event) else {
                continue;
            };
            if status == UpdateStatus::Verifying && next == UpdateStatus::Verified {
                verified_since_reset = true;
            }
            if next == UpdateStatus::Unknown || next == UpdateStatus::Starting {
                verified_since_reset = false;
            }
            if matches!(next, UpdateStatus::Installed | UpdateStatus::WaitingForReboot) {
                prop_assert!(verified_since_reset);
            }
            status = next;
        }
    }
}

// =============================================================================
// Property 3: Restored records are never active
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Whatever was persisted, nothing comes back downloading, verifying
    /// or installing.
    #[test]
    fn prop_restore_never_active(
        status in arb_status(),
        persistent in arb_persistent(),
        file_len in prop::option::of(0u64..10_000),
    ) {
        let (restored, restored_persistent) = restore_status(status, persistent, file_len);
        prop_assert!(!restored.is_download_active());
        prop_assert!(!restored.is_install_active());
        prop_assert_ne!(restored, UpdateStatus::Verifying);

        if restored == UpdateStatus::Verified {
            prop_assert_eq!(restored_persistent, PersistentStatus::Verified);
            prop_assert!(file_len.is_some_and(|len| len > 0));
        }
    }
}

// =============================================================================
// Property 4: Feed merge is idempotent
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Applying the same feed entry twice changes nothing the second time,
    /// and lifecycle state survives any metadata refresh.
    #[test]
    fn prop_apply_feed_idempotent(
        ts in 1i64..10_000,
        new_ts in 1i64..10_000,
        changelog in "[a-z ]{0,32}",
        status in arb_status(),
        downloaded in 0u64..1000,
    ) {
        let mut record = UpdateRecord::from_feed(&feed_entry("abc", ts));
        record.status = status;
        record.downloaded_bytes = downloaded;

        let mut entry = feed_entry("abc", new_ts);
        entry.changelog = changelog;
        record.apply_feed(&entry);
        let after_first = record.clone();

        prop_assert!(!record.apply_feed(&entry));
        prop_assert_eq!(&record, &after_first);
        prop_assert_eq!(record.status, status);
        prop_assert_eq!(record.downloaded_bytes, downloaded);
    }
}

// =============================================================================
// Property 5: Changelog folding keeps every pending changelog
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// The newest pending record carries every pending changelog, and the
    /// listing does not depend on input order.
    #[test]
    fn prop_changelog_fold_complete(records in arb_pending_records(), seed in any::<u64>()) {
        let newest = records
            .iter()
            .max_by_key(|r| r.timestamp)
            .map(|r| r.download_id.clone())
            .unwrap();
        let changelogs: Vec<String> = records.iter().map(|r| r.changelog.clone()).collect();

        let listing = merged_listing(records.clone(), 100, ChangelogOrder::NewestFirst);
        let head = &listing[0];
        prop_assert_eq!(&head.download_id, &newest);
        for changelog in &changelogs {
            prop_assert!(head.changelog.contains(changelog.as_str()));
        }

        let mut shuffled = records;
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);
        shuffled.reverse();
        let again = merged_listing(shuffled, 100, ChangelogOrder::NewestFirst);
        prop_assert_eq!(listing, again);
    }
}
