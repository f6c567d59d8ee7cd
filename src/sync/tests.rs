//! Integration Tests for the Sync Engine
//!
//! End-to-end scenarios against an in-memory database and a programmable
//! remote store double:
//! - Offline write -> pending -> reconnect -> exactly one successful push
//! - Retry exhaustion and backoff monotonicity
//! - Pull reconciliation through the conflict resolver
//! - Validation failures leaving no trace
//! - Recovery, sign-out cancellation, export/import round trips
//!
//! Timing-sensitive tests run on the paused tokio clock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::{broadcast, Mutex as TokioMutex};

use crate::db::Database;
use crate::error::{PreferenceError, SyncFailureReason};
use crate::models::{
    CyclePreferences, PreferenceDocument, PrivacyPreferences, SyncStatus, TemperatureUnit,
    UnitPreferences, WeightUnit, HeightUnit,
};
use crate::store::{ImportMergeStrategy, PreferenceStore, StoreConfig};
use crate::sync::api::{RemoteError, RemoteStore};
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::coordinator::{PullOutcome, SyncEvent};
use crate::sync::resolver::ResolutionStrategy;

// ============================================================================
// Remote Store Double
// ============================================================================

struct MockRemote {
    online: AtomicBool,
    reject_auth: AtomicBool,
    push_attempts: AtomicU32,
    push_successes: AtomicU32,
    stored: TokioMutex<Option<PreferenceDocument>>,
}

impl MockRemote {
    fn online() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            reject_auth: AtomicBool::new(false),
            push_attempts: AtomicU32::new(0),
            push_successes: AtomicU32::new(0),
            stored: TokioMutex::new(None),
        })
    }

    fn offline() -> Arc<Self> {
        let remote = Self::online();
        remote.online.store(false, Ordering::SeqCst);
        remote
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn attempts(&self) -> u32 {
        self.push_attempts.load(Ordering::SeqCst)
    }

    fn successes(&self) -> u32 {
        self.push_successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn push_document(&self, doc: &PreferenceDocument) -> Result<(), RemoteError> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(RemoteError::Unauthorized);
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::NoConnectivity("simulated offline".to_string()));
        }
        *self.stored.lock().await = Some(doc.clone());
        self.push_successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pull_document(
        &self,
        _user_id: &str,
    ) -> Result<Option<PreferenceDocument>, RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::NoConnectivity("simulated offline".to_string()));
        }
        Ok(self.stored.lock().await.clone())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> StoreConfig {
    StoreConfig {
        periodic_pull: None,
        ..StoreConfig::default()
    }
}

fn build_store(remote: Arc<MockRemote>, monitor: &ConnectivityMonitor) -> PreferenceStore {
    init_logging();
    let db = Database::in_memory().expect("in-memory database");
    let store = PreferenceStore::new("user-1", db, remote, monitor.subscribe(), test_config());
    store.start();
    store
}

fn build_store_with_db(
    db: Database,
    remote: Arc<MockRemote>,
    monitor: &ConnectivityMonitor,
) -> PreferenceStore {
    init_logging();
    let store = PreferenceStore::new("user-1", db, remote, monitor.subscribe(), test_config());
    store.start();
    store
}

fn doc_at(ts_secs: i64, counter: i64) -> PreferenceDocument {
    let mut doc = PreferenceDocument::new_default("user-1");
    doc.last_modified = Utc.timestamp_opt(ts_secs, 0).unwrap();
    doc.write_counter = counter;
    doc
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for sync event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

// ============================================================================
// Offline-First Write Path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_update_pushes_exactly_once_after_reconnect() {
    let remote = MockRemote::offline();
    let monitor = ConnectivityMonitor::new(false);
    let store = build_store(remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    let cycle = CyclePreferences {
        average_cycle_length: 30,
        ..CyclePreferences::default()
    };
    store.update_cycle_preferences(cycle).await.unwrap();

    // The write is immediately visible locally and marked pending
    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.cycle.average_cycle_length, 30);
    assert_eq!(doc.sync_status, SyncStatus::Pending);

    // The first attempt fails offline and schedules a retry
    wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::PushRetryScheduled { .. })
    })
    .await;

    remote.set_online(true);
    monitor.set_online(true);

    wait_for_event(&mut events, |e| matches!(e, SyncEvent::PushSucceeded { .. })).await;

    assert_eq!(remote.successes(), 1);
    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.sync_status, SyncStatus::Synced);

    let pushed = remote.stored.lock().await.clone().unwrap();
    assert_eq!(pushed.cycle.average_cycle_length, 30);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_mark_document_failed() {
    let remote = MockRemote::offline();
    // The signal claims online, but the server stays unreachable
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    store
        .update_cycle_preferences(CyclePreferences::default())
        .await
        .unwrap();

    let mut delays = Vec::new();
    loop {
        match events.recv().await.expect("event channel closed") {
            SyncEvent::PushRetryScheduled { delay, .. } => delays.push(delay),
            SyncEvent::PushFailed {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(reason, SyncFailureReason::NoConnectivity);
                break;
            }
            _ => {}
        }
    }

    // Four scheduled retries before the fifth attempt gives up, each delay
    // strictly greater than the previous
    assert_eq!(delays.len(), 4);
    for pair in delays.windows(2) {
        assert!(pair[1] > pair[0], "delays must grow: {:?}", delays);
    }

    assert_eq!(remote.attempts(), 5);
    assert_eq!(remote.successes(), 0);

    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.sync_status, SyncStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_fails_without_retries() {
    let remote = MockRemote::online();
    remote.reject_auth.store(true, Ordering::SeqCst);
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    store
        .update_cycle_preferences(CyclePreferences::default())
        .await
        .unwrap();

    let event = wait_for_event(&mut events, |e| matches!(e, SyncEvent::PushFailed { .. })).await;
    match event {
        SyncEvent::PushFailed {
            attempts, reason, ..
        } => {
            assert_eq!(attempts, 1);
            assert_eq!(reason, SyncFailureReason::RemoteRejected);
        }
        _ => unreachable!(),
    }

    assert_eq!(remote.attempts(), 1);
    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.sync_status, SyncStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_write_is_not_pushed() {
    let remote = MockRemote::offline();
    let monitor = ConnectivityMonitor::new(false);
    let store = build_store(remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 29,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::PushRetryScheduled { .. })
    })
    .await;

    // A second write lands while the first is waiting for network
    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 31,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    remote.set_online(true);
    monitor.set_online(true);

    wait_for_event(&mut events, |e| matches!(e, SyncEvent::PushSucceeded { .. })).await;

    // Only the final state reached the remote store
    let pushed = remote.stored.lock().await.clone().unwrap();
    assert_eq!(pushed.cycle.average_cycle_length, 31);
    assert_eq!(remote.successes(), 1);
}

// ============================================================================
// Pull Reconciliation
// ============================================================================

#[tokio::test]
async fn test_pull_applies_newer_remote_document() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let db = Database::in_memory().unwrap();

    let mut local = doc_at(100, 1);
    local.sync_status = SyncStatus::Synced;
    db.save_document(&local).unwrap();

    let mut newer = doc_at(200, 2);
    newer.units = UnitPreferences {
        temperature: TemperatureUnit::Fahrenheit,
        weight: WeightUnit::Pounds,
        height: HeightUnit::Feet,
    };
    *remote.stored.lock().await = Some(newer);

    let store = build_store_with_db(db, remote.clone(), &monitor);

    let outcome = store.refresh().await.unwrap();
    assert_eq!(
        outcome,
        PullOutcome::Applied(ResolutionStrategy::LastWriteWins)
    );

    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.units.temperature, TemperatureUnit::Fahrenheit);
    assert_eq!(doc.sync_status, SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn test_pull_with_newer_local_schedules_push() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let db = Database::in_memory().unwrap();

    let mut local = doc_at(300, 3);
    local.cycle.average_cycle_length = 33;
    local.sync_status = SyncStatus::Pending;
    db.save_document(&local).unwrap();

    *remote.stored.lock().await = Some(doc_at(100, 1));

    let store = build_store_with_db(db, remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    let outcome = store.refresh().await.unwrap();
    assert_eq!(
        outcome,
        PullOutcome::Applied(ResolutionStrategy::LastWriteWins)
    );

    // The local document survived and the remote converges to it
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::PushSucceeded { .. })).await;
    let pushed = remote.stored.lock().await.clone().unwrap();
    assert_eq!(pushed.cycle.average_cycle_length, 33);

    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_pull_into_fresh_install_adopts_remote() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);

    let mut remote_doc = doc_at(500, 4);
    remote_doc.display.language = "de".to_string();
    *remote.stored.lock().await = Some(remote_doc);

    let store = build_store(remote.clone(), &monitor);

    let outcome = store.refresh().await.unwrap();
    assert_eq!(outcome, PullOutcome::Applied(ResolutionStrategy::RemoteWins));

    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.display.language, "de");
    assert_eq!(doc.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_equal_timestamp_privacy_conflict_requires_manual() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let db = Database::in_memory().unwrap();

    let mut local = doc_at(100, 2);
    local.privacy = PrivacyPreferences {
        require_app_lock: true,
        ..PrivacyPreferences::default()
    };
    db.save_document(&local).unwrap();

    let mut remote_doc = doc_at(100, 2);
    remote_doc.privacy = PrivacyPreferences {
        hide_in_app_switcher: true,
        ..PrivacyPreferences::default()
    };
    *remote.stored.lock().await = Some(remote_doc);

    let store = build_store_with_db(db, remote.clone(), &monitor);

    let err = store.refresh().await.unwrap_err();
    assert!(matches!(err, PreferenceError::Conflict(_)));

    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.sync_status, SyncStatus::Conflicted);
    // Local content is untouched until the user decides
    assert!(doc.privacy.require_app_lock);
}

#[tokio::test(start_paused = true)]
async fn test_equal_timestamp_tiebreak_converges() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let db = Database::in_memory().unwrap();

    let mut local = doc_at(100, 5);
    local.cycle.average_cycle_length = 30;
    db.save_document(&local).unwrap();

    let mut remote_doc = doc_at(100, 3);
    remote_doc.cycle.average_cycle_length = 32;
    *remote.stored.lock().await = Some(remote_doc);

    let store = build_store_with_db(db, remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    store.refresh().await.unwrap();

    // The higher write counter wins and is pushed back out
    wait_for_event(&mut events, |e| matches!(e, SyncEvent::PushSucceeded { .. })).await;
    let pushed = remote.stored.lock().await.clone().unwrap();
    assert_eq!(pushed.cycle.average_cycle_length, 30);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_invalid_update_leaves_no_trace() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    let before = store.get_settings().await.unwrap();

    let invalid = CyclePreferences {
        average_cycle_length: 28,
        luteal_phase_length: 28,
        ..CyclePreferences::default()
    };
    let err = store.update_cycle_preferences(invalid).await.unwrap_err();
    match err {
        PreferenceError::Validation(violations) => {
            assert!(violations
                .iter()
                .any(|v| v.field == "cycle.luteal_phase_length"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }

    // No cache mutation, no backup, no push
    let after = store.get_settings().await.unwrap();
    assert_eq!(after, before);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.list_backups(10).unwrap().is_empty());
    assert_eq!(remote.attempts(), 0);
}

#[tokio::test]
async fn test_update_is_idempotent_except_bookkeeping() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    let cycle = CyclePreferences {
        average_cycle_length: 30,
        ..CyclePreferences::default()
    };
    store.update_cycle_preferences(cycle.clone()).await.unwrap();
    let first = store.get_settings().await.unwrap();

    store.update_cycle_preferences(cycle).await.unwrap();
    let second = store.get_settings().await.unwrap();

    assert_eq!(first.content_fingerprint(), second.content_fingerprint());
    assert!(second.last_modified > first.last_modified);
    assert_eq!(second.write_counter, first.write_counter + 1);
}

// ============================================================================
// Reset / Export / Import / Restore
// ============================================================================

#[tokio::test]
async fn test_reset_to_defaults_can_preserve_units() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    store
        .update_unit_preferences(UnitPreferences {
            temperature: TemperatureUnit::Fahrenheit,
            weight: WeightUnit::Pounds,
            height: HeightUnit::Feet,
        })
        .await
        .unwrap();
    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 35,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    let doc = store.reset_to_defaults(true).await.unwrap();
    assert_eq!(doc.units.temperature, TemperatureUnit::Fahrenheit);
    assert_eq!(doc.cycle, CyclePreferences::default());
    assert_eq!(doc.sync_status, SyncStatus::Pending);

    let doc = store.reset_to_defaults(false).await.unwrap();
    assert_eq!(doc.units, UnitPreferences::default());
}

#[tokio::test]
async fn test_export_import_roundtrip() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 30,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();
    let exported = store.export_snapshot(true).await.unwrap();

    // Settings drift after the export
    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 41,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    let doc = store
        .import_snapshot(&exported, ImportMergeStrategy::Replace)
        .await
        .unwrap();
    assert_eq!(doc.cycle.average_cycle_length, 30);
    assert_eq!(doc.sync_status, SyncStatus::Pending);

    let current = store.get_settings().await.unwrap();
    assert_eq!(current.cycle.average_cycle_length, 30);
}

#[tokio::test]
async fn test_import_merge_sections_keeps_local_rest() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    store
        .update_display_preferences(crate::models::DisplayPreferences {
            language: "fr".to_string(),
            ..crate::models::DisplayPreferences::default()
        })
        .await
        .unwrap();

    // An export carrying only a non-default cycle section
    let other_store_doc = {
        let mut doc = PreferenceDocument::new_default("user-1");
        doc.cycle.average_cycle_length = 33;
        doc
    };
    let export = crate::backup::SettingsExport {
        schema_version: crate::models::SCHEMA_VERSION,
        exported_at: Utc::now(),
        metadata: None,
        document: other_store_doc,
    };
    let json = serde_json::to_string(&export).unwrap();

    let doc = store
        .import_snapshot(&json, ImportMergeStrategy::MergeSections)
        .await
        .unwrap();
    assert_eq!(doc.cycle.average_cycle_length, 33);
    assert_eq!(doc.display.language, "fr");
}

#[tokio::test]
async fn test_restore_on_new_device_from_remote() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);

    let mut remote_doc = PreferenceDocument::new_default("user-1");
    remote_doc.cycle.average_cycle_length = 31;
    *remote.stored.lock().await = Some(remote_doc);

    let store = build_store(remote.clone(), &monitor);

    let doc = store.restore_on_new_device(None).await.unwrap();
    assert_eq!(doc.cycle.average_cycle_length, 31);

    let current = store.get_settings().await.unwrap();
    assert_eq!(current.cycle.average_cycle_length, 31);
}

// ============================================================================
// Recovery & Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recover_from_sync_failure_after_reconnect() {
    let remote = MockRemote::offline();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 30,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, SyncEvent::PushFailed { .. })).await;
    assert_eq!(
        store.get_settings().await.unwrap().sync_status,
        SyncStatus::Failed
    );

    remote.set_online(true);
    store.recover_from_sync_failure().await.unwrap();

    assert_eq!(remote.successes(), 1);
    assert_eq!(
        store.get_settings().await.unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test(start_paused = true)]
async fn test_recover_times_out_while_offline() {
    let remote = MockRemote::offline();
    let monitor = ConnectivityMonitor::new(false);
    let store = build_store(remote.clone(), &monitor);

    let err = store.recover_from_sync_failure().await.unwrap_err();
    match err {
        PreferenceError::Sync {
            reason, retryable, ..
        } => {
            assert_eq!(reason, SyncFailureReason::NoConnectivity);
            assert!(retryable);
        }
        other => panic!("expected sync error, got {:?}", other),
    }
    assert_eq!(remote.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_cancels_retries_and_keeps_pending_state() {
    let remote = MockRemote::offline();
    let monitor = ConnectivityMonitor::new(false);
    let store = build_store(remote.clone(), &monitor);
    let mut events = store.subscribe_events();

    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 30,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    wait_for_event(&mut events, |e| {
        matches!(e, SyncEvent::PushRetryScheduled { .. })
    })
    .await;
    let attempts_before = remote.attempts();

    store.sign_out().await;

    // The retry loop is gone; no further attempts even as time passes
    tokio::time::advance(Duration::from_secs(600)).await;
    assert_eq!(remote.attempts(), attempts_before);

    // The write survived locally and is still pending
    let doc = store.get_settings().await.unwrap();
    assert_eq!(doc.cycle.average_cycle_length, 30);
    assert_eq!(doc.sync_status, SyncStatus::Pending);
}

// ============================================================================
// Change Stream
// ============================================================================

#[tokio::test]
async fn test_observe_changes_replays_and_follows() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    let mut rx = store.observe_changes().await.unwrap();
    let initial = rx.borrow_and_update().clone().expect("replayed value");
    assert_eq!(initial.cycle, CyclePreferences::default());

    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 30,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    rx.changed().await.unwrap();
    let updated = rx.borrow().clone().expect("updated value");
    assert_eq!(updated.cycle.average_cycle_length, 30);
}

#[tokio::test]
async fn test_dropping_one_subscriber_leaves_others_working() {
    let remote = MockRemote::online();
    let monitor = ConnectivityMonitor::new(true);
    let store = build_store(remote.clone(), &monitor);

    let rx1 = store.observe_changes().await.unwrap();
    let mut rx2 = store.observe_changes().await.unwrap();
    drop(rx1);

    store
        .update_cycle_preferences(CyclePreferences {
            average_cycle_length: 30,
            ..CyclePreferences::default()
        })
        .await
        .unwrap();

    rx2.changed().await.unwrap();
    assert_eq!(
        rx2.borrow().clone().unwrap().cycle.average_cycle_length,
        30
    );
}
