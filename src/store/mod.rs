//! Preference Store - the single entry point for settings access
//!
//! Composes the cache, local persistence, sync coordinator, and backup
//! manager behind one facade:
//! - Reads go cache -> local store -> persisted defaults; "not found" never
//!   escapes to a caller
//! - Writes validate, persist locally, update the cache, snapshot in the
//!   background, and queue a remote push; they return as soon as local
//!   persistence succeeds
//! - A watch-based change stream replays the latest document to every new
//!   subscriber
//!
//! One instance serves one user; the user id is fixed at construction and
//! threaded through every collaborator instead of living in ambient state.
//! All mutation of the user's document is serialized through a single mutex
//! shared with the sync coordinator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};

use crate::backup::{BackupManager, BackupError, BackupRecord, DEFAULT_KEEP_COUNT};
use crate::cache::{PreferenceCache, DEFAULT_TTL};
use crate::db::{Database, LocalStore, SqliteLocalStore};
use crate::error::PreferenceError;
use crate::models::{
    NotificationPreferences, PreferenceDocument, SectionUpdate, SyncStatus,
    CyclePreferences, DisplayPreferences, PrivacyPreferences, SyncPreferences, UnitPreferences,
};
use crate::sync::api::RemoteStore;
use crate::sync::coordinator::{PullOutcome, RetryPolicy, SyncCoordinator, SyncEvent, SyncPhase};
use crate::sync::resolver::{self, ResolutionStrategy};

// ============================================================================
// Collaborator Interfaces
// ============================================================================

/// Re-registers OS notifications after the notification section changes.
/// Consumed here, implemented by the platform layer; a failure never fails
/// the settings update itself.
#[async_trait]
pub trait NotificationScheduler: Send + Sync {
    async fn reschedule(&self, prefs: &NotificationPreferences) -> Result<(), RescheduleError>;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to reschedule notifications: {0}")]
pub struct RescheduleError(pub String);

/// How an imported snapshot is combined with the current settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMergeStrategy {
    /// The imported document replaces the current one wholesale
    Replace,
    /// Last-write-wins between current and imported, via the resolver
    PreferNewer,
    /// Imported sections that differ from defaults overlay the current ones
    MergeSections,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
    pub backup_keep_count: usize,
    /// Cadence for background pulls; `None` disables them
    pub periodic_pull: Option<Duration>,
    /// Bounded retries for local persistence before surfacing the failure
    pub persistence_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_TTL,
            retry: RetryPolicy::default(),
            backup_keep_count: DEFAULT_KEEP_COUNT,
            periodic_pull: Some(Duration::from_secs(30 * 60)),
            persistence_retries: 3,
        }
    }
}

// ============================================================================
// Preference Store
// ============================================================================

/// Facade over one user's preference document
pub struct PreferenceStore {
    user_id: String,
    local: Arc<dyn LocalStore>,
    cache: PreferenceCache<PreferenceDocument>,
    coordinator: SyncCoordinator,
    backups: BackupManager,
    scheduler: Option<Arc<dyn NotificationScheduler>>,
    doc_lock: Arc<Mutex<()>>,
    config: StoreConfig,
}

impl PreferenceStore {
    pub fn new(
        user_id: impl Into<String>,
        db: Database,
        remote: Arc<dyn RemoteStore>,
        connectivity: watch::Receiver<bool>,
        config: StoreConfig,
    ) -> Self {
        let user_id = user_id.into();
        let cache = PreferenceCache::new(config.cache_ttl);
        let local: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::new(db.clone()));
        let doc_lock = Arc::new(Mutex::new(()));

        let coordinator = SyncCoordinator::new(
            user_id.clone(),
            remote.clone(),
            local.clone(),
            cache.clone(),
            doc_lock.clone(),
            connectivity,
            config.retry.clone(),
        );
        let backups = BackupManager::new(db, remote, config.backup_keep_count);

        Self {
            user_id,
            local,
            cache,
            coordinator,
            backups,
            scheduler: None,
            doc_lock,
            config,
        }
    }

    /// Attach the platform notification scheduler
    pub fn with_notification_scheduler(mut self, scheduler: Arc<dyn NotificationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Start background sync (push worker, optional periodic pulls)
    pub fn start(&self) {
        self.coordinator.start();
        if let Some(interval) = self.config.periodic_pull {
            self.coordinator.start_periodic_pull(interval);
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// The current settings: cache, then local store, then freshly persisted
    /// defaults. Absence always resolves to a defaulted document.
    pub async fn get_settings(&self) -> Result<PreferenceDocument, PreferenceError> {
        if let Some(doc) = self.cache.get(&self.user_id).await {
            return Ok(doc);
        }

        let _guard = self.doc_lock.lock().await;
        // Re-check under the lock; a concurrent caller may have populated it
        if let Some(doc) = self.cache.get(&self.user_id).await {
            return Ok(doc);
        }

        let doc = self.load_or_create_default_locked()?;
        self.cache.put(&self.user_id, doc.clone()).await;
        Ok(doc)
    }

    /// Hot change stream with replay-latest semantics. Subscriptions are
    /// independently cancellable and never affect pending writes.
    pub async fn observe_changes(
        &self,
    ) -> Result<watch::Receiver<Option<PreferenceDocument>>, PreferenceError> {
        // Make sure the stream has a current value to replay
        self.get_settings().await?;
        Ok(self.cache.subscribe())
    }

    /// Sync lifecycle and error events for non-blocking UI feedback
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.coordinator.subscribe_events()
    }

    /// The push pipeline's current phase
    pub fn subscribe_sync_phase(&self) -> watch::Receiver<SyncPhase> {
        self.coordinator.subscribe_phase()
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Validate and apply one section update. Returns once local persistence
    /// succeeds; remote convergence happens in the background.
    pub async fn update_section(&self, update: SectionUpdate) -> Result<(), PreferenceError> {
        let violations = update.validate();
        if !violations.is_empty() {
            return Err(PreferenceError::Validation(violations));
        }
        let section = update.section();

        let updated = {
            let _guard = self.doc_lock.lock().await;
            let mut doc = self.load_or_create_default_locked()?;
            doc.apply(update.clone());
            doc.touch();
            doc.sync_status = SyncStatus::Pending;

            // Re-check the whole document; cross-section state must never
            // reach the cache or the remote store invalid
            let violations = doc.validate();
            if !violations.is_empty() {
                return Err(PreferenceError::Validation(violations));
            }

            self.persist_with_retry(&doc, "update")?;
            self.cache.put(&self.user_id, doc.clone()).await;
            doc
        };

        log::info!(
            "updated {} preferences for {}",
            section.as_str(),
            self.user_id
        );

        if let SectionUpdate::Notifications(ref prefs) = update {
            if let Some(scheduler) = &self.scheduler {
                if let Err(e) = scheduler.reschedule(prefs).await {
                    log::warn!("notification rescheduling for {} failed: {}", self.user_id, e);
                }
            }
        }

        self.backups.create_automatic(&updated);
        self.coordinator.enqueue_push(updated).await;
        Ok(())
    }

    pub async fn update_unit_preferences(&self, prefs: UnitPreferences) -> Result<(), PreferenceError> {
        self.update_section(SectionUpdate::Units(prefs)).await
    }

    pub async fn update_notification_preferences(
        &self,
        prefs: NotificationPreferences,
    ) -> Result<(), PreferenceError> {
        self.update_section(SectionUpdate::Notifications(prefs)).await
    }

    pub async fn update_cycle_preferences(&self, prefs: CyclePreferences) -> Result<(), PreferenceError> {
        self.update_section(SectionUpdate::Cycle(prefs)).await
    }

    pub async fn update_privacy_preferences(
        &self,
        prefs: PrivacyPreferences,
    ) -> Result<(), PreferenceError> {
        self.update_section(SectionUpdate::Privacy(prefs)).await
    }

    pub async fn update_display_preferences(
        &self,
        prefs: DisplayPreferences,
    ) -> Result<(), PreferenceError> {
        self.update_section(SectionUpdate::Display(prefs)).await
    }

    pub async fn update_sync_preferences(&self, prefs: SyncPreferences) -> Result<(), PreferenceError> {
        self.update_section(SectionUpdate::Sync(prefs)).await
    }

    /// Reset every section to defaults, optionally carrying the units
    /// section forward. Always succeeds locally.
    pub async fn reset_to_defaults(
        &self,
        preserve_unit_preferences: bool,
    ) -> Result<PreferenceDocument, PreferenceError> {
        let doc = {
            let _guard = self.doc_lock.lock().await;
            let current = self.load_or_create_default_locked()?;

            let mut fresh = PreferenceDocument::new_default(&self.user_id);
            if preserve_unit_preferences {
                fresh.units = current.units.clone();
            }
            // Continue the existing modification history so the reset wins
            // over older states on other devices
            fresh.last_modified = current.last_modified;
            fresh.write_counter = current.write_counter;
            fresh.touch();
            fresh.sync_status = SyncStatus::Pending;

            self.persist_with_retry(&fresh, "reset")?;
            self.cache.put(&self.user_id, fresh.clone()).await;
            fresh
        };

        log::info!(
            "reset settings for {} (units preserved: {})",
            self.user_id,
            preserve_unit_preferences
        );
        self.backups.create_automatic(&doc);
        self.coordinator.enqueue_push(doc.clone()).await;
        Ok(doc)
    }

    // ------------------------------------------------------------------------
    // Export / Import / Backup
    // ------------------------------------------------------------------------

    /// Versioned JSON export of the current settings
    pub async fn export_snapshot(&self, include_metadata: bool) -> Result<String, PreferenceError> {
        // Guarantees a document exists to export
        self.get_settings().await?;
        self.backups
            .export_settings(&self.user_id, include_metadata)
            .map_err(map_backup_error)
    }

    /// Import a previously exported snapshot. Revalidates before applying
    /// and queues a push so other devices converge.
    pub async fn import_snapshot(
        &self,
        data: &str,
        strategy: ImportMergeStrategy,
    ) -> Result<PreferenceDocument, PreferenceError> {
        let export = self.backups.parse_export(data).map_err(map_backup_error)?;
        let imported = export.document;

        if imported.user_id != self.user_id {
            return Err(PreferenceError::Backup(format!(
                "snapshot belongs to user {}, not {}",
                imported.user_id, self.user_id
            )));
        }

        let violations = imported.validate();
        if !violations.is_empty() {
            return Err(PreferenceError::Validation(violations));
        }

        let doc = {
            let _guard = self.doc_lock.lock().await;
            let current = self.load_or_create_default_locked()?;

            let mut merged = match strategy {
                ImportMergeStrategy::Replace => imported,
                ImportMergeStrategy::PreferNewer => {
                    let decision = resolver::resolve(&current, &imported);
                    if decision.strategy == ResolutionStrategy::ManualRequired {
                        return Err(PreferenceError::Conflict(decision.reason));
                    }
                    decision.winner
                }
                ImportMergeStrategy::MergeSections => {
                    resolver::merge_sections(&current, &imported).winner
                }
            };

            // The import is a fresh local mutation on this device
            merged.user_id = self.user_id.clone();
            if merged.last_modified < current.last_modified {
                merged.last_modified = current.last_modified;
            }
            merged.write_counter = merged.write_counter.max(current.write_counter);
            merged.touch();
            merged.sync_status = SyncStatus::Pending;

            let violations = merged.validate();
            if !violations.is_empty() {
                return Err(PreferenceError::Validation(violations));
            }

            self.persist_with_retry(&merged, "import")?;
            self.cache.put(&self.user_id, merged.clone()).await;
            merged
        };

        log::info!("imported settings snapshot for {}", self.user_id);
        self.backups.create_automatic(&doc);
        self.coordinator.enqueue_push(doc.clone()).await;
        Ok(doc)
    }

    /// Restore settings on a freshly installed device; see
    /// [`BackupManager::restore_on_new_device`] for the source order.
    pub async fn restore_on_new_device(
        &self,
        data: Option<&str>,
    ) -> Result<PreferenceDocument, PreferenceError> {
        let restored = self
            .backups
            .restore_on_new_device(&self.user_id, data)
            .await
            .map_err(map_backup_error)?;

        let doc = {
            let _guard = self.doc_lock.lock().await;
            let mut doc = restored;
            doc.sync_status = SyncStatus::Pending;
            self.persist_with_retry(&doc, "restore")?;
            self.cache.put(&self.user_id, doc.clone()).await;
            doc
        };

        log::info!("restored settings for {} on this device", self.user_id);
        self.backups.create_automatic(&doc);
        self.coordinator.enqueue_push(doc.clone()).await;
        Ok(doc)
    }

    pub async fn create_manual_backup(&self) -> Result<i64, PreferenceError> {
        self.get_settings().await?;
        self.backups
            .create_manual(&self.user_id)
            .map_err(map_backup_error)
    }

    pub fn list_backups(&self, limit: usize) -> Result<Vec<BackupRecord>, PreferenceError> {
        self.backups
            .list_backups(&self.user_id, limit)
            .map_err(map_backup_error)
    }

    pub fn cleanup_old_backups(&self, keep_count: usize) -> Result<usize, PreferenceError> {
        self.backups
            .cleanup_old_backups(&self.user_id, keep_count)
            .map_err(map_backup_error)
    }

    // ------------------------------------------------------------------------
    // Sync control
    // ------------------------------------------------------------------------

    /// Explicit refresh: pull the remote document through the resolver
    pub async fn refresh(&self) -> Result<PullOutcome, PreferenceError> {
        self.coordinator.pull().await
    }

    /// Wait for connectivity, then make one push attempt for unsynced state
    pub async fn recover_from_sync_failure(&self) -> Result<(), PreferenceError> {
        self.coordinator.recover_from_sync_failure().await
    }

    /// Stop background sync and drop cached state. Pending writes stay
    /// `Pending` in the local store and will be pushed after the next start.
    pub async fn sign_out(&self) {
        self.coordinator.stop().await;
        self.cache.invalidate_all().await;
        log::info!("signed out {}", self.user_id);
    }

    // ------------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------------

    /// Load the stored document or persist defaults; caller holds the lock
    fn load_or_create_default_locked(&self) -> Result<PreferenceDocument, PreferenceError> {
        match self
            .local
            .load_document(&self.user_id)
            .map_err(|e| PreferenceError::persistence("load", e))?
        {
            Some(doc) => Ok(doc),
            None => {
                let doc = PreferenceDocument::new_default(&self.user_id);
                self.persist_with_retry(&doc, "initialize")?;
                log::info!("created default settings for {}", self.user_id);
                Ok(doc)
            }
        }
    }

    /// Local saves retry a small bounded number of times before surfacing
    fn persist_with_retry(
        &self,
        doc: &PreferenceDocument,
        operation: &str,
    ) -> Result<(), PreferenceError> {
        let attempts = self.config.persistence_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.local.save_document(doc) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "local save ({}) attempt {}/{} for {} failed: {}",
                        operation,
                        attempt,
                        attempts,
                        self.user_id,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(PreferenceError::Persistence {
            operation: operation.to_string(),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

fn map_backup_error(err: BackupError) -> PreferenceError {
    match err {
        BackupError::IncompatibleSchema { found, supported } => {
            PreferenceError::IncompatibleSchema { found, supported }
        }
        other => PreferenceError::Backup(other.to_string()),
    }
}
