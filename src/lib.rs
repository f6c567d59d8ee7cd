//! # Eunio Preferences
//!
//! Offline-first settings synchronization engine for the Eunio health app.
//!
//! The [`store::PreferenceStore`] facade is the single entry point: it
//! composes a mutex-guarded TTL cache, SQLite persistence, a background sync
//! coordinator with retry and backoff, and automatic backup snapshots.
//! Writes always succeed locally and converge with the remote store later;
//! multi-device conflicts resolve deterministically through last-write-wins
//! with a write-counter tiebreak.

pub mod backup;
pub mod cache;
pub mod db;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

pub use backup::{BackupKind, BackupManager, BackupRecord, SettingsExport};
pub use cache::{CacheStats, PreferenceCache, DEFAULT_TTL};
pub use db::{Database, LocalStore, SqliteLocalStore};
pub use error::{FieldViolation, PreferenceError, SyncFailureReason, SyncOperation};
pub use models::{
    CyclePreferences, DisplayPreferences, NotificationPreferences, PreferenceDocument,
    PreferenceSection, PrivacyPreferences, SectionUpdate, SyncPreferences, SyncStatus,
    UnitPreferences, SCHEMA_VERSION,
};
pub use store::{
    ImportMergeStrategy, NotificationScheduler, PreferenceStore, RescheduleError, StoreConfig,
};
pub use sync::{
    ConflictDecision, ConnectivityMonitor, HttpRemoteStore, PullOutcome, RemoteError, RemoteStore,
    ResolutionStrategy, RetryPolicy, SyncEvent, SyncPhase,
};
