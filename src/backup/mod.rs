//! Backup Module - Snapshot Management, Export & Restore
//!
//! Keeps a per-user history of preference snapshots:
//! - Automatic snapshots after every successful mutation (fire-and-forget)
//! - Manual backups and versioned JSON export/import
//! - Restore on a new device from an explicit payload, the remote store,
//!   or the most recent local snapshot
//! - Count-based retention (default: keep the 10 most recent per user)
//! - SHA-256 integrity hashes over every stored payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::Database;
use crate::error::FieldViolation;
use crate::models::{
    default_device_name, Platform, PreferenceDocument, SCHEMA_VERSION,
};
use crate::sync::api::RemoteStore;

/// Snapshots kept per user unless configured otherwise
pub const DEFAULT_KEEP_COUNT: usize = 10;

// ============================================================================
// Types & Structures
// ============================================================================

/// What produced a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Automatic,
    Manual,
    Export,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Automatic => "automatic",
            BackupKind::Manual => "manual",
            BackupKind::Export => "export",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "automatic" => Ok(BackupKind::Automatic),
            "manual" => Ok(BackupKind::Manual),
            "export" => Ok(BackupKind::Export),
            _ => Err(format!("Invalid backup kind: {}", s)),
        }
    }
}

/// An immutable snapshot of one user's settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: i64,
    pub user_id: String,
    pub kind: BackupKind,
    pub payload: String,
    pub payload_hash: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// The versioned export wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsExport {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExportMetadata>,
    pub document: PreferenceDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub device_id: String,
    pub device_name: String,
    pub platform: Platform,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No stored settings for user {0}")]
    NothingToBackUp(String),

    #[error("No backup available for user {0}")]
    NoBackupAvailable(String),

    #[error("Snapshot integrity check failed - backup may be corrupted")]
    IntegrityCheckFailed,

    #[error("Incompatible export schema version {found} (supported up to {supported})")]
    IncompatibleSchema { found: u32, supported: u32 },

    #[error("Invalid backup payload: {0}")]
    InvalidPayload(String),
}

// ============================================================================
// Backup Manager
// ============================================================================

/// Owns backup records for every user of this install
#[derive(Clone)]
pub struct BackupManager {
    db: Database,
    remote: Arc<dyn RemoteStore>,
    keep_count: usize,
}

impl BackupManager {
    pub fn new(db: Database, remote: Arc<dyn RemoteStore>, keep_count: usize) -> Self {
        Self {
            db,
            remote,
            keep_count,
        }
    }

    /// Snapshot a just-persisted document in the background. Never fails the
    /// mutation that triggered it; problems are logged only.
    pub fn create_automatic(&self, doc: &PreferenceDocument) {
        let manager = self.clone();
        let doc = doc.clone();
        tokio::spawn(async move {
            match manager.insert_snapshot(&doc, BackupKind::Automatic) {
                Ok(id) => log::debug!("automatic backup {} recorded for {}", id, doc.user_id),
                Err(e) => log::warn!("automatic backup for {} failed: {}", doc.user_id, e),
            }
            if let Err(e) = manager.cleanup_old_backups(&doc.user_id, manager.keep_count) {
                log::warn!("backup pruning for {} failed: {}", doc.user_id, e);
            }
        });
    }

    /// User-visible manual backup of the currently stored settings
    pub fn create_manual(&self, user_id: &str) -> Result<i64, BackupError> {
        let doc = self
            .db
            .load_document(user_id)
            .map_err(|e| BackupError::DatabaseError(e.to_string()))?
            .ok_or_else(|| BackupError::NothingToBackUp(user_id.to_string()))?;

        let id = self.insert_snapshot(&doc, BackupKind::Manual)?;
        log::info!("manual backup {} created for {}", id, user_id);
        Ok(id)
    }

    /// Serialize the current settings as a versioned export document
    pub fn export_settings(
        &self,
        user_id: &str,
        include_metadata: bool,
    ) -> Result<String, BackupError> {
        let doc = self
            .db
            .load_document(user_id)
            .map_err(|e| BackupError::DatabaseError(e.to_string()))?
            .ok_or_else(|| BackupError::NothingToBackUp(user_id.to_string()))?;

        let metadata = if include_metadata {
            let device_id = self
                .db
                .device_id()
                .map_err(|e| BackupError::DatabaseError(e.to_string()))?;
            Some(ExportMetadata {
                device_id,
                device_name: default_device_name(),
                platform: Platform::current(),
            })
        } else {
            None
        };

        let export = SettingsExport {
            schema_version: SCHEMA_VERSION,
            exported_at: Utc::now(),
            metadata,
            document: doc.clone(),
        };

        // Exports leave a record too, so the history shows when settings
        // left the device
        if let Err(e) = self.insert_snapshot(&doc, BackupKind::Export) {
            log::warn!("recording export snapshot for {} failed: {}", user_id, e);
        }

        serde_json::to_string_pretty(&export).map_err(|e| BackupError::Serialization(e.to_string()))
    }

    /// Parse and version-gate an export payload. Newer schema versions are
    /// rejected; the document is not validated here (the store revalidates
    /// before applying).
    pub fn parse_export(&self, data: &str) -> Result<SettingsExport, BackupError> {
        let export: SettingsExport =
            serde_json::from_str(data).map_err(|e| BackupError::InvalidPayload(e.to_string()))?;

        if export.schema_version > SCHEMA_VERSION {
            return Err(BackupError::IncompatibleSchema {
                found: export.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(export)
    }

    /// Resolve the document to restore on a new device: explicit payload
    /// first, then the remote store, then the newest local snapshot. The
    /// returned document is validated; existing local settings are never
    /// touched here, so a failed validation destroys nothing.
    pub async fn restore_on_new_device(
        &self,
        user_id: &str,
        data: Option<&str>,
    ) -> Result<PreferenceDocument, BackupError> {
        let doc = if let Some(data) = data {
            self.parse_export(data)?.document
        } else {
            match self.remote.pull_document(user_id).await {
                Ok(Some(doc)) => doc,
                Ok(None) => self.latest_local_document(user_id)?,
                Err(e) => {
                    log::warn!(
                        "remote restore for {} unavailable ({}), trying local snapshots",
                        user_id,
                        e
                    );
                    self.latest_local_document(user_id)?
                }
            }
        };

        if doc.user_id != user_id {
            return Err(BackupError::InvalidPayload(format!(
                "backup belongs to user {}, not {}",
                doc.user_id, user_id
            )));
        }

        let violations = doc.validate();
        if !violations.is_empty() {
            return Err(BackupError::InvalidPayload(format_violations(&violations)));
        }

        Ok(doc)
    }

    /// List backups for a user, newest first
    pub fn list_backups(&self, user_id: &str, limit: usize) -> Result<Vec<BackupRecord>, BackupError> {
        self.db
            .query(
                "SELECT id, user_id, kind, payload, payload_hash, size_bytes, created_at
                 FROM backups
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
                rusqlite::params![user_id, limit as i64],
                map_backup_row,
            )
            .map_err(|e| BackupError::DatabaseError(e.to_string()))
    }

    /// Deterministic pruning: keep the `keep_count` most recent snapshots by
    /// creation time, delete the rest. Running it twice in a row deletes
    /// nothing the second time.
    pub fn cleanup_old_backups(&self, user_id: &str, keep_count: usize) -> Result<usize, BackupError> {
        let deleted = self
            .db
            .execute(
                "DELETE FROM backups
                 WHERE user_id = ?1
                   AND id NOT IN (
                       SELECT id FROM backups
                       WHERE user_id = ?1
                       ORDER BY created_at DESC, id DESC
                       LIMIT ?2
                   )",
                rusqlite::params![user_id, keep_count as i64],
            )
            .map_err(|e| BackupError::DatabaseError(e.to_string()))?;

        if deleted > 0 {
            log::info!("pruned {} old backups for {}", deleted, user_id);
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------------

    fn insert_snapshot(
        &self,
        doc: &PreferenceDocument,
        kind: BackupKind,
    ) -> Result<i64, BackupError> {
        let payload =
            serde_json::to_string(doc).map_err(|e| BackupError::Serialization(e.to_string()))?;
        let payload_hash = compute_payload_hash(payload.as_bytes());

        self.db
            .execute_insert(
                "INSERT INTO backups (user_id, kind, payload, payload_hash, size_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    doc.user_id,
                    kind.as_str(),
                    payload,
                    payload_hash,
                    payload.len() as i64,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| BackupError::DatabaseError(e.to_string()))
    }

    /// The newest local snapshot, hash-verified and parsed
    fn latest_local_document(&self, user_id: &str) -> Result<PreferenceDocument, BackupError> {
        let record = self
            .list_backups(user_id, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NoBackupAvailable(user_id.to_string()))?;

        if compute_payload_hash(record.payload.as_bytes()) != record.payload_hash {
            return Err(BackupError::IntegrityCheckFailed);
        }

        serde_json::from_str(&record.payload)
            .map_err(|e| BackupError::InvalidPayload(e.to_string()))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn map_backup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: BackupKind::from_str(&row.get::<_, String>(2)?)
            .unwrap_or(BackupKind::Automatic),
        payload: row.get(3)?,
        payload_hash: row.get(4)?,
        size_bytes: row.get(5)?,
        created_at: row
            .get::<_, String>(6)?
            .parse()
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Compute SHA-256 hash of a payload
fn compute_payload_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Tests
// ============================================================================
