//! Error Taxonomy - Typed Failure Categories
//!
//! Classifies every failure the engine can surface:
//! - Validation errors list every violated field, never just the first
//! - Persistence errors cover local I/O on the synchronous write path
//! - Sync errors carry a retry classification and a user-presentable reason
//! - Conflict errors appear only when resolution requires the user
//!
//! Module-level error enums (`DbError`, `RemoteError`, `BackupError`) convert
//! into this taxonomy at the facade boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A single violated constraint on one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Direction of a remote sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Push,
    Pull,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Push => "push",
            SyncOperation::Pull => "pull",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a sync operation failed, at the granularity the UI presents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailureReason {
    /// The device could not reach the remote store at all
    NoConnectivity,
    /// The remote store answered and refused the operation
    RemoteRejected,
    /// Local state could not be read or written while syncing
    LocalCorruption,
}

impl SyncFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFailureReason::NoConnectivity => "no connectivity",
            SyncFailureReason::RemoteRejected => "remote rejected",
            SyncFailureReason::LocalCorruption => "local corruption",
        }
    }
}

impl fmt::Display for SyncFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate-level error taxonomy returned by the preference store facade
#[derive(Debug, Error)]
pub enum PreferenceError {
    /// Input failed structural validation; lists every violated field
    #[error("validation failed: {} field(s) invalid", .0.len())]
    Validation(Vec<FieldViolation>),

    /// Local persistence failed after bounded retries
    #[error("local persistence failed during {operation}: {message}")]
    Persistence { operation: String, message: String },

    /// A push or pull against the remote store failed
    #[error("sync {operation} failed ({reason}): {message}")]
    Sync {
        operation: SyncOperation,
        reason: SyncFailureReason,
        retryable: bool,
        message: String,
    },

    /// Conflict resolution requires the user to decide
    #[error("settings conflict requires manual resolution: {0}")]
    Conflict(String),

    /// Backup or snapshot handling failed
    #[error("backup error: {0}")]
    Backup(String),

    /// An imported snapshot was written by a newer schema
    #[error("incompatible settings export: schema version {found}, supported up to {supported}")]
    IncompatibleSchema { found: u32, supported: u32 },
}

impl PreferenceError {
    pub fn persistence(operation: &str, source: impl fmt::Display) -> Self {
        PreferenceError::Persistence {
            operation: operation.to_string(),
            message: source.to_string(),
        }
    }

    /// Whether retrying the same call can succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            PreferenceError::Validation(_) => false,
            PreferenceError::Persistence { .. } => true,
            PreferenceError::Sync { retryable, .. } => *retryable,
            PreferenceError::Conflict(_) => false,
            PreferenceError::Backup(_) => false,
            PreferenceError::IncompatibleSchema { .. } => false,
        }
    }

    /// Formats the violation list for display, one violation per line
    pub fn violation_summary(&self) -> Option<String> {
        match self {
            PreferenceError::Validation(violations) => Some(
                violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
