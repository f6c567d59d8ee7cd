//! Preference Data Models
//!
//! Defines the settings aggregate synchronized across devices:
//! - PreferenceDocument: the full per-user settings document
//! - Six independent preference sections (units, notifications, cycle,
//!   privacy, display, sync policy)
//! - SyncStatus: the document's position in the sync state machine
//! - SectionUpdate: a validated write to exactly one section
//!
//! Every local mutation goes through [`PreferenceDocument::touch`], which
//! keeps `last_modified` strictly increasing and bumps the per-user write
//! counter used as the conflict tiebreak.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FieldViolation;

/// Current version of the document / export schema
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Sync Status
// ============================================================================

/// Where the document stands relative to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Conflicted,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => SyncStatus::Synced,
            "conflicted" => SyncStatus::Conflicted,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }
}

// ============================================================================
// Preference Sections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    Kilograms,
    Pounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeightUnit {
    Centimeters,
    Feet,
}

/// Measurement units used across the app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPreferences {
    pub temperature: TemperatureUnit,
    pub weight: WeightUnit,
    pub height: HeightUnit,
}

impl Default for UnitPreferences {
    fn default() -> Self {
        Self {
            temperature: TemperatureUnit::Celsius,
            weight: WeightUnit::Kilograms,
            height: HeightUnit::Centimeters,
        }
    }
}

/// Reminder configuration; actual OS registration happens outside this crate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub enabled: bool,
    pub daily_log_reminder: bool,
    /// Hour of day for the daily log reminder (0-23)
    pub reminder_hour: u8,
    /// Minute for the daily log reminder (0-59)
    pub reminder_minute: u8,
    pub period_reminder: bool,
    /// Days before the predicted period start (0-7)
    pub period_reminder_days_before: u8,
    pub ovulation_reminder: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_log_reminder: true,
            reminder_hour: 20,
            reminder_minute: 0,
            period_reminder: true,
            period_reminder_days_before: 2,
            ovulation_reminder: false,
        }
    }
}

impl NotificationPreferences {
    pub fn validate(&self, violations: &mut Vec<FieldViolation>) {
        if self.reminder_hour > 23 {
            violations.push(FieldViolation::new(
                "notifications.reminder_hour",
                "must be between 0 and 23",
            ));
        }
        if self.reminder_minute > 59 {
            violations.push(FieldViolation::new(
                "notifications.reminder_minute",
                "must be between 0 and 59",
            ));
        }
        if self.period_reminder_days_before > 7 {
            violations.push(FieldViolation::new(
                "notifications.period_reminder_days_before",
                "must be between 0 and 7",
            ));
        }
    }
}

/// Cycle model parameters used for predictions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CyclePreferences {
    /// Average cycle length in days (21-45)
    pub average_cycle_length: u8,
    /// Average period length in days (2-10)
    pub average_period_length: u8,
    /// Luteal phase length in days (at least 6, strictly shorter than the cycle)
    pub luteal_phase_length: u8,
    pub track_ovulation: bool,
}

impl Default for CyclePreferences {
    fn default() -> Self {
        Self {
            average_cycle_length: 28,
            average_period_length: 5,
            luteal_phase_length: 14,
            track_ovulation: true,
        }
    }
}

impl CyclePreferences {
    pub fn validate(&self, violations: &mut Vec<FieldViolation>) {
        if !(21..=45).contains(&self.average_cycle_length) {
            violations.push(FieldViolation::new(
                "cycle.average_cycle_length",
                "must be between 21 and 45 days",
            ));
        }
        if !(2..=10).contains(&self.average_period_length) {
            violations.push(FieldViolation::new(
                "cycle.average_period_length",
                "must be between 2 and 10 days",
            ));
        }
        if self.luteal_phase_length < 6 {
            violations.push(FieldViolation::new(
                "cycle.luteal_phase_length",
                "must be at least 6 days",
            ));
        }
        if self.luteal_phase_length >= self.average_cycle_length {
            violations.push(FieldViolation::new(
                "cycle.luteal_phase_length",
                "must be shorter than the average cycle length",
            ));
        }
    }
}

/// User-sensitive section; conflicts here are never resolved silently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPreferences {
    pub require_app_lock: bool,
    pub hide_in_app_switcher: bool,
    pub share_anonymous_analytics: bool,
    pub allow_health_export: bool,
}

impl Default for PrivacyPreferences {
    fn default() -> Self {
        Self {
            require_app_lock: false,
            hide_in_app_switcher: false,
            share_anonymous_analytics: false,
            allow_health_export: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    Monday,
    Sunday,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPreferences {
    pub theme: Theme,
    pub week_start: WeekStart,
    /// Language tag, e.g. "en" or "de"
    pub language: String,
    pub show_predictions: bool,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            week_start: WeekStart::Monday,
            language: "en".to_string(),
            show_predictions: true,
        }
    }
}

impl DisplayPreferences {
    pub fn validate(&self, violations: &mut Vec<FieldViolation>) {
        if self.language.trim().is_empty() {
            violations.push(FieldViolation::new(
                "display.language",
                "must not be empty",
            ));
        }
    }
}

/// Sync policy for this user's settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPreferences {
    pub auto_sync: bool,
    pub wifi_only: bool,
    /// Minutes between automatic syncs (5-1440)
    pub sync_interval_minutes: u32,
}

impl Default for SyncPreferences {
    fn default() -> Self {
        Self {
            auto_sync: true,
            wifi_only: false,
            sync_interval_minutes: 30,
        }
    }
}

impl SyncPreferences {
    pub fn validate(&self, violations: &mut Vec<FieldViolation>) {
        if !(5..=1440).contains(&self.sync_interval_minutes) {
            violations.push(FieldViolation::new(
                "sync.sync_interval_minutes",
                "must be between 5 and 1440 minutes",
            ));
        }
    }
}

// ============================================================================
// Section Updates
// ============================================================================

/// Names one section of the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceSection {
    Units,
    Notifications,
    Cycle,
    Privacy,
    Display,
    Sync,
}

impl PreferenceSection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceSection::Units => "units",
            PreferenceSection::Notifications => "notifications",
            PreferenceSection::Cycle => "cycle",
            PreferenceSection::Privacy => "privacy",
            PreferenceSection::Display => "display",
            PreferenceSection::Sync => "sync",
        }
    }
}

/// A replacement value for exactly one section
#[derive(Debug, Clone, PartialEq)]
pub enum SectionUpdate {
    Units(UnitPreferences),
    Notifications(NotificationPreferences),
    Cycle(CyclePreferences),
    Privacy(PrivacyPreferences),
    Display(DisplayPreferences),
    Sync(SyncPreferences),
}

impl SectionUpdate {
    pub fn section(&self) -> PreferenceSection {
        match self {
            SectionUpdate::Units(_) => PreferenceSection::Units,
            SectionUpdate::Notifications(_) => PreferenceSection::Notifications,
            SectionUpdate::Cycle(_) => PreferenceSection::Cycle,
            SectionUpdate::Privacy(_) => PreferenceSection::Privacy,
            SectionUpdate::Display(_) => PreferenceSection::Display,
            SectionUpdate::Sync(_) => PreferenceSection::Sync,
        }
    }

    /// Validates the new section value in isolation
    pub fn validate(&self) -> Vec<FieldViolation> {
        let mut violations = Vec::new();
        match self {
            SectionUpdate::Units(_) => {}
            SectionUpdate::Notifications(n) => n.validate(&mut violations),
            SectionUpdate::Cycle(c) => c.validate(&mut violations),
            SectionUpdate::Privacy(_) => {}
            SectionUpdate::Display(d) => d.validate(&mut violations),
            SectionUpdate::Sync(s) => s.validate(&mut violations),
        }
        violations
    }
}

// ============================================================================
// Preference Document
// ============================================================================

/// The full settings aggregate for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceDocument {
    pub schema_version: u32,
    pub user_id: String,
    pub units: UnitPreferences,
    pub notifications: NotificationPreferences,
    pub cycle: CyclePreferences,
    pub privacy: PrivacyPreferences,
    pub display: DisplayPreferences,
    pub sync: SyncPreferences,
    /// Wall-clock timestamp of the last local mutation; strictly increasing
    pub last_modified: DateTime<Utc>,
    /// Per-user monotonic write counter; secondary conflict tiebreak
    pub write_counter: i64,
    pub sync_status: SyncStatus,
}

impl PreferenceDocument {
    /// A fully defaulted document for a user who has never saved settings
    pub fn new_default(user_id: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            user_id: user_id.to_string(),
            units: UnitPreferences::default(),
            notifications: NotificationPreferences::default(),
            cycle: CyclePreferences::default(),
            privacy: PrivacyPreferences::default(),
            display: DisplayPreferences::default(),
            sync: SyncPreferences::default(),
            last_modified: Utc::now(),
            write_counter: 0,
            sync_status: SyncStatus::Pending,
        }
    }

    /// Stamps a local mutation: `last_modified` strictly increases even when
    /// the wall clock does not, and the write counter advances.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_modified = if now > self.last_modified {
            now
        } else {
            self.last_modified + Duration::milliseconds(1)
        };
        self.write_counter += 1;
    }

    /// Replaces one section with a new value
    pub fn apply(&mut self, update: SectionUpdate) {
        match update {
            SectionUpdate::Units(v) => self.units = v,
            SectionUpdate::Notifications(v) => self.notifications = v,
            SectionUpdate::Cycle(v) => self.cycle = v,
            SectionUpdate::Privacy(v) => self.privacy = v,
            SectionUpdate::Display(v) => self.display = v,
            SectionUpdate::Sync(v) => self.sync = v,
        }
    }

    /// Structural validation across all sections; returns every violation
    pub fn validate(&self) -> Vec<FieldViolation> {
        let mut violations = Vec::new();
        if self.user_id.trim().is_empty() {
            violations.push(FieldViolation::new("user_id", "must not be empty"));
        }
        if self.schema_version > SCHEMA_VERSION {
            violations.push(FieldViolation::new(
                "schema_version",
                "newer than this app supports",
            ));
        }
        self.notifications.validate(&mut violations);
        self.cycle.validate(&mut violations);
        self.display.validate(&mut violations);
        self.sync.validate(&mut violations);
        violations
    }

    /// True when every section matches, ignoring sync bookkeeping
    pub fn sections_equal(&self, other: &Self) -> bool {
        self.units == other.units
            && self.notifications == other.notifications
            && self.cycle == other.cycle
            && self.privacy == other.privacy
            && self.display == other.display
            && self.sync == other.sync
    }

    /// Deterministic SHA-256 fingerprint of the section content only.
    /// Identical section values always hash identically, regardless of
    /// timestamps, counters, or sync status.
    pub fn content_fingerprint(&self) -> String {
        let sections = (
            &self.units,
            &self.notifications,
            &self.cycle,
            &self.privacy,
            &self.display,
            &self.sync,
        );
        let bytes = serde_json::to_vec(&sections).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

// ============================================================================
// Device Identity
// ============================================================================

/// Platform identifier included in export metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    MacOS,
    Windows,
    Linux,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        #[cfg(target_os = "ios")]
        return Platform::Ios;

        #[cfg(target_os = "android")]
        return Platform::Android;

        #[cfg(target_os = "macos")]
        return Platform::MacOS;

        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(not(any(
            target_os = "ios",
            target_os = "android",
            target_os = "macos",
            target_os = "windows"
        )))]
        return Platform::Linux;
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::MacOS => "macos",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
        }
    }
}

/// Get default device name from hostname
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("{} Device", Platform::current().as_str()))
}

// ============================================================================
// Tests
// ============================================================================
