//! Conflict Resolution
//!
//! Pure comparison of a local and a remote preference document. The resolver
//! only decides; the caller persists the winner and updates the sync status.
//!
//! Ordering across devices is defined by `last_modified`. When timestamps
//! collide (clock skew, simultaneous writes), two deterministic tiebreaks
//! keep every device converging on the same winner without coordination:
//! the per-user write counter first, the content fingerprint second. The one
//! exception is the privacy section: a disagreement there at identical
//! timestamps is never resolved silently.

use crate::models::PreferenceDocument;

/// How a conflict was (or was not) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    LocalWins,
    RemoteWins,
    FieldMerge,
    ManualRequired,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::LocalWins => "local_wins",
            ResolutionStrategy::RemoteWins => "remote_wins",
            ResolutionStrategy::FieldMerge => "field_merge",
            ResolutionStrategy::ManualRequired => "manual_required",
        }
    }
}

/// Output of [`resolve`]: the winning document plus the reasoning
#[derive(Debug, Clone)]
pub struct ConflictDecision {
    pub winner: PreferenceDocument,
    pub strategy: ResolutionStrategy,
    pub reason: String,
}

/// Compare local and remote versions of a settings document.
///
/// Deterministic and order-independent: for documents with equal timestamps
/// and non-sensitive differences, `resolve(a, b)` and `resolve(b, a)` agree
/// on the winner.
pub fn resolve(local: &PreferenceDocument, remote: &PreferenceDocument) -> ConflictDecision {
    let local_ts = local.last_modified.to_rfc3339();
    let remote_ts = remote.last_modified.to_rfc3339();

    if remote.last_modified > local.last_modified {
        return ConflictDecision {
            winner: remote.clone(),
            strategy: ResolutionStrategy::LastWriteWins,
            reason: format!(
                "remote modified at {} is newer than local {}",
                remote_ts, local_ts
            ),
        };
    }

    if local.last_modified > remote.last_modified {
        // The caller must still schedule a push so the remote converges
        return ConflictDecision {
            winner: local.clone(),
            strategy: ResolutionStrategy::LastWriteWins,
            reason: format!(
                "local modified at {} is newer than remote {}",
                local_ts, remote_ts
            ),
        };
    }

    if local.sections_equal(remote) {
        return ConflictDecision {
            winner: local.clone(),
            strategy: ResolutionStrategy::LocalWins,
            reason: format!("documents are identical at {}", local_ts),
        };
    }

    // Equal timestamps with differing content: clock skew or a simultaneous
    // write on two devices.
    if local.privacy != remote.privacy {
        return ConflictDecision {
            winner: local.clone(),
            strategy: ResolutionStrategy::ManualRequired,
            reason: format!(
                "privacy settings differ at identical timestamp {} (local counter {}, remote counter {})",
                local_ts, local.write_counter, remote.write_counter
            ),
        };
    }

    if local.write_counter != remote.write_counter {
        let local_wins = local.write_counter > remote.write_counter;
        let winner = if local_wins { local } else { remote };
        return ConflictDecision {
            winner: winner.clone(),
            strategy: ResolutionStrategy::LastWriteWins,
            reason: format!(
                "timestamps equal at {}; write counter tiebreak ({} vs {})",
                local_ts, local.write_counter, remote.write_counter
            ),
        };
    }

    // Same timestamp, same counter: fall back to the content fingerprint,
    // which is identical on every device for identical content.
    let local_fp = local.content_fingerprint();
    let remote_fp = remote.content_fingerprint();
    let winner = if local_fp > remote_fp { local } else { remote };
    ConflictDecision {
        winner: winner.clone(),
        strategy: ResolutionStrategy::LastWriteWins,
        reason: format!(
            "timestamps and counters equal at {}; content fingerprint tiebreak",
            local_ts
        ),
    }
}

/// Merge an imported document into the current one, section by section:
/// every imported section that differs from its default replaces the current
/// value, everything else is kept. Used by snapshot import.
pub fn merge_sections(
    current: &PreferenceDocument,
    imported: &PreferenceDocument,
) -> ConflictDecision {
    let mut merged = current.clone();
    let mut taken: Vec<&str> = Vec::new();

    if imported.units != Default::default() {
        merged.units = imported.units.clone();
        taken.push("units");
    }
    if imported.notifications != Default::default() {
        merged.notifications = imported.notifications.clone();
        taken.push("notifications");
    }
    if imported.cycle != Default::default() {
        merged.cycle = imported.cycle.clone();
        taken.push("cycle");
    }
    if imported.privacy != Default::default() {
        merged.privacy = imported.privacy.clone();
        taken.push("privacy");
    }
    if imported.display != Default::default() {
        merged.display = imported.display.clone();
        taken.push("display");
    }
    if imported.sync != Default::default() {
        merged.sync = imported.sync.clone();
        taken.push("sync");
    }

    let reason = if taken.is_empty() {
        "imported document matches defaults; nothing merged".to_string()
    } else {
        format!("merged imported sections: {}", taken.join(", "))
    };

    ConflictDecision {
        winner: merged,
        strategy: ResolutionStrategy::FieldMerge,
        reason,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PreferenceDocument, TemperatureUnit};
    use chrono::{TimeZone, Utc};

    fn doc_at(ts_secs: i64, counter: i64) -> PreferenceDocument {
        let mut doc = PreferenceDocument::new_default("user-1");
        doc.last_modified = Utc.timestamp_opt(ts_secs, 0).unwrap();
        doc.write_counter = counter;
        doc
    }

    #[test]
    fn test_newer_remote_wins() {
        let local = doc_at(100, 3);
        let mut remote = doc_at(200, 1);
        remote.units.temperature = TemperatureUnit::Fahrenheit;

        let decision = resolve(&local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(decision.winner.units.temperature, TemperatureUnit::Fahrenheit);
        assert!(decision.reason.contains(&local.last_modified.to_rfc3339()));
        assert!(decision.reason.contains(&remote.last_modified.to_rfc3339()));
    }

    #[test]
    fn test_newer_local_wins() {
        let mut local = doc_at(300, 2);
        local.cycle.average_cycle_length = 30;
        let remote = doc_at(200, 5);

        let decision = resolve(&local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(decision.winner.cycle.average_cycle_length, 30);
    }

    #[test]
    fn test_identical_documents_keep_local() {
        let local = doc_at(100, 1);
        let remote = doc_at(100, 1);

        let decision = resolve(&local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::LocalWins);
    }

    #[test]
    fn test_equal_timestamps_counter_tiebreak() {
        let mut local = doc_at(100, 7);
        local.cycle.average_cycle_length = 30;
        let mut remote = doc_at(100, 4);
        remote.cycle.average_cycle_length = 32;

        let decision = resolve(&local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(decision.winner.cycle.average_cycle_length, 30);
    }

    #[test]
    fn test_resolution_is_order_independent() {
        let mut a = doc_at(100, 2);
        a.cycle.average_cycle_length = 30;
        let mut b = doc_at(100, 2);
        b.cycle.average_cycle_length = 32;

        let ab = resolve(&a, &b);
        let ba = resolve(&b, &a);
        assert_eq!(
            ab.winner.content_fingerprint(),
            ba.winner.content_fingerprint()
        );
        assert_eq!(ab.strategy, ba.strategy);
    }

    #[test]
    fn test_privacy_disagreement_requires_manual_resolution() {
        let mut local = doc_at(100, 2);
        local.privacy.require_app_lock = true;
        let mut remote = doc_at(100, 5);
        remote.privacy.share_anonymous_analytics = true;

        let decision = resolve(&local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::ManualRequired);
    }

    #[test]
    fn test_privacy_difference_with_newer_timestamp_still_lww() {
        // Timestamps differ, so ordinary last-write-wins applies even to the
        // sensitive section
        let mut local = doc_at(100, 2);
        local.privacy.require_app_lock = true;
        let remote = doc_at(200, 1);

        let decision = resolve(&local, &remote);
        assert_eq!(decision.strategy, ResolutionStrategy::LastWriteWins);
        assert!(!decision.winner.privacy.require_app_lock);
    }

    #[test]
    fn test_merge_sections_takes_non_default_imported() {
        let current = doc_at(100, 1);
        let mut imported = doc_at(50, 0);
        imported.units.temperature = TemperatureUnit::Fahrenheit;

        let decision = merge_sections(&current, &imported);
        assert_eq!(decision.strategy, ResolutionStrategy::FieldMerge);
        assert_eq!(decision.winner.units.temperature, TemperatureUnit::Fahrenheit);
        // Untouched sections stay on the current document's values
        assert_eq!(decision.winner.cycle, current.cycle);
        assert!(decision.reason.contains("units"));
    }
}
