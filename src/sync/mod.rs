//! Sync Module - Cross-Device Preference Synchronization
//!
//! Keeps one user's settings consistent between this device and the remote
//! store:
//! - Offline-first: every write lands locally, remote convergence follows
//! - Deterministic conflict resolution (last-write-wins plus tiebreaks)
//! - Retry with exponential backoff, gated on a connectivity signal
//! - A single-slot pending queue that collapses superseded writes

pub mod api;
pub mod connectivity;
pub mod coordinator;
pub mod resolver;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use api::{HttpRemoteStore, RemoteError, RemoteStore};
pub use connectivity::ConnectivityMonitor;
pub use coordinator::{PullOutcome, RetryPolicy, SyncCoordinator, SyncEvent, SyncPhase};
pub use resolver::{merge_sections, resolve, ConflictDecision, ResolutionStrategy};
