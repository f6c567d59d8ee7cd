//! Sync Coordinator - push/pull orchestration with retry and backoff
//!
//! Drives the document's sync state machine:
//!
//! ```text
//! Idle -> Pushing -> (synced | push failed)
//! push failed -> WaitingForNetwork -> Pushing
//! ```
//!
//! Pulling runs alongside the push pipeline and always funnels through the
//! conflict resolver before anything is applied.
//!
//! A single-slot pending queue holds at most the latest unsynced write;
//! superseded intermediate writes are dropped since only the final state
//! matters. Retryable failures schedule the same operation again with
//! exponential backoff, gated on the connectivity signal. Cancellation is
//! cooperative: the worker only stops at wait points, so an in-flight push
//! either completes or the document simply stays `Pending`.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::cache::PreferenceCache;
use crate::db::{DbError, LocalStore};
use crate::error::{PreferenceError, SyncFailureReason, SyncOperation};
use crate::models::{PreferenceDocument, SyncStatus};

use super::api::{RemoteError, RemoteStore};
use super::resolver::{self, ResolutionStrategy};

// ============================================================================
// Types
// ============================================================================

/// Where the push pipeline currently stands. Pulls run in parallel and are
/// reported through events rather than this phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Pushing,
    WaitingForNetwork,
}

/// Observable sync lifecycle events; the UI's non-blocking feedback channel
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PushStarted {
        attempt: u32,
    },
    PushSucceeded {
        at: DateTime<Utc>,
    },
    PushRetryScheduled {
        attempt: u32,
        delay: Duration,
        reason: SyncFailureReason,
    },
    PushFailed {
        reason: SyncFailureReason,
        attempts: u32,
        message: String,
    },
    PullApplied {
        strategy: ResolutionStrategy,
    },
    ConflictDetected {
        reason: String,
    },
}

/// Result of a pull that did not require manual resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The user has never pushed from any device
    NoRemoteData,
    Applied(ResolutionStrategy),
}

/// Exponential backoff parameters for push retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
    /// How long `recover_from_sync_failure` waits for connectivity
    pub recovery_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 5,
            recovery_wait: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): base * factor^(n-1),
    /// capped. Non-decreasing in `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(self.factor.saturating_pow(exp));
        delay.min(self.cap)
    }
}

/// The queued intent to push one document state
#[derive(Debug, Clone)]
struct PendingPush {
    document: PreferenceDocument,
    attempt: u32,
    next_eligible_at: DateTime<Utc>,
    last_error: Option<String>,
}

enum PushExit {
    /// Finished: success, fatal failure, or superseded by a newer write
    Done,
    /// Shutdown was requested mid-wait
    Cancelled,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates push/pull for one user's preference document
pub struct SyncCoordinator {
    inner: Arc<Inner>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    periodic: StdMutex<Option<JoinHandle<()>>>,
}

struct Inner {
    user_id: String,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    cache: PreferenceCache<PreferenceDocument>,
    /// Serializes every mutation of this user's document; shared with the
    /// preference store facade
    doc_lock: Arc<Mutex<()>>,
    pending: Mutex<Option<PendingPush>>,
    policy: RetryPolicy,
    connectivity: watch::Receiver<bool>,
    phase_tx: watch::Sender<SyncPhase>,
    events_tx: broadcast::Sender<SyncEvent>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        cache: PreferenceCache<PreferenceDocument>,
        doc_lock: Arc<Mutex<()>>,
        connectivity: watch::Receiver<bool>,
        policy: RetryPolicy,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SyncPhase::Idle);
        let (events_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                user_id,
                remote,
                local,
                cache,
                doc_lock,
                pending: Mutex::new(None),
                policy,
                connectivity,
                phase_tx,
                events_tx,
                notify: Notify::new(),
                shutdown_tx,
            }),
            worker: StdMutex::new(None),
            periodic: StdMutex::new(None),
        }
    }

    /// Spawn the background push worker
    pub fn start(&self) {
        let mut guard = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(async move {
            worker_loop(inner).await;
        }));
        log::info!("sync worker started for {}", self.inner.user_id);
    }

    /// Spawn a periodic pull loop at the given interval
    pub fn start_periodic_pull(&self, interval: Duration) {
        let mut guard = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *guard = Some(tokio::spawn(async move {
            let mut shutdown = inner.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                log::debug!("periodic pull for {}", inner.user_id);
                if let Err(e) = inner.pull().await {
                    log::warn!("periodic pull for {} failed: {}", inner.user_id, e);
                }
            }
        }));
        log::info!(
            "periodic pull started for {} (every {:?})",
            self.inner.user_id,
            interval
        );
    }

    /// Queue a push for the given document state. Replaces any push still
    /// waiting in the slot; only the latest write is ever sent.
    pub async fn enqueue_push(&self, document: PreferenceDocument) {
        let mut slot = self.inner.pending.lock().await;
        if slot.is_some() {
            log::debug!("superseding queued push for {}", self.inner.user_id);
        }
        *slot = Some(PendingPush {
            document,
            attempt: 0,
            next_eligible_at: Utc::now(),
            last_error: None,
        });
        drop(slot);
        self.inner.notify.notify_one();
    }

    /// Pull the remote document and reconcile it with local state
    pub async fn pull(&self) -> Result<PullOutcome, PreferenceError> {
        self.inner.pull().await
    }

    /// Wait (bounded) for connectivity, then make one push attempt for
    /// whatever is not yet synced. Never a silent no-op while offline: the
    /// call observes the connectivity signal until it reports online or the
    /// recovery window elapses.
    pub async fn recover_from_sync_failure(&self) -> Result<(), PreferenceError> {
        let inner = &self.inner;
        log::info!("sync recovery requested for {}", inner.user_id);

        let mut conn = inner.connectivity.clone();
        let wait_online = async {
            loop {
                if *conn.borrow_and_update() {
                    break;
                }
                if conn.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(inner.policy.recovery_wait, wait_online)
            .await
            .is_err()
        {
            return Err(PreferenceError::Sync {
                operation: SyncOperation::Push,
                reason: SyncFailureReason::NoConnectivity,
                retryable: true,
                message: "connectivity was not restored within the recovery window".to_string(),
            });
        }

        let doc = {
            let _guard = inner.doc_lock.lock().await;
            inner
                .local
                .load_document(&inner.user_id)
                .map_err(|e| inner.local_error(e))?
        };
        let Some(doc) = doc else {
            log::debug!("nothing to recover for {}", inner.user_id);
            return Ok(());
        };
        if doc.sync_status == SyncStatus::Synced {
            log::debug!("{} already synced; recovery is a no-op", inner.user_id);
            return Ok(());
        }

        match inner.remote.push_document(&doc).await {
            Ok(()) => {
                inner.record_push_outcome(&doc, SyncStatus::Synced).await;
                // The recovered state supersedes whatever was queued
                *inner.pending.lock().await = None;
                inner.emit(SyncEvent::PushSucceeded { at: Utc::now() });
                log::info!("sync recovery for {} succeeded", inner.user_id);
                Ok(())
            }
            Err(err) => {
                log::warn!("sync recovery push for {} failed: {}", inner.user_id, err);
                inner.emit(SyncEvent::PushFailed {
                    reason: err.failure_reason(),
                    attempts: 1,
                    message: err.to_string(),
                });
                Err(err.into_preference_error(SyncOperation::Push))
            }
        }
    }

    /// Observe the push pipeline's state machine
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Observe sync lifecycle events (the asynchronous error stream)
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Cooperative shutdown, used on sign-out. The worker finishes or
    /// abandons its wait at the next checkpoint; it never stops mid-apply.
    pub async fn stop(&self) {
        self.inner.shutdown_tx.send_replace(true);
        self.inner.notify.notify_one();

        let worker = {
            let mut guard = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        let periodic = {
            let mut guard = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = periodic {
            let _ = handle.await;
        }
        log::info!("sync coordinator stopped for {}", self.inner.user_id);
    }
}

// ============================================================================
// Worker
// ============================================================================

async fn worker_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = shutdown.changed() => { continue; }
        }

        loop {
            // Take the slot in its own scope so the guard is not held while
            // the push runs
            let op = { inner.pending.lock().await.take() };
            let Some(op) = op else { break };
            match inner.run_push(op, &mut shutdown).await {
                PushExit::Done => continue,
                PushExit::Cancelled => return,
            }
        }
    }
    log::debug!("sync worker for {} exited", inner.user_id);
}

impl Inner {
    fn set_phase(&self, phase: SyncPhase) {
        self.phase_tx.send_replace(phase);
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn local_error(&self, err: DbError) -> PreferenceError {
        PreferenceError::Sync {
            operation: SyncOperation::Pull,
            reason: SyncFailureReason::LocalCorruption,
            retryable: false,
            message: err.to_string(),
        }
    }

    /// Push one queued operation to completion: success, fatal failure, or
    /// exhaustion of the allowed attempts.
    async fn run_push(&self, mut op: PendingPush, shutdown: &mut watch::Receiver<bool>) -> PushExit {
        loop {
            op.attempt += 1;
            if let Some(prev) = &op.last_error {
                log::debug!("retrying push for {} after: {}", self.user_id, prev);
            }
            self.set_phase(SyncPhase::Pushing);
            self.emit(SyncEvent::PushStarted {
                attempt: op.attempt,
            });

            match self.remote.push_document(&op.document).await {
                Ok(()) => {
                    self.record_push_outcome(&op.document, SyncStatus::Synced)
                        .await;
                    self.emit(SyncEvent::PushSucceeded { at: Utc::now() });
                    self.set_phase(SyncPhase::Idle);
                    log::info!(
                        "preferences push for {} succeeded (attempt {})",
                        self.user_id,
                        op.attempt
                    );
                    return PushExit::Done;
                }
                Err(err) if !err.is_retryable() => {
                    log::error!("preferences push for {} rejected: {}", self.user_id, err);
                    self.record_push_outcome(&op.document, SyncStatus::Failed)
                        .await;
                    self.emit(SyncEvent::PushFailed {
                        reason: err.failure_reason(),
                        attempts: op.attempt,
                        message: err.to_string(),
                    });
                    self.set_phase(SyncPhase::Idle);
                    return PushExit::Done;
                }
                Err(err) => {
                    op.last_error = Some(err.to_string());

                    if op.attempt >= self.policy.max_attempts {
                        log::warn!(
                            "preferences push for {} giving up after {} attempts: {}",
                            self.user_id,
                            op.attempt,
                            err
                        );
                        self.record_push_outcome(&op.document, SyncStatus::Failed)
                            .await;
                        self.emit(SyncEvent::PushFailed {
                            reason: err.failure_reason(),
                            attempts: op.attempt,
                            message: err.to_string(),
                        });
                        self.set_phase(SyncPhase::Idle);
                        return PushExit::Done;
                    }

                    let delay = self.policy.delay_for(op.attempt);
                    op.next_eligible_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    log::warn!(
                        "preferences push for {} attempt {} failed ({}), retrying in {:?} (eligible at {})",
                        self.user_id,
                        op.attempt,
                        err,
                        delay,
                        op.next_eligible_at
                    );
                    self.emit(SyncEvent::PushRetryScheduled {
                        attempt: op.attempt,
                        delay,
                        reason: err.failure_reason(),
                    });
                    self.set_phase(SyncPhase::WaitingForNetwork);

                    if !self.wait_for_retry(delay, shutdown).await {
                        // Shutdown mid-wait; the document stays Pending
                        self.set_phase(SyncPhase::Idle);
                        return PushExit::Cancelled;
                    }

                    // A newer write supersedes the in-flight retry
                    let superseded = { self.pending.lock().await.is_some() };
                    if superseded {
                        log::debug!(
                            "queued write supersedes in-flight retry for {}",
                            self.user_id
                        );
                        self.set_phase(SyncPhase::Idle);
                        return PushExit::Done;
                    }
                }
            }
        }
    }

    /// Sleep out the backoff delay, then wait for the connectivity signal to
    /// report online. Returns false if shutdown was requested.
    async fn wait_for_retry(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }

        let mut conn = self.connectivity.clone();
        loop {
            if *conn.borrow_and_update() {
                return true;
            }
            tokio::select! {
                res = conn.changed() => {
                    if res.is_err() {
                        log::warn!("connectivity signal closed; assuming online");
                        return true;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Stamp the outcome of a push onto the stored document, unless a newer
    /// local write has already replaced the state that was pushed.
    async fn record_push_outcome(&self, pushed: &PreferenceDocument, status: SyncStatus) {
        let _guard = self.doc_lock.lock().await;
        let stored = match self.local.load_document(&self.user_id) {
            Ok(Some(doc)) => doc,
            Ok(None) => return,
            Err(e) => {
                log::error!(
                    "failed to record push outcome for {}: {}",
                    self.user_id,
                    e
                );
                return;
            }
        };
        if stored.last_modified != pushed.last_modified {
            // A newer write is queued; its own push will settle the status
            return;
        }

        let mut updated = stored;
        updated.sync_status = status;
        if let Err(e) = self.local.save_document(&updated) {
            log::error!("failed to persist sync status for {}: {}", self.user_id, e);
            return;
        }
        self.cache.put(&self.user_id, updated).await;
    }

    /// Fetch the remote document, run it through the resolver, and persist
    /// the winner. Errors out with `Conflict` when resolution needs the user.
    async fn pull(&self) -> Result<PullOutcome, PreferenceError> {
        log::info!("pulling remote preferences for {}", self.user_id);

        let remote_doc = self
            .remote
            .pull_document(&self.user_id)
            .await
            .map_err(|e| e.into_preference_error(SyncOperation::Pull))?;

        let Some(remote_doc) = remote_doc else {
            log::debug!("no remote preferences for {}", self.user_id);
            return Ok(PullOutcome::NoRemoteData);
        };

        // Invalid state never reaches the cache or the local store, even
        // when the remote produced it
        let violations = remote_doc.validate();
        if !violations.is_empty() {
            log::warn!(
                "remote preferences for {} failed validation ({} violations)",
                self.user_id,
                violations.len()
            );
            return Err(PreferenceError::Validation(violations));
        }

        let _guard = self.doc_lock.lock().await;
        let local = self
            .local
            .load_document(&self.user_id)
            .map_err(|e| self.local_error(e))?;

        let Some(local) = local else {
            // First pull on a fresh install
            let mut doc = remote_doc;
            doc.sync_status = SyncStatus::Synced;
            self.local
                .save_document(&doc)
                .map_err(|e| self.local_error(e))?;
            self.cache.put(&self.user_id, doc).await;
            self.emit(SyncEvent::PullApplied {
                strategy: ResolutionStrategy::RemoteWins,
            });
            return Ok(PullOutcome::Applied(ResolutionStrategy::RemoteWins));
        };

        let decision = resolver::resolve(&local, &remote_doc);
        log::info!(
            "resolved preferences for {}: {} ({})",
            self.user_id,
            decision.strategy.as_str(),
            decision.reason
        );

        if decision.strategy == ResolutionStrategy::ManualRequired {
            let mut conflicted = local;
            conflicted.sync_status = SyncStatus::Conflicted;
            self.local
                .save_document(&conflicted)
                .map_err(|e| self.local_error(e))?;
            self.cache.put(&self.user_id, conflicted).await;
            self.emit(SyncEvent::ConflictDetected {
                reason: decision.reason.clone(),
            });
            return Err(PreferenceError::Conflict(decision.reason));
        }

        let local_won = decision.winner == local;
        let identical = decision.strategy == ResolutionStrategy::LocalWins;
        let mut winner = decision.winner;

        if local_won && !identical {
            // Local is ahead; the remote must converge to it
            winner.sync_status = SyncStatus::Pending;
            self.local
                .save_document(&winner)
                .map_err(|e| self.local_error(e))?;
            self.cache.put(&self.user_id, winner.clone()).await;
            drop(_guard);

            let mut slot = self.pending.lock().await;
            *slot = Some(PendingPush {
                document: winner,
                attempt: 0,
                next_eligible_at: Utc::now(),
                last_error: None,
            });
            drop(slot);
            self.notify.notify_one();
        } else {
            winner.sync_status = SyncStatus::Synced;
            self.local
                .save_document(&winner)
                .map_err(|e| self.local_error(e))?;
            self.cache.put(&self.user_id, winner).await;
        }

        self.emit(SyncEvent::PullApplied {
            strategy: decision.strategy,
        });
        Ok(PullOutcome::Applied(decision.strategy))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotonic_up_to_cap() {
        let policy = RetryPolicy::default();

        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "delay shrank at attempt {}", attempt);
            assert!(delay <= policy.cap);
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(20), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_strictly_increases_below_cap() {
        let policy = RetryPolicy::default();
        for attempt in 1..6 {
            assert!(policy.delay_for(attempt + 1) > policy.delay_for(attempt));
        }
    }
}
