use crate::config::SyncConfig;
use crate::database::META_LAST_REPLAY_AT;
use crate::error::{LedgerError, TimerError};
use crate::ledger::SessionLedger;
use crate::models::{OfflineQueueEntry, QueueStats, RemoteSessionRecord, SessionMutation};
use crate::Database;
use scopeguard::guard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod writer;

pub use writer::LedgerWriter;

/// What replay does with a queued record, given what the ledger already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayAction {
    /// No remote record: create it with everything the queue knows.
    Create,
    /// Remote record exists but the queued one carries better closing data.
    Finalize,
    /// Remote already has at least as much; only pending aggregates are applied.
    KeepRemote,
}

/// Merge rule for replay: an open remote record takes the queued finalization;
/// two finalized records keep whichever recorded the longer actual duration.
pub fn decide_replay(
    remote: Option<&RemoteSessionRecord>,
    queued: &RemoteSessionRecord,
) -> ReplayAction {
    let Some(remote) = remote else {
        return ReplayAction::Create;
    };
    match (remote.finalization(), queued.finalization()) {
        (_, None) => ReplayAction::KeepRemote,
        (None, Some(_)) => ReplayAction::Finalize,
        (Some(have), Some(want)) if want.actual_duration_seconds > have.actual_duration_seconds => {
            ReplayAction::Finalize
        }
        _ => ReplayAction::KeepRemote,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub failed: usize,
    /// Entries still queued after this run
    pub remaining: i64,
    /// Another replay was already running
    pub skipped: bool,
}

/// Applies session mutations to the ledger and drains the offline queue.
#[derive(Clone)]
pub struct SyncManager {
    pub(crate) db: Arc<Database>,
    ledger: Arc<dyn SessionLedger>,
    pub(crate) is_syncing: Arc<AtomicBool>,
    warn_after_retries: i32,
}

impl SyncManager {
    pub fn new(db: Arc<Database>, ledger: Arc<dyn SessionLedger>, config: &SyncConfig) -> Self {
        Self {
            db,
            ledger,
            is_syncing: Arc::new(AtomicBool::new(false)),
            warn_after_retries: config.warn_after_retries,
        }
    }

    /// Adaptive batch size for background runs
    fn calculate_batch_size(&self, pending_count: i64) -> i64 {
        match pending_count {
            0..=20 => 5,
            21..=100 => 20,
            _ => 50,
        }
    }

    /// Direct write path. A ledger failure queues the mutation; the only error
    /// returned is failing to queue it.
    pub async fn apply_mutation(&self, mutation: &SessionMutation) -> Result<(), TimerError> {
        let session_id = mutation.session_id();
        if self.db.has_pending_for_session(session_id)? {
            // Keep create/finalize order: the earlier write for this session is still queued
            self.db.enqueue_mutation(mutation)?;
            debug!(
                "[SYNC] Session {} already queued, merged mutation into queue",
                session_id
            );
            return Ok(());
        }

        // Ledger errors never reach the state machine; the queue absorbs them
        if let Err(e) = self.push(mutation).await {
            let err = TimerError::from(e);
            warn!("[SYNC] {} for session {}, queued for replay", err, session_id);
            self.db.enqueue_mutation(mutation)?;
        }
        Ok(())
    }

    async fn push(&self, mutation: &SessionMutation) -> Result<(), LedgerError> {
        let record = &mutation.record;
        match record.finalization() {
            None => {
                self.ledger.create_session(&mutation.user_id, record).await?;
            }
            Some(finalization) => {
                match self
                    .ledger
                    .finalize_session(&mutation.user_id, &record.session_id, &finalization)
                    .await
                {
                    Ok(()) => {}
                    // The open record never reached the ledger
                    Err(LedgerError::NotFound(_)) => {
                        self.ledger.create_session(&mutation.user_id, record).await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.apply_aggregates(mutation).await
    }

    async fn apply_aggregates(&self, mutation: &SessionMutation) -> Result<(), LedgerError> {
        if let Some(delta) = &mutation.aggregate_delta {
            let aggregates = self
                .ledger
                .increment_user_aggregates(&mutation.user_id, delta)
                .await?;
            debug!(
                "[SYNC] Aggregates for {}: {} sessions, streak {}",
                mutation.user_id, aggregates.total_sessions, aggregates.current_streak
            );
        }
        Ok(())
    }

    /// Replay one queued mutation, deduped against what the ledger holds.
    async fn replay_entry(&self, entry: &OfflineQueueEntry) -> Result<ReplayAction, LedgerError> {
        let mutation = &entry.mutation;
        let record = &mutation.record;
        // Look before writing: an earlier partial replay may already have landed
        let remote = self
            .ledger
            .get_session(&mutation.user_id, &record.session_id)
            .await?;
        let action = decide_replay(remote.as_ref(), record);
        match action {
            ReplayAction::Create => {
                self.ledger.create_session(&mutation.user_id, record).await?;
            }
            ReplayAction::Finalize => {
                if let Some(finalization) = record.finalization() {
                    self.ledger
                        .finalize_session(&mutation.user_id, &record.session_id, &finalization)
                        .await?;
                }
            }
            ReplayAction::KeepRemote => {
                debug!(
                    "[SYNC] Session {} already on ledger with equal or better data",
                    record.session_id
                );
            }
        }
        // Applied even on KeepRemote: the record may have landed while the
        // increment did not. The counted-id window makes a repeat a no-op.
        self.apply_aggregates(mutation).await?;
        Ok(action)
    }

    /// Drain the whole queue now, ignoring backoff. Used on explicit request,
    /// foreground and reconnect.
    pub async fn process_offline_queue(&self) -> Result<ReplayReport, TimerError> {
        self.run_single_flight(false).await
    }

    /// Background variant: honours per-entry backoff and processes one adaptive batch.
    pub async fn process_due_entries(&self) -> Result<ReplayReport, TimerError> {
        self.run_single_flight(true).await
    }

    async fn run_single_flight(&self, background: bool) -> Result<ReplayReport, TimerError> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[SYNC] Another replay already in progress, skipping");
            return Ok(ReplayReport {
                skipped: true,
                ..Default::default()
            });
        }

        let _guard = guard((), |_| {
            self.is_syncing.store(false, Ordering::Release);
        });

        self.run_replay(background).await
    }

    async fn run_replay(&self, background: bool) -> Result<ReplayReport, TimerError> {
        let pending_count = self.db.pending_count()?;
        if pending_count == 0 {
            debug!("[SYNC] Offline queue empty");
            self.touch_last_replay();
            return Ok(ReplayReport::default());
        }

        // Explicit replay drains everything now; the background loop takes one
        // adaptive batch and respects per-entry backoff.
        let limit = if background {
            self.calculate_batch_size(pending_count)
        } else {
            pending_count
        };
        let entries = self.db.pending_mutations(limit, background)?;
        info!(
            "[SYNC] Replaying {} of {} queued mutation(s){}",
            entries.len(),
            pending_count,
            if background { " (background)" } else { "" }
        );

        let mut report = ReplayReport::default();
        // FIFO, one entry at a time: a failed entry does not block the ones after it
        for entry in &entries {
            let session_id = entry.mutation.session_id();
            match self.replay_entry(entry).await {
                Ok(action) => {
                    report.applied += 1;
                    // A mutation merged into this row during replay must survive
                    if self
                        .db
                        .remove_queue_entry_if_unchanged(entry.id, &entry.mutation)?
                    {
                        info!("[SYNC] Replayed session {} ({:?})", session_id, action);
                    } else {
                        debug!(
                            "[SYNC] Entry {} for {} changed during replay, keeping it",
                            entry.id, session_id
                        );
                    }
                }
                Err(e) => {
                    // Entries are never dropped; backoff grows with retry_count
                    report.failed += 1;
                    let retry_count = entry.retry_count + 1;
                    self.db
                        .mark_queue_retry(entry.id, retry_count, &e.to_string())?;
                    if retry_count >= self.warn_after_retries {
                        error!(
                            "[SYNC] Session {} still not replayed after {} attempts: {}",
                            session_id, retry_count, e
                        );
                    } else {
                        warn!(
                            "[SYNC] Replay of session {} failed (attempt {}): {}",
                            session_id, retry_count, e
                        );
                    }
                }
            }
        }

        if report.applied > 0 {
            self.touch_last_replay();
        }
        report.remaining = self.db.pending_count()?;
        info!(
            "[SYNC] Replay finished: {} applied, {} failed, {} remaining",
            report.applied, report.failed, report.remaining
        );
        Ok(report)
    }

    fn touch_last_replay(&self) {
        if let Err(e) = self
            .db
            .set_app_meta(META_LAST_REPLAY_AT, &chrono::Utc::now().timestamp().to_string())
        {
            warn!("[SYNC] Failed to update last_replay_at: {}", e);
        }
    }

    pub fn queue_stats(&self) -> Result<QueueStats, TimerError> {
        Ok(self.db.queue_stats(self.warn_after_retries)?)
    }
}

/// Periodic replay: startup delay plus jitter, then one due batch per interval
/// whenever the connectivity probe succeeds.
pub fn spawn_background_sync(manager: Arc<SyncManager>, config: SyncConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let jitter_ms: u64 = rand::random::<u32>() as u64 % 2000 + 1000;
        let total_ms = config.startup_delay_secs * 1000 + jitter_ms;
        tokio::time::sleep(tokio::time::Duration::from_millis(total_ms)).await;

        info!("[SYNC] Starting background replay task");
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
            config.sync_interval_secs.max(1),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if !crate::network::check_online_status(&config.connectivity_probe_urls).await {
                debug!("[SYNC] Offline, skipping background replay");
                continue;
            }
            match manager.process_due_entries().await {
                Ok(report) if report.applied > 0 => {
                    info!("[SYNC] Background replay: {} applied", report.applied)
                }
                Ok(_) => debug!("[SYNC] Background replay: nothing due"),
                Err(e) => error!("[SYNC] Background replay error: {}", e),
            }
        }
    })
}
