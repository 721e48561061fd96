use crate::engine::core::FinishMode;
use crate::engine::SessionMachine;
use crate::error::TimerError;
use crate::models::{FinishedSession, PhaseState, TimerSnapshot};
use tracing::{debug, error, info, warn};

impl SessionMachine {
    /// Durable write that is part of every non-terminal transition.
    pub(crate) fn persist(&self, snapshot: &TimerSnapshot, op: &str) -> Result<(), TimerError> {
        self.db.save_snapshot(snapshot).map_err(|e| {
            error!(
                "[DB] Failed to persist snapshot after {} for session {}: {}",
                op, snapshot.session_id, e
            );
            TimerError::PersistenceFailure(format!("{}: {}", op, e))
        })
    }

    /// Re-write the in-memory snapshot, e.g. before the app is backgrounded.
    pub fn persist_current(&self) -> Result<(), TimerError> {
        let state = self.lock_state()?;
        match state.as_ref() {
            Some(snapshot) => self.persist(snapshot, "flush"),
            None => Ok(()),
        }
    }

    fn discard_stored_snapshot(&self, reason: &str) -> Result<(), TimerError> {
        warn!("[RECOVERY] Discarding persisted snapshot: {}", reason);
        self.db.clear_snapshot()?;
        Ok(())
    }

    /// Restore the persisted session after process start.
    ///
    /// Returns `true` when a session was restored (Running or Paused as stored).
    /// A snapshot that no longer parses or fails validation is discarded; one whose
    /// elapsed time already reached the plan is closed as missed. Calling this again
    /// re-derives the same state from the same stored snapshot.
    pub fn recover_from_cold_start(&self) -> Result<bool, TimerError> {
        let counters = self.db.load_cycle_counters()?;
        match self.counters.lock() {
            Ok(mut guard) => *guard = counters,
            Err(e) => return Err(TimerError::StateLock(e.to_string())),
        }

        let stored = match self.db.load_snapshot() {
            Ok(stored) => stored,
            Err(TimerError::RecoveryDataCorrupt(reason)) => {
                self.discard_stored_snapshot(&reason)?;
                *self.lock_state()? = None;
                return Ok(false);
            }
            Err(e) => {
                error!("[RECOVERY] Failed to read snapshot: {}", e);
                return Err(e);
            }
        };

        let snapshot = match stored {
            Some(snapshot) => snapshot,
            None => {
                info!("[RECOVERY] No saved session, starting idle");
                *self.lock_state()? = None;
                return Ok(false);
            }
        };

        let now = self.clock.now();
        if let Err(reason) = snapshot.validate(now) {
            self.discard_stored_snapshot(&reason)?;
            *self.lock_state()? = None;
            return Ok(false);
        }

        if snapshot.is_overdue_at(now) {
            info!(
                "[RECOVERY] Session {} passed its plan while the app was gone, closing as missed",
                snapshot.session_id
            );
            *self.lock_state()? = Some(snapshot);
            self.finish(FinishMode::Missed)?;
            return Ok(false);
        }

        info!(
            "[RECOVERY] Restored session {}: {:?}, elapsed={}s of {}s",
            snapshot.session_id,
            snapshot.phase_state,
            snapshot.elapsed_seconds_at(now),
            snapshot.planned_duration_seconds
        );
        if snapshot.phase_state == PhaseState::Running {
            if let Err(e) = self.notifier.schedule_for(&snapshot) {
                warn!("[NOTIFY] Failed to reschedule after recovery: {}", e);
            }
        }
        *self.lock_state()? = Some(snapshot);
        Ok(true)
    }

    /// Foreground recomputation. Keeps in-memory state when storage agrees, rewrites
    /// storage when it does not, completes a running session that reached its plan
    /// and drops notifications that no longer apply.
    pub fn reconcile(&self) -> Result<Option<FinishedSession>, TimerError> {
        let in_memory = self.read_state();
        let Some(current) = in_memory else {
            self.notifier.cancel_except(None);
            return match self.db.load_snapshot() {
                Ok(None) => Ok(None),
                _ => {
                    // Storage holds a session memory does not know about
                    self.recover_from_cold_start()?;
                    self.check_completion()
                }
            };
        };

        match self.db.load_snapshot() {
            Ok(Some(stored)) if stored == current => {
                debug!("[RECOVERY] Snapshot for {} consistent", current.session_id);
            }
            Ok(_) | Err(TimerError::RecoveryDataCorrupt(_)) => {
                warn!(
                    "[RECOVERY] Stored snapshot diverged from memory for {}, rewriting",
                    current.session_id
                );
                self.persist_current()?;
            }
            Err(e) => return Err(e),
        }

        if let Some(done) = self.check_completion()? {
            return Ok(Some(done));
        }

        self.notifier.cancel_except(Some(&current.session_id));
        if current.phase_state == PhaseState::Paused {
            self.notifier.cancel_all(&current.session_id);
        }
        Ok(None)
    }

    /// Make sure a running session has its completion notification pending.
    /// Returns `true` if it had to be scheduled.
    pub fn ensure_notifications_scheduled(&self) -> bool {
        let Some(snapshot) = self.read_state() else {
            return false;
        };
        if snapshot.phase_state != PhaseState::Running
            || self.notifier.has_completion(&snapshot.session_id)
        {
            return false;
        }
        match self.notifier.schedule_for(&snapshot) {
            Ok(()) => {
                info!(
                    "[NOTIFY] Completion for {} was missing, scheduled",
                    snapshot.session_id
                );
                true
            }
            Err(e) => {
                warn!("[NOTIFY] Could not schedule completion for {}: {}", snapshot.session_id, e);
                false
            }
        }
    }
}
