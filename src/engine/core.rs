use crate::engine::SessionMachine;
use crate::error::TimerError;
use crate::models::{
    AggregateDelta, MAX_PLANNED_DURATION_SECONDS, FinishedSession, InterruptionReason, PhaseState, SessionKind,
    SessionMutation, TimerSnapshot,
};
use tracing::{debug, error, info, warn};

/// How a session leaves Running/Paused.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FinishMode {
    Complete {
        actual_duration_seconds: Option<u64>,
        was_completed: bool,
    },
    Cancel,
    /// Completes only if the session is running and has reached its plan.
    Organic,
    /// Snapshot found past its plan at recovery.
    Missed,
}

impl SessionMachine {
    /// Idle → Running. Returns the new session id.
    pub fn start(
        &self,
        user_id: &str,
        kind: SessionKind,
        planned_duration_seconds: u64,
    ) -> Result<String, TimerError> {
        if planned_duration_seconds == 0 {
            return Err(TimerError::invalid_state(
                "planned duration must be greater than zero",
            ));
        }
        // Keeps completion and reminder times inside chrono's range
        if planned_duration_seconds > MAX_PLANNED_DURATION_SECONDS {
            warn!(
                "[FSM] Rejected start: planned duration {}s exceeds {}s",
                planned_duration_seconds, MAX_PLANNED_DURATION_SECONDS
            );
            return Err(TimerError::invalid_state(format!(
                "planned duration must not exceed {} seconds",
                MAX_PLANNED_DURATION_SECONDS
            )));
        }

        let mut state = self.lock_state()?;
        // Only Idle → Running is a valid start: one session at a time, and a
        // paused session has to be resumed or finished first.
        if let Some(current) = state.as_ref() {
            warn!(
                "[FSM] Invalid transition: {:?} → Running (session {} still active)",
                current.phase_state, current.session_id
            );
            return Err(TimerError::invalid_state(format!(
                "session {} is already active",
                current.session_id
            )));
        }

        let snapshot = TimerSnapshot {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            phase_state: PhaseState::Running,
            started_at_wall_clock: self.clock.now(),
            paused_at_wall_clock: None,
            accumulated_paused_ms: 0,
            planned_duration_seconds,
            interrupted: false,
        };
        // Durable first: if the write fails memory stays Idle
        self.persist(&snapshot, "start")?;
        *state = Some(snapshot.clone());
        drop(state);

        info!(
            "[TIMER] Started {} session {} ({}s planned)",
            kind.as_str(),
            snapshot.session_id,
            planned_duration_seconds
        );
        if let Err(e) = self.notifier.schedule_for(&snapshot) {
            warn!("[NOTIFY] Failed to schedule notifications after start: {}", e);
        }
        // Open record on the ledger; the sink queues it if the ledger is unreachable
        self.sink.submit(SessionMutation {
            user_id: snapshot.user_id.clone(),
            record: self.open_record(&snapshot),
            aggregate_delta: None,
        });
        Ok(snapshot.session_id)
    }

    /// Running → Paused. Pausing an already paused session is a no-op.
    pub fn pause(&self) -> Result<(), TimerError> {
        self.pause_internal(false).map(|_| ())
    }

    /// Pause on behalf of an external interruption. Returns the affected session id,
    /// or `None` when idle.
    pub fn pause_for_interruption(
        &self,
        reason: &InterruptionReason,
    ) -> Result<Option<String>, TimerError> {
        // Interruptions arrive regardless of phase; idle is not an error here
        if self.read_state().is_none() {
            debug!("[TIMER] Interruption {:?} while idle, nothing to pause", reason);
            return Ok(None);
        }
        self.pause_internal(true)
    }

    fn pause_internal(&self, interrupted: bool) -> Result<Option<String>, TimerError> {
        let mut state = self.lock_state()?;
        let current = match state.as_ref() {
            Some(s) => s,
            None => {
                warn!("[FSM] Invalid transition: Idle → Paused (no active session)");
                return Err(TimerError::invalid_state("no active session to pause"));
            }
        };

        match current.phase_state {
            // Paused → Paused: no-op, pausedAt keeps the original pause moment
            PhaseState::Paused if !interrupted || current.interrupted => {
                debug!("[FSM] Pause ignored: session {} already paused", current.session_id);
                Ok(Some(current.session_id.clone()))
            }
            PhaseState::Paused => {
                // Already paused by the user; only remember the interruption
                let mut next = current.clone();
                next.interrupted = true;
                self.persist(&next, "pause")?;
                let session_id = next.session_id.clone();
                *state = Some(next);
                Ok(Some(session_id))
            }
            // Running → Paused: freeze elapsed by stamping pausedAt
            PhaseState::Running => {
                let mut next = current.clone();
                next.phase_state = PhaseState::Paused;
                next.paused_at_wall_clock = Some(self.clock.now());
                next.interrupted |= interrupted;
                self.persist(&next, "pause")?;
                let session_id = next.session_id.clone();
                *state = Some(next);
                drop(state);

                // Nothing may fire while frozen; resume reschedules from the new projection
                self.notifier.cancel_all(&session_id);
                info!("[TIMER] Paused session {}", session_id);
                Ok(Some(session_id))
            }
            PhaseState::Idle => Err(TimerError::invalid_state("snapshot in Idle phase")),
        }
    }

    /// Paused → Running. The pause span is folded into `accumulated_paused_ms`.
    pub fn resume(&self) -> Result<(), TimerError> {
        let mut state = self.lock_state()?;
        let current = match state.as_ref() {
            Some(s) => s,
            None => {
                warn!("[FSM] Invalid transition: Idle → Running (use start instead)");
                return Err(TimerError::invalid_state("no paused session to resume"));
            }
        };
        // Paused → Running only; resuming a running session is a caller bug
        if current.phase_state != PhaseState::Paused {
            warn!("[FSM] Invalid transition: Running → Running (already running)");
            return Err(TimerError::invalid_state("session is already running"));
        }

        // startedAt never moves; the pause span is added to the accumulated total
        let now = self.clock.now();
        let mut next = current.clone();
        let pause_ms = next
            .paused_at_wall_clock
            .map(|at| (now - at).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        next.accumulated_paused_ms = next.accumulated_paused_ms.saturating_add(pause_ms);
        next.paused_at_wall_clock = None;
        next.phase_state = PhaseState::Running;
        self.persist(&next, "resume")?;
        *state = Some(next.clone());
        drop(state);

        info!(
            "[TIMER] Resumed session {} after {}s paused",
            next.session_id,
            pause_ms / 1000
        );
        if let Err(e) = self.notifier.schedule_for(&next) {
            warn!("[NOTIFY] Failed to reschedule notifications after resume: {}", e);
        }
        Ok(())
    }

    /// Running/Paused → Idle. `actual_duration_seconds` defaults to the computed
    /// elapsed time. Aggregates and cycle counters move only when `was_completed`.
    pub fn complete(
        &self,
        actual_duration_seconds: Option<u64>,
        was_completed: bool,
    ) -> Result<FinishedSession, TimerError> {
        self.finish(FinishMode::Complete {
            actual_duration_seconds,
            was_completed,
        })?
        .ok_or_else(|| TimerError::invalid_state("no active session to complete"))
    }

    /// Running/Paused → Idle without counting the session.
    pub fn cancel(&self) -> Result<FinishedSession, TimerError> {
        self.finish(FinishMode::Cancel)?
            .ok_or_else(|| TimerError::invalid_state("no active session to cancel"))
    }

    /// Complete a running session whose elapsed time reached the plan and show the
    /// completion notification now. Returns `None` if nothing was due.
    pub fn check_completion(&self) -> Result<Option<FinishedSession>, TimerError> {
        let finished = self.finish(FinishMode::Organic)?;
        if let Some(done) = &finished {
            if let Err(e) = self.notifier.present_completion(&done.session_id, done.kind) {
                warn!("[NOTIFY] Failed to present completion: {}", e);
            }
        }
        Ok(finished)
    }

    pub(crate) fn finish(&self, mode: FinishMode) -> Result<Option<FinishedSession>, TimerError> {
        let mut state = self.lock_state()?;
        let current = match state.as_ref() {
            Some(s) => s.clone(),
            None => {
                if matches!(mode, FinishMode::Complete { .. } | FinishMode::Cancel) {
                    warn!("[FSM] Invalid transition: Idle → Idle ({:?})", mode);
                }
                return Ok(None);
            }
        };

        let now = self.clock.now();
        let elapsed = current.elapsed_seconds_at(now);
        let (actual, completed, interrupted) = match mode {
            FinishMode::Complete {
                actual_duration_seconds,
                was_completed,
            } => (
                actual_duration_seconds.unwrap_or(elapsed),
                was_completed,
                current.interrupted,
            ),
            FinishMode::Cancel => (elapsed, false, current.interrupted),
            // Only a running session reaches its plan on its own; a paused one is frozen
            FinishMode::Organic => {
                if current.phase_state != PhaseState::Running || !current.is_overdue_at(now) {
                    return Ok(None);
                }
                (current.planned_duration_seconds, true, current.interrupted)
            }
            // Finished while the process was gone: closed, never counted
            FinishMode::Missed => (elapsed, false, true),
        };

        let mut counters = self
            .counters
            .lock()
            .map_err(|e| TimerError::StateLock(e.to_string()))?;
        let next_counters = if completed {
            counters.after_completion(current.kind)
        } else {
            *counters
        };

        // Snapshot clear and counters commit together, before memory goes Idle
        if let Err(e) = self.db.finish_snapshot(&next_counters) {
            error!(
                "[DB] Failed to clear snapshot for session {}: {}",
                current.session_id, e
            );
            return Err(TimerError::PersistenceFailure(e.to_string()));
        }
        *state = None;
        *counters = next_counters;
        drop(counters);
        drop(state);

        self.notifier.cancel_all(&current.session_id);

        let mut record = self.open_record(&current);
        record.actual_duration_seconds = Some(actual);
        record.ended_at = Some(now);
        record.completed = completed;
        record.interrupted = interrupted;
        // Aggregates move only for completed sessions; streak and minutes only for work
        let aggregate_delta = completed.then(|| AggregateDelta {
            session_id: current.session_id.clone(),
            sessions: 1,
            focus_minutes: if current.kind == SessionKind::Work {
                actual / 60
            } else {
                0
            },
            active_date: self.clock.date_of(now),
            counts_toward_streak: current.kind == SessionKind::Work,
        });
        self.sink.submit(SessionMutation {
            user_id: current.user_id.clone(),
            record,
            aggregate_delta,
        });

        info!(
            "[TIMER] Session {} finished ({:?}): {}s, completed={}, since long break={}",
            current.session_id, mode, actual, completed, next_counters.completed_since_long_break
        );
        Ok(Some(FinishedSession {
            session_id: current.session_id,
            kind: current.kind,
            actual_duration_seconds: actual,
            completed,
        }))
    }
}
