use crate::clock::Clock;
use crate::models::{
    CycleCounters, PhaseState, RemoteSessionRecord, SessionMutation, TimerSnapshot, TimerStatus,
};
use crate::notifications::NotificationScheduler;
use crate::Database;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;

mod core;
mod db;

/// Where the machine hands remote-ledger mutations. `submit` must not block on the
/// network: the local transition has already happened by the time it is called.
#[async_trait]
pub trait MutationSink: Send + Sync {
    fn submit(&self, mutation: SessionMutation);

    /// Wait until every mutation submitted so far was applied or queued.
    async fn flush(&self);
}

/// Session state machine: the only writer of the timer snapshot.
///
/// `None` in `state` is `Idle`. Every transition persists first and only then
/// replaces the in-memory value, so a failed write leaves memory untouched.
pub struct SessionMachine {
    pub(crate) state: Mutex<Option<TimerSnapshot>>,
    /// Persisted with each terminal transition, see `Database::finish_snapshot`
    pub(crate) counters: Mutex<CycleCounters>,
    pub(crate) db: Arc<Database>,
    sink: Arc<dyn MutationSink>,
    notifier: Arc<NotificationScheduler>,
    clock: Arc<dyn Clock>,
}

impl SessionMachine {
    /// Counters are read from storage right away; the snapshot only via
    /// `recover_from_cold_start`.
    pub fn new(
        db: Arc<Database>,
        sink: Arc<dyn MutationSink>,
        notifier: Arc<NotificationScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, crate::TimerError> {
        let counters = db.load_cycle_counters()?;
        Ok(Self {
            state: Mutex::new(None),
            counters: Mutex::new(counters),
            db,
            sink,
            notifier,
            clock,
        })
    }

    pub(crate) fn lock_state(
        &self,
    ) -> Result<MutexGuard<'_, Option<TimerSnapshot>>, crate::TimerError> {
        self.state
            .lock()
            .map_err(|e| crate::TimerError::StateLock(e.to_string()))
    }

    /// Reads never fail: a poisoned lock still holds the last committed value.
    fn read_state(&self) -> Option<TimerSnapshot> {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => {
                error!("[TIMER] State mutex poisoned, reading last committed snapshot");
                poisoned.into_inner().clone()
            }
        }
    }

    pub fn snapshot(&self) -> Option<TimerSnapshot> {
        self.read_state()
    }

    pub fn phase(&self) -> PhaseState {
        self.read_state()
            .map(|s| s.phase_state)
            .unwrap_or(PhaseState::Idle)
    }

    /// Elapsed active seconds, 0 when idle.
    pub fn elapsed_seconds(&self) -> u64 {
        let now = self.clock.now();
        self.read_state()
            .map(|s| s.elapsed_seconds_at(now))
            .unwrap_or(0)
    }

    pub fn cycle_counters(&self) -> CycleCounters {
        match self.counters.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn sessions_since_long_break(&self) -> u32 {
        self.cycle_counters().completed_since_long_break
    }

    pub fn status(&self) -> TimerStatus {
        let now = self.clock.now();
        let sessions_since_long_break = self.sessions_since_long_break();
        match self.read_state() {
            Some(s) => TimerStatus {
                phase: s.phase_state,
                session_id: Some(s.session_id.clone()),
                kind: Some(s.kind),
                elapsed_seconds: s.elapsed_seconds_at(now),
                remaining_seconds: s.remaining_seconds_at(now),
                planned_duration_seconds: s.planned_duration_seconds,
                sessions_since_long_break,
            },
            None => TimerStatus {
                phase: PhaseState::Idle,
                session_id: None,
                kind: None,
                elapsed_seconds: 0,
                remaining_seconds: 0,
                planned_duration_seconds: 0,
                sessions_since_long_break,
            },
        }
    }

    pub async fn flush(&self) {
        self.sink.flush().await;
    }

    /// Open ledger record for a snapshot. The record's date is the start date.
    fn open_record(&self, snapshot: &TimerSnapshot) -> RemoteSessionRecord {
        RemoteSessionRecord {
            session_id: snapshot.session_id.clone(),
            user_id: snapshot.user_id.clone(),
            kind: snapshot.kind,
            planned_duration_seconds: snapshot.planned_duration_seconds,
            actual_duration_seconds: None,
            started_at: snapshot.started_at_wall_clock,
            ended_at: None,
            completed: false,
            interrupted: snapshot.interrupted,
            date: self
                .clock
                .date_of(snapshot.started_at_wall_clock)
                .format("%Y-%m-%d")
                .to_string(),
        }
    }
}
