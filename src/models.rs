use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Longest plan a session may have (one week).
pub const MAX_PLANNED_DURATION_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Interval type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    Work,
    Break,
    LongBreak,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Work => "work",
            SessionKind::Break => "break",
            SessionKind::LongBreak => "longBreak",
        }
    }

    pub fn is_break(&self) -> bool {
        !matches!(self, SessionKind::Work)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    Idle,
    Running,
    Paused,
}

/// The in-flight timer. Absent (`None` at the owner) means `Idle`.
///
/// All timing derives from absolute timestamps:
/// `elapsed = (now - started_at) - (accumulated_paused + current pause)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub session_id: String,
    /// Owner of the remote record; recovery finalizes under this id.
    pub user_id: String,
    pub kind: SessionKind,
    pub phase_state: PhaseState,
    pub started_at_wall_clock: DateTime<Utc>,
    pub paused_at_wall_clock: Option<DateTime<Utc>>,
    pub accumulated_paused_ms: u64,
    pub planned_duration_seconds: u64,
    /// Set once an external interruption paused this session.
    #[serde(default)]
    pub interrupted: bool,
}

impl TimerSnapshot {
    /// Elapsed active time in milliseconds at `now`. Negative means the wall clock
    /// moved behind the stored timestamps.
    pub fn elapsed_ms_at(&self, now: DateTime<Utc>) -> i64 {
        let span = (now - self.started_at_wall_clock).num_milliseconds();
        let current_pause = match (self.phase_state, self.paused_at_wall_clock) {
            (PhaseState::Paused, Some(paused_at)) => (now - paused_at).num_milliseconds().max(0),
            _ => 0,
        };
        let paused = i64::try_from(self.accumulated_paused_ms).unwrap_or(i64::MAX);
        span.saturating_sub(paused.saturating_add(current_pause))
    }

    /// Whole elapsed seconds, floored at 0 and capped at the plan.
    pub fn elapsed_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        let secs = (self.elapsed_ms_at(now).max(0) / 1000) as u64;
        secs.min(self.planned_duration_seconds)
    }

    pub fn remaining_seconds_at(&self, now: DateTime<Utc>) -> u64 {
        self.planned_duration_seconds
            .saturating_sub(self.elapsed_seconds_at(now))
    }

    /// Projected wall-clock completion if the timer keeps running from `now`.
    /// Saturates at the end of chrono's range instead of overflowing.
    pub fn projected_completion_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let remaining_ms = self
            .planned_ms()
            .saturating_sub(self.elapsed_ms_at(now).max(0))
            .max(0);
        chrono::Duration::try_milliseconds(remaining_ms)
            .and_then(|remaining| now.checked_add_signed(remaining))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.elapsed_ms_at(now) >= self.planned_ms()
    }

    fn planned_ms(&self) -> i64 {
        i64::try_from(self.planned_duration_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// Structural checks applied to a snapshot read back from storage.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), String> {
        if self.session_id.trim().is_empty() {
            return Err("empty session id".into());
        }
        if self.planned_duration_seconds == 0 {
            return Err("planned duration is zero".into());
        }
        if self.planned_duration_seconds > MAX_PLANNED_DURATION_SECONDS {
            return Err(format!(
                "planned duration {}s exceeds {}s",
                self.planned_duration_seconds, MAX_PLANNED_DURATION_SECONDS
            ));
        }
        match (self.phase_state, self.paused_at_wall_clock) {
            (PhaseState::Idle, _) => return Err("persisted snapshot in Idle phase".into()),
            (PhaseState::Paused, None) => return Err("paused without pausedAt".into()),
            (PhaseState::Running, Some(_)) => return Err("running with pausedAt set".into()),
            _ => {}
        }
        let elapsed = self.elapsed_ms_at(now);
        if elapsed < 0 {
            return Err(format!("negative elapsed time ({} ms)", elapsed));
        }
        Ok(())
    }
}

/// Durable counterpart of a session on the remote ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub kind: SessionKind,
    pub planned_duration_seconds: u64,
    pub actual_duration_seconds: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub interrupted: bool,
    /// `YYYY-MM-DD`, denormalized for date queries.
    pub date: String,
}

impl RemoteSessionRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn finalization(&self) -> Option<Finalization> {
        Some(Finalization {
            actual_duration_seconds: self.actual_duration_seconds?,
            ended_at: self.ended_at?,
            completed: self.completed,
            interrupted: self.interrupted,
        })
    }
}

/// Closing fields written by `finalize_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finalization {
    pub actual_duration_seconds: u64,
    pub ended_at: DateTime<Utc>,
    pub completed: bool,
    pub interrupted: bool,
}

/// Increment for the per-user aggregate document, keyed by the session that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateDelta {
    pub session_id: String,
    pub sessions: u64,
    pub focus_minutes: u64,
    pub active_date: NaiveDate,
    pub counts_toward_streak: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAggregates {
    pub total_sessions: u64,
    pub total_focus_minutes: u64,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_active_date: Option<NaiveDate>,
    /// Sessions already counted, newest last; bounds double counting on retry.
    #[serde(default)]
    pub counted_session_ids: Vec<String>,
    #[serde(default)]
    pub version: u64,
}

/// One pending remote mutation: the full record as the state machine last knew it,
/// plus the aggregate increment to apply once the record is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMutation {
    pub user_id: String,
    pub record: RemoteSessionRecord,
    pub aggregate_delta: Option<AggregateDelta>,
}

impl SessionMutation {
    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    /// Fold a later mutation for the same session into this one.
    pub fn merge(&mut self, later: SessionMutation) {
        self.record = later.record;
        if later.aggregate_delta.is_some() {
            self.aggregate_delta = later.aggregate_delta;
        }
    }
}

/// Offline queue row
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineQueueEntry {
    pub id: i64,
    pub mutation: SessionMutation,
    pub retry_count: i32,
    pub created_at: i64,
    pub last_retry_at: Option<i64>,
    pub error_message: Option<String>,
}

/// Work intervals completed since the last long break, persisted with the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleCounters {
    pub completed_since_long_break: u32,
    pub lifetime_completed_work: u64,
}

impl CycleCounters {
    pub fn after_completion(self, kind: SessionKind) -> Self {
        match kind {
            SessionKind::Work => Self {
                completed_since_long_break: self.completed_since_long_break.saturating_add(1),
                lifetime_completed_work: self.lifetime_completed_work.saturating_add(1),
            },
            SessionKind::LongBreak => Self {
                completed_since_long_break: 0,
                ..self
            },
            SessionKind::Break => self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "detail")]
pub enum InterruptionReason {
    IncomingCall,
    LowBattery,
    Other(String),
}

/// Why and when a session was paused from outside; offered back to the user for a while.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionRecord {
    pub session_id: String,
    pub reason: InterruptionReason,
    pub occurred_at: DateTime<Utc>,
}

/// Offline queue statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_count: i64,
    pub stuck_count: i64,
    pub oldest_created_at: Option<i64>,
    pub last_replay_at: Option<i64>,
}

/// Read model polled by the UI once per tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerStatus {
    pub phase: PhaseState,
    pub session_id: Option<String>,
    pub kind: Option<SessionKind>,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub planned_duration_seconds: u64,
    pub sessions_since_long_break: u32,
}

/// Result of a terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedSession {
    pub session_id: String,
    pub kind: SessionKind,
    pub actual_duration_seconds: u64,
    pub completed: bool,
}
