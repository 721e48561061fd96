use crate::clock::Clock;
use crate::engine::SessionMachine;
use crate::error::TimerError;
use crate::models::{FinishedSession, InterruptionReason, InterruptionRecord, PhaseState};
use crate::Database;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Process lifecycle and coarse external signals as reported by the host app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
    Inactive,
    Terminated,
    Interruption(InterruptionReason),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorOutcome {
    /// Session that turned out to be finished when the app came back
    pub finished: Option<FinishedSession>,
    /// Session paused by an interruption
    pub interrupted_session: Option<String>,
    pub notifications_rescheduled: bool,
}

/// Turns lifecycle events into state-machine calls. Never edits the snapshot itself.
pub struct SuspensionMonitor {
    machine: Arc<SessionMachine>,
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    interruption_ttl: Duration,
}

impl SuspensionMonitor {
    pub fn new(
        machine: Arc<SessionMachine>,
        db: Arc<Database>,
        clock: Arc<dyn Clock>,
        interruption_ttl_secs: i64,
    ) -> Self {
        Self {
            machine,
            db,
            clock,
            interruption_ttl: Duration::try_seconds(interruption_ttl_secs).unwrap_or(Duration::MAX),
        }
    }

    pub fn handle(&self, event: LifecycleEvent) -> Result<MonitorOutcome, TimerError> {
        let mut outcome = MonitorOutcome::default();
        match event {
            LifecycleEvent::Background | LifecycleEvent::Inactive | LifecycleEvent::Terminated => {
                debug!("[MONITOR] {:?}: securing notifications and snapshot", event);
                outcome.notifications_rescheduled = self.machine.ensure_notifications_scheduled();
                self.machine.persist_current()?;
            }
            LifecycleEvent::Foreground => {
                debug!("[MONITOR] Foreground: recomputing elapsed time");
                outcome.finished = self.machine.reconcile()?;
                if outcome.finished.is_some() {
                    self.dismiss_interruption();
                }
            }
            LifecycleEvent::Interruption(reason) => {
                if let Some(session_id) = self.machine.pause_for_interruption(&reason)? {
                    let record = InterruptionRecord {
                        session_id: session_id.clone(),
                        reason,
                        occurred_at: self.clock.now(),
                    };
                    if let Err(e) = self.db.save_interruption(&record) {
                        // The pause itself is already durable
                        warn!("[MONITOR] Failed to record interruption: {}", e);
                    }
                    info!(
                        "[MONITOR] Session {} paused by {:?}",
                        session_id, record.reason
                    );
                    outcome.interrupted_session = Some(session_id);
                }
            }
        }
        Ok(outcome)
    }

    /// The interruption to offer for resume, if it is recent and its session is
    /// still the paused one. Stale records are dropped.
    pub fn pending_interruption(&self) -> Option<InterruptionRecord> {
        let record = match self.db.load_interruption() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!("[MONITOR] Failed to read interruption record: {}", e);
                return None;
            }
        };

        let age = self.clock.now() - record.occurred_at;
        let still_paused = self
            .machine
            .snapshot()
            .map(|s| s.session_id == record.session_id && s.phase_state == PhaseState::Paused)
            .unwrap_or(false);
        if age > self.interruption_ttl || !still_paused {
            debug!(
                "[MONITOR] Dropping interruption for {} (age {}s, still paused: {})",
                record.session_id,
                age.num_seconds(),
                still_paused
            );
            self.dismiss_interruption();
            return None;
        }
        Some(record)
    }

    pub fn dismiss_interruption(&self) {
        if let Err(e) = self.db.clear_interruption() {
            warn!("[MONITOR] Failed to clear interruption record: {}", e);
        }
    }
}
