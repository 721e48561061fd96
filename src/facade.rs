use crate::auth::AuthContext;
use crate::engine::SessionMachine;
use crate::error::TimerError;
use crate::models::{
    FinishedSession, InterruptionRecord, QueueStats, SessionKind, TimerStatus,
};
use crate::monitor::{LifecycleEvent, MonitorOutcome, SuspensionMonitor};
use crate::sync::{ReplayReport, SyncManager};
use std::sync::Arc;
use tracing::warn;

/// Long-break cadence: after `long_break_interval` completed work sessions the
/// next break is a long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePolicy {
    pub long_break_interval: u32,
}

impl CyclePolicy {
    pub fn new(long_break_interval: u32) -> Self {
        Self {
            long_break_interval: long_break_interval.max(1),
        }
    }

    pub fn next_break_kind(&self, sessions_since_long_break: u32) -> SessionKind {
        if sessions_since_long_break >= self.long_break_interval {
            SessionKind::LongBreak
        } else {
            SessionKind::Break
        }
    }
}

/// The only entry point for the UI layer. Every call needs a signed-in user.
pub struct TimerFacade {
    auth: Arc<dyn AuthContext>,
    machine: Arc<SessionMachine>,
    monitor: Arc<SuspensionMonitor>,
    sync: Arc<SyncManager>,
    policy: CyclePolicy,
}

impl TimerFacade {
    pub fn new(
        auth: Arc<dyn AuthContext>,
        machine: Arc<SessionMachine>,
        monitor: Arc<SuspensionMonitor>,
        sync: Arc<SyncManager>,
        policy: CyclePolicy,
    ) -> Self {
        Self {
            auth,
            machine,
            monitor,
            sync,
            policy,
        }
    }

    fn require_user(&self) -> Result<String, TimerError> {
        self.auth.current_user_id().ok_or_else(|| {
            warn!("[TIMER] Rejected call without an authenticated user");
            TimerError::Unauthenticated
        })
    }

    /// `planned_duration_seconds` is resolved by the caller from its own settings.
    pub fn start(
        &self,
        kind: SessionKind,
        planned_duration_seconds: u64,
    ) -> Result<String, TimerError> {
        let user_id = self.require_user()?;
        self.machine.start(&user_id, kind, planned_duration_seconds)
    }

    pub fn pause(&self) -> Result<(), TimerError> {
        self.require_user()?;
        self.machine.pause()
    }

    pub fn resume(&self) -> Result<(), TimerError> {
        self.require_user()?;
        self.machine.resume()?;
        self.monitor.dismiss_interruption();
        Ok(())
    }

    pub fn complete(
        &self,
        actual_duration_seconds: Option<u64>,
        was_completed: bool,
    ) -> Result<FinishedSession, TimerError> {
        self.require_user()?;
        let finished = self.machine.complete(actual_duration_seconds, was_completed)?;
        self.monitor.dismiss_interruption();
        Ok(finished)
    }

    pub fn cancel(&self) -> Result<FinishedSession, TimerError> {
        self.require_user()?;
        let finished = self.machine.cancel()?;
        self.monitor.dismiss_interruption();
        Ok(finished)
    }

    pub fn get_elapsed_seconds(&self) -> Result<u64, TimerError> {
        self.require_user()?;
        Ok(self.machine.elapsed_seconds())
    }

    /// Poll target for the UI tick. Also completes a session that just reached its plan.
    pub fn status(&self) -> Result<TimerStatus, TimerError> {
        self.require_user()?;
        self.machine.check_completion()?;
        Ok(self.machine.status())
    }

    pub fn sessions_since_long_break(&self) -> Result<u32, TimerError> {
        self.require_user()?;
        Ok(self.machine.sessions_since_long_break())
    }

    pub fn next_break_kind(&self) -> Result<SessionKind, TimerError> {
        Ok(self
            .policy
            .next_break_kind(self.sessions_since_long_break()?))
    }

    pub fn recover(&self) -> Result<bool, TimerError> {
        self.require_user()?;
        self.machine.recover_from_cold_start()
    }

    pub fn pending_interruption(&self) -> Result<Option<InterruptionRecord>, TimerError> {
        self.require_user()?;
        Ok(self.monitor.pending_interruption())
    }

    pub async fn process_offline_queue(&self) -> Result<ReplayReport, TimerError> {
        self.require_user()?;
        self.machine.flush().await;
        self.sync.process_offline_queue().await
    }

    pub fn queue_stats(&self) -> Result<QueueStats, TimerError> {
        self.require_user()?;
        self.sync.queue_stats()
    }

    /// Forward a lifecycle event. Coming to the foreground also replays the queue.
    pub async fn on_lifecycle(&self, event: LifecycleEvent) -> Result<MonitorOutcome, TimerError> {
        let foreground = event == LifecycleEvent::Foreground;
        let outcome = self.monitor.handle(event)?;
        if foreground && self.auth.current_user_id().is_some() {
            self.machine.flush().await;
            if let Err(e) = self.sync.process_offline_queue().await {
                warn!("[SYNC] Replay on foreground failed: {}", e);
            }
        }
        Ok(outcome)
    }

    /// Wait until remote writes submitted so far were applied or queued.
    pub async fn settle(&self) {
        self.machine.flush().await;
    }
}
