use crate::clock::Clock;
use crate::error::NotificationError;
use crate::models::{SessionKind, TimerSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Completion,
    Progress { remaining_minutes: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    /// Stable per session and purpose, so re-scheduling replaces instead of duplicating.
    pub id: String,
    pub session_id: String,
    pub fire_at: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
}

/// Local notification delivery offered by the host OS.
pub trait NotificationPlatform: Send + Sync {
    /// Schedule for an absolute time. Scheduling an id that is already pending replaces it.
    fn schedule(&self, request: &NotificationRequest) -> Result<(), NotificationError>;
    fn cancel(&self, id: &str);
    /// Show right away.
    fn present(&self, request: &NotificationRequest) -> Result<(), NotificationError>;
}

fn completion_id(session_id: &str) -> String {
    format!("{}:completion", session_id)
}

fn progress_id(session_id: &str, minutes: u64) -> String {
    format!("{}:remaining-{}m", session_id, minutes)
}

fn completion_text(kind: SessionKind) -> (&'static str, &'static str) {
    match kind {
        SessionKind::Work => ("Focus session complete", "Nice work. Time for a break."),
        SessionKind::Break => ("Break is over", "Ready to focus again?"),
        SessionKind::LongBreak => ("Long break is over", "Ready to start a new cycle?"),
    }
}

/// Keeps the platform's pending notifications in step with the running session.
pub struct NotificationScheduler {
    platform: Arc<dyn NotificationPlatform>,
    clock: Arc<dyn Clock>,
    checkpoints_minutes: Vec<u64>,
    pending: Mutex<HashMap<String, Vec<NotificationRequest>>>,
}

impl NotificationScheduler {
    pub fn new(
        platform: Arc<dyn NotificationPlatform>,
        clock: Arc<dyn Clock>,
        checkpoints_minutes: Vec<u64>,
    ) -> Self {
        Self {
            platform,
            clock,
            checkpoints_minutes,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, Vec<NotificationRequest>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("[NOTIFY] Pending map poisoned, continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Schedule the completion notification, replacing any earlier one for the session.
    pub fn schedule_completion(
        &self,
        session_id: &str,
        kind: SessionKind,
        completion_at: DateTime<Utc>,
    ) -> Result<(), NotificationError> {
        let id = completion_id(session_id);
        let mut pending = self.lock_pending();
        let entries = pending.entry(session_id.to_string()).or_default();
        if let Some(pos) = entries.iter().position(|r| r.id == id) {
            entries.remove(pos);
            self.platform.cancel(&id);
        }

        if completion_at <= self.clock.now() {
            return Err(NotificationError::InPast(format!(
                "completion for {} at {}",
                session_id, completion_at
            )));
        }

        let (title, body) = completion_text(kind);
        let request = NotificationRequest {
            id,
            session_id: session_id.to_string(),
            fire_at: completion_at,
            title: title.to_string(),
            body: body.to_string(),
            kind: NotificationKind::Completion,
        };
        self.platform.schedule(&request)?;
        debug!(
            "[NOTIFY] Completion for {} scheduled at {}",
            session_id, completion_at
        );
        entries.push(request);
        Ok(())
    }

    /// One reminder per checkpoint still ahead of `remaining_seconds`. Replaces earlier
    /// reminders for the session; returns how many were scheduled.
    pub fn schedule_progress_reminders(
        &self,
        session_id: &str,
        remaining_seconds: u64,
    ) -> Result<usize, NotificationError> {
        let now = self.clock.now();
        let mut pending = self.lock_pending();
        let entries = pending.entry(session_id.to_string()).or_default();
        entries.retain(|r| {
            let stale = matches!(r.kind, NotificationKind::Progress { .. });
            if stale {
                self.platform.cancel(&r.id);
            }
            !stale
        });

        let mut scheduled = 0;
        for &minutes in &self.checkpoints_minutes {
            let checkpoint_secs = minutes.saturating_mul(60);
            if checkpoint_secs == 0 || checkpoint_secs >= remaining_seconds {
                continue;
            }
            let lead = remaining_seconds - checkpoint_secs;
            let Some(fire_at) = i64::try_from(lead)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|lead| now.checked_add_signed(lead))
            else {
                warn!(
                    "[NOTIFY] Checkpoint {}m for {} is out of range, skipped",
                    minutes, session_id
                );
                continue;
            };
            let request = NotificationRequest {
                id: progress_id(session_id, minutes),
                session_id: session_id.to_string(),
                fire_at,
                title: format!("{} minutes left", minutes),
                body: "Keep going, you're almost there.".to_string(),
                kind: NotificationKind::Progress {
                    remaining_minutes: minutes,
                },
            };
            self.platform.schedule(&request)?;
            entries.push(request);
            scheduled += 1;
        }
        Ok(scheduled)
    }

    /// Completion plus progress reminders projected from a running snapshot.
    pub fn schedule_for(&self, snapshot: &TimerSnapshot) -> Result<(), NotificationError> {
        let now = self.clock.now();
        self.schedule_completion(
            &snapshot.session_id,
            snapshot.kind,
            snapshot.projected_completion_at(now),
        )?;
        self.schedule_progress_reminders(&snapshot.session_id, snapshot.remaining_seconds_at(now))?;
        Ok(())
    }

    pub fn cancel_all(&self, session_id: &str) {
        let removed = self.lock_pending().remove(session_id).unwrap_or_default();
        for request in &removed {
            self.platform.cancel(&request.id);
        }
        if !removed.is_empty() {
            debug!(
                "[NOTIFY] Cancelled {} pending notification(s) for {}",
                removed.len(),
                session_id
            );
        }
    }

    /// Cancel everything not belonging to `keep`.
    pub fn cancel_except(&self, keep: Option<&str>) {
        let stale: Vec<String> = self
            .lock_pending()
            .keys()
            .filter(|sid| Some(sid.as_str()) != keep)
            .cloned()
            .collect();
        for session_id in stale {
            self.cancel_all(&session_id);
        }
    }

    pub fn pending_for(&self, session_id: &str) -> Vec<NotificationRequest> {
        self.lock_pending()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_completion(&self, session_id: &str) -> bool {
        self.lock_pending()
            .get(session_id)
            .map(|entries| entries.iter().any(|r| r.kind == NotificationKind::Completion))
            .unwrap_or(false)
    }

    /// The timer finished in the foreground: drop what is pending and show completion now.
    pub fn present_completion(
        &self,
        session_id: &str,
        kind: SessionKind,
    ) -> Result<(), NotificationError> {
        self.cancel_all(session_id);
        let (title, body) = completion_text(kind);
        let request = NotificationRequest {
            id: completion_id(session_id),
            session_id: session_id.to_string(),
            fire_at: self.clock.now(),
            title: title.to_string(),
            body: body.to_string(),
            kind: NotificationKind::Completion,
        };
        info!("[NOTIFY] Presenting completion for {}", session_id);
        self.platform.present(&request)
    }
}

/// In-process platform: each notification is a tokio sleep task that pushes the
/// request into a channel when it fires.
pub struct TokioNotificationPlatform {
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    delivered: mpsc::UnboundedSender<NotificationRequest>,
}

impl TokioNotificationPlatform {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<NotificationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                clock,
                tasks: Mutex::new(HashMap::new()),
                delivered: tx,
            },
            rx,
        )
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl NotificationPlatform for TokioNotificationPlatform {
    fn schedule(&self, request: &NotificationRequest) -> Result<(), NotificationError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NotificationError::Unavailable(e.to_string()))?;
        let delay = (request.fire_at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let tx = self.delivered.clone();
        let payload = request.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(payload);
        });

        let mut tasks = self.lock_tasks();
        tasks.retain(|_, h| !h.is_finished());
        if let Some(previous) = tasks.insert(request.id.clone(), handle) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self, id: &str) {
        if let Some(handle) = self.lock_tasks().remove(id) {
            handle.abort();
        }
    }

    fn present(&self, request: &NotificationRequest) -> Result<(), NotificationError> {
        self.delivered
            .send(request.clone())
            .map_err(|e| NotificationError::Unavailable(e.to_string()))
    }
}

impl Drop for TokioNotificationPlatform {
    fn drop(&mut self) {
        for (_, handle) in self.lock_tasks().drain() {
            handle.abort();
        }
    }
}
