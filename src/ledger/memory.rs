use super::SessionLedger;
use crate::error::LedgerError;
use crate::models::{Finalization, RemoteSessionRecord, UserAggregates};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct LedgerState {
    sessions: HashMap<(String, String), RemoteSessionRecord>,
    aggregates: HashMap<String, UserAggregates>,
}

/// In-process ledger. Reachability can be switched off to simulate an outage.
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    reachable: AtomicBool,
    /// CAS calls that will report a lost race before succeeding
    pending_cas_conflicts: AtomicU32,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            reachable: AtomicBool::new(true),
            pending_cas_conflicts: AtomicU32::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn inject_cas_conflicts(&self, count: u32) {
        self.pending_cas_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn sessions_for(&self, user_id: &str) -> Vec<RemoteSessionRecord> {
        let mut records: Vec<RemoteSessionRecord> = match self.state.lock() {
            Ok(state) => state
                .sessions
                .iter()
                .filter(|((uid, _), _)| uid == user_id)
                .map(|(_, r)| r.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        records.sort_by_key(|r| r.started_at);
        records
    }

    pub fn aggregates_for(&self, user_id: &str) -> UserAggregates {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.aggregates.get(user_id).cloned())
            .unwrap_or_default()
    }

    /// Seed a user's aggregate document directly.
    pub fn put_aggregates(&self, user_id: &str, aggregates: UserAggregates) {
        if let Ok(mut state) = self.state.lock() {
            state.aggregates.insert(user_id.to_string(), aggregates);
        }
    }

    fn connect(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unreachable("memory ledger offline".into()));
        }
        self.state
            .lock()
            .map_err(|e| LedgerError::Unreachable(format!("ledger state poisoned: {}", e)))
    }
}

#[async_trait]
impl SessionLedger for MemoryLedger {
    async fn create_session(
        &self,
        user_id: &str,
        record: &RemoteSessionRecord,
    ) -> Result<String, LedgerError> {
        let mut state = self.connect()?;
        state
            .sessions
            .entry((user_id.to_string(), record.session_id.clone()))
            .or_insert_with(|| record.clone());
        Ok(record.session_id.clone())
    }

    async fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        finalization: &Finalization,
    ) -> Result<(), LedgerError> {
        let mut state = self.connect()?;
        let record = state
            .sessions
            .get_mut(&(user_id.to_string(), session_id.to_string()))
            .ok_or_else(|| LedgerError::NotFound(session_id.to_string()))?;
        record.actual_duration_seconds = Some(finalization.actual_duration_seconds);
        record.ended_at = Some(finalization.ended_at);
        record.completed = finalization.completed;
        record.interrupted = finalization.interrupted;
        Ok(())
    }

    async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<RemoteSessionRecord>, LedgerError> {
        let state = self.connect()?;
        Ok(state
            .sessions
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn load_aggregates(&self, user_id: &str) -> Result<UserAggregates, LedgerError> {
        let state = self.connect()?;
        Ok(state.aggregates.get(user_id).cloned().unwrap_or_default())
    }

    async fn compare_and_swap_aggregates(
        &self,
        user_id: &str,
        expected_version: u64,
        next: &UserAggregates,
    ) -> Result<bool, LedgerError> {
        let mut state = self.connect()?;
        if self
            .pending_cas_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(false);
        }
        let stored_version = state
            .aggregates
            .get(user_id)
            .map(|a| a.version)
            .unwrap_or(0);
        if stored_version != expected_version {
            return Ok(false);
        }
        state.aggregates.insert(user_id.to_string(), next.clone());
        Ok(true)
    }
}
