use crate::error::LedgerError;
use crate::models::{AggregateDelta, Finalization, RemoteSessionRecord, UserAggregates};
use async_trait::async_trait;
use tracing::{debug, warn};

mod aggregates;
mod http;
mod memory;

pub use aggregates::{advance_streak, apply_delta, COUNTED_SESSION_WINDOW};
pub use http::HttpSessionLedger;
pub use memory::MemoryLedger;

/// Compare-and-set attempts before an aggregate increment gives up as `Conflict`.
pub const MAX_CAS_ATTEMPTS: u32 = 8;

/// Durable backend for session records and per-user aggregates.
///
/// Every call must be safe to retry with the same session id: the offline queue
/// replays them after partial failures.
#[async_trait]
pub trait SessionLedger: Send + Sync {
    /// Create the record. Creating an id that already exists is not an error and
    /// does not overwrite it. Returns the backend's id for the record.
    async fn create_session(
        &self,
        user_id: &str,
        record: &RemoteSessionRecord,
    ) -> Result<String, LedgerError>;

    async fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        finalization: &Finalization,
    ) -> Result<(), LedgerError>;

    /// Existence check used to dedupe replay.
    async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<RemoteSessionRecord>, LedgerError>;

    async fn load_aggregates(&self, user_id: &str) -> Result<UserAggregates, LedgerError>;

    /// Store `next` only if the stored version still equals `expected_version`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap_aggregates(
        &self,
        user_id: &str,
        expected_version: u64,
        next: &UserAggregates,
    ) -> Result<bool, LedgerError>;

    /// Apply counters and streak together in one compare-and-set. A delta whose
    /// session was already counted is a no-op.
    async fn increment_user_aggregates(
        &self,
        user_id: &str,
        delta: &AggregateDelta,
    ) -> Result<UserAggregates, LedgerError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.load_aggregates(user_id).await?;
            let mut next = current.clone();
            if !apply_delta(&mut next, delta) {
                debug!(
                    "[LEDGER] Session {} already counted for user {}, skipping increment",
                    delta.session_id, user_id
                );
                return Ok(current);
            }
            next.version = current.version + 1;
            if self
                .compare_and_swap_aggregates(user_id, current.version, &next)
                .await?
            {
                return Ok(next);
            }
            warn!(
                "[LEDGER] Aggregate CAS conflict for user {} (attempt {}/{})",
                user_id, attempt, MAX_CAS_ATTEMPTS
            );
        }
        Err(LedgerError::Conflict(format!(
            "aggregates for {} changed concurrently {} times",
            user_id, MAX_CAS_ATTEMPTS
        )))
    }
}
