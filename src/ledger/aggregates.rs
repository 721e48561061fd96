use crate::models::{AggregateDelta, UserAggregates};
use chrono::NaiveDate;

/// How many counted session ids the aggregate document remembers.
pub const COUNTED_SESSION_WINDOW: usize = 64;

/// Streak rule for a completed work session on `today`:
/// yesterday → +1, today → unchanged, anything else → 1.
/// A day older than `last_active_date` (a late offline replay) leaves the streak
/// and the date alone; `last_active_date` only moves forward.
pub fn advance_streak(aggregates: &mut UserAggregates, today: NaiveDate) {
    if matches!(aggregates.last_active_date, Some(last) if today < last) {
        return;
    }
    let yesterday = today.pred_opt();
    match aggregates.last_active_date {
        Some(last) if last == today => {}
        Some(last) if Some(last) == yesterday => {
            aggregates.current_streak = aggregates.current_streak.saturating_add(1);
        }
        _ => aggregates.current_streak = 1,
    }
    // A same-day completion on a fresh document still starts the streak
    if aggregates.current_streak == 0 {
        aggregates.current_streak = 1;
    }
    aggregates.longest_streak = aggregates.longest_streak.max(aggregates.current_streak);
    aggregates.last_active_date = Some(today);
}

/// Fold `delta` into `aggregates`. Returns `false` (and leaves it untouched) if the
/// delta's session was already counted.
pub fn apply_delta(aggregates: &mut UserAggregates, delta: &AggregateDelta) -> bool {
    if aggregates
        .counted_session_ids
        .iter()
        .any(|id| id == &delta.session_id)
    {
        return false;
    }

    aggregates.total_sessions = aggregates.total_sessions.saturating_add(delta.sessions);
    aggregates.total_focus_minutes = aggregates
        .total_focus_minutes
        .saturating_add(delta.focus_minutes);
    if delta.counts_toward_streak {
        advance_streak(aggregates, delta.active_date);
    }

    aggregates.counted_session_ids.push(delta.session_id.clone());
    let overflow = aggregates
        .counted_session_ids
        .len()
        .saturating_sub(COUNTED_SESSION_WINDOW);
    if overflow > 0 {
        aggregates.counted_session_ids.drain(..overflow);
    }
    true
}
