//! Dispatch classification.

use std::time::Duration;

use agentdesk_store::RunState;

/// Outcome of classifying an inbound item against a project's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    /// Start with no prior context.
    Fresh,
    /// Resume the previous conversation.
    Continue,
    /// A live run owns the project; refuse.
    Busy,
}

/// Whether an active run has gone longer than `ttl` without a heartbeat.
pub fn lease_expired(state: &RunState, now_ms: i64, ttl: Duration) -> bool {
    let last = state.heartbeat_at.unwrap_or(state.updated_at);
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(last) > ttl_ms
}

/// Classify an inbound item. Pure: reads `state` once and never re-queries.
///
/// A run that ended without completing, or whose lease expired, is resumed
/// when the run task still holds context for the project and restarted
/// fresh otherwise.
pub fn classify(
    state: Option<&RunState>,
    now_ms: i64,
    lease_ttl: Duration,
    context_available: bool,
) -> RunDecision {
    let state = match state {
        Some(s) => s,
        None => return RunDecision::Fresh,
    };

    if state.is_completed {
        return RunDecision::Continue;
    }

    if state.is_active && !lease_expired(state, now_ms, lease_ttl) {
        return RunDecision::Busy;
    }

    if context_available {
        RunDecision::Continue
    } else {
        RunDecision::Fresh
    }
}
