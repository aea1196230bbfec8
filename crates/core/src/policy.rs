use chrono::{DateTime, Duration, Utc};

use crate::types::{Dispute, EscrowHold, HoldStatus};

/// Default day counts applied to new records and to engine runs without overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowPolicy {
    pub hold_duration_days: u32,
    pub reminder_window_days: u32,
    pub escalation_threshold_days: u32,
}

impl EscrowPolicy {
    pub const DEFAULT_HOLD_DURATION_DAYS: u32 = 30;
    pub const DEFAULT_REMINDER_WINDOW_DAYS: u32 = 5;
    pub const DEFAULT_ESCALATION_THRESHOLD_DAYS: u32 = 5;
}

impl Default for EscrowPolicy {
    fn default() -> Self {
        Self {
            hold_duration_days: Self::DEFAULT_HOLD_DURATION_DAYS,
            reminder_window_days: Self::DEFAULT_REMINDER_WINDOW_DAYS,
            escalation_threshold_days: Self::DEFAULT_ESCALATION_THRESHOLD_DAYS,
        }
    }
}

fn days(value: u32) -> Duration {
    Duration::days(i64::from(value))
}

/// Instant at which the hold's own duration elapses.
pub fn release_at(hold: &EscrowHold) -> DateTime<Utc> {
    hold.created_at + days(hold.hold_duration_days)
}

/// Returns `true` when the hold is waiting for release and old enough to be paid out.
///
/// `threshold_override` replaces the hold's own `hold_duration_days`. The
/// dispute block is enforced by the store, not here.
pub fn release_due(hold: &EscrowHold, now: DateTime<Utc>, threshold_override: Option<u32>) -> bool {
    if !hold.status.is_pending_release() {
        return false;
    }
    let threshold = threshold_override.unwrap_or(hold.hold_duration_days);
    now - hold.created_at >= days(threshold)
}

/// Returns `true` when the hold is within `window_days` of its release and has
/// never been reminded.
pub fn reminder_due(hold: &EscrowHold, now: DateTime<Utc>, window_days: u32) -> bool {
    if hold.status != HoldStatus::Active || hold.reminder_sent_at.is_some() {
        return false;
    }
    let lead = hold.hold_duration_days.saturating_sub(window_days);
    now - hold.created_at >= days(lead)
}

/// Returns `true` when the dispute is still open or under review past its threshold.
pub fn escalation_due(
    dispute: &Dispute,
    now: DateTime<Utc>,
    threshold_override: Option<u32>,
) -> bool {
    if !dispute.status.is_escalatable() {
        return false;
    }
    let threshold = threshold_override.unwrap_or(dispute.escalation_threshold_days);
    now - dispute.opened_at >= days(threshold)
}
