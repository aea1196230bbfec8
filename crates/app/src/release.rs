use chrono::{DateTime, Duration, Utc};
use tracing::{error, info};

use holdwatch_core::policy;
use holdwatch_core::types::{
    BatchResult, EscrowHold, Notification, NotificationCategory, NotificationSeverity,
};
use holdwatch_storage::{Database, TransitionOutcome};

use crate::engine::{BatchTally, Clock, EngineError};
use crate::notify::NotificationQueue;

const ENGINE: &str = "release";

/// Releases escrow holds whose dispute-free period has elapsed and credits sellers.
#[derive(Clone)]
pub struct HoldReleaseEngine {
    database: Database,
    notifier: NotificationQueue,
    clock: Clock,
}

impl HoldReleaseEngine {
    pub fn new(database: Database, notifier: NotificationQueue, clock: Clock) -> Self {
        Self {
            database,
            notifier,
            clock,
        }
    }

    /// Runs one release pass.
    ///
    /// `threshold_days` replaces each hold's own duration when given. Holds
    /// whose order has an unresolved dispute are never released.
    pub async fn run(&self, threshold_days: Option<u32>) -> Result<BatchResult, EngineError> {
        let now = (self.clock)();
        let created_before = now - Duration::days(i64::from(threshold_days.unwrap_or(0)));
        let holds = self.database.holds();
        let candidates = holds.list_release_candidates(created_before).await?;

        let mut tally = BatchTally::start(ENGINE);
        for hold in candidates
            .iter()
            .filter(|hold| policy::release_due(hold, now, threshold_days))
        {
            match holds.release(&hold.id, now).await {
                Ok(TransitionOutcome::Applied) => {
                    tally.succeeded();
                    info!(
                        stage = ENGINE,
                        hold_id = %hold.id,
                        order_id = %hold.order_id,
                        seller_id = %hold.seller_id,
                        amount_cents = hold.amount_cents,
                        "escrow hold released"
                    );
                    self.notify_released(hold, now);
                }
                Ok(TransitionOutcome::Skipped) => {
                    tally.skipped();
                    info!(
                        stage = ENGINE,
                        hold_id = %hold.id,
                        "hold changed since listing; release skipped"
                    );
                }
                Err(err) => {
                    tally.failed();
                    error!(
                        stage = ENGINE,
                        hold_id = %hold.id,
                        order_id = %hold.order_id,
                        error = %err,
                        "failed to release escrow hold"
                    );
                }
            }
        }

        let result = tally.finish();
        info!(
            stage = ENGINE,
            candidates = candidates.len(),
            released = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "auto-release pass completed"
        );
        Ok(result)
    }

    fn notify_released(&self, hold: &EscrowHold, now: DateTime<Utc>) {
        let amount = format_amount(hold.amount_cents, &hold.currency);
        self.notifier.notify(Notification::new(
            &hold.seller_id,
            NotificationCategory::Escrow,
            NotificationSeverity::Info,
            format!(
                "Escrow for order {} was released; {amount} has been credited to your balance.",
                hold.order_id
            ),
            &hold.id,
            now,
        ));
        self.notifier.notify(Notification::new(
            &hold.buyer_id,
            NotificationCategory::Escrow,
            NotificationSeverity::Info,
            format!(
                "The hold period for order {} ended without a dispute; {amount} was released to the seller.",
                hold.order_id
            ),
            &hold.id,
            now,
        ));
    }
}

pub(crate) fn format_amount(amount_cents: i64, currency: &str) -> String {
    let sign = if amount_cents < 0 { "-" } else { "" };
    let cents = amount_cents.unsigned_abs();
    format!("{sign}{}.{:02} {currency}", cents / 100, cents % 100)
}
