use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{error, info};

use holdwatch_core::policy;
use holdwatch_core::types::{
    BatchResult, EscrowHold, Notification, NotificationCategory, NotificationSeverity,
};
use holdwatch_storage::{Database, TransitionOutcome};

use crate::engine::{BatchTally, Clock, EngineError};
use crate::notify::NotificationQueue;
use crate::release::format_amount;

const ENGINE: &str = "reminder";

/// Warns buyers once that a hold is about to be released.
#[derive(Clone)]
pub struct ReminderDispatcher {
    database: Database,
    notifier: NotificationQueue,
    clock: Clock,
}

impl ReminderDispatcher {
    pub fn new(database: Database, notifier: NotificationQueue, clock: Clock) -> Self {
        Self {
            database,
            notifier,
            clock,
        }
    }

    /// Runs one reminder pass for holds within `window_days` of their release.
    ///
    /// The reminder timestamp is written before the notification is queued,
    /// so a hold is reminded at most once however often the pass runs.
    pub async fn run(&self, window_days: u32) -> Result<BatchResult, EngineError> {
        let now = (self.clock)();
        let holds = self.database.holds();
        let candidates = holds.list_reminder_candidates(now).await?;

        let mut tally = BatchTally::start(ENGINE);
        for hold in candidates
            .iter()
            .filter(|hold| policy::reminder_due(hold, now, window_days))
        {
            match holds.mark_reminder_sent(&hold.id, now).await {
                Ok(TransitionOutcome::Applied) => {
                    tally.succeeded();
                    info!(
                        stage = ENGINE,
                        hold_id = %hold.id,
                        buyer_id = %hold.buyer_id,
                        "auto-release reminder recorded"
                    );
                    self.notify_buyer(hold, now);
                }
                Ok(TransitionOutcome::Skipped) => {
                    tally.skipped();
                    info!(
                        stage = ENGINE,
                        hold_id = %hold.id,
                        "hold changed since listing; reminder skipped"
                    );
                }
                Err(err) => {
                    tally.failed();
                    error!(
                        stage = ENGINE,
                        hold_id = %hold.id,
                        error = %err,
                        "failed to record auto-release reminder"
                    );
                }
            }
        }

        let result = tally.finish();
        info!(
            stage = ENGINE,
            candidates = candidates.len(),
            reminders_sent = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "reminder pass completed"
        );
        Ok(result)
    }

    fn notify_buyer(&self, hold: &EscrowHold, now: DateTime<Utc>) {
        let release_at = policy::release_at(hold).to_rfc3339_opts(SecondsFormat::Secs, true);
        self.notifier.notify(Notification::new(
            &hold.buyer_id,
            NotificationCategory::Reminder,
            NotificationSeverity::Warning,
            format!(
                "{} held for order {} will be released to the seller at {release_at}. \
                 Open a dispute before then if something is wrong with the order.",
                format_amount(hold.amount_cents, &hold.currency),
                hold.order_id
            ),
            &hold.id,
            now,
        ));
    }
}
