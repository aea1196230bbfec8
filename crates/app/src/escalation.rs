use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use holdwatch_core::policy;
use holdwatch_core::types::{
    BatchResult, Dispute, Notification, NotificationCategory, NotificationSeverity,
    ADMIN_RECIPIENT,
};
use holdwatch_storage::{Database, TransitionOutcome};

use crate::engine::{BatchTally, Clock, EngineError};
use crate::notify::NotificationQueue;

const ENGINE: &str = "escalation";

/// Promotes disputes left unresolved past their threshold and alerts the admin queue.
#[derive(Clone)]
pub struct DisputeEscalationEngine {
    database: Database,
    notifier: NotificationQueue,
    clock: Clock,
}

impl DisputeEscalationEngine {
    pub fn new(database: Database, notifier: NotificationQueue, clock: Clock) -> Self {
        Self {
            database,
            notifier,
            clock,
        }
    }

    /// Runs one escalation pass.
    ///
    /// `threshold_days` replaces each dispute's own threshold when given.
    /// A failure on one dispute is logged and counted; the pass continues.
    pub async fn run(&self, threshold_days: Option<u32>) -> Result<BatchResult, EngineError> {
        let now = (self.clock)();
        let opened_before = now - Duration::days(i64::from(threshold_days.unwrap_or(0)));
        let disputes = self.database.disputes();
        let candidates = disputes.list_escalation_candidates(opened_before).await?;

        let mut tally = BatchTally::start(ENGINE);
        for dispute in candidates
            .iter()
            .filter(|dispute| policy::escalation_due(dispute, now, threshold_days))
        {
            match disputes.escalate(&dispute.id, now).await {
                Ok(TransitionOutcome::Applied) => {
                    tally.succeeded();
                    warn!(
                        stage = ENGINE,
                        dispute_id = %dispute.id,
                        order_id = %dispute.order_id,
                        opened_at = %dispute.opened_at.to_rfc3339(),
                        "dispute escalated"
                    );
                    self.notify_admin(dispute, now);
                }
                Ok(TransitionOutcome::Skipped) => {
                    tally.skipped();
                    info!(
                        stage = ENGINE,
                        dispute_id = %dispute.id,
                        "dispute changed since listing; escalation skipped"
                    );
                }
                Err(err) => {
                    tally.failed();
                    error!(
                        stage = ENGINE,
                        dispute_id = %dispute.id,
                        order_id = %dispute.order_id,
                        error = %err,
                        "failed to escalate dispute"
                    );
                }
            }
        }

        let result = tally.finish();
        info!(
            stage = ENGINE,
            candidates = candidates.len(),
            escalated = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            "escalation pass completed"
        );
        Ok(result)
    }

    fn notify_admin(&self, dispute: &Dispute, now: DateTime<Utc>) {
        let age_days = (now - dispute.opened_at).num_days();
        self.notifier.notify(Notification::new(
            ADMIN_RECIPIENT,
            NotificationCategory::Escalation,
            NotificationSeverity::Critical,
            format!(
                "Dispute {} on order {} has been unresolved for {age_days} days ({}) and was escalated.",
                dispute.id, dispute.order_id, dispute.reason
            ),
            &dispute.id,
            now,
        ));
    }
}
