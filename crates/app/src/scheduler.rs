use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use holdwatch_core::types::BatchResult;

use crate::engine::{EngineError, Engines};

/// In-process driver for the three engines when no external cron is configured.
#[derive(Clone)]
pub struct Scheduler {
    engines: Engines,
    reminder_window_days: u32,
    interval: Duration,
}

/// Outcome of one scheduler pass. `None` marks an engine that could not list its candidates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPass {
    pub released: Option<BatchResult>,
    pub reminded: Option<BatchResult>,
    pub escalated: Option<BatchResult>,
}

impl Scheduler {
    pub fn new(engines: Engines, reminder_window_days: u32, interval: Duration) -> Self {
        Self {
            engines,
            reminder_window_days,
            interval,
        }
    }

    /// Runs the scheduler loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    /// Runs release, reminders and escalation once, in that order.
    ///
    /// A batch-fatal error in one engine is logged and does not stop the others.
    pub async fn run_once(&self) -> SchedulerPass {
        let released = settle("release", self.engines.release.run(None).await);
        let reminded = settle(
            "reminder",
            self.engines.reminders.run(self.reminder_window_days).await,
        );
        let escalated = settle("escalation", self.engines.escalation.run(None).await);

        SchedulerPass {
            released,
            reminded,
            escalated,
        }
    }
}

fn settle(engine: &'static str, result: Result<BatchResult, EngineError>) -> Option<BatchResult> {
    match result {
        Ok(result) => {
            info!(
                stage = "scheduler",
                engine,
                succeeded = result.succeeded,
                failed = result.failed,
                skipped = result.skipped,
                "scheduled engine pass completed"
            );
            Some(result)
        }
        Err(err) => {
            error!(stage = "scheduler", engine, error = %err, "scheduled engine pass failed");
            None
        }
    }
}
