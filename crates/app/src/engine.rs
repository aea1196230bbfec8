use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use thiserror::Error;

use holdwatch_core::types::BatchResult;
use holdwatch_storage::{Database, DisputeError, HoldError};

use crate::escalation::DisputeEscalationEngine;
use crate::notify::NotificationQueue;
use crate::release::HoldReleaseEngine;
use crate::reminder::ReminderDispatcher;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The three batch engines wired to one database, notification queue and clock.
#[derive(Clone)]
pub struct Engines {
    pub release: HoldReleaseEngine,
    pub reminders: ReminderDispatcher,
    pub escalation: DisputeEscalationEngine,
}

impl Engines {
    pub fn new(database: Database, notifier: NotificationQueue, clock: Clock) -> Self {
        Self {
            release: HoldReleaseEngine::new(database.clone(), notifier.clone(), clock.clone()),
            reminders: ReminderDispatcher::new(database.clone(), notifier.clone(), clock.clone()),
            escalation: DisputeEscalationEngine::new(database, notifier, clock),
        }
    }
}

/// Failure that prevents an engine from enumerating its candidates at all.
///
/// Per-record failures never surface here; they are counted in
/// [`BatchResult::failed`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to list escrow holds: {0}")]
    Holds(#[from] HoldError),
    #[error("failed to list disputes: {0}")]
    Disputes(#[from] DisputeError),
}

/// Accumulates per-record outcomes for one engine pass and mirrors them to metrics.
pub(crate) struct BatchTally {
    engine: &'static str,
    started: Instant,
    result: BatchResult,
}

impl BatchTally {
    pub(crate) fn start(engine: &'static str) -> Self {
        counter!("engine_runs_total", "engine" => engine).increment(1);
        Self {
            engine,
            started: Instant::now(),
            result: BatchResult::default(),
        }
    }

    pub(crate) fn succeeded(&mut self) {
        self.result.succeeded += 1;
        counter!("engine_records_total", "engine" => self.engine, "outcome" => "succeeded")
            .increment(1);
    }

    pub(crate) fn failed(&mut self) {
        self.result.failed += 1;
        counter!("engine_records_total", "engine" => self.engine, "outcome" => "failed")
            .increment(1);
    }

    pub(crate) fn skipped(&mut self) {
        self.result.skipped += 1;
        counter!("engine_records_total", "engine" => self.engine, "outcome" => "skipped")
            .increment(1);
    }

    pub(crate) fn finish(self) -> BatchResult {
        histogram!("engine_run_seconds", "engine" => self.engine)
            .record(self.started.elapsed().as_secs_f64());
        self.result
    }
}
