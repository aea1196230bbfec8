use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use holdwatch_core::types::{Dispute, EscrowHold};
use holdwatch_storage::{Database, NewDispute, NewEscrowHold};

use crate::engine::Clock;

pub const FIXED_NOW: &str = "2024-03-01T12:00:00Z";

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(FIXED_NOW)
        .expect("fixed time")
        .with_timezone(&Utc)
}

pub fn fixed_clock() -> Clock {
    let now = fixed_now();
    Arc::new(move || now)
}

pub async fn setup_db() -> (Database, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
    let db = Database::connect(&url).await.expect("connect");
    db.run_migrations().await.expect("migrations");
    (db, dir)
}

pub async fn insert_hold(db: &Database, order_id: &str, seller_id: &str, age_days: i64) -> EscrowHold {
    db.holds()
        .insert(&NewEscrowHold {
            order_id,
            buyer_id: "buyer-1",
            seller_id,
            amount_cents: 1_000,
            currency: "USD",
            hold_duration_days: 30,
            created_at: fixed_now() - Duration::days(age_days),
        })
        .await
        .expect("insert hold")
}

pub async fn open_dispute(db: &Database, order_id: &str, reason: &str, age_days: i64) -> Dispute {
    db.disputes()
        .open(&NewDispute {
            order_id,
            reason,
            escalation_threshold_days: 5,
            opened_at: fixed_now() - Duration::days(age_days),
        })
        .await
        .expect("open dispute")
}
