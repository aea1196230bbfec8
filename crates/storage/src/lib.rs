use std::{borrow::Cow, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use holdwatch_core::types::{
    Dispute, DisputeOutcome, DisputeStatus, EscrowHold, HoldStatus, Notification,
    NotificationCategory, NotificationSeverity, UnknownStatus,
};

const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

const UNRESOLVED_DISPUTE_STATUSES: &str = "('open', 'under_review', 'escalated')";

const HOLD_COLUMNS: &str = "id, order_id, buyer_id, seller_id, amount_cents, currency, status, \
     created_at, hold_duration_days, reminder_sent_at, released_at";

const DISPUTE_COLUMNS: &str = "id, order_id, reason, status, opened_at, \
     escalation_threshold_days, escalated_at, resolved_at";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Every pooled connection gets WAL journaling, foreign keys and a busy
    /// timeout so concurrent writers wait instead of failing immediately.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Waits for checked-out connections to return and closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Returns a handle to operate on escrow holds.
    pub fn holds(&self) -> HoldRepository {
        HoldRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to operate on dispute cases.
    pub fn disputes(&self) -> DisputeRepository {
        DisputeRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for reading seller balances.
    pub fn seller_balances(&self) -> SellerBalanceRepository {
        SellerBalanceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the notification outbox.
    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of a conditional (compare-and-swap) status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record was still in the expected prior state and has been moved.
    Applied,
    /// No row matched the precondition; nothing was written.
    Skipped,
}

impl TransitionOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }

    fn from_rows_affected(rows: u64) -> Self {
        if rows == 1 {
            Self::Applied
        } else {
            Self::Skipped
        }
    }
}

/// Repository for escrow holds.
#[derive(Clone)]
pub struct HoldRepository {
    pool: SqlitePool,
}

impl HoldRepository {
    /// Creates a new `active` hold for an order.
    pub async fn insert(&self, record: &NewEscrowHold<'_>) -> Result<EscrowHold, HoldError> {
        let hold = EscrowHold {
            id: Uuid::new_v4().to_string(),
            order_id: record.order_id.to_string(),
            buyer_id: record.buyer_id.to_string(),
            seller_id: record.seller_id.to_string(),
            amount_cents: record.amount_cents,
            currency: record.currency.to_string(),
            status: HoldStatus::Active,
            created_at: record.created_at.trunc_subsecs(3),
            hold_duration_days: record.hold_duration_days,
            reminder_sent_at: None,
            released_at: None,
        };

        sqlx::query(
            "INSERT INTO escrow_holds \
             (id, order_id, buyer_id, seller_id, amount_cents, currency, status, created_at, hold_duration_days) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&hold.id)
        .bind(&hold.order_id)
        .bind(&hold.buyer_id)
        .bind(&hold.seller_id)
        .bind(hold.amount_cents)
        .bind(&hold.currency)
        .bind(hold.status.as_str())
        .bind(to_rfc3339(hold.created_at))
        .bind(i64::from(hold.hold_duration_days))
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err)
                if db_err.code() == Some(Cow::Borrowed(SQLITE_CONSTRAINT_UNIQUE)) =>
            {
                HoldError::DuplicateOrder
            }
            other => HoldError::Database(other),
        })?;

        Ok(hold)
    }

    /// Loads a hold by id.
    pub async fn fetch(&self, hold_id: &str) -> Result<Option<EscrowHold>, HoldError> {
        let sql = format!("SELECT {HOLD_COLUMNS} FROM escrow_holds WHERE id = ?");
        let row = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(hold_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(HoldRow::into_domain).transpose()
    }

    /// Loads the hold owned by an order.
    pub async fn fetch_by_order(&self, order_id: &str) -> Result<Option<EscrowHold>, HoldError> {
        let sql = format!("SELECT {HOLD_COLUMNS} FROM escrow_holds WHERE order_id = ?");
        let row = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(HoldRow::into_domain).transpose()
    }

    /// Lists holds awaiting release that were created at or before `created_before`
    /// and whose order has no unresolved dispute, oldest first.
    pub async fn list_release_candidates(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<EscrowHold>, HoldError> {
        let sql = format!(
            "SELECT {HOLD_COLUMNS} FROM escrow_holds AS h \
             WHERE h.status IN ('active', 'reminder_sent') \
               AND h.created_at <= ? \
               AND NOT EXISTS ( \
                   SELECT 1 FROM disputes AS d \
                    WHERE d.order_id = h.order_id \
                      AND d.status IN {UNRESOLVED_DISPUTE_STATUSES}) \
             ORDER BY h.created_at ASC, h.id ASC"
        );
        let rows = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(to_rfc3339(created_before))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(HoldRow::into_domain).collect()
    }

    /// Lists `active` holds that have not been reminded yet, oldest first.
    pub async fn list_reminder_candidates(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<EscrowHold>, HoldError> {
        let sql = format!(
            "SELECT {HOLD_COLUMNS} FROM escrow_holds \
             WHERE status = 'active' \
               AND reminder_sent_at IS NULL \
               AND created_at <= ? \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(to_rfc3339(created_before))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(HoldRow::into_domain).collect()
    }

    /// Releases a hold and credits the seller in one transaction.
    ///
    /// The status update only matches while the hold is still awaiting
    /// release and its order has no unresolved dispute, so concurrent runs
    /// credit each hold at most once.
    pub async fn release(
        &self,
        hold_id: &str,
        released_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, HoldError> {
        let released_at = to_rfc3339(released_at);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "UPDATE escrow_holds \
                SET status = 'released', released_at = ? \
              WHERE id = ? \
                AND status IN ('active', 'reminder_sent') \
                AND NOT EXISTS ( \
                    SELECT 1 FROM disputes AS d \
                     WHERE d.order_id = escrow_holds.order_id \
                       AND d.status IN {UNRESOLVED_DISPUTE_STATUSES}) \
             RETURNING seller_id, amount_cents"
        );
        let released = sqlx::query(&sql)
            .bind(&released_at)
            .bind(hold_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = released else {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Skipped);
        };

        let seller_id: String = row.get("seller_id");
        let amount_cents: i64 = row.get("amount_cents");
        sqlx::query(
            "INSERT INTO seller_balances (seller_id, balance_cents, updated_at) \
             VALUES (?, ?, ?) \
             ON CONFLICT(seller_id) DO UPDATE \
             SET balance_cents = balance_cents + excluded.balance_cents, \
                 updated_at = excluded.updated_at",
        )
        .bind(&seller_id)
        .bind(amount_cents)
        .bind(&released_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }

    /// Records the release reminder; matches only an `active`, never-reminded hold.
    pub async fn mark_reminder_sent(
        &self,
        hold_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, HoldError> {
        let result = sqlx::query(
            "UPDATE escrow_holds \
                SET status = 'reminder_sent', reminder_sent_at = ? \
              WHERE id = ? \
                AND status = 'active' \
                AND reminder_sent_at IS NULL",
        )
        .bind(to_rfc3339(sent_at))
        .bind(hold_id)
        .execute(&self.pool)
        .await?;

        Ok(TransitionOutcome::from_rows_affected(result.rows_affected()))
    }
}

/// Parameters required to create a hold.
pub struct NewEscrowHold<'a> {
    pub order_id: &'a str,
    pub buyer_id: &'a str,
    pub seller_id: &'a str,
    pub amount_cents: i64,
    pub currency: &'a str,
    pub hold_duration_days: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct HoldRow {
    id: String,
    order_id: String,
    buyer_id: String,
    seller_id: String,
    amount_cents: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    hold_duration_days: i64,
    reminder_sent_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

impl HoldRow {
    fn into_domain(self) -> Result<EscrowHold, HoldError> {
        Ok(EscrowHold {
            status: self.status.parse()?,
            id: self.id,
            order_id: self.order_id,
            buyer_id: self.buyer_id,
            seller_id: self.seller_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            created_at: self.created_at,
            hold_duration_days: clamp_days(self.hold_duration_days),
            reminder_sent_at: self.reminder_sent_at,
            released_at: self.released_at,
        })
    }
}

/// Errors that can occur while reading or mutating holds.
#[derive(Debug, Error)]
pub enum HoldError {
    #[error("order already has an escrow hold")]
    DuplicateOrder,
    #[error("failed to decode hold row: {0}")]
    Decode(#[from] UnknownStatus),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for dispute cases.
#[derive(Clone)]
pub struct DisputeRepository {
    pool: SqlitePool,
}

impl DisputeRepository {
    /// Opens a dispute and moves the order's pending hold to `disputed`.
    ///
    /// Only a hold still awaiting release can be disputed; a released hold or
    /// one frozen by an earlier resolved dispute is refused.
    pub async fn open(&self, record: &NewDispute<'_>) -> Result<Dispute, DisputeError> {
        let dispute = Dispute {
            id: Uuid::new_v4().to_string(),
            order_id: record.order_id.to_string(),
            reason: record.reason.to_string(),
            status: DisputeStatus::Open,
            opened_at: record.opened_at.trunc_subsecs(3),
            escalation_threshold_days: record.escalation_threshold_days,
            escalated_at: None,
            resolved_at: None,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO disputes \
             (id, order_id, reason, status, opened_at, escalation_threshold_days) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&dispute.id)
        .bind(&dispute.order_id)
        .bind(&dispute.reason)
        .bind(dispute.status.as_str())
        .bind(to_rfc3339(dispute.opened_at))
        .bind(i64::from(dispute.escalation_threshold_days))
        .execute(&mut *tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(Cow::into_owned);
                match code.as_deref() {
                    Some(SQLITE_CONSTRAINT_FOREIGNKEY) => DisputeError::HoldMissing,
                    Some(SQLITE_CONSTRAINT_UNIQUE) => DisputeError::AlreadyOpen,
                    _ => DisputeError::Database(sqlx::Error::Database(db_err)),
                }
            }
            other => DisputeError::Database(other),
        })?;

        let frozen = sqlx::query(
            "UPDATE escrow_holds SET status = 'disputed' \
              WHERE order_id = ? AND status IN ('active', 'reminder_sent')",
        )
        .bind(&dispute.order_id)
        .execute(&mut *tx)
        .await?;
        if frozen.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DisputeError::HoldNotDisputable);
        }

        tx.commit().await?;
        Ok(dispute)
    }

    /// Loads a dispute by id.
    pub async fn fetch(&self, dispute_id: &str) -> Result<Option<Dispute>, DisputeError> {
        let sql = format!("SELECT {DISPUTE_COLUMNS} FROM disputes WHERE id = ?");
        let row = sqlx::query_as::<_, DisputeRow>(&sql)
            .bind(dispute_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DisputeRow::into_domain).transpose()
    }

    /// Lists `open` and `under_review` disputes opened at or before `opened_before`.
    pub async fn list_escalation_candidates(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<Dispute>, DisputeError> {
        let sql = format!(
            "SELECT {DISPUTE_COLUMNS} FROM disputes \
             WHERE status IN ('open', 'under_review') \
               AND opened_at <= ? \
             ORDER BY opened_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, DisputeRow>(&sql)
            .bind(to_rfc3339(opened_before))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DisputeRow::into_domain).collect()
    }

    /// Moves an `open` dispute to `under_review`.
    pub async fn mark_under_review(
        &self,
        dispute_id: &str,
    ) -> Result<TransitionOutcome, DisputeError> {
        let result = sqlx::query(
            "UPDATE disputes SET status = 'under_review' WHERE id = ? AND status = 'open'",
        )
        .bind(dispute_id)
        .execute(&self.pool)
        .await?;

        Ok(TransitionOutcome::from_rows_affected(result.rows_affected()))
    }

    /// Escalates a dispute that is still `open` or `under_review`.
    pub async fn escalate(
        &self,
        dispute_id: &str,
        escalated_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DisputeError> {
        let result = sqlx::query(
            "UPDATE disputes \
                SET status = 'escalated', escalated_at = ? \
              WHERE id = ? \
                AND status IN ('open', 'under_review')",
        )
        .bind(to_rfc3339(escalated_at))
        .bind(dispute_id)
        .execute(&self.pool)
        .await?;

        Ok(TransitionOutcome::from_rows_affected(result.rows_affected()))
    }

    /// Closes an unresolved dispute and clears any escalation stamp.
    ///
    /// A rejected dispute hands the order's hold back to the release clock;
    /// a resolved one leaves the hold `disputed` for manual settlement.
    pub async fn resolve(
        &self,
        dispute_id: &str,
        outcome: DisputeOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, DisputeError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE disputes \
                SET status = ?, resolved_at = ?, escalated_at = NULL \
              WHERE id = ? \
                AND status IN {UNRESOLVED_DISPUTE_STATUSES} \
             RETURNING order_id"
        );
        let closed = sqlx::query(&sql)
            .bind(outcome.status().as_str())
            .bind(to_rfc3339(resolved_at))
            .bind(dispute_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = closed else {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Skipped);
        };

        if outcome == DisputeOutcome::Rejected {
            let order_id: String = row.get("order_id");
            sqlx::query(
                "UPDATE escrow_holds SET status = 'active' \
                  WHERE order_id = ? AND status = 'disputed'",
            )
            .bind(&order_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied)
    }
}

/// Parameters required to open a dispute.
pub struct NewDispute<'a> {
    pub order_id: &'a str,
    pub reason: &'a str,
    pub escalation_threshold_days: u32,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct DisputeRow {
    id: String,
    order_id: String,
    reason: String,
    status: String,
    opened_at: DateTime<Utc>,
    escalation_threshold_days: i64,
    escalated_at: Option<DateTime<Utc>>,
    resolved_at: Option<DateTime<Utc>>,
}

impl DisputeRow {
    fn into_domain(self) -> Result<Dispute, DisputeError> {
        Ok(Dispute {
            status: self.status.parse()?,
            id: self.id,
            order_id: self.order_id,
            reason: self.reason,
            opened_at: self.opened_at,
            escalation_threshold_days: clamp_days(self.escalation_threshold_days),
            escalated_at: self.escalated_at,
            resolved_at: self.resolved_at,
        })
    }
}

/// Errors that can occur while reading or mutating disputes.
#[derive(Debug, Error)]
pub enum DisputeError {
    #[error("order has no escrow hold")]
    HoldMissing,
    #[error("order already has an unresolved dispute")]
    AlreadyOpen,
    #[error("order's escrow hold is no longer awaiting release")]
    HoldNotDisputable,
    #[error("failed to decode dispute row: {0}")]
    Decode(#[from] UnknownStatus),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for seller balances credited by released holds.
#[derive(Clone)]
pub struct SellerBalanceRepository {
    pool: SqlitePool,
}

impl SellerBalanceRepository {
    /// Returns the seller's credited balance, zero when nothing was released yet.
    pub async fn fetch(&self, seller_id: &str) -> Result<i64, sqlx::Error> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance_cents FROM seller_balances WHERE seller_id = ?",
        )
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance.unwrap_or(0))
    }
}

/// Repository for the notification outbox.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    /// Persists one outbound notification.
    pub async fn insert(&self, notification: &Notification) -> Result<(), NotificationError> {
        sqlx::query(
            "INSERT INTO notifications \
             (id, recipient_id, category, severity, message, related_entity_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&notification.recipient_id)
        .bind(notification.category.as_str())
        .bind(notification.severity.as_str())
        .bind(&notification.message)
        .bind(&notification.related_entity_id)
        .bind(to_rfc3339(notification.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lists the newest notifications first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<Notification>, NotificationError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT recipient_id, category, severity, message, related_entity_id, created_at \
               FROM notifications \
              ORDER BY created_at DESC, rowid DESC \
              LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NotificationRow::into_domain).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    recipient_id: String,
    category: String,
    severity: String,
    message: String,
    related_entity_id: String,
    created_at: DateTime<Utc>,
}

impl NotificationRow {
    fn into_domain(self) -> Result<Notification, NotificationError> {
        Ok(Notification {
            category: NotificationCategory::from_str(&self.category)?,
            severity: NotificationSeverity::from_str(&self.severity)?,
            recipient_id: self.recipient_id,
            message: self.message,
            related_entity_id: self.related_entity_id,
            created_at: self.created_at,
        })
    }
}

/// Errors that can occur while using the notification outbox.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("failed to decode notification row: {0}")]
    Decode(#[from] UnknownStatus),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn clamp_days(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const NOW: &str = "2024-03-01T12:00:00Z";

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(NOW)
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    async fn setup_db() -> (Database, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    async fn insert_hold(db: &Database, order_id: &str, age_days: i64) -> EscrowHold {
        db.holds()
            .insert(&NewEscrowHold {
                order_id,
                buyer_id: "buyer-1",
                seller_id: "seller-1",
                amount_cents: 1_000,
                currency: "USD",
                hold_duration_days: 30,
                created_at: now() - ChronoDuration::days(age_days),
            })
            .await
            .expect("insert hold")
    }

    async fn open_dispute(db: &Database, order_id: &str) -> Dispute {
        db.disputes()
            .open(&NewDispute {
                order_id,
                reason: "item not as described",
                escalation_threshold_days: 5,
                opened_at: now(),
            })
            .await
            .expect("open dispute")
    }

    #[tokio::test]
    async fn migrations_apply() {
        let (db, _dir) = setup_db().await;
        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 4, "expected core tables to be created");
    }

    #[tokio::test]
    async fn insert_rejects_second_hold_for_order() {
        let (db, _dir) = setup_db().await;
        insert_hold(&db, "order-1", 1).await;

        let err = db
            .holds()
            .insert(&NewEscrowHold {
                order_id: "order-1",
                buyer_id: "buyer-2",
                seller_id: "seller-2",
                amount_cents: 5,
                currency: "USD",
                hold_duration_days: 30,
                created_at: now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HoldError::DuplicateOrder));
    }

    #[tokio::test]
    async fn release_credits_seller_once() {
        let (db, _dir) = setup_db().await;
        let hold = insert_hold(&db, "order-1", 31).await;

        let first = db.holds().release(&hold.id, now()).await.expect("release");
        assert_eq!(first, TransitionOutcome::Applied);
        let second = db.holds().release(&hold.id, now()).await.expect("release");
        assert_eq!(second, TransitionOutcome::Skipped);

        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::Released);
        assert_eq!(stored.released_at, Some(now()));

        let balance = db.seller_balances().fetch("seller-1").await.expect("balance");
        assert_eq!(balance, 1_000);
    }

    #[tokio::test]
    async fn release_is_blocked_by_unresolved_dispute() {
        let (db, _dir) = setup_db().await;
        let hold = insert_hold(&db, "order-1", 40).await;
        open_dispute(&db, "order-1").await;

        let candidates = db
            .holds()
            .list_release_candidates(now())
            .await
            .expect("candidates");
        assert!(candidates.is_empty());

        let outcome = db.holds().release(&hold.id, now()).await.expect("release");
        assert_eq!(outcome, TransitionOutcome::Skipped);
        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::Disputed);
        assert_eq!(db.seller_balances().fetch("seller-1").await.expect("balance"), 0);
    }

    #[tokio::test]
    async fn rejected_dispute_returns_hold_to_release_clock() {
        let (db, _dir) = setup_db().await;
        let hold = insert_hold(&db, "order-1", 40).await;
        let dispute = open_dispute(&db, "order-1").await;

        let outcome = db
            .disputes()
            .resolve(&dispute.id, DisputeOutcome::Rejected, now())
            .await
            .expect("resolve");
        assert!(outcome.is_applied());

        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::Active);
        let candidates = db
            .holds()
            .list_release_candidates(now())
            .await
            .expect("candidates");
        assert_eq!(candidates.len(), 1);

        let again = db
            .disputes()
            .resolve(&dispute.id, DisputeOutcome::Resolved, now())
            .await
            .expect("resolve twice");
        assert_eq!(again, TransitionOutcome::Skipped);
    }

    #[tokio::test]
    async fn open_rejects_missing_hold_and_duplicate_dispute() {
        let (db, _dir) = setup_db().await;
        let err = db
            .disputes()
            .open(&NewDispute {
                order_id: "missing",
                reason: "x",
                escalation_threshold_days: 5,
                opened_at: now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DisputeError::HoldMissing));

        insert_hold(&db, "order-1", 1).await;
        open_dispute(&db, "order-1").await;
        let err = db
            .disputes()
            .open(&NewDispute {
                order_id: "order-1",
                reason: "again",
                escalation_threshold_days: 5,
                opened_at: now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DisputeError::AlreadyOpen));
    }

    #[tokio::test]
    async fn escalate_is_monotonic() {
        let (db, _dir) = setup_db().await;
        insert_hold(&db, "order-1", 1).await;
        let dispute = open_dispute(&db, "order-1").await;

        assert!(db
            .disputes()
            .mark_under_review(&dispute.id)
            .await
            .expect("review")
            .is_applied());
        assert!(db
            .disputes()
            .escalate(&dispute.id, now())
            .await
            .expect("escalate")
            .is_applied());
        assert_eq!(
            db.disputes()
                .escalate(&dispute.id, now())
                .await
                .expect("escalate twice"),
            TransitionOutcome::Skipped
        );
        assert_eq!(
            db.disputes()
                .mark_under_review(&dispute.id)
                .await
                .expect("review after escalation"),
            TransitionOutcome::Skipped
        );

        let stored = db
            .disputes()
            .fetch(&dispute.id)
            .await
            .expect("fetch")
            .expect("dispute");
        assert_eq!(stored.status, DisputeStatus::Escalated);
        assert_eq!(stored.escalated_at, Some(now()));
    }

    #[tokio::test]
    async fn resolve_clears_escalation_stamp() {
        let (db, _dir) = setup_db().await;
        insert_hold(&db, "order-1", 1).await;
        let dispute = open_dispute(&db, "order-1").await;
        db.disputes()
            .escalate(&dispute.id, now())
            .await
            .expect("escalate");

        let outcome = db
            .disputes()
            .resolve(&dispute.id, DisputeOutcome::Resolved, now())
            .await
            .expect("resolve");
        assert!(outcome.is_applied());

        let stored = db
            .disputes()
            .fetch(&dispute.id)
            .await
            .expect("fetch")
            .expect("dispute");
        assert_eq!(stored.status, DisputeStatus::Resolved);
        assert_eq!(stored.resolved_at, Some(now()));
        assert!(stored.escalated_at.is_none());

        let forged = sqlx::query("UPDATE disputes SET escalated_at = ? WHERE id = ?")
            .bind(to_rfc3339(now()))
            .bind(&dispute.id)
            .execute(db.pool())
            .await;
        assert!(forged.is_err(), "closed disputes must not carry escalated_at");
    }

    #[tokio::test]
    async fn resolved_dispute_keeps_hold_frozen() {
        let (db, _dir) = setup_db().await;
        let hold = insert_hold(&db, "order-1", 40).await;
        let first = open_dispute(&db, "order-1").await;
        db.disputes()
            .resolve(&first.id, DisputeOutcome::Resolved, now())
            .await
            .expect("resolve");

        let err = db
            .disputes()
            .open(&NewDispute {
                order_id: "order-1",
                reason: "second attempt",
                escalation_threshold_days: 5,
                opened_at: now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DisputeError::HoldNotDisputable));

        let unresolved: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM disputes WHERE order_id = 'order-1' AND status = 'open'",
        )
        .fetch_one(db.pool())
        .await
        .expect("count disputes");
        assert_eq!(unresolved.0, 0, "refused dispute must be rolled back");

        let outcome = db.holds().release(&hold.id, now()).await.expect("release");
        assert_eq!(outcome, TransitionOutcome::Skipped);
        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::Disputed);
        assert_eq!(db.seller_balances().fetch("seller-1").await.expect("balance"), 0);
    }

    #[tokio::test]
    async fn released_hold_cannot_be_disputed() {
        let (db, _dir) = setup_db().await;
        let hold = insert_hold(&db, "order-1", 40).await;
        db.holds().release(&hold.id, now()).await.expect("release");

        let err = db
            .disputes()
            .open(&NewDispute {
                order_id: "order-1",
                reason: "too late",
                escalation_threshold_days: 5,
                opened_at: now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DisputeError::HoldNotDisputable));
    }

    #[tokio::test]
    async fn inserted_records_match_stored_precision() {
        let (db, _dir) = setup_db().await;
        let created_at = now() + ChronoDuration::nanoseconds(123_456_789);
        let hold = db
            .holds()
            .insert(&NewEscrowHold {
                order_id: "order-1",
                buyer_id: "buyer-1",
                seller_id: "seller-1",
                amount_cents: 1_000,
                currency: "USD",
                hold_duration_days: 30,
                created_at,
            })
            .await
            .expect("insert hold");
        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored, hold);
        assert_eq!(hold.created_at, now() + ChronoDuration::milliseconds(123));

        let dispute = db
            .disputes()
            .open(&NewDispute {
                order_id: "order-1",
                reason: "late",
                escalation_threshold_days: 5,
                opened_at: created_at,
            })
            .await
            .expect("open dispute");
        let stored = db
            .disputes()
            .fetch(&dispute.id)
            .await
            .expect("fetch")
            .expect("dispute");
        assert_eq!(stored, dispute);
    }

    #[tokio::test]
    async fn reminder_mark_is_at_most_once() {
        let (db, _dir) = setup_db().await;
        let hold = insert_hold(&db, "order-1", 26).await;

        let first = db
            .holds()
            .mark_reminder_sent(&hold.id, now())
            .await
            .expect("mark");
        let second = db
            .holds()
            .mark_reminder_sent(&hold.id, now() + ChronoDuration::hours(1))
            .await
            .expect("mark again");
        assert!(first.is_applied());
        assert_eq!(second, TransitionOutcome::Skipped);

        let stored = db.holds().fetch(&hold.id).await.expect("fetch").expect("hold");
        assert_eq!(stored.status, HoldStatus::ReminderSent);
        assert_eq!(stored.reminder_sent_at, Some(now()));
        assert!(db
            .holds()
            .list_reminder_candidates(now())
            .await
            .expect("candidates")
            .is_empty());
    }

    #[tokio::test]
    async fn notifications_round_trip_through_outbox() {
        let (db, _dir) = setup_db().await;
        let repo = db.notifications();
        repo.insert(&Notification::new(
            "admin",
            NotificationCategory::Escalation,
            NotificationSeverity::Critical,
            "dispute escalated",
            "dispute-1",
            now(),
        ))
        .await
        .expect("insert");

        let listed = repo.list_recent(10).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].severity, NotificationSeverity::Critical);
        assert_eq!(listed[0].created_at, now());
    }
}
