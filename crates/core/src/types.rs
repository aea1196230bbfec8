use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Recipient id used for messages addressed to the admin review queue.
pub const ADMIN_RECIPIENT: &str = "admin";

/// Lifecycle state of an escrow hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Active,
    ReminderSent,
    Released,
    Disputed,
}

impl HoldStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ReminderSent => "reminder_sent",
            Self::Released => "released",
            Self::Disputed => "disputed",
        }
    }

    /// Holds in these states are still waiting for their release clock.
    pub fn is_pending_release(self) -> bool {
        matches!(self, Self::Active | Self::ReminderSent)
    }
}

impl fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HoldStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "reminder_sent" => Ok(Self::ReminderSent),
            "released" => Ok(Self::Released),
            "disputed" => Ok(Self::Disputed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Lifecycle state of a dispute case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    UnderReview,
    Escalated,
    Resolved,
    Rejected,
}

impl DisputeStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::UnderReview => "under_review",
            Self::Escalated => "escalated",
            Self::Resolved => "resolved",
            Self::Rejected => "rejected",
        }
    }

    /// A dispute in any of these states blocks automatic release of the order's hold.
    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Open | Self::UnderReview | Self::Escalated)
    }

    /// States the escalation engine may promote to [`DisputeStatus::Escalated`].
    pub fn is_escalatable(self) -> bool {
        matches!(self, Self::Open | Self::UnderReview)
    }
}

impl fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisputeStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "open" => Ok(Self::Open),
            "under_review" => Ok(Self::UnderReview),
            "escalated" => Ok(Self::Escalated),
            "resolved" => Ok(Self::Resolved),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Terminal outcome chosen when a dispute is closed by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeOutcome {
    Resolved,
    Rejected,
}

impl DisputeOutcome {
    pub fn status(self) -> DisputeStatus {
        match self {
            Self::Resolved => DisputeStatus::Resolved,
            Self::Rejected => DisputeStatus::Rejected,
        }
    }
}

/// Raised when a persisted status string does not map to a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status value '{0}'")]
pub struct UnknownStatus(pub String);

/// Funds retained for an order until its dispute-free period elapses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowHold {
    pub id: String,
    pub order_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub hold_duration_days: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

/// Dispute case raised against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispute {
    pub id: String,
    pub order_id: String,
    pub reason: String,
    pub status: DisputeStatus,
    pub opened_at: DateTime<Utc>,
    pub escalation_threshold_days: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome counters of one batch engine pass.
///
/// `skipped` counts records whose conditional write matched no row because
/// another run (or an operator) moved them after they were listed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl BatchResult {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Escrow,
    Reminder,
    Escalation,
}

impl NotificationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Escrow => "escrow",
            Self::Reminder => "reminder",
            Self::Escalation => "escalation",
        }
    }
}

impl FromStr for NotificationCategory {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "escrow" => Ok(Self::Escrow),
            "reminder" => Ok(Self::Reminder),
            "escalation" => Ok(Self::Escalation),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Critical,
}

impl NotificationSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for NotificationSeverity {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Outbound message produced as a side effect of an engine transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient_id: String,
    pub category: NotificationCategory,
    pub severity: NotificationSeverity,
    pub message: String,
    pub related_entity_id: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient_id: impl Into<String>,
        category: NotificationCategory,
        severity: NotificationSeverity,
        message: impl Into<String>,
        related_entity_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            category,
            severity,
            message: message.into(),
            related_entity_id: related_entity_id.into(),
            created_at,
        }
    }
}
