use serde::{Deserialize, Serialize};
use specta::Type;
use uuid::Uuid;

/// A queued delivery of one submission to one destination.
///
/// Webhook and email events share this shape and live in separate tables.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct DeliveryEvent {
    pub id: Uuid,
    pub submission_id: Uuid,

    pub status: DeliveryStatus,
    pub attempt_count: i64,

    pub last_attempt_at: Option<String>,
    /// Empty after a successful attempt.
    pub last_attempt_err: Option<String>,
    /// Only set while the event is pending or retrying.
    pub next_attempt_at: Option<String>,

    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivering,
    Delivered,
    Retrying,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivering => "delivering",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Webhook,
    Email,
}

impl DeliveryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryKind::Webhook => "webhook",
            DeliveryKind::Email => "email",
        }
    }
}
