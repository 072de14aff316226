//! Core domain types for the reservation and payment core.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Amount;

/// Scheduled training session identifier.
pub type SessionId = Uuid;

/// Booking identifier.
pub type BookingId = Uuid;

/// Payment identifier.
pub type PaymentId = Uuid;

/// Refund identifier.
pub type RefundId = Uuid;

macro_rules! status_str {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Published,
    Full,
    Cancelled,
}

status_str!(SessionStatus {
    Draft => "draft",
    Published => "published",
    Full => "full",
    Cancelled => "cancelled",
});

/// A scheduled session with its seat counters.
///
/// `current_capacity` and `status` are owned by the capacity ledger; every
/// other component reads them only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub course_name: String,
    /// Price per participant.
    pub price: Amount,
    pub max_capacity: u32,
    pub current_capacity: u32,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
}

impl Session {
    /// Create a published session with no seats taken.
    pub fn published(
        course_name: impl Into<String>,
        price: Amount,
        max_capacity: u32,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            course_name: course_name.into(),
            price,
            max_capacity,
            current_capacity: 0,
            status: SessionStatus::Published,
            start_time,
        }
    }

    pub fn available_spots(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_capacity)
    }

    /// Derive `full`/`published` from the counters. Draft and cancelled
    /// sessions keep their status.
    pub fn recompute_status(&mut self) {
        if matches!(self.status, SessionStatus::Published | SessionStatus::Full) {
            self.status = if self.current_capacity >= self.max_capacity {
                SessionStatus::Full
            } else {
                SessionStatus::Published
            };
        }
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.start_time <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    PaymentFailed,
    Cancelled,
    Refunded,
    Attended,
    Completed,
}

status_str!(BookingStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    PaymentFailed => "payment_failed",
    Cancelled => "cancelled",
    Refunded => "refunded",
    Attended => "attended",
    Completed => "completed",
});

impl BookingStatus {
    /// Whether the booking still holds seats on its session.
    pub fn holds_seats(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled | Self::Refunded | Self::PaymentFailed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub session_id: SessionId,
    /// Unique human-readable reference, e.g. `CB-261019-4F2A9C`.
    pub reference: String,
    pub contact_email: String,
    pub participants: Vec<Participant>,
    pub participant_count: u32,
    pub total_amount: Amount,
    pub status: BookingStatus,
    pub special_requirements: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
    PartiallyRefunded,
}

status_str!(PaymentStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Refunded => "refunded",
    PartiallyRefunded => "partially_refunded",
});

impl PaymentStatus {
    /// Payment captured money at some point (refunds included).
    pub fn is_captured(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Refunded | Self::PartiallyRefunded
        )
    }
}

/// One logical payment per booking attempt. `amount` never changes after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub booking_id: BookingId,
    pub external_intent_id: String,
    pub idempotency_key: String,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Approved,
    Processing,
    Completed,
    Failed,
}

status_str!(RefundStatus {
    Pending => "pending",
    Approved => "approved",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl RefundStatus {
    /// Refunds that still count against the refundable balance.
    pub fn reserves_balance(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum RefundReason {
    Duplicate,
    Fraudulent,
    RequestedByCustomer,
    SessionCancelled,
    Other(String),
}

impl RefundReason {
    /// Reason string understood by the provider.
    pub fn provider_reason(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Fraudulent => "fraudulent",
            _ => "requested_by_customer",
        }
    }
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => f.write_str("duplicate"),
            Self::Fraudulent => f.write_str("fraudulent"),
            Self::RequestedByCustomer => f.write_str("requested_by_customer"),
            Self::SessionCancelled => f.write_str("session_cancelled"),
            Self::Other(text) => write!(f, "other: {text}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub payment_id: PaymentId,
    pub booking_id: BookingId,
    pub amount: Amount,
    pub status: RefundStatus,
    pub reason: RefundReason,
    pub approved_by: Option<String>,
    pub provider_refund_id: Option<String>,
    pub error_message: Option<String>,
    /// Provider submissions that ended in a definite rejection. Part of the
    /// refund's idempotency key so a retry is a fresh provider request.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored record of an inbound provider event. Only verified payloads are
/// ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub external_event_id: String,
    pub event_type: String,
    pub payload: String,
    pub processed: bool,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEventRecord {
    pub fn new(
        external_event_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            external_event_id: external_event_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            processed: false,
            retry_count: 0,
            error_message: None,
            received_at: Utc::now(),
            processed_at: None,
        }
    }
}
