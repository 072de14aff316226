//! Append-only payment event log.
//!
//! Every payment, refund and webhook transition appends one [`PaymentEvent`].
//! Entries are never updated or deleted; they feed audit and reconciliation
//! reporting and never drive state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Amount;
use crate::model::{BookingId, PaymentId, RefundId};

/// Typed event payloads. Serialized with a `type` tag so the stored form is
/// self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEventKind {
    BookingCreated {
        reference: String,
        amount: Amount,
    },
    IntentCreated {
        intent_id: String,
        amount: Amount,
    },
    GatewayFailure {
        operation: String,
        message: String,
    },
    PaymentSucceeded {
        intent_id: String,
        charge_id: Option<String>,
    },
    PaymentFailed {
        intent_id: String,
        reason: String,
    },
    /// A transition was requested but left state unchanged.
    TransitionSkipped {
        intent_id: String,
        transition: String,
        outcome: String,
    },
    /// The provider captured money for a booking whose seats are gone.
    PaymentCaptureOrphaned {
        intent_id: String,
        charge_id: Option<String>,
        amount: Amount,
    },
    BookingCancelled {
        released_seats: u32,
    },
    BookingStatusChanged {
        from: String,
        to: String,
    },
    RefundRequested {
        amount: Amount,
        reason: String,
    },
    RefundApproved {
        approver: String,
    },
    RefundSubmitted {
        provider_refund_id: String,
    },
    RefundCompleted {
        amount: Amount,
    },
    RefundFailed {
        message: String,
    },
    WebhookReceived {
        event_id: String,
        event_type: String,
    },
    WebhookFailed {
        event_id: String,
        error: String,
        retry_count: u32,
    },
}

impl PaymentEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "booking_created",
            Self::IntentCreated { .. } => "intent_created",
            Self::GatewayFailure { .. } => "gateway_failure",
            Self::PaymentSucceeded { .. } => "payment_succeeded",
            Self::PaymentFailed { .. } => "payment_failed",
            Self::TransitionSkipped { .. } => "transition_skipped",
            Self::PaymentCaptureOrphaned { .. } => "payment_capture_orphaned",
            Self::BookingCancelled { .. } => "booking_cancelled",
            Self::BookingStatusChanged { .. } => "booking_status_changed",
            Self::RefundRequested { .. } => "refund_requested",
            Self::RefundApproved { .. } => "refund_approved",
            Self::RefundSubmitted { .. } => "refund_submitted",
            Self::RefundCompleted { .. } => "refund_completed",
            Self::RefundFailed { .. } => "refund_failed",
            Self::WebhookReceived { .. } => "webhook_received",
            Self::WebhookFailed { .. } => "webhook_failed",
        }
    }
}

/// Entity references attached to a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRefs {
    pub payment: Option<PaymentId>,
    pub refund: Option<RefundId>,
    pub booking: Option<BookingId>,
}

impl EventRefs {
    pub fn booking(booking: BookingId) -> Self {
        Self {
            booking: Some(booking),
            ..Default::default()
        }
    }

    pub fn payment(payment: PaymentId, booking: BookingId) -> Self {
        Self {
            payment: Some(payment),
            booking: Some(booking),
            ..Default::default()
        }
    }

    pub fn refund(refund: RefundId, payment: PaymentId, booking: BookingId) -> Self {
        Self {
            payment: Some(payment),
            refund: Some(refund),
            booking: Some(booking),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Monotonic sequence number, starting at 1.
    pub seq: u64,
    #[serde(flatten)]
    pub refs: EventRefs,
    pub kind: PaymentEventKind,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only event storage.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<PaymentEvent>,
}

impl EventLog {
    pub fn append(&mut self, refs: EventRefs, kind: PaymentEventKind) -> u64 {
        let seq = self.entries.len() as u64 + 1;
        self.entries.push(PaymentEvent {
            seq,
            refs,
            kind,
            recorded_at: Utc::now(),
        });
        seq
    }

    pub fn entries(&self) -> &[PaymentEvent] {
        &self.entries
    }

    pub fn for_booking(&self, booking: BookingId) -> impl Iterator<Item = &PaymentEvent> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.refs.booking == Some(booking))
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.entries.iter().filter(|e| e.kind.name() == name).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
