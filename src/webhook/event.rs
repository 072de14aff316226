//! Provider event payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::Amount;
use crate::model::{BookingId, RefundId};

/// Outer shape shared by every provider event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub booking_id: Option<BookingId>,
    #[serde(default)]
    pub refund_id: Option<RefundId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentObject {
    pub id: String,
    /// Minor units.
    pub amount: i64,
    #[serde(default, alias = "latest_charge")]
    pub charge_id: Option<String>,
    #[serde(default)]
    pub receipt_url: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl IntentObject {
    pub fn amount(&self) -> Amount {
        Amount::from_minor_units(self.amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub charge: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Event decoded into the types this service acts on.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    PaymentSucceeded(IntentObject),
    PaymentFailed(IntentObject),
    RefundSucceeded(RefundObject),
    RefundFailed(RefundObject),
    Unknown(String),
}

impl ProviderEvent {
    pub fn decode(envelope: &EventEnvelope) -> Result<Self, serde_json::Error> {
        let object = || envelope.data.object.clone();
        Ok(match envelope.event_type.as_str() {
            "payment.succeeded" | "payment_intent.succeeded" => {
                Self::PaymentSucceeded(serde_json::from_value(object())?)
            }
            "payment.failed" | "payment_intent.payment_failed" => {
                Self::PaymentFailed(serde_json::from_value(object())?)
            }
            "refund.succeeded" | "charge.refund.succeeded" => {
                Self::RefundSucceeded(serde_json::from_value(object())?)
            }
            "refund.failed" | "charge.refund.failed" => {
                Self::RefundFailed(serde_json::from_value(object())?)
            }
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl EventEnvelope {
    fn new(id: impl Into<String>, event_type: &str, object: Value) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.to_string(),
            created: chrono::Utc::now().timestamp(),
            data: EventData { object },
        }
    }

    /// `payment.succeeded` / `payment.failed` for an intent.
    pub fn for_intent(
        id: impl Into<String>,
        event_type: &str,
        intent_id: &str,
        amount_minor: i64,
        booking: BookingId,
        charge_id: Option<&str>,
        failure_message: Option<&str>,
    ) -> Self {
        Self::new(
            id,
            event_type,
            json!({
                "id": intent_id,
                "amount": amount_minor,
                "charge_id": charge_id,
                "failure_message": failure_message,
                "metadata": { "booking_id": booking },
            }),
        )
    }

    /// `refund.succeeded` / `refund.failed` for a provider refund.
    pub fn for_refund(
        id: impl Into<String>,
        event_type: &str,
        provider_refund_id: &str,
        amount_minor: i64,
        refund: RefundId,
        failure_reason: Option<&str>,
    ) -> Self {
        Self::new(
            id,
            event_type,
            json!({
                "id": provider_refund_id,
                "amount": amount_minor,
                "failure_reason": failure_reason,
                "metadata": { "refund_id": refund },
            }),
        )
    }

    pub fn to_payload(&self) -> String {
        // a tree of strings and numbers always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}
