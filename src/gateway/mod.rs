//! Payment gateway adapter.
//!
//! [`PaymentProvider`] is the raw provider surface, in provider minor units.
//! [`PaymentGateway`] wraps it: it converts amounts at the boundary, derives
//! idempotency keys, bounds every call with a timeout, translates provider
//! failures into [`GatewayError`] and records each failure in the event log.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::Amount;
use crate::config::Config;
use crate::error::{GatewayError, StoreError};
use crate::events::{EventRefs, PaymentEventKind};
use crate::model::{BookingId, RefundId, RefundReason};
use crate::store::Database;

pub mod simulated;

/// Width of the timestamp bucket folded into intent idempotency keys.
const KEY_BUCKET_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentStatus {
    RequiresPayment,
    Processing,
    Succeeded,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct ProviderIntent {
    pub id: String,
    pub client_secret: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: IntentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub booking_id: BookingId,
}

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub booking_id: BookingId,
    pub amount_minor: i64,
    pub currency: String,
    pub receipt_email: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRefundStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProviderRefund {
    pub id: String,
    pub charge_id: String,
    pub amount_minor: i64,
    pub status: ProviderRefundStatus,
    pub refund_id: RefundId,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub refund_id: RefundId,
    pub charge_id: String,
    /// `None` refunds the full remaining charge.
    pub amount_minor: Option<i64>,
    pub reason: &'static str,
    pub idempotency_key: String,
}

/// Failures reported by the provider itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("declined ({code}): {message}")]
    Declined { code: String, message: String },

    /// The idempotency key was already used; carries the original object id.
    #[error("idempotency key already used for {existing}")]
    IdempotencyConflict { existing: String },

    #[error("no such object {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),
}

/// Raw payment provider API.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_intent(&self, request: IntentRequest) -> Result<ProviderIntent, ProviderError>;

    async fn confirm_intent(&self, intent_id: &str) -> Result<ProviderIntent, ProviderError>;

    async fn retrieve_intent(&self, intent_id: &str) -> Result<ProviderIntent, ProviderError>;

    async fn create_refund(&self, request: RefundRequest) -> Result<ProviderRefund, ProviderError>;
}

/// A created payment intent, in platform terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRef {
    pub intent_id: String,
    pub client_secret: String,
    pub idempotency_key: String,
    pub amount: Amount,
}

/// Provider-side state of an intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentDetails {
    pub intent_id: String,
    pub booking_id: BookingId,
    pub status: IntentStatus,
    pub amount: Amount,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
}

impl IntentDetails {
    pub fn succeeded(&self) -> bool {
        self.status == IntentStatus::Succeeded
    }

    fn from_provider(intent: ProviderIntent) -> Self {
        Self {
            intent_id: intent.id,
            booking_id: intent.booking_id,
            status: intent.status,
            amount: Amount::from_minor_units(intent.amount_minor),
            charge_id: intent.charge_id,
            receipt_url: intent.receipt_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRef {
    pub provider_refund_id: String,
    pub status: ProviderRefundStatus,
}

/// Deterministic key for intent creation: the same booking created in the
/// same time bucket always maps to the same key.
pub fn intent_idempotency_key(booking: BookingId, created_at: DateTime<Utc>) -> String {
    let bucket = created_at.timestamp().div_euclid(KEY_BUCKET_SECS);
    format!("booking-{}-{bucket}", booking.simple())
}

pub fn refund_idempotency_key(refund: RefundId, attempt: u32) -> String {
    format!("refund-{}-{attempt}", refund.simple())
}

pub struct PaymentGateway {
    provider: Arc<dyn PaymentProvider>,
    db: Arc<Database>,
    timeout: Duration,
    currency: String,
}

impl PaymentGateway {
    pub fn new(provider: Arc<dyn PaymentProvider>, db: Arc<Database>, config: &Config) -> Self {
        Self {
            provider,
            db,
            timeout: config.gateway_timeout,
            currency: config.currency.clone(),
        }
    }

    /// Create a payment intent for a booking.
    ///
    /// A timed-out attempt is retried once with the same idempotency key;
    /// the provider deduplicates so no second charge can be created.
    pub async fn create_intent(
        &self,
        booking: BookingId,
        amount: Amount,
        email: &str,
        created_at: DateTime<Utc>,
    ) -> Result<IntentRef, GatewayError> {
        const OP: &str = "create_intent";
        let key = intent_idempotency_key(booking, created_at);
        let request = IntentRequest {
            booking_id: booking,
            amount_minor: amount.to_minor_units(),
            currency: self.currency.clone(),
            receipt_email: email.to_string(),
            idempotency_key: key.clone(),
        };
        let refs = EventRefs::booking(booking);

        let mut result = self
            .call(OP, self.provider.create_intent(request.clone()))
            .await;
        if matches!(result, Err(CallError::Timeout)) {
            warn!(booking = %booking, "intent creation timed out, retrying with same key");
            result = self.call(OP, self.provider.create_intent(request)).await;
        }

        let intent = match result {
            Ok(intent) => intent,
            Err(CallError::Provider(ProviderError::IdempotencyConflict { existing })) => {
                // duplicate request: the original intent is the answer
                info!(booking = %booking, intent = %existing, "provider reported duplicate intent");
                match self.call(OP, self.provider.retrieve_intent(&existing)).await {
                    Ok(intent) => intent,
                    Err(e) => return Err(self.record_failure(refs, e.into_gateway(OP)).await),
                }
            }
            Err(e) => return Err(self.record_failure(refs, e.into_gateway(OP)).await),
        };

        info!(booking = %booking, intent = %intent.id, amount = %amount, "payment intent created");
        Ok(IntentRef {
            intent_id: intent.id,
            client_secret: intent.client_secret,
            idempotency_key: key,
            amount: Amount::from_minor_units(intent.amount_minor),
        })
    }

    /// Confirm an intent synchronously.
    pub async fn confirm(&self, intent_id: &str) -> Result<IntentDetails, GatewayError> {
        self.confirm_for(intent_id, EventRefs::default()).await
    }

    /// [`confirm`](Self::confirm), logging any failure against `refs`.
    pub async fn confirm_for(
        &self,
        intent_id: &str,
        refs: EventRefs,
    ) -> Result<IntentDetails, GatewayError> {
        const OP: &str = "confirm_intent";
        match self.call(OP, self.provider.confirm_intent(intent_id)).await {
            Ok(intent) => Ok(IntentDetails::from_provider(intent)),
            Err(e) => Err(self.record_failure(refs, e.into_gateway(OP)).await),
        }
    }

    pub async fn retrieve_intent(&self, intent_id: &str) -> Result<IntentDetails, GatewayError> {
        const OP: &str = "retrieve_intent";
        match self.call(OP, self.provider.retrieve_intent(intent_id)).await {
            Ok(intent) => Ok(IntentDetails::from_provider(intent)),
            Err(e) => Err(self
                .record_failure(EventRefs::default(), e.into_gateway(OP))
                .await),
        }
    }

    /// Ask the provider to refund a captured charge. `amount` of `None`
    /// refunds whatever remains on the charge.
    pub async fn create_refund(
        &self,
        refund: RefundId,
        attempt: u32,
        charge_id: &str,
        amount: Option<Amount>,
        reason: &RefundReason,
        refs: EventRefs,
    ) -> Result<RefundRef, GatewayError> {
        const OP: &str = "create_refund";
        let request = RefundRequest {
            refund_id: refund,
            charge_id: charge_id.to_string(),
            amount_minor: amount.map(Amount::to_minor_units),
            reason: reason.provider_reason(),
            idempotency_key: refund_idempotency_key(refund, attempt),
        };
        match self.call(OP, self.provider.create_refund(request)).await {
            Ok(r) => Ok(RefundRef {
                provider_refund_id: r.id,
                status: r.status,
            }),
            Err(e) => Err(self.record_failure(refs, e.into_gateway(OP)).await),
        }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, CallError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Provider(e)),
            Err(_) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "provider call timed out");
                Err(CallError::Timeout)
            }
        }
    }

    async fn record_failure(&self, refs: EventRefs, error: GatewayError) -> GatewayError {
        warn!(reason = %error, "gateway failure");
        if let Err(e) = append_failure(&self.db, refs, failure_event(&error)).await {
            warn!(reason = %e, "could not record gateway failure");
        }
        error
    }
}

enum CallError {
    Provider(ProviderError),
    Timeout,
}

impl CallError {
    fn into_gateway(self, operation: &'static str) -> GatewayError {
        match self {
            CallError::Timeout => GatewayError::Timeout { operation },
            CallError::Provider(ProviderError::Declined { code, message }) => {
                GatewayError::Rejected {
                    operation,
                    code: Some(code),
                    message,
                }
            }
            CallError::Provider(ProviderError::IdempotencyConflict { existing }) => {
                GatewayError::Rejected {
                    operation,
                    code: Some("idempotency_conflict".to_string()),
                    message: format!("duplicate of {existing}"),
                }
            }
            CallError::Provider(ProviderError::NotFound(id)) => {
                GatewayError::NotFound { operation, id }
            }
            CallError::Provider(ProviderError::Network(message)) => {
                GatewayError::Unavailable { operation, message }
            }
        }
    }
}

fn failure_event(error: &GatewayError) -> PaymentEventKind {
    let operation = match error {
        GatewayError::Rejected { operation, .. }
        | GatewayError::Timeout { operation }
        | GatewayError::Unavailable { operation, .. }
        | GatewayError::NotFound { operation, .. } => *operation,
    };
    PaymentEventKind::GatewayFailure {
        operation: operation.to_string(),
        message: error.to_string(),
    }
}

async fn append_failure(
    db: &Database,
    refs: EventRefs,
    kind: PaymentEventKind,
) -> Result<(), StoreError> {
    db.transaction::<_, StoreError>(|t| {
        t.events.append(refs, kind);
        Ok(())
    })
    .await
}
