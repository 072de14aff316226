//! In-process payment provider.
//!
//! Behaves like a card processor with idempotency keys: reusing a key
//! returns the original object. Knobs let callers decline cards, reject
//! refunds, add latency or report duplicates as errors.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    IntentRequest, IntentStatus, PaymentProvider, ProviderError, ProviderIntent, ProviderRefund,
    ProviderRefundStatus, RefundRequest,
};

#[derive(Debug, Default)]
struct State {
    intents: HashMap<String, ProviderIntent>,
    intent_keys: HashMap<String, String>,
    intent_emails: HashMap<String, String>,
    refunds: HashMap<String, ProviderRefund>,
    refund_keys: HashMap<String, String>,
    declined_emails: HashSet<String>,
    refund_rejection: Option<String>,
    report_duplicates: bool,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct SimulatedProvider {
    state: Mutex<State>,
}

fn object_id(prefix: &str) -> String {
    format!("{prefix}_{}", &Uuid::new_v4().simple().to_string()[..24])
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cards used with this receipt email are declined on confirmation.
    pub async fn decline_card_for(&self, email: &str) {
        self.state
            .lock()
            .await
            .declined_emails
            .insert(email.to_lowercase());
    }

    /// Reject every refund request with `message`; `None` accepts again.
    pub async fn reject_refunds(&self, message: Option<&str>) {
        self.state.lock().await.refund_rejection = message.map(str::to_string);
    }

    /// Answer reused idempotency keys with an error instead of the original.
    pub async fn report_duplicates(&self, enabled: bool) {
        self.state.lock().await.report_duplicates = enabled;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = Some(latency);
    }

    pub async fn intent_count(&self) -> usize {
        self.state.lock().await.intents.len()
    }

    pub async fn refund(&self, id: &str) -> Option<ProviderRefund> {
        self.state.lock().await.refunds.get(id).cloned()
    }

    /// Finish a pending refund, as the processor would asynchronously.
    pub async fn settle_refund(&self, id: &str, succeeded: bool) -> Option<ProviderRefund> {
        let mut state = self.state.lock().await;
        let refund = state.refunds.get_mut(id)?;
        if refund.status == ProviderRefundStatus::Pending {
            refund.status = if succeeded {
                ProviderRefundStatus::Succeeded
            } else {
                ProviderRefundStatus::Failed
            };
        }
        Some(refund.clone())
    }

    async fn delay(&self) {
        let latency = self.state.lock().await.latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PaymentProvider for SimulatedProvider {
    async fn create_intent(&self, request: IntentRequest) -> Result<ProviderIntent, ProviderError> {
        self.delay().await;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.intent_keys.get(&request.idempotency_key).cloned() {
            if state.report_duplicates {
                return Err(ProviderError::IdempotencyConflict { existing });
            }
            return state
                .intents
                .get(&existing)
                .cloned()
                .ok_or(ProviderError::NotFound(existing));
        }

        if request.amount_minor <= 0 {
            return Err(ProviderError::Declined {
                code: "amount_too_small".to_string(),
                message: format!("amount {} is not chargeable", request.amount_minor),
            });
        }

        let id = object_id("pi");
        let intent = ProviderIntent {
            client_secret: format!("{id}_secret_{}", Uuid::new_v4().simple()),
            id: id.clone(),
            amount_minor: request.amount_minor,
            currency: request.currency,
            status: IntentStatus::RequiresPayment,
            charge_id: None,
            receipt_url: None,
            booking_id: request.booking_id,
        };
        state.intent_keys.insert(request.idempotency_key, id.clone());
        state
            .intent_emails
            .insert(id.clone(), request.receipt_email.to_lowercase());
        state.intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn confirm_intent(&self, intent_id: &str) -> Result<ProviderIntent, ProviderError> {
        self.delay().await;
        let mut state = self.state.lock().await;

        let declined = state
            .intent_emails
            .get(intent_id)
            .is_some_and(|email| state.declined_emails.contains(email));
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| ProviderError::NotFound(intent_id.to_string()))?;

        if matches!(
            intent.status,
            IntentStatus::RequiresPayment | IntentStatus::Processing
        ) {
            if declined {
                intent.status = IntentStatus::Failed {
                    reason: "Your card was declined.".to_string(),
                };
            } else {
                let charge = object_id("ch");
                intent.receipt_url = Some(format!("https://pay.example.test/receipts/{charge}"));
                intent.charge_id = Some(charge);
                intent.status = IntentStatus::Succeeded;
            }
        }
        Ok(intent.clone())
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<ProviderIntent, ProviderError> {
        self.delay().await;
        self.state
            .lock()
            .await
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(intent_id.to_string()))
    }

    async fn create_refund(&self, request: RefundRequest) -> Result<ProviderRefund, ProviderError> {
        self.delay().await;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.refund_keys.get(&request.idempotency_key).cloned() {
            if state.report_duplicates {
                return Err(ProviderError::IdempotencyConflict { existing });
            }
            return state
                .refunds
                .get(&existing)
                .cloned()
                .ok_or(ProviderError::NotFound(existing));
        }

        if let Some(message) = &state.refund_rejection {
            return Err(ProviderError::Declined {
                code: "refund_rejected".to_string(),
                message: message.clone(),
            });
        }

        let charged = state
            .intents
            .values()
            .find(|i| {
                i.status == IntentStatus::Succeeded
                    && i.charge_id.as_deref() == Some(request.charge_id.as_str())
            })
            .map(|i| i.amount_minor)
            .ok_or_else(|| ProviderError::Declined {
                code: "charge_missing".to_string(),
                message: format!("no captured charge {}", request.charge_id),
            })?;
        let refunded: i64 = state
            .refunds
            .values()
            .filter(|r| r.charge_id == request.charge_id && r.status != ProviderRefundStatus::Failed)
            .map(|r| r.amount_minor)
            .sum();
        let remaining = charged - refunded;
        let amount = request.amount_minor.unwrap_or(remaining);
        if amount <= 0 || amount > remaining {
            return Err(ProviderError::Declined {
                code: "amount_too_large".to_string(),
                message: format!("refund of {amount} exceeds remaining {remaining}"),
            });
        }

        let refund = ProviderRefund {
            id: object_id("re"),
            charge_id: request.charge_id,
            amount_minor: amount,
            status: ProviderRefundStatus::Pending,
            refund_id: request.refund_id,
        };
        state
            .refund_keys
            .insert(request.idempotency_key, refund.id.clone());
        state.refunds.insert(refund.id.clone(), refund.clone());
        Ok(refund)
    }
}
