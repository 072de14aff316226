//! Webhook ingestion.
//!
//! Each delivery is verified before anything is stored, deduplicated by the
//! provider's event id with an insert-if-absent, then routed to the payment
//! state machine or the refund processor. Handler failures stay on the event
//! record (`retry_count`, `error_message`) and are retried until the cap,
//! after which the event waits for an operator.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{StoreError, WebhookError};
use crate::events::{EventRefs, PaymentEventKind};
use crate::ledger::retry_on_conflict;
use crate::model::WebhookEventRecord;
use crate::payments::{IntentUpdate, PaymentStateMachine, TransitionOutcome};
use crate::refunds::RefundProcessor;
use crate::store::{Database, InsertOutcome};

pub mod event;
pub mod verification;

pub use event::{EventEnvelope, ProviderEvent};
pub use verification::SignatureVerifier;

/// What happened to a delivery that passed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Routed and applied.
    Processed,
    /// Already processed earlier; nothing reapplied.
    Duplicate,
    /// Event type this service does not act on.
    Ignored,
    /// Handler failed; the provider or the retry sweep will redeliver.
    Failed,
    /// Past the retry cap; left for manual review.
    NeedsReview,
}

/// Acknowledgement returned to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl WebhookAck {
    fn new(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

/// A raw delivery: payload bytes as text plus the signature header.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub processed: usize,
    pub duplicates: usize,
    pub ignored: usize,
    pub failed: usize,
    pub needs_review: usize,
    pub rejected: usize,
}

impl IngestStats {
    fn record(&mut self, outcome: WebhookOutcome) {
        match outcome {
            WebhookOutcome::Processed => self.processed += 1,
            WebhookOutcome::Duplicate => self.duplicates += 1,
            WebhookOutcome::Ignored => self.ignored += 1,
            WebhookOutcome::Failed => self.failed += 1,
            WebhookOutcome::NeedsReview => self.needs_review += 1,
        }
    }
}

pub struct WebhookIngestor {
    db: Arc<Database>,
    verifier: SignatureVerifier,
    payments: Arc<PaymentStateMachine>,
    refunds: Arc<RefundProcessor>,
    max_attempts: u32,
    lock_attempts: u32,
    backoff: Duration,
}

impl WebhookIngestor {
    pub fn new(
        db: Arc<Database>,
        payments: Arc<PaymentStateMachine>,
        refunds: Arc<RefundProcessor>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            verifier: SignatureVerifier::new(
                config.webhook_secret.as_bytes(),
                config.webhook_tolerance,
            ),
            payments,
            refunds,
            max_attempts: config.webhook_max_attempts.max(1),
            lock_attempts: config.reserve_max_attempts.max(1),
            backoff: config.reserve_backoff,
        }
    }

    /// Handle one delivery.
    ///
    /// Only signature and payload-shape problems are errors; every other
    /// outcome is acknowledged with `received: true`.
    pub async fn ingest(&self, payload: &str, signature: &str) -> Result<WebhookAck, WebhookError> {
        if let Err(e) = self
            .verifier
            .verify(payload.as_bytes(), signature, Utc::now().timestamp())
        {
            // unverified payloads are never logged
            warn!(payload_len = payload.len(), reason = %e, "webhook signature rejected");
            return Err(e.into());
        }

        let envelope: EventEnvelope = serde_json::from_str(payload).map_err(|e| {
            warn!(payload_len = payload.len(), reason = %e, "webhook payload malformed");
            WebhookError::MalformedPayload(e.to_string())
        })?;

        let record = WebhookEventRecord::new(&envelope.id, &envelope.event_type, payload);
        let inserted = self
            .db
            .transaction::<_, StoreError>(|t| {
                let outcome = t.insert_webhook_event(record);
                if matches!(outcome, InsertOutcome::Inserted) {
                    t.events.append(
                        EventRefs::default(),
                        PaymentEventKind::WebhookReceived {
                            event_id: envelope.id.clone(),
                            event_type: envelope.event_type.clone(),
                        },
                    );
                }
                Ok(outcome)
            })
            .await?;

        match inserted {
            InsertOutcome::Existing(existing) if existing.processed => {
                info!(event = %envelope.id, "duplicate webhook acknowledged");
                Ok(WebhookAck::new(WebhookOutcome::Duplicate))
            }
            InsertOutcome::Existing(existing) if existing.retry_count >= self.max_attempts => {
                warn!(event = %envelope.id, retries = existing.retry_count, "webhook redelivered while awaiting review");
                Ok(WebhookAck::new(WebhookOutcome::NeedsReview))
            }
            // new, or stored by an attempt that did not finish
            _ => Ok(WebhookAck::new(self.process(&envelope).await?)),
        }
    }

    /// Reprocess stored events that are not yet processed and still under
    /// the cap, including ones whose first attempt never finished.
    pub async fn retry_pending(&self) -> Result<IngestStats, WebhookError> {
        let max = self.max_attempts;
        let pending = self
            .db
            .read(|t| {
                t.webhook_events()
                    .filter(|r| !r.processed && r.retry_count < max)
                    .map(|r| r.payload.clone())
                    .collect::<Vec<_>>()
            })
            .await?;

        let mut stats = IngestStats::default();
        for payload in pending {
            // stored payloads were verified on arrival
            let envelope: EventEnvelope = match serde_json::from_str(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(reason = %e, "stored webhook no longer decodes");
                    stats.rejected += 1;
                    continue;
                }
            };
            stats.record(self.process(&envelope).await?);
        }
        if stats != IngestStats::default() {
            info!(
                processed = stats.processed,
                failed = stats.failed,
                needs_review = stats.needs_review,
                "webhook retry sweep finished"
            );
        }
        Ok(stats)
    }

    /// Events past the retry cap, oldest first.
    pub async fn needing_review(&self) -> Result<Vec<WebhookEventRecord>, StoreError> {
        let max = self.max_attempts;
        let mut records = self
            .db
            .read(|t| {
                t.webhook_events()
                    .filter(|r| !r.processed && r.retry_count >= max)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await?;
        records.sort_by_key(|r| r.received_at);
        Ok(records)
    }

    /// Ingest every delivery from `stream`. Rejected deliveries are logged
    /// and skipped.
    pub async fn run(
        &self,
        mut stream: impl Stream<Item = WebhookDelivery> + Unpin,
    ) -> IngestStats {
        let mut stats = IngestStats::default();
        while let Some(delivery) = stream.next().await {
            match self.ingest(&delivery.payload, &delivery.signature).await {
                Ok(ack) => stats.record(ack.outcome),
                Err(e) => {
                    warn!(code = %e.code(), reason = %e, "webhook delivery rejected");
                    stats.rejected += 1;
                }
            }
        }
        stats
    }

    /// Route a verified, stored event and record the result on its row.
    ///
    /// State changes made by the handler are committed before the row is
    /// updated. If the row cannot be updated the event stays unprocessed
    /// and the sweep reapplies it, which the idempotent handlers absorb.
    async fn process(&self, envelope: &EventEnvelope) -> Result<WebhookOutcome, WebhookError> {
        match self.route(envelope).await {
            Ok(outcome) => {
                let marked = retry_on_conflict(self.lock_attempts, self.backoff, || {
                    self.db.transaction::<_, StoreError>(|t| {
                        if let Some(row) = t.webhook_event_mut(&envelope.id) {
                            row.processed = true;
                            row.error_message = None;
                            row.processed_at = Some(Utc::now());
                        }
                        Ok(())
                    })
                })
                .await;
                if let Err(e) = marked {
                    warn!(event = %envelope.id, reason = %e, "webhook applied but not marked processed, sweep will retry");
                }
                Ok(outcome)
            }
            Err(e) => {
                let message = e.to_string();
                let recorded = retry_on_conflict(self.lock_attempts, self.backoff, || {
                    self.db.transaction::<_, StoreError>(|t| {
                        let retry_count = match t.webhook_event_mut(&envelope.id) {
                            Some(row) => {
                                row.retry_count += 1;
                                row.error_message = Some(message.clone());
                                row.retry_count
                            }
                            None => 0,
                        };
                        t.events.append(
                            EventRefs::default(),
                            PaymentEventKind::WebhookFailed {
                                event_id: envelope.id.clone(),
                                error: message.clone(),
                                retry_count,
                            },
                        );
                        Ok(retry_count)
                    })
                })
                .await;
                let retry_count = match recorded {
                    Ok(count) => count,
                    Err(store) => {
                        warn!(event = %envelope.id, reason = %store, failure = %message, "webhook failure not recorded");
                        return Ok(WebhookOutcome::Failed);
                    }
                };

                if retry_count >= self.max_attempts {
                    error!(
                        event = %envelope.id,
                        event_type = %envelope.event_type,
                        retries = retry_count,
                        reason = %message,
                        "webhook needs manual review"
                    );
                    Ok(WebhookOutcome::NeedsReview)
                } else {
                    warn!(event = %envelope.id, retries = retry_count, reason = %message, "webhook processing failed");
                    Ok(WebhookOutcome::Failed)
                }
            }
        }
    }

    async fn route(&self, envelope: &EventEnvelope) -> Result<WebhookOutcome, WebhookError> {
        let event = ProviderEvent::decode(envelope)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        let outcome = match event {
            ProviderEvent::PaymentSucceeded(intent) => {
                self.payments.mark_succeeded(&IntentUpdate::from(&intent)).await?
            }
            ProviderEvent::PaymentFailed(intent) => {
                self.payments.mark_failed(&IntentUpdate::from(&intent)).await?
            }
            ProviderEvent::RefundSucceeded(refund) => {
                self.refunds
                    .complete(&refund.id, refund.metadata.refund_id)
                    .await?
            }
            ProviderEvent::RefundFailed(refund) => {
                let reason = refund
                    .failure_reason
                    .as_deref()
                    .unwrap_or("refund failed at provider");
                self.refunds
                    .fail(&refund.id, refund.metadata.refund_id, reason)
                    .await?
            }
            ProviderEvent::Unknown(event_type) => {
                info!(event = %envelope.id, event_type = %event_type, "unhandled webhook type acknowledged");
                return Ok(WebhookOutcome::Ignored);
            }
        };
        if outcome != TransitionOutcome::Applied {
            info!(event = %envelope.id, outcome = ?outcome, "webhook state already current");
        }
        Ok(WebhookOutcome::Processed)
    }
}
