//! Service wiring and the batch flow driven by the CLI.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::booking::{BookingRequest, BookingService};
use crate::config::Config;
use crate::csv::{BookingOrder, Card, SessionSeed};
use crate::error::{Error, WebhookError};
use crate::gateway::simulated::SimulatedProvider;
use crate::gateway::{IntentStatus, PaymentGateway};
use crate::ledger::CapacityLedger;
use crate::model::{BookingId, RefundReason, RefundStatus, Session, SessionId};
use crate::outbox::{DrainStats, LoggingSideEffects, OutboxDispatcher};
use crate::payments::PaymentStateMachine;
use crate::reconciliation::{self, ReconciliationReport};
use crate::refunds::RefundProcessor;
use crate::store::Database;
use crate::validator::BookingValidator;
use crate::webhook::{
    EventEnvelope, IngestStats, SignatureVerifier, WebhookAck, WebhookDelivery, WebhookIngestor,
};

/// Every service over one store and one simulated provider.
pub struct Platform {
    config: Config,
    db: Arc<Database>,
    provider: Arc<SimulatedProvider>,
    gateway: Arc<PaymentGateway>,
    ledger: Arc<CapacityLedger>,
    bookings: Arc<BookingService>,
    payments: Arc<PaymentStateMachine>,
    refunds: Arc<RefundProcessor>,
    webhooks: Arc<WebhookIngestor>,
    signer: SignatureVerifier,
}

/// Result of [`Platform::run_batch`].
#[derive(Debug)]
pub struct BatchSummary {
    /// Sessions in input order, as they stand after the batch.
    pub sessions: Vec<(String, Session)>,
    pub bookings_created: usize,
    pub webhooks: IngestStats,
    pub refunds_completed: usize,
    pub side_effects: DrainStats,
    pub report: ReconciliationReport,
}

impl Platform {
    pub fn new(config: Config, provider: Arc<SimulatedProvider>) -> Self {
        let db = Arc::new(Database::new(config.lock_timeout));
        let gateway = Arc::new(PaymentGateway::new(provider.clone(), db.clone(), &config));
        let ledger = Arc::new(CapacityLedger::new(db.clone(), &config));
        let validator = BookingValidator::new(db.clone(), ledger.clone(), &config);
        let bookings = Arc::new(BookingService::new(
            db.clone(),
            validator,
            gateway.clone(),
            &config,
        ));
        let payments = Arc::new(PaymentStateMachine::new(db.clone(), gateway.clone(), &config));
        let refunds = Arc::new(RefundProcessor::new(db.clone(), gateway.clone(), &config));
        let webhooks = Arc::new(WebhookIngestor::new(
            db.clone(),
            payments.clone(),
            refunds.clone(),
            &config,
        ));
        let signer = SignatureVerifier::new(config.webhook_secret.as_bytes(), config.webhook_tolerance);

        Self {
            config,
            db,
            provider,
            gateway,
            ledger,
            bookings,
            payments,
            refunds,
            webhooks,
            signer,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn provider(&self) -> &Arc<SimulatedProvider> {
        &self.provider
    }

    pub fn gateway(&self) -> &Arc<PaymentGateway> {
        &self.gateway
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    pub fn bookings(&self) -> &Arc<BookingService> {
        &self.bookings
    }

    pub fn payments(&self) -> &Arc<PaymentStateMachine> {
        &self.payments
    }

    pub fn refunds(&self) -> &Arc<RefundProcessor> {
        &self.refunds
    }

    pub fn webhooks(&self) -> &Arc<WebhookIngestor> {
        &self.webhooks
    }

    /// Sign `envelope` the way the provider would, timestamped now.
    pub fn sign(&self, envelope: &EventEnvelope) -> Result<WebhookDelivery, WebhookError> {
        let payload = envelope.to_payload();
        let signature = self.signer.sign(payload.as_bytes(), Utc::now().timestamp())?;
        Ok(WebhookDelivery { payload, signature })
    }

    /// Sign and ingest one provider event.
    pub async fn deliver(&self, envelope: &EventEnvelope) -> Result<WebhookAck, WebhookError> {
        let delivery = self.sign(envelope)?;
        self.webhooks
            .ingest(&delivery.payload, &delivery.signature)
            .await
    }

    pub fn outbox(&self) -> OutboxDispatcher<LoggingSideEffects> {
        OutboxDispatcher::new(
            self.db.clone(),
            LoggingSideEffects,
            self.config.outbox_max_attempts,
        )
        .with_lease(self.config.outbox_lease)
        .with_retention(self.config.outbox_retention)
    }

    /// Seed `sessions`, place every order concurrently, confirm each intent
    /// at the provider and feed the resulting webhooks (each delivered
    /// twice) through the ingestor. Refunds requested by the orders run
    /// afterwards, then side effects are drained.
    pub async fn run_batch(
        self: &Arc<Self>,
        sessions: Vec<SessionSeed>,
        orders: Vec<BookingOrder>,
    ) -> Result<BatchSummary, Error> {
        let started = Utc::now();

        let mut labels = Vec::new();
        let mut ids = HashMap::new();
        for seed in sessions {
            if ids.contains_key(&seed.label) {
                warn!(session = %seed.label, "duplicate session label, skipping");
                continue;
            }
            let id = self.db.insert_session(seed.session).await?;
            ids.insert(seed.label.clone(), id);
            labels.push((seed.label, id));
        }
        let ids = Arc::new(ids);

        for order in orders.iter().filter(|o| o.card == Card::Decline) {
            self.provider.decline_card_for(&order.email).await;
        }

        let (sender, receiver) = mpsc::channel(64);
        let ingest = tokio::spawn({
            let webhooks = self.webhooks.clone();
            async move { webhooks.run(ReceiverStream::new(receiver)).await }
        });

        let mut placed = JoinSet::new();
        for order in orders {
            let platform = self.clone();
            let ids = ids.clone();
            let sender = sender.clone();
            placed.spawn(async move {
                let booking = platform.place(&order, &ids, &sender).await;
                (order, booking)
            });
        }
        drop(sender);

        let mut created = Vec::new();
        while let Some(joined) = placed.join_next().await {
            match joined {
                Ok((order, Some(booking))) => created.push((order, booking)),
                Ok((_, None)) => {}
                Err(e) => warn!(reason = %e, "booking task failed"),
            }
        }
        let webhooks = match ingest.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(reason = %e, "webhook task failed");
                IngestStats::default()
            }
        };

        let mut refunds_completed = 0;
        for (order, booking) in &created {
            if let Some(amount) = order.refund {
                if self.refund(*booking, amount, order.line).await {
                    refunds_completed += 1;
                }
            }
        }

        let side_effects = self.outbox().drain().await?;

        let mut snapshot = Vec::with_capacity(labels.len());
        for (label, id) in labels {
            snapshot.push((label, self.db.session(id).await?));
        }
        let report =
            reconciliation::report(&self.db, started, Utc::now() + Duration::seconds(1)).await?;

        info!(
            bookings = created.len(),
            processed = webhooks.processed,
            duplicates = webhooks.duplicates,
            refunds = refunds_completed,
            "batch finished"
        );
        Ok(BatchSummary {
            sessions: snapshot,
            bookings_created: created.len(),
            webhooks,
            refunds_completed,
            side_effects,
            report,
        })
    }

    /// Create one booking and queue the provider's verdict on its intent.
    async fn place(
        &self,
        order: &BookingOrder,
        ids: &HashMap<String, SessionId>,
        webhooks: &mpsc::Sender<WebhookDelivery>,
    ) -> Option<BookingId> {
        let Some(&session_id) = ids.get(&order.session) else {
            warn!(line = order.line, session = %order.session, "unknown session label");
            return None;
        };
        let request = BookingRequest {
            session_id,
            participants: order.participants.clone(),
            contact_email: order.email.clone(),
            total_amount: order.total,
            special_requirements: None,
        };
        let created = match self.bookings.create_booking(request).await {
            Ok(created) => created,
            Err(e) => {
                warn!(line = order.line, code = %e.code(), "order not placed");
                return None;
            }
        };

        let details = match self.gateway.confirm(&created.intent_id).await {
            Ok(details) => details,
            Err(e) => {
                warn!(line = order.line, booking = %created.booking_id, reason = %e, "confirmation unknown");
                return Some(created.booking_id);
            }
        };
        let event_id = format!("evt_{}", Uuid::new_v4().simple());
        let envelope = match &details.status {
            IntentStatus::Succeeded => EventEnvelope::for_intent(
                event_id,
                "payment_intent.succeeded",
                &details.intent_id,
                details.amount.to_minor_units(),
                created.booking_id,
                details.charge_id.as_deref(),
                None,
            ),
            IntentStatus::Failed { reason } => EventEnvelope::for_intent(
                event_id,
                "payment_intent.payment_failed",
                &details.intent_id,
                details.amount.to_minor_units(),
                created.booking_id,
                None,
                Some(reason),
            ),
            other => {
                info!(booking = %created.booking_id, status = ?other, "intent not settled yet");
                return Some(created.booking_id);
            }
        };

        match self.sign(&envelope) {
            Ok(delivery) => {
                // providers deliver at least once
                for delivery in [delivery.clone(), delivery] {
                    if webhooks.send(delivery).await.is_err() {
                        warn!(booking = %created.booking_id, "webhook channel closed");
                    }
                }
            }
            Err(e) => warn!(booking = %created.booking_id, reason = %e, "could not sign webhook"),
        }
        Some(created.booking_id)
    }

    /// Request, approve and settle a refund, then deliver its webhook.
    async fn refund(&self, booking: BookingId, amount: crate::Amount, line: usize) -> bool {
        let refund = match self
            .refunds
            .create(booking, Some(amount), RefundReason::RequestedByCustomer)
            .await
        {
            Ok(refund) => refund,
            Err(e) => {
                warn!(line, booking = %booking, code = %e.code(), "refund not requested");
                return false;
            }
        };
        let refund = match self.refunds.approve(refund.id, "batch").await {
            Ok(refund) => refund,
            Err(e) => {
                warn!(line, refund = %refund.id, reason = %e, "refund not approved");
                return false;
            }
        };
        let (RefundStatus::Processing, Some(provider_id)) =
            (refund.status, refund.provider_refund_id.as_deref())
        else {
            return refund.status == RefundStatus::Completed;
        };

        let Some(settled) = self.provider.settle_refund(provider_id, true).await else {
            return false;
        };
        let envelope = EventEnvelope::for_refund(
            format!("evt_{}", Uuid::new_v4().simple()),
            "refund.succeeded",
            &settled.id,
            settled.amount_minor,
            refund.id,
            None,
        );
        match self.deliver(&envelope).await {
            Ok(_) => matches!(
                self.refunds.refund(refund.id).await,
                Ok(r) if r.status == RefundStatus::Completed
            ),
            Err(e) => {
                warn!(line, refund = %refund.id, reason = %e, "refund webhook rejected");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Participant, SessionStatus};
    use crate::Amount;

    fn seed(label: &str, capacity: u32, taken: u32) -> SessionSeed {
        let mut session = Session::published(
            format!("{label} course"),
            Amount::from_major(75),
            capacity,
            Utc::now() + Duration::days(7),
        );
        session.current_capacity = taken;
        session.recompute_status();
        SessionSeed {
            label: label.to_string(),
            session,
        }
    }

    fn order(line: usize, session: &str, email: &str, seats: u32) -> BookingOrder {
        BookingOrder {
            line,
            session: session.to_string(),
            email: email.to_string(),
            participants: (0..seats)
                .map(|i| Participant {
                    name: format!("P{i}"),
                    email: None,
                })
                .collect(),
            total: Amount::from_major(75).times(seats),
            card: Card::Ok,
            refund: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batch_books_confirms_and_refunds() {
        let platform = Arc::new(Platform::new(Config::default(), Arc::new(SimulatedProvider::new())));
        let mut declined = order(3, "efaw", "dee@example.com", 1);
        declined.card = Card::Decline;
        let mut refunded = order(4, "efaw", "rob@example.com", 2);
        refunded.refund = Some(Amount::from_major(150));

        let summary = platform
            .run_batch(
                vec![seed("efaw", 12, 6)],
                vec![
                    order(2, "efaw", "ana@example.com", 2),
                    declined,
                    refunded,
                    order(5, "nope", "x@example.com", 1),
                ],
            )
            .await
            .unwrap();

        assert_eq!(summary.bookings_created, 3);
        assert_eq!(summary.webhooks.processed, 3);
        assert_eq!(summary.webhooks.duplicates, 3);
        assert_eq!(summary.refunds_completed, 1);

        let (label, session) = &summary.sessions[0];
        assert_eq!(label, "efaw");
        assert_eq!(session.current_capacity, 8);
        assert_eq!(session.status, SessionStatus::Published);

        assert_eq!(summary.report.payments_count, 2);
        assert_eq!(summary.report.payments_amount, Amount::from_major(300));
        assert_eq!(summary.report.refunds_amount, Amount::from_major(150));
        assert_eq!(summary.report.net_amount, Amount::from_major(150));
        assert!(summary.report.is_consistent());
        assert_eq!(summary.side_effects.dead_lettered, 0);

        let statuses = platform
            .db()
            .read(|t| {
                let mut s: Vec<_> = t.bookings().map(|b| b.status).collect();
                s.sort_by_key(|s| s.as_str());
                s
            })
            .await
            .unwrap();
        assert_eq!(
            statuses,
            vec![
                BookingStatus::Confirmed,
                BookingStatus::PaymentFailed,
                BookingStatus::Refunded
            ]
        );
    }

    #[tokio::test]
    async fn deliver_rejects_nothing_it_signed() {
        let platform = Platform::new(Config::default(), Arc::new(SimulatedProvider::new()));
        let envelope = EventEnvelope::for_intent(
            "evt_unknown",
            "customer.created",
            "pi_1",
            100,
            Uuid::new_v4(),
            None,
            None,
        );
        let ack = platform.deliver(&envelope).await.unwrap();
        assert!(ack.received);
    }
}
