//! Payment state machine.
//!
//! Owns `Payment.status` and the payment-driven part of `Booking.status`.
//! Transitions are idempotent set-to-state operations: the synchronous
//! confirmation path and webhook deliveries can race or repeat and still
//! converge. Payment, booking and session rows change in one transaction so
//! a booking is never observably confirmed while its payment is pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Amount;
use crate::config::Config;
use crate::error::PaymentError;
use crate::events::{EventRefs, PaymentEventKind};
use crate::gateway::{IntentDetails, IntentStatus, PaymentGateway, intent_idempotency_key};
use crate::ledger::{AsConflict, release_seats, reserve_seats, retry_on_conflict};
use crate::model::{
    Booking, BookingId, BookingStatus, Payment, PaymentId, PaymentStatus, Session, SessionId,
};
use crate::outbox::SideEffect;
use crate::store::{Database, Tables};
use crate::webhook::event::IntentObject;

/// Provider-reported intent state, from a webhook or a confirm call.
#[derive(Debug, Clone)]
pub struct IntentUpdate {
    pub intent_id: String,
    /// Booking named in the intent metadata; used when no payment row
    /// exists for the intent yet.
    pub booking_hint: Option<BookingId>,
    pub amount: Amount,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&IntentObject> for IntentUpdate {
    fn from(intent: &IntentObject) -> Self {
        Self {
            intent_id: intent.id.clone(),
            booking_hint: intent.metadata.booking_id,
            amount: intent.amount(),
            charge_id: intent.charge_id.clone(),
            receipt_url: intent.receipt_url.clone(),
            failure_reason: intent.failure_message.clone(),
        }
    }
}

impl From<&IntentDetails> for IntentUpdate {
    fn from(details: &IntentDetails) -> Self {
        Self {
            intent_id: details.intent_id.clone(),
            booking_hint: Some(details.booking_id),
            amount: details.amount,
            charge_id: details.charge_id.clone(),
            receipt_url: details.receipt_url.clone(),
            failure_reason: match &details.status {
                IntentStatus::Failed { reason } => Some(reason.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The target state was already reached; nothing was written.
    AlreadyApplied,
    /// A later state already won (e.g. a failure reported after capture).
    Superseded,
}

impl TransitionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyApplied => "already_applied",
            Self::Superseded => "superseded",
        }
    }
}

/// What a success transition committed. A lost-seats capture still commits
/// its audit entry before surfacing as an error.
enum Committed {
    Outcome(TransitionOutcome),
    SeatsLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    Declined { reason: String },
    /// Outcome unknown; the webhook will settle it.
    Pending,
}

impl AsConflict for PaymentError {
    fn is_conflict(&self) -> bool {
        matches!(self, PaymentError::Store(e) if e.is_conflict())
    }
}

pub struct PaymentStateMachine {
    db: Arc<Database>,
    gateway: Arc<PaymentGateway>,
    max_attempts: u32,
    backoff: Duration,
}

impl PaymentStateMachine {
    pub fn new(db: Arc<Database>, gateway: Arc<PaymentGateway>, config: &Config) -> Self {
        Self {
            db,
            gateway,
            max_attempts: config.reserve_max_attempts.max(1),
            backoff: config.reserve_backoff,
        }
    }

    pub async fn payment(&self, id: PaymentId) -> Result<Payment, PaymentError> {
        self.db
            .read(|t| t.payment(id).cloned())
            .await?
            .ok_or(PaymentError::NotFound(id))
    }

    pub async fn payment_for_booking(&self, booking: BookingId) -> Result<Payment, PaymentError> {
        self.db
            .read(|t| t.payment_for_booking(booking).cloned())
            .await?
            .ok_or(PaymentError::NoPaymentForBooking(booking))
    }

    /// Record a captured payment and confirm its booking.
    pub async fn mark_succeeded(
        &self,
        update: &IntentUpdate,
    ) -> Result<TransitionOutcome, PaymentError> {
        let (booking, session) = self.resolve(update).await?;
        let result = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db.transaction_with_session(session, |s, t| {
                apply_success(s, t, booking, update)
            })
        })
        .await
        .and_then(|committed| match committed {
            Committed::Outcome(outcome) => Ok(outcome),
            Committed::SeatsLost => Err(PaymentError::SeatsLost { booking }),
        });
        log_result("payment succeeded", update, &result);
        result
    }

    /// Record a failed payment; a pending booking gives its seats back.
    pub async fn mark_failed(
        &self,
        update: &IntentUpdate,
    ) -> Result<TransitionOutcome, PaymentError> {
        let (booking, session) = self.resolve(update).await?;
        let result = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db.transaction_with_session(session, |s, t| {
                apply_failure(s, t, booking, update)
            })
        })
        .await;
        log_result("payment failed", update, &result);
        result
    }

    /// Confirm the booking's intent with the provider and apply the result.
    ///
    /// A timeout or outage leaves everything pending and returns
    /// [`ConfirmOutcome::Pending`].
    pub async fn confirm_payment(&self, booking: BookingId) -> Result<ConfirmOutcome, PaymentError> {
        let payment = self.payment_for_booking(booking).await?;
        let refs = EventRefs::payment(payment.id, booking);
        let intent = payment.external_intent_id.as_str();
        if payment.status.is_captured() {
            self.note_skipped(refs, intent, TransitionOutcome::AlreadyApplied.as_str())
                .await;
            return Ok(ConfirmOutcome::Confirmed);
        }

        // gateway failures are logged against the payment by the gateway
        let details = match self.gateway.confirm_for(intent, refs).await {
            Ok(details) => details,
            Err(e) if e.is_indeterminate() => {
                warn!(booking = %booking, reason = %e, "confirmation outcome unknown, awaiting webhook");
                return Ok(ConfirmOutcome::Pending);
            }
            Err(e) => return Err(e.into()),
        };

        match &details.status {
            IntentStatus::Succeeded => {
                self.mark_succeeded(&IntentUpdate::from(&details)).await?;
                Ok(ConfirmOutcome::Confirmed)
            }
            IntentStatus::Failed { reason } => {
                self.mark_failed(&IntentUpdate::from(&details)).await?;
                Ok(ConfirmOutcome::Declined {
                    reason: reason.clone(),
                })
            }
            IntentStatus::RequiresPayment | IntentStatus::Processing => {
                self.note_skipped(refs, intent, "awaiting_provider").await;
                Ok(ConfirmOutcome::Pending)
            }
        }
    }

    /// Audit a confirmation that changed nothing.
    async fn note_skipped(&self, refs: EventRefs, intent: &str, outcome: &str) {
        let appended = self
            .db
            .transaction::<_, PaymentError>(|t| {
                record_skip(t, refs, intent, "confirm_payment", outcome);
                Ok(())
            })
            .await;
        if let Err(e) = appended {
            warn!(intent, reason = %e, "could not record skipped confirmation");
        }
    }

    /// Find the booking and session an intent belongs to.
    async fn resolve(&self, update: &IntentUpdate) -> Result<(BookingId, SessionId), PaymentError> {
        self.db
            .read(|t| -> Result<_, PaymentError> {
                let booking = t
                    .payment_by_intent(&update.intent_id)
                    .map(|p| p.booking_id)
                    .or(update.booking_hint)
                    .ok_or_else(|| PaymentError::UnknownIntent(update.intent_id.clone()))?;
                let session = t
                    .booking(booking)
                    .map(|b| b.session_id)
                    .ok_or(PaymentError::BookingNotFound(booking))?;
                Ok((booking, session))
            })
            .await?
    }
}

fn apply_success(
    session: &mut Session,
    t: &mut Tables,
    booking_id: BookingId,
    update: &IntentUpdate,
) -> Result<Committed, PaymentError> {
    let booking = t
        .booking(booking_id)
        .cloned()
        .ok_or(PaymentError::BookingNotFound(booking_id))?;
    let existing = t.payment_by_intent(&update.intent_id).cloned();
    let known_refs = match &existing {
        Some(p) => EventRefs::payment(p.id, booking_id),
        None => EventRefs::booking(booking_id),
    };
    if existing.as_ref().is_some_and(|p| p.status.is_captured()) {
        let outcome = TransitionOutcome::AlreadyApplied;
        record_skip(t, known_refs, &update.intent_id, "payment_succeeded", outcome.as_str());
        return Ok(Committed::Outcome(outcome));
    }

    let next_status = match booking.status {
        BookingStatus::Pending => Some(BookingStatus::Confirmed),
        BookingStatus::PaymentFailed => {
            // a retried card succeeded after the seats were handed back
            if !reserve_seats(session, booking.participant_count).ok {
                t.events.append(
                    known_refs,
                    PaymentEventKind::PaymentCaptureOrphaned {
                        intent_id: update.intent_id.clone(),
                        charge_id: update.charge_id.clone(),
                        amount: update.amount,
                    },
                );
                return Ok(Committed::SeatsLost);
            }
            Some(BookingStatus::Confirmed)
        }
        BookingStatus::Cancelled | BookingStatus::Refunded => {
            warn!(
                booking = %booking_id,
                status = %booking.status,
                "payment captured for a closed booking, refund required"
            );
            None
        }
        BookingStatus::Confirmed | BookingStatus::Attended | BookingStatus::Completed => None,
    };

    let payment_id = upsert_payment(t, existing.as_ref(), &booking, update)?;
    let now = Utc::now();
    let amount = match t.payment_mut(payment_id) {
        Some(payment) => {
            payment.status = PaymentStatus::Succeeded;
            payment.charge_id = update.charge_id.clone().or(payment.charge_id.take());
            payment.receipt_url = update.receipt_url.clone().or(payment.receipt_url.take());
            payment.failure_reason = None;
            payment.updated_at = now;
            payment.amount
        }
        None => return Err(PaymentError::NotFound(payment_id)),
    };

    let refs = EventRefs::payment(payment_id, booking_id);
    t.events.append(
        refs,
        PaymentEventKind::PaymentSucceeded {
            intent_id: update.intent_id.clone(),
            charge_id: update.charge_id.clone(),
        },
    );
    if let Some(to) = next_status {
        set_booking_status(t, &booking, to, refs);
        t.outbox.push(SideEffect::ConfirmationEmail {
            booking: booking_id,
            reference: booking.reference.clone(),
            email: booking.contact_email.clone(),
        });
        t.outbox.push(SideEffect::GenerateInvoice {
            booking: booking_id,
            payment: payment_id,
            amount,
        });
        t.outbox.push(SideEffect::CustomerStats {
            email: booking.contact_email.clone(),
            bookings_delta: 1,
            spend_delta: amount,
        });
    }
    Ok(Committed::Outcome(TransitionOutcome::Applied))
}

fn apply_failure(
    session: &mut Session,
    t: &mut Tables,
    booking_id: BookingId,
    update: &IntentUpdate,
) -> Result<TransitionOutcome, PaymentError> {
    let booking = t
        .booking(booking_id)
        .cloned()
        .ok_or(PaymentError::BookingNotFound(booking_id))?;
    let existing = t.payment_by_intent(&update.intent_id).cloned();
    if let Some(payment) = &existing {
        let skipped = match payment.status {
            status if status.is_captured() => Some(TransitionOutcome::Superseded),
            PaymentStatus::Failed => Some(TransitionOutcome::AlreadyApplied),
            _ => None,
        };
        if let Some(outcome) = skipped {
            let refs = EventRefs::payment(payment.id, booking_id);
            record_skip(t, refs, &update.intent_id, "payment_failed", outcome.as_str());
            return Ok(outcome);
        }
    }

    let reason = update
        .failure_reason
        .clone()
        .unwrap_or_else(|| "payment failed".to_string());
    let payment_id = upsert_payment(t, existing.as_ref(), &booking, update)?;
    if let Some(payment) = t.payment_mut(payment_id) {
        payment.status = PaymentStatus::Failed;
        payment.failure_reason = Some(reason.clone());
        payment.updated_at = Utc::now();
    }

    let refs = EventRefs::payment(payment_id, booking_id);
    t.events.append(
        refs,
        PaymentEventKind::PaymentFailed {
            intent_id: update.intent_id.clone(),
            reason: reason.clone(),
        },
    );
    if booking.status == BookingStatus::Pending {
        release_seats(session, booking.participant_count);
        set_booking_status(t, &booking, BookingStatus::PaymentFailed, refs);
        t.outbox.push(SideEffect::PaymentFailedNotice {
            booking: booking_id,
            email: booking.contact_email.clone(),
            reason,
        });
    }
    Ok(TransitionOutcome::Applied)
}

/// Payment row for the intent, inserting it when intent creation succeeded
/// at the provider but the row was never written.
fn upsert_payment(
    t: &mut Tables,
    existing: Option<&Payment>,
    booking: &Booking,
    update: &IntentUpdate,
) -> Result<PaymentId, PaymentError> {
    if let Some(payment) = existing {
        return Ok(payment.id);
    }
    let now = Utc::now();
    let payment = Payment {
        id: Uuid::new_v4(),
        booking_id: booking.id,
        external_intent_id: update.intent_id.clone(),
        idempotency_key: intent_idempotency_key(booking.id, booking.created_at),
        amount: update.amount,
        status: PaymentStatus::Pending,
        charge_id: None,
        receipt_url: None,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    };
    let id = payment.id;
    warn!(booking = %booking.id, intent = %update.intent_id, "payment row missing, recorded from provider event");
    t.insert_payment(payment).map_err(PaymentError::from)?;
    t.events.append(
        EventRefs::payment(id, booking.id),
        PaymentEventKind::IntentCreated {
            intent_id: update.intent_id.clone(),
            amount: update.amount,
        },
    );
    Ok(id)
}

fn record_skip(t: &mut Tables, refs: EventRefs, intent: &str, transition: &str, outcome: &str) {
    t.events.append(
        refs,
        PaymentEventKind::TransitionSkipped {
            intent_id: intent.to_string(),
            transition: transition.to_string(),
            outcome: outcome.to_string(),
        },
    );
}

pub(crate) fn set_booking_status(
    t: &mut Tables,
    booking: &Booking,
    to: BookingStatus,
    refs: EventRefs,
) {
    if let Some(row) = t.booking_mut(booking.id) {
        row.status = to;
        row.updated_at = Utc::now();
    }
    t.events.append(
        refs,
        PaymentEventKind::BookingStatusChanged {
            from: booking.status.to_string(),
            to: to.to_string(),
        },
    );
}

fn log_result(
    transition: &str,
    update: &IntentUpdate,
    result: &Result<TransitionOutcome, PaymentError>,
) {
    match result {
        Ok(TransitionOutcome::Applied) => {
            info!(intent = %update.intent_id, amount = %update.amount, "{transition} applied");
        }
        Ok(outcome) => {
            info!(intent = %update.intent_id, outcome = ?outcome, "{transition} skipped");
        }
        Err(e) => {
            warn!(intent = %update.intent_id, reason = %e, "{transition} rejected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::gateway::simulated::SimulatedProvider;
    use crate::model::Participant;
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        db: Arc<Database>,
        provider: Arc<SimulatedProvider>,
        machine: PaymentStateMachine,
        session: SessionId,
    }

    async fn fixture(max: u32) -> Fixture {
        let config = Config {
            lock_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let db = Arc::new(Database::new(config.lock_timeout));
        let session = Session::published(
            "EFAW",
            Amount::from_major(75),
            max,
            Utc::now() + ChronoDuration::days(7),
        );
        let session = db.insert_session(session).await.unwrap();
        let provider = Arc::new(SimulatedProvider::new());
        let gateway = Arc::new(PaymentGateway::new(provider.clone(), db.clone(), &config));
        let machine = PaymentStateMachine::new(db.clone(), gateway, &config);
        Fixture {
            db,
            provider,
            machine,
            session,
        }
    }

    fn booking(session: SessionId, seats: u32) -> Booking {
        let now = Utc::now();
        Booking {
            id: Uuid::new_v4(),
            session_id: session,
            reference: format!("CB-TEST-{}", Uuid::new_v4().simple()),
            contact_email: "pat@example.com".into(),
            participants: (0..seats)
                .map(|i| Participant {
                    name: format!("P{i}"),
                    email: None,
                })
                .collect(),
            participant_count: seats,
            total_amount: Amount::from_major(75).times(seats),
            status: BookingStatus::Pending,
            special_requirements: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending booking holding `seats`, with a pending payment on `intent`.
    async fn pending_booking(f: &Fixture, seats: u32, intent: &str) -> BookingId {
        let b = booking(f.session, seats);
        let id = b.id;
        let payment = Payment {
            id: Uuid::new_v4(),
            booking_id: id,
            external_intent_id: intent.to_string(),
            idempotency_key: "k".into(),
            amount: b.total_amount,
            status: PaymentStatus::Pending,
            charge_id: None,
            receipt_url: None,
            failure_reason: None,
            created_at: b.created_at,
            updated_at: b.created_at,
        };
        f.db.transaction_with_session::<_, StoreError>(f.session, |s, t| {
            assert!(reserve_seats(s, seats).ok);
            t.insert_booking(b)?;
            t.insert_payment(payment)?;
            Ok(())
        })
        .await
        .unwrap();
        id
    }

    fn update(intent: &str, booking: BookingId) -> IntentUpdate {
        IntentUpdate {
            intent_id: intent.into(),
            booking_hint: Some(booking),
            amount: Amount::from_major(150),
            charge_id: Some("ch_1".into()),
            receipt_url: None,
            failure_reason: Some("card_declined".into()),
        }
    }

    async fn state(f: &Fixture, booking: BookingId) -> (BookingStatus, PaymentStatus, u32) {
        let (b, p) = f
            .db
            .read(|t: &Tables| {
                (
                    t.booking(booking).unwrap().status,
                    t.payment_for_booking(booking).unwrap().status,
                )
            })
            .await
            .unwrap();
        (b, p, f.db.session(f.session).await.unwrap().current_capacity)
    }

    async fn logged(f: &Fixture, name: &'static str) -> usize {
        f.db.read(|t| t.events.count_of(name)).await.unwrap()
    }

    #[tokio::test]
    async fn success_confirms_once() {
        let f = fixture(12).await;
        let booking = pending_booking(&f, 2, "pi_1").await;

        let first = f.machine.mark_succeeded(&update("pi_1", booking)).await.unwrap();
        let second = f.machine.mark_succeeded(&update("pi_1", booking)).await.unwrap();
        assert_eq!(first, TransitionOutcome::Applied);
        assert_eq!(second, TransitionOutcome::AlreadyApplied);

        assert_eq!(
            state(&f, booking).await,
            (BookingStatus::Confirmed, PaymentStatus::Succeeded, 2)
        );
        let (emails, invoices) = f
            .db
            .read(|t| (t.outbox.count("confirmation_email"), t.outbox.count("generate_invoice")))
            .await
            .unwrap();
        assert_eq!((emails, invoices), (1, 1));
        assert_eq!(logged(&f, "payment_succeeded").await, 1);
        assert_eq!(logged(&f, "transition_skipped").await, 1);
    }

    #[tokio::test]
    async fn failure_releases_seats() {
        let f = fixture(12).await;
        let booking = pending_booking(&f, 3, "pi_1").await;

        let outcome = f.machine.mark_failed(&update("pi_1", booking)).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
        assert_eq!(
            state(&f, booking).await,
            (BookingStatus::PaymentFailed, PaymentStatus::Failed, 0)
        );

        // repeated failure releases nothing more
        assert_eq!(
            f.machine.mark_failed(&update("pi_1", booking)).await.unwrap(),
            TransitionOutcome::AlreadyApplied
        );
        assert_eq!(f.db.session(f.session).await.unwrap().current_capacity, 0);
        assert_eq!(logged(&f, "payment_failed").await, 1);
        assert_eq!(logged(&f, "transition_skipped").await, 1);
    }

    #[tokio::test]
    async fn failure_after_capture_is_superseded() {
        let f = fixture(12).await;
        let booking = pending_booking(&f, 1, "pi_1").await;
        f.machine.mark_succeeded(&update("pi_1", booking)).await.unwrap();

        let outcome = f.machine.mark_failed(&update("pi_1", booking)).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::Superseded);
        assert_eq!(
            state(&f, booking).await,
            (BookingStatus::Confirmed, PaymentStatus::Succeeded, 1)
        );
        let skipped = f
            .db
            .read(|t| {
                t.events
                    .for_booking(booking)
                    .filter(|e| e.kind.name() == "transition_skipped")
                    .map(|e| e.kind.clone())
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap();
        assert_eq!(
            skipped,
            vec![PaymentEventKind::TransitionSkipped {
                intent_id: "pi_1".into(),
                transition: "payment_failed".into(),
                outcome: "superseded".into(),
            }]
        );
    }

    #[tokio::test]
    async fn late_success_revives_booking_when_seats_remain() {
        let f = fixture(12).await;
        let booking = pending_booking(&f, 2, "pi_1").await;
        f.machine.mark_failed(&update("pi_1", booking)).await.unwrap();

        f.machine.mark_succeeded(&update("pi_1", booking)).await.unwrap();
        assert_eq!(
            state(&f, booking).await,
            (BookingStatus::Confirmed, PaymentStatus::Succeeded, 2)
        );
    }

    #[tokio::test]
    async fn late_success_without_seats_is_an_error() {
        let f = fixture(2).await;
        let booking = pending_booking(&f, 2, "pi_1").await;
        f.machine.mark_failed(&update("pi_1", booking)).await.unwrap();
        let _other = pending_booking(&f, 2, "pi_2").await;

        let err = f.machine.mark_succeeded(&update("pi_1", booking)).await.unwrap_err();
        assert!(matches!(err, PaymentError::SeatsLost { .. }));
        assert_eq!(
            state(&f, booking).await,
            (BookingStatus::PaymentFailed, PaymentStatus::Failed, 2)
        );

        let orphaned = f
            .db
            .read(|t| {
                t.events
                    .for_booking(booking)
                    .filter(|e| e.kind.name() == "payment_capture_orphaned")
                    .count()
            })
            .await
            .unwrap();
        assert_eq!(orphaned, 1);
    }

    #[tokio::test]
    async fn missing_payment_row_is_recorded_from_metadata() {
        let f = fixture(12).await;
        let b = booking(f.session, 1);
        let id = b.id;
        f.db.transaction_with_session::<_, StoreError>(f.session, |s, t| {
            reserve_seats(s, 1);
            t.insert_booking(b)
        })
        .await
        .unwrap();

        f.machine.mark_succeeded(&update("pi_orphan", id)).await.unwrap();
        let payment = f.machine.payment_for_booking(id).await.unwrap();
        assert_eq!(payment.external_intent_id, "pi_orphan");
        assert_eq!(payment.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn unknown_intent_without_metadata() {
        let f = fixture(12).await;
        let mut u = update("pi_nobody", Uuid::new_v4());
        u.booking_hint = None;
        assert!(matches!(
            f.machine.mark_succeeded(&u).await,
            Err(PaymentError::UnknownIntent(_))
        ));
    }

    #[tokio::test]
    async fn confirm_payment_drives_transition() {
        let f = fixture(12).await;
        let gateway = PaymentGateway::new(f.provider.clone(), f.db.clone(), &Config::default());
        let b = booking(f.session, 2);
        let booking_id = b.id;
        let intent = gateway
            .create_intent(booking_id, b.total_amount, &b.contact_email, b.created_at)
            .await
            .unwrap();
        pending_booking_with(&f, b, &intent.intent_id).await;

        let outcome = f.machine.confirm_payment(booking_id).await.unwrap();
        assert_eq!(outcome, ConfirmOutcome::Confirmed);
        let payment = f.machine.payment_for_booking(booking_id).await.unwrap();
        assert!(payment.charge_id.unwrap().starts_with("ch_"));
    }

    #[tokio::test]
    async fn confirm_payment_declined() {
        let f = fixture(12).await;
        f.provider.decline_card_for("pat@example.com").await;
        let gateway = PaymentGateway::new(f.provider.clone(), f.db.clone(), &Config::default());
        let b = booking(f.session, 1);
        let booking_id = b.id;
        let intent = gateway
            .create_intent(booking_id, b.total_amount, &b.contact_email, b.created_at)
            .await
            .unwrap();
        pending_booking_with(&f, b, &intent.intent_id).await;

        let outcome = f.machine.confirm_payment(booking_id).await.unwrap();
        assert!(matches!(outcome, ConfirmOutcome::Declined { .. }));
        assert_eq!(
            state(&f, booking_id).await,
            (BookingStatus::PaymentFailed, PaymentStatus::Failed, 0)
        );
    }

    #[tokio::test]
    async fn confirming_a_captured_payment_is_audited() {
        let f = fixture(12).await;
        let booking = pending_booking(&f, 1, "pi_1").await;
        f.machine.mark_succeeded(&update("pi_1", booking)).await.unwrap();

        let outcome = f.machine.confirm_payment(booking).await.unwrap();
        assert_eq!(outcome, ConfirmOutcome::Confirmed);
        assert_eq!(logged(&f, "transition_skipped").await, 1);
    }

    #[tokio::test]
    async fn confirm_failure_is_logged_against_the_payment() {
        let f = fixture(12).await;
        // the provider has never seen this intent
        let booking = pending_booking(&f, 1, "pi_ghost").await;

        let err = f.machine.confirm_payment(booking).await.unwrap_err();
        assert!(matches!(err, PaymentError::Gateway(_)));
        let failures = f
            .db
            .read(|t| {
                t.events
                    .for_booking(booking)
                    .filter(|e| e.kind.name() == "gateway_failure")
                    .count()
            })
            .await
            .unwrap();
        assert_eq!(failures, 1);
        assert_eq!(
            state(&f, booking).await,
            (BookingStatus::Pending, PaymentStatus::Pending, 1)
        );
    }

    async fn pending_booking_with(f: &Fixture, b: Booking, intent: &str) {
        let payment = Payment {
            id: Uuid::new_v4(),
            booking_id: b.id,
            external_intent_id: intent.to_string(),
            idempotency_key: intent_idempotency_key(b.id, b.created_at),
            amount: b.total_amount,
            status: PaymentStatus::Pending,
            charge_id: None,
            receipt_url: None,
            failure_reason: None,
            created_at: b.created_at,
            updated_at: b.created_at,
        };
        let seats = b.participant_count;
        f.db.transaction_with_session::<_, StoreError>(f.session, |s, t| {
            reserve_seats(s, seats);
            t.insert_booking(b)?;
            t.insert_payment(payment)
        })
        .await
        .unwrap();
    }
}
