//! Booking creation and admin booking actions.
//!
//! Creation validates, then reserves seats and inserts the booking in one
//! session-locked transaction, then creates the payment intent with no lock
//! held. A definite provider rejection gives the seats back; an unknown
//! outcome leaves the booking pending for the webhook to settle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::Amount;
use crate::config::Config;
use crate::error::{BookingError, GatewayError, NotBookableReason, ValidationError, ValidationWarning};
use crate::events::{EventRefs, PaymentEventKind};
use crate::gateway::{IntentRef, PaymentGateway};
use crate::ledger::{AsConflict, release_seats, reserve_seats, retry_on_conflict};
use crate::model::{
    Booking, BookingId, BookingStatus, Participant, Payment, PaymentStatus, Session, SessionId,
};
use crate::payments::set_booking_status;
use crate::store::{Database, Tables};
use crate::validator::BookingValidator;

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub session_id: SessionId,
    pub participants: Vec<Participant>,
    pub contact_email: String,
    pub total_amount: Amount,
    pub special_requirements: Option<String>,
}

impl BookingRequest {
    pub fn participant_count(&self) -> u32 {
        u32::try_from(self.participants.len()).unwrap_or(u32::MAX)
    }
}

/// A reserved booking with its payment intent.
#[derive(Debug, Clone)]
pub struct BookingCreated {
    pub booking_id: BookingId,
    pub reference: String,
    pub amount: Amount,
    pub intent_id: String,
    /// Handed to the client to complete payment.
    pub client_secret: String,
    pub warnings: Vec<ValidationWarning>,
}

impl AsConflict for BookingError {
    fn is_conflict(&self) -> bool {
        matches!(self, BookingError::TransientFailure(_))
    }
}

pub struct BookingService {
    db: Arc<Database>,
    validator: BookingValidator,
    gateway: Arc<PaymentGateway>,
    max_attempts: u32,
    backoff: Duration,
}

impl BookingService {
    pub fn new(
        db: Arc<Database>,
        validator: BookingValidator,
        gateway: Arc<PaymentGateway>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            validator,
            gateway,
            max_attempts: config.reserve_max_attempts.max(1),
            backoff: config.reserve_backoff,
        }
    }

    pub async fn booking(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.db
            .read(|t| t.booking(id).cloned())
            .await?
            .ok_or(BookingError::NotFound(id))
    }

    pub async fn create_booking(&self, request: BookingRequest) -> Result<BookingCreated, BookingError> {
        let report = self.validator.validate(&request).await;
        if !report.is_valid {
            let err = rejection(report.errors);
            warn!(
                session = %request.session_id,
                code = %err.code(),
                reason = %err,
                "booking rejected"
            );
            return Err(err);
        }

        let booking = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db.transaction_with_session(request.session_id, |s, t| {
                reserve_and_insert(s, t, &request, Utc::now())
            })
        })
        .await
        .inspect_err(|e| warn!(session = %request.session_id, reason = %e, "booking not reserved"))?;
        info!(
            booking = %booking.id,
            reference = %booking.reference,
            seats = booking.participant_count,
            amount = %booking.total_amount,
            "booking reserved"
        );

        let intent = self
            .gateway
            .create_intent(
                booking.id,
                booking.total_amount,
                &booking.contact_email,
                booking.created_at,
            )
            .await;
        let intent = match intent {
            Ok(intent) => intent,
            Err(e) if e.is_indeterminate() => {
                warn!(booking = %booking.id, reason = %e, "intent outcome unknown, booking left pending");
                return Err(e.into());
            }
            Err(e) => {
                self.abandon(&booking, &e).await;
                return Err(e.into());
            }
        };

        self.record_payment(&booking, &intent).await?;
        Ok(BookingCreated {
            booking_id: booking.id,
            reference: booking.reference,
            amount: booking.total_amount,
            intent_id: intent.intent_id,
            client_secret: intent.client_secret,
            warnings: report.warnings,
        })
    }

    /// Admin cancellation of a pending or confirmed booking. Seats go back
    /// to the session; any refund is a separate request.
    pub async fn cancel_booking(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.transition(
            id,
            &[BookingStatus::Pending, BookingStatus::Confirmed],
            BookingStatus::Cancelled,
        )
        .await
    }

    /// Manual confirmation, e.g. for an offline payment.
    pub async fn confirm_booking(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.transition(id, &[BookingStatus::Pending], BookingStatus::Confirmed)
            .await
    }

    pub async fn mark_attended(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.transition(id, &[BookingStatus::Confirmed], BookingStatus::Attended)
            .await
    }

    pub async fn mark_completed(&self, id: BookingId) -> Result<Booking, BookingError> {
        self.transition(id, &[BookingStatus::Attended], BookingStatus::Completed)
            .await
    }

    async fn transition(
        &self,
        id: BookingId,
        from: &[BookingStatus],
        to: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let session = self.booking(id).await?.session_id;
        let result = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db.transaction_with_session(session, |s, t| {
                let booking = t.booking(id).cloned().ok_or(BookingError::NotFound(id))?;
                if !from.contains(&booking.status) {
                    return Err(BookingError::InvalidTransition {
                        booking: id,
                        from: booking.status,
                        to,
                    });
                }
                if to == BookingStatus::Cancelled {
                    let released = release_seats(s, booking.participant_count);
                    t.events.append(
                        EventRefs::booking(id),
                        PaymentEventKind::BookingCancelled {
                            released_seats: released,
                        },
                    );
                }
                set_booking_status(t, &booking, to, EventRefs::booking(id));
                t.booking(id).cloned().ok_or(BookingError::NotFound(id))
            })
        })
        .await;

        match &result {
            Ok(b) => info!(booking = %id, status = %b.status, "booking status changed"),
            Err(e) => warn!(booking = %id, to = %to, reason = %e, "booking status change skipped"),
        }
        result
    }

    async fn record_payment(&self, booking: &Booking, intent: &IntentRef) -> Result<(), BookingError> {
        let now = Utc::now();
        self.db
            .transaction(|t| -> Result<(), BookingError> {
                // a fast webhook may have recorded it already
                if t.payment_by_intent(&intent.intent_id).is_some() {
                    return Ok(());
                }
                let payment = Payment {
                    id: Uuid::new_v4(),
                    booking_id: booking.id,
                    external_intent_id: intent.intent_id.clone(),
                    idempotency_key: intent.idempotency_key.clone(),
                    amount: booking.total_amount,
                    status: PaymentStatus::Pending,
                    charge_id: None,
                    receipt_url: None,
                    failure_reason: None,
                    created_at: now,
                    updated_at: now,
                };
                let payment_id = payment.id;
                t.insert_payment(payment)?;
                t.events.append(
                    EventRefs::payment(payment_id, booking.id),
                    PaymentEventKind::IntentCreated {
                        intent_id: intent.intent_id.clone(),
                        amount: intent.amount,
                    },
                );
                Ok(())
            })
            .await
    }

    /// The provider definitely refused the intent: fail the booking and
    /// release its seats.
    async fn abandon(&self, booking: &Booking, cause: &GatewayError) {
        let result = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db.transaction_with_session(booking.session_id, |s, t| {
                let Some(current) = t.booking(booking.id).cloned() else {
                    return Err(BookingError::NotFound(booking.id));
                };
                if current.status == BookingStatus::Pending {
                    release_seats(s, current.participant_count);
                    set_booking_status(
                        t,
                        &current,
                        BookingStatus::PaymentFailed,
                        EventRefs::booking(booking.id),
                    );
                }
                Ok(())
            })
        })
        .await;
        match result {
            Ok(()) => warn!(booking = %booking.id, reason = %cause, "intent refused, seats released"),
            Err(e) => warn!(booking = %booking.id, reason = %e, "could not release seats after intent refusal"),
        }
    }
}

fn reserve_and_insert(
    session: &mut Session,
    t: &mut Tables,
    request: &BookingRequest,
    now: DateTime<Utc>,
) -> Result<Booking, BookingError> {
    if let Some(reason) = NotBookableReason::from_status(session.status) {
        return Err(match reason {
            NotBookableReason::Full => BookingError::CapacityUnavailable {
                available: session.available_spots(),
            },
            other => BookingError::SessionNotBookable(other),
        });
    }
    if session.has_started(now) {
        return Err(BookingError::SessionNotBookable(NotBookableReason::Started));
    }

    // the validator's duplicate check ran without the lock
    let email = request.contact_email.trim();
    if t
        .bookings_for_session(session.id)
        .any(|b| b.status.holds_seats() && b.contact_email.eq_ignore_ascii_case(email))
    {
        return Err(BookingError::Validation(vec![
            ValidationError::DuplicateBooking {
                email: email.to_string(),
            },
        ]));
    }

    let count = request.participant_count();
    let reservation = reserve_seats(session, count);
    if !reservation.ok {
        return Err(BookingError::CapacityUnavailable {
            available: reservation.available_spots,
        });
    }

    let reference = loop {
        let candidate = booking_reference(now);
        if !t.reference_taken(&candidate) {
            break candidate;
        }
    };
    let booking = Booking {
        id: Uuid::new_v4(),
        session_id: session.id,
        reference,
        contact_email: email.to_string(),
        participants: request.participants.clone(),
        participant_count: count,
        total_amount: request.total_amount,
        status: BookingStatus::Pending,
        special_requirements: request.special_requirements.clone(),
        created_at: now,
        updated_at: now,
    };
    t.insert_booking(booking.clone())?;
    t.events.append(
        EventRefs::booking(booking.id),
        PaymentEventKind::BookingCreated {
            reference: booking.reference.clone(),
            amount: booking.total_amount,
        },
    );
    Ok(booking)
}

/// `CB-YYMMDD-XXXXXX`.
fn booking_reference(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("CB-{}-{suffix}", now.format("%y%m%d"))
}

/// Collapse validation errors into the caller-facing error. Capacity and
/// session-status problems alone keep their own codes.
fn rejection(errors: Vec<ValidationError>) -> BookingError {
    let only_availability = errors.iter().all(|e| {
        matches!(
            e,
            ValidationError::InsufficientCapacity { .. } | ValidationError::SessionNotBookable(_)
        )
    });
    if errors.is_empty() || !only_availability {
        return BookingError::Validation(errors);
    }

    let capacity = errors.iter().find_map(|e| match e {
        ValidationError::InsufficientCapacity { available, .. } => Some(*available),
        ValidationError::SessionNotBookable(NotBookableReason::Full) => Some(0),
        _ => None,
    });
    match capacity {
        Some(available) => BookingError::CapacityUnavailable { available },
        None => errors
            .into_iter()
            .find_map(|e| match e {
                ValidationError::SessionNotBookable(reason) => {
                    Some(BookingError::SessionNotBookable(reason))
                }
                _ => None,
            })
            .unwrap_or(BookingError::Validation(Vec::new())),
    }
}
