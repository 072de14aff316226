//! Refund processor.
//!
//! Lifecycle: `pending → approved → processing → completed | failed`, with
//! `failed → pending` only through [`RefundProcessor::retry`]. The refundable
//! balance counts every refund that is not failed, so two in-flight refunds
//! can never together exceed the captured amount.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Amount;
use crate::config::Config;
use crate::error::RefundError;
use crate::events::{EventRefs, PaymentEventKind};
use crate::gateway::{PaymentGateway, ProviderRefundStatus};
use crate::ledger::{AsConflict, release_seats, retry_on_conflict};
use crate::model::{
    BookingId, BookingStatus, PaymentStatus, Refund, RefundId, RefundReason, RefundStatus,
    Session, SessionId,
};
use crate::outbox::SideEffect;
use crate::payments::{TransitionOutcome, set_booking_status};
use crate::store::{Database, Tables};

impl AsConflict for RefundError {
    fn is_conflict(&self) -> bool {
        matches!(self, RefundError::Store(e) if e.is_conflict())
    }
}

/// What a refund submission needs once the local row is approved.
struct Submission {
    refund: Refund,
    charge_id: String,
}

pub struct RefundProcessor {
    db: Arc<Database>,
    gateway: Arc<PaymentGateway>,
    max_attempts: u32,
    backoff: Duration,
}

impl RefundProcessor {
    pub fn new(db: Arc<Database>, gateway: Arc<PaymentGateway>, config: &Config) -> Self {
        Self {
            db,
            gateway,
            max_attempts: config.reserve_max_attempts.max(1),
            backoff: config.reserve_backoff,
        }
    }

    pub async fn refund(&self, id: RefundId) -> Result<Refund, RefundError> {
        self.db
            .read(|t| t.refund(id).cloned())
            .await?
            .ok_or(RefundError::NotFound(id))
    }

    pub async fn refunds_for_booking(&self, booking: BookingId) -> Result<Vec<Refund>, RefundError> {
        let mut refunds = self
            .db
            .read(|t| {
                t.refunds()
                    .filter(|r| r.booking_id == booking)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .await?;
        refunds.sort_by_key(|r| r.created_at);
        Ok(refunds)
    }

    /// Open a refund for the booking's payment. `amount` of `None` refunds
    /// the whole remaining balance.
    pub async fn create(
        &self,
        booking: BookingId,
        amount: Option<Amount>,
        reason: RefundReason,
    ) -> Result<Refund, RefundError> {
        let result = self
            .db
            .transaction(|t| -> Result<Refund, RefundError> {
                t.booking(booking).ok_or(RefundError::BookingNotFound(booking))?;
                let payment = t
                    .payment_for_booking(booking)
                    .cloned()
                    .ok_or(RefundError::PaymentNotFound(booking))?;
                if !payment.status.is_captured() {
                    return Err(RefundError::PaymentNotRefundable {
                        payment: payment.id,
                        status: payment.status,
                    });
                }

                let refundable = refundable_balance(t, payment.id, payment.amount);
                let amount = match amount {
                    Some(a) if !a.is_positive() => return Err(RefundError::InvalidAmount(a)),
                    Some(a) => a,
                    None => refundable,
                };
                if amount > refundable || !amount.is_positive() {
                    return Err(RefundError::ExceedsRefundableBalance {
                        requested: amount,
                        refundable,
                    });
                }

                let now = Utc::now();
                let refund = Refund {
                    id: Uuid::new_v4(),
                    payment_id: payment.id,
                    booking_id: booking,
                    amount,
                    status: RefundStatus::Pending,
                    reason,
                    approved_by: None,
                    provider_refund_id: None,
                    error_message: None,
                    attempts: 0,
                    created_at: now,
                    updated_at: now,
                };
                t.insert_refund(refund.clone())?;
                t.events.append(
                    EventRefs::refund(refund.id, payment.id, booking),
                    PaymentEventKind::RefundRequested {
                        amount,
                        reason: refund.reason.to_string(),
                    },
                );
                Ok(refund)
            })
            .await;

        match &result {
            Ok(r) => info!(booking = %booking, refund = %r.id, amount = %r.amount, "refund requested"),
            Err(e) => warn!(booking = %booking, reason = %e, "refund request rejected"),
        }
        result
    }

    /// Approve a pending refund and submit it to the provider.
    ///
    /// Returns the refund as it stands afterwards: `processing` once the
    /// provider accepts, `failed` on a definite rejection, or still
    /// `approved` when the provider's answer is unknown. An `approved`
    /// refund may be approved again; the resubmission reuses its
    /// idempotency key.
    pub async fn approve(&self, id: RefundId, approver: &str) -> Result<Refund, RefundError> {
        let submission = self
            .db
            .transaction(|t| -> Result<Submission, RefundError> {
                let refund = t.refund(id).cloned().ok_or(RefundError::NotFound(id))?;
                if !matches!(refund.status, RefundStatus::Pending | RefundStatus::Approved) {
                    return Err(RefundError::InvalidState {
                        refund: id,
                        status: refund.status,
                        operation: "approve",
                    });
                }
                let charge_id = t
                    .payment(refund.payment_id)
                    .and_then(|p| p.charge_id.clone())
                    .ok_or(RefundError::MissingCharge(refund.payment_id))?;

                let row = t.refund_mut(id).ok_or(RefundError::NotFound(id))?;
                row.status = RefundStatus::Approved;
                row.approved_by = Some(approver.to_string());
                row.updated_at = Utc::now();
                let refund = row.clone();
                t.events.append(
                    EventRefs::refund(id, refund.payment_id, refund.booking_id),
                    PaymentEventKind::RefundApproved {
                        approver: approver.to_string(),
                    },
                );
                Ok(Submission { refund, charge_id })
            })
            .await?;
        info!(refund = %id, approver, "refund approved");

        let Submission { refund, charge_id } = submission;
        let refs = EventRefs::refund(id, refund.payment_id, refund.booking_id);
        let submitted = self
            .gateway
            .create_refund(
                id,
                refund.attempts,
                &charge_id,
                Some(refund.amount),
                &refund.reason,
                refs,
            )
            .await;

        match submitted {
            Ok(provider) => {
                let provider_id = provider.provider_refund_id.clone();
                self.db
                    .transaction(|t| -> Result<(), RefundError> {
                        if let Some(row) = t.refund_mut(id) {
                            // a fast webhook may already have settled it
                            if row.status == RefundStatus::Approved {
                                row.status = RefundStatus::Processing;
                            }
                            row.provider_refund_id = Some(provider_id.clone());
                            row.error_message = None;
                            row.updated_at = Utc::now();
                        }
                        t.events.append(
                            refs,
                            PaymentEventKind::RefundSubmitted {
                                provider_refund_id: provider_id.clone(),
                            },
                        );
                        Ok(())
                    })
                    .await?;
                info!(refund = %id, provider_refund = %provider_id, "refund submitted");

                match provider.status {
                    ProviderRefundStatus::Succeeded => {
                        self.complete(&provider_id, Some(id)).await?;
                    }
                    ProviderRefundStatus::Failed => {
                        self.fail(&provider_id, Some(id), "refund failed at provider")
                            .await?;
                    }
                    ProviderRefundStatus::Pending => {}
                }
            }
            Err(e) if e.is_indeterminate() => {
                warn!(refund = %id, reason = %e, "refund submission outcome unknown, awaiting webhook");
                let message = e.to_string();
                self.db
                    .transaction(|t| -> Result<(), RefundError> {
                        if let Some(row) = t.refund_mut(id) {
                            row.error_message = Some(message);
                            row.updated_at = Utc::now();
                        }
                        Ok(())
                    })
                    .await?;
            }
            Err(e) => {
                warn!(refund = %id, reason = %e, "refund rejected by provider");
                let message = e.to_string();
                self.db
                    .transaction(|t| -> Result<(), RefundError> {
                        mark_refund_failed(t, id, message);
                        Ok(())
                    })
                    .await?;
            }
        }
        self.refund(id).await
    }

    /// Re-enter the approval path for a failed refund with the same amount
    /// and reason.
    pub async fn retry(&self, id: RefundId, approver: &str) -> Result<Refund, RefundError> {
        self.db
            .transaction(|t| -> Result<(), RefundError> {
                let refund = t.refund(id).cloned().ok_or(RefundError::NotFound(id))?;
                if refund.status != RefundStatus::Failed {
                    return Err(RefundError::InvalidState {
                        refund: id,
                        status: refund.status,
                        operation: "retry",
                    });
                }
                // the failed refund released its share of the balance
                let amount = t
                    .payment(refund.payment_id)
                    .map(|p| p.amount)
                    .unwrap_or(Amount::ZERO);
                let refundable = refundable_balance(t, refund.payment_id, amount);
                if refund.amount > refundable {
                    return Err(RefundError::ExceedsRefundableBalance {
                        requested: refund.amount,
                        refundable,
                    });
                }
                if let Some(row) = t.refund_mut(id) {
                    row.status = RefundStatus::Pending;
                    row.error_message = None;
                    row.updated_at = Utc::now();
                }
                Ok(())
            })
            .await?;
        info!(refund = %id, "refund retry requested");
        self.approve(id, approver).await
    }

    /// Provider confirmed the refund. A refund that returns the whole
    /// payment also refunds the booking and gives its seats back.
    pub async fn complete(
        &self,
        provider_refund_id: &str,
        refund_hint: Option<RefundId>,
    ) -> Result<TransitionOutcome, RefundError> {
        let (id, session) = self.resolve(provider_refund_id, refund_hint).await?;
        let result = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db.transaction_with_session(session, |s, t| {
                apply_completion(s, t, id, provider_refund_id)
            })
        })
        .await;
        match &result {
            Ok(TransitionOutcome::Applied) => info!(refund = %id, "refund completed"),
            Ok(outcome) => info!(refund = %id, outcome = ?outcome, "refund completion skipped"),
            Err(e) => warn!(refund = %id, reason = %e, "refund completion rejected"),
        }
        result
    }

    /// Provider reported the refund failed.
    pub async fn fail(
        &self,
        provider_refund_id: &str,
        refund_hint: Option<RefundId>,
        message: &str,
    ) -> Result<TransitionOutcome, RefundError> {
        let (id, _) = self.resolve(provider_refund_id, refund_hint).await?;
        let result = self
            .db
            .transaction(|t| -> Result<TransitionOutcome, RefundError> {
                let refund = t.refund(id).cloned().ok_or(RefundError::NotFound(id))?;
                match refund.status {
                    RefundStatus::Failed => Ok(TransitionOutcome::AlreadyApplied),
                    RefundStatus::Completed => Ok(TransitionOutcome::Superseded),
                    RefundStatus::Pending => Err(RefundError::InvalidState {
                        refund: id,
                        status: refund.status,
                        operation: "fail",
                    }),
                    RefundStatus::Approved | RefundStatus::Processing => {
                        if let Some(row) = t.refund_mut(id) {
                            row.provider_refund_id = Some(provider_refund_id.to_string());
                        }
                        mark_refund_failed(t, id, message.to_string());
                        Ok(TransitionOutcome::Applied)
                    }
                }
            })
            .await;
        match &result {
            Ok(TransitionOutcome::Applied) => warn!(refund = %id, reason = message, "refund failed"),
            Ok(outcome) => info!(refund = %id, outcome = ?outcome, "refund failure skipped"),
            Err(e) => warn!(refund = %id, reason = %e, "refund failure rejected"),
        }
        result
    }

    async fn resolve(
        &self,
        provider_refund_id: &str,
        hint: Option<RefundId>,
    ) -> Result<(RefundId, SessionId), RefundError> {
        self.db
            .read(|t| -> Result<_, RefundError> {
                let refund = t
                    .refund_by_provider_id(provider_refund_id)
                    .or_else(|| hint.and_then(|id| t.refund(id)))
                    .ok_or_else(|| RefundError::UnknownProviderRefund(provider_refund_id.to_string()))?;
                let session = t
                    .booking(refund.booking_id)
                    .map(|b| b.session_id)
                    .ok_or(RefundError::BookingNotFound(refund.booking_id))?;
                Ok((refund.id, session))
            })
            .await?
    }
}

/// Captured amount not yet claimed by a completed or in-flight refund.
fn refundable_balance(t: &Tables, payment: crate::model::PaymentId, captured: Amount) -> Amount {
    let reserved: Amount = t
        .refunds_for_payment(payment)
        .filter(|r| r.status.reserves_balance())
        .map(|r| r.amount)
        .sum();
    captured.saturating_sub(reserved)
}

fn mark_refund_failed(t: &mut Tables, id: RefundId, message: String) {
    let Some(row) = t.refund_mut(id) else {
        return;
    };
    row.status = RefundStatus::Failed;
    row.attempts += 1;
    row.error_message = Some(message.clone());
    row.updated_at = Utc::now();
    let refs = EventRefs::refund(id, row.payment_id, row.booking_id);
    t.events
        .append(refs, PaymentEventKind::RefundFailed { message });
}

fn apply_completion(
    session: &mut Session,
    t: &mut Tables,
    id: RefundId,
    provider_refund_id: &str,
) -> Result<TransitionOutcome, RefundError> {
    let refund = t.refund(id).cloned().ok_or(RefundError::NotFound(id))?;
    match refund.status {
        RefundStatus::Completed => return Ok(TransitionOutcome::AlreadyApplied),
        RefundStatus::Approved | RefundStatus::Processing => {}
        status => {
            return Err(RefundError::InvalidState {
                refund: id,
                status,
                operation: "complete",
            });
        }
    }
    let payment = t
        .payment(refund.payment_id)
        .cloned()
        .ok_or(RefundError::PaymentNotFound(refund.booking_id))?;
    let booking = t
        .booking(refund.booking_id)
        .cloned()
        .ok_or(RefundError::BookingNotFound(refund.booking_id))?;

    let now = Utc::now();
    if let Some(row) = t.refund_mut(id) {
        row.status = RefundStatus::Completed;
        row.provider_refund_id = Some(provider_refund_id.to_string());
        row.error_message = None;
        row.updated_at = now;
    }
    let refs = EventRefs::refund(id, payment.id, booking.id);
    t.events.append(
        refs,
        PaymentEventKind::RefundCompleted {
            amount: refund.amount,
        },
    );

    let refunded: Amount = t
        .refunds_for_payment(payment.id)
        .filter(|r| r.status == RefundStatus::Completed)
        .map(|r| r.amount)
        .sum();
    let fully_refunded = refunded >= payment.amount;
    if let Some(row) = t.payment_mut(payment.id) {
        row.status = if fully_refunded {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        row.updated_at = now;
    }

    let closes_booking = fully_refunded && booking.status.holds_seats();
    if closes_booking {
        release_seats(session, booking.participant_count);
        set_booking_status(t, &booking, BookingStatus::Refunded, refs);
    }
    t.outbox.push(SideEffect::RefundConfirmationEmail {
        booking: booking.id,
        refund: id,
        email: booking.contact_email.clone(),
        amount: refund.amount,
    });
    t.outbox.push(SideEffect::CustomerStats {
        email: booking.contact_email,
        bookings_delta: if closes_booking { -1 } else { 0 },
        spend_delta: Amount::ZERO - refund.amount,
    });
    Ok(TransitionOutcome::Applied)
}
