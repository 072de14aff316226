use std::sync::Arc;

use chrono::{Duration, Utc};
use coursebook::booking::{BookingCreated, BookingRequest};
use coursebook::error::{BookingError, ErrorCode, RefundError, StoreError, WebhookError};
use coursebook::gateway::simulated::SimulatedProvider;
use coursebook::model::{Participant, Refund, RefundReason};
use coursebook::webhook::{EventEnvelope, WebhookOutcome};
use coursebook::{
    Amount, BookingStatus, Config, PaymentStatus, Platform, RefundStatus, Session, SessionId,
    SessionStatus,
};

fn platform() -> Arc<Platform> {
    Arc::new(Platform::new(
        Config::default(),
        Arc::new(SimulatedProvider::new()),
    ))
}

async fn session(platform: &Platform, price: i64, max: u32, taken: u32) -> SessionId {
    let mut session = Session::published(
        "Emergency First Aid at Work",
        Amount::from_major(price),
        max,
        Utc::now() + Duration::days(10),
    );
    session.current_capacity = taken;
    session.recompute_status();
    platform.db().insert_session(session).await.unwrap()
}

fn request(session: SessionId, email: &str, seats: u32, total: Amount) -> BookingRequest {
    BookingRequest {
        session_id: session,
        participants: (1..=seats)
            .map(|i| Participant {
                name: format!("Delegate {i}"),
                email: None,
            })
            .collect(),
        contact_email: email.to_string(),
        total_amount: total,
        special_requirements: None,
    }
}

/// Book and pay through the provider, confirming via webhook.
async fn paid_booking(platform: &Platform, session: SessionId, email: &str, seats: u32) -> BookingCreated {
    let price = platform.db().session(session).await.unwrap().price;
    let created = platform
        .bookings()
        .create_booking(request(session, email, seats, price.times(seats)))
        .await
        .unwrap();
    let details = platform.gateway().confirm(&created.intent_id).await.unwrap();
    assert!(details.succeeded());

    let envelope = EventEnvelope::for_intent(
        format!("evt_pay_{}", created.reference),
        "payment.succeeded",
        &created.intent_id,
        created.amount.to_minor_units(),
        created.booking_id,
        details.charge_id.as_deref(),
        None,
    );
    let ack = platform.deliver(&envelope).await.unwrap();
    assert_eq!(ack.outcome, WebhookOutcome::Processed);
    created
}

/// Request, approve and settle a refund through its webhook.
async fn settled_refund(platform: &Platform, booking: &BookingCreated, amount: Amount) -> Refund {
    let refund = platform
        .refunds()
        .create(booking.booking_id, Some(amount), RefundReason::RequestedByCustomer)
        .await
        .unwrap();
    let refund = platform.refunds().approve(refund.id, "ops@example.com").await.unwrap();
    assert_eq!(refund.status, RefundStatus::Processing);

    let provider_id = refund.provider_refund_id.clone().unwrap();
    let settled = platform
        .provider()
        .settle_refund(&provider_id, true)
        .await
        .unwrap();
    let envelope = EventEnvelope::for_refund(
        format!("evt_refund_{provider_id}"),
        "refund.succeeded",
        &provider_id,
        settled.amount_minor,
        refund.id,
        None,
    );
    platform.deliver(&envelope).await.unwrap();
    platform.refunds().refund(refund.id).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_reservations_never_overbook() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;

    let mut handles = Vec::new();
    for i in 0..40u32 {
        let ledger = platform.ledger().clone();
        handles.push(tokio::spawn(async move {
            let seats = i % 3 + 1;
            let reservation = ledger.reserve(session, seats).await.unwrap();
            if reservation.ok { seats } else { 0 }
        }));
    }
    let mut granted = 0;
    for handle in handles {
        granted += handle.await.unwrap();
    }

    let session = platform.db().session(session).await.unwrap();
    assert!(session.current_capacity <= session.max_capacity);
    assert_eq!(session.current_capacity, granted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_requests_for_the_last_two_seats() {
    let platform = platform();
    let session = session(&platform, 75, 12, 10).await;

    let mut handles = Vec::new();
    for email in ["first@example.com", "second@example.com"] {
        let platform = platform.clone();
        handles.push(tokio::spawn(async move {
            platform
                .bookings()
                .create_booking(request(session, email, 2, Amount::from_major(150)))
                .await
        }));
    }
    let mut ok = 0;
    let mut codes = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => codes.push(e.code()),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(codes, vec![ErrorCode::CapacityUnavailable]);
    let session = platform.db().session(session).await.unwrap();
    assert_eq!(session.available_spots(), 0);
    assert_eq!(session.status, SessionStatus::Full);
}

#[tokio::test]
async fn price_mismatch_reports_expected_amount() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;

    let err = platform
        .bookings()
        .create_booking(request(session, "ana@example.com", 2, Amount::from_major(140)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationFailed);
    assert!(err.to_string().contains("expected amount 150.00"));
}

#[tokio::test]
async fn price_tolerance_is_one_penny() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;

    let close: Amount = "150.01".parse().unwrap();
    platform
        .bookings()
        .create_booking(request(session, "near@example.com", 2, close))
        .await
        .unwrap();

    let off: Amount = "150.02".parse().unwrap();
    let err = platform
        .bookings()
        .create_booking(request(session, "far@example.com", 2, off))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation(_)));
}

#[tokio::test]
async fn same_event_delivered_twice_applies_once() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;
    let created = platform
        .bookings()
        .create_booking(request(session, "ana@example.com", 2, Amount::from_major(150)))
        .await
        .unwrap();

    let envelope = EventEnvelope::for_intent(
        "evt_123",
        "payment.succeeded",
        &created.intent_id,
        15_000,
        created.booking_id,
        Some("ch_123"),
        None,
    );
    let first = platform.deliver(&envelope).await.unwrap();
    let second = platform.deliver(&envelope).await.unwrap();

    assert!(first.received && second.received);
    assert_eq!(first.outcome, WebhookOutcome::Processed);
    assert_eq!(second.outcome, WebhookOutcome::Duplicate);

    let booking = platform.bookings().booking(created.booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    let payment = platform
        .payments()
        .payment_for_booking(created.booking_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    let (emails, invoices, changes) = platform
        .db()
        .read(|t| {
            (
                t.outbox.count("confirmation_email"),
                t.outbox.count("generate_invoice"),
                t.events.count_of("payment_succeeded"),
            )
        })
        .await
        .unwrap();
    assert_eq!((emails, invoices, changes), (1, 1, 1));
}

#[tokio::test]
async fn forged_webhook_is_rejected_before_storage() {
    let platform = platform();
    let envelope = EventEnvelope::for_intent(
        "evt_forged",
        "payment.succeeded",
        "pi_forged",
        15_000,
        uuid::Uuid::new_v4(),
        None,
        None,
    );
    let delivery = platform.sign(&envelope).unwrap();
    let tampered = delivery.payload.replace("15000", "1");

    let err = platform
        .webhooks()
        .ingest(&tampered, &delivery.signature)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature(_)));
    assert_eq!(err.code(), ErrorCode::InvalidSignature);
    let stored = platform
        .db()
        .read(|t| t.webhook_events().count())
        .await
        .unwrap();
    assert_eq!(stored, 0);
}

#[tokio::test]
async fn refund_beyond_completed_refunds_is_rejected() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;
    let booking = paid_booking(&platform, session, "ana@example.com", 1).await;

    let first = settled_refund(&platform, &booking, Amount::from_major(75)).await;
    assert_eq!(first.status, RefundStatus::Completed);

    let err = platform
        .refunds()
        .create(booking.booking_id, Some(Amount::from_major(50)), RefundReason::RequestedByCustomer)
        .await
        .unwrap_err();
    assert!(matches!(err, RefundError::ExceedsRefundableBalance { .. }));
    assert_eq!(err.code(), ErrorCode::RefundRejected);
    assert!(err.to_string().contains("exceeds refundable balance"));
}

#[tokio::test]
async fn full_refund_restores_capacity() {
    let platform = platform();
    let session = session(&platform, 75, 12, 4).await;
    let booking = paid_booking(&platform, session, "ana@example.com", 3).await;
    assert_eq!(platform.db().session(session).await.unwrap().current_capacity, 7);

    settled_refund(&platform, &booking, Amount::from_major(225)).await;

    assert_eq!(platform.db().session(session).await.unwrap().current_capacity, 4);
    let booking = platform.bookings().booking(booking.booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Refunded);
    let payment = platform
        .payments()
        .payment_for_booking(booking.id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn partial_refund_keeps_seats() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;
    let booking = paid_booking(&platform, session, "ana@example.com", 2).await;

    settled_refund(&platform, &booking, Amount::from_major(75)).await;

    assert_eq!(platform.db().session(session).await.unwrap().current_capacity, 2);
    let payment = platform
        .payments()
        .payment_for_booking(booking.booking_id)
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::PartiallyRefunded);
    let booking = platform.bookings().booking(booking.booking_id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn recompute_corrects_drift() {
    let platform = platform();
    let session = session(&platform, 75, 12, 0).await;
    paid_booking(&platform, session, "ana@example.com", 2).await;

    platform
        .db()
        .with_session_lock::<_, StoreError>(session, |s| {
            s.current_capacity = 9;
            Ok(())
        })
        .await
        .unwrap();

    let drift = platform.ledger().recompute(session).await.unwrap().unwrap();
    assert_eq!((drift.recorded, drift.actual), (9, 2));
    assert_eq!(platform.db().session(session).await.unwrap().current_capacity, 2);
    assert!(platform.ledger().recompute(session).await.unwrap().is_none());
}

#[tokio::test]
async fn reconciliation_after_refunds() {
    let platform = platform();
    let start = Utc::now() - Duration::seconds(1);
    let session = session(&platform, 75, 12, 0).await;
    let a = paid_booking(&platform, session, "a@example.com", 2).await;
    paid_booking(&platform, session, "b@example.com", 1).await;
    settled_refund(&platform, &a, Amount::from_major(50)).await;

    let report = coursebook::reconciliation::report(platform.db(), start, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.payments_count, 2);
    assert_eq!(report.payments_amount, Amount::from_major(225));
    assert_eq!(report.refunds_amount, Amount::from_major(50));
    assert_eq!(report.net_amount, Amount::from_major(175));
    assert!(report.is_consistent());
}
