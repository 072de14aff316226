//! Read-only reconciliation totals over a date range.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::Amount;
use crate::error::StoreError;
use crate::events::PaymentEventKind;
use crate::model::{PaymentId, RefundId, RefundStatus};
use crate::store::{Database, Tables};

/// Aggregated money movement for `[start, end)`.
///
/// Payments count when captured (including ones refunded later); refunds
/// count once completed. Both are selected by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub payments_count: usize,
    pub payments_amount: Amount,
    pub refunds_count: usize,
    pub refunds_amount: Amount,
    pub net_amount: Amount,
    /// Captured payments with no `payment_succeeded` entry in the event log.
    #[serde(skip)]
    pub unlogged_payments: Vec<PaymentId>,
    /// Completed refunds with no matching `refund_completed` entry.
    #[serde(skip)]
    pub unlogged_refunds: Vec<RefundId>,
}

impl ReconciliationReport {
    /// Rows and the audit log agree.
    pub fn is_consistent(&self) -> bool {
        self.unlogged_payments.is_empty() && self.unlogged_refunds.is_empty()
    }
}

pub async fn report(
    db: &Database,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<ReconciliationReport, StoreError> {
    let report = db.read(|t| build(t, start, end)).await?;
    if !report.is_consistent() {
        warn!(
            payments = report.unlogged_payments.len(),
            refunds = report.unlogged_refunds.len(),
            "rows missing from the payment event log"
        );
    }
    Ok(report)
}

fn build(t: &Tables, start: DateTime<Utc>, end: DateTime<Utc>) -> ReconciliationReport {
    let in_range = |at: DateTime<Utc>| start <= at && at < end;
    let log = t.events.entries();

    let payments: Vec<_> = t
        .payments()
        .filter(|p| p.status.is_captured() && in_range(p.created_at))
        .collect();
    let refunds: Vec<_> = t
        .refunds()
        .filter(|r| r.status == RefundStatus::Completed && in_range(r.created_at))
        .collect();

    let unlogged_payments = payments
        .iter()
        .filter(|p| {
            !log.iter().any(|e| {
                e.refs.payment == Some(p.id)
                    && matches!(e.kind, PaymentEventKind::PaymentSucceeded { .. })
            })
        })
        .map(|p| p.id)
        .collect();
    let unlogged_refunds = refunds
        .iter()
        .filter(|r| {
            !log.iter().any(|e| {
                e.refs.refund == Some(r.id)
                    && matches!(e.kind, PaymentEventKind::RefundCompleted { amount } if amount == r.amount)
            })
        })
        .map(|r| r.id)
        .collect();

    let payments_amount: Amount = payments.iter().map(|p| p.amount).sum();
    let refunds_amount: Amount = refunds.iter().map(|r| r.amount).sum();
    ReconciliationReport {
        start,
        end,
        payments_count: payments.len(),
        payments_amount,
        refunds_count: refunds.len(),
        refunds_amount,
        net_amount: payments_amount - refunds_amount,
        unlogged_payments,
        unlogged_refunds,
    }
}
