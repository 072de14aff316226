//! Outbox for best-effort side effects.
//!
//! State transitions append [`SideEffect`]s inside the same transaction as
//! the state change. [`OutboxDispatcher`] drains them later through a
//! [`SideEffectHandler`]; a failing delivery is retried on its own without
//! touching the transition that produced it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::Amount;
use crate::error::{SideEffectError, StoreError};
use crate::model::{BookingId, PaymentId, RefundId, SessionId};
use crate::store::Database;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEffect {
    ConfirmationEmail {
        booking: BookingId,
        reference: String,
        email: String,
    },
    GenerateInvoice {
        booking: BookingId,
        payment: PaymentId,
        amount: Amount,
    },
    /// Adjust per-customer totals; deltas are negative for refunds.
    CustomerStats {
        email: String,
        bookings_delta: i32,
        spend_delta: Amount,
    },
    PaymentFailedNotice {
        booking: BookingId,
        email: String,
        reason: String,
    },
    RefundConfirmationEmail {
        booking: BookingId,
        refund: RefundId,
        email: String,
        amount: Amount,
    },
    DuplicateBookingAlert {
        session: SessionId,
        email: String,
    },
}

impl SideEffect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfirmationEmail { .. } => "confirmation_email",
            Self::GenerateInvoice { .. } => "generate_invoice",
            Self::CustomerStats { .. } => "customer_stats",
            Self::PaymentFailedNotice { .. } => "payment_failed_notice",
            Self::RefundConfirmationEmail { .. } => "refund_confirmation_email",
            Self::DuplicateBookingAlert { .. } => "duplicate_booking_alert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: u64,
    pub effect: SideEffect,
    pub state: DeliveryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set while in flight; a claim older than the lease is taken back.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the entry was delivered or dead-lettered.
    pub finished_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    fn is_finished(&self) -> bool {
        matches!(self.state, DeliveryState::Delivered | DeliveryState::DeadLetter)
    }
}

/// Entries are kept in id order; ids are never reused after a prune.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Vec<OutboxEntry>,
    next_id: u64,
}

/// At least `age` has passed between `since` and `now`.
fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, age: Duration) -> bool {
    (now - since).to_std().is_ok_and(|elapsed| elapsed >= age)
}

impl Outbox {
    pub fn push(&mut self, effect: SideEffect) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(OutboxEntry {
            id,
            effect,
            state: DeliveryState::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            claimed_at: None,
            finished_at: None,
        });
        id
    }

    /// Move every pending entry, and every in-flight entry whose lease ran
    /// out, to in-flight and return them. Concurrent drains never hold the
    /// same entry within one lease.
    fn claim_due(&mut self, now: DateTime<Utc>, lease: Duration) -> Vec<(u64, SideEffect)> {
        self.entries
            .iter_mut()
            .filter(|e| match (e.state, e.claimed_at) {
                (DeliveryState::Pending, _) => true,
                (DeliveryState::InFlight, Some(at)) => older_than(at, now, lease),
                (DeliveryState::InFlight, None) => true,
                _ => false,
            })
            .map(|e| {
                if e.state == DeliveryState::InFlight {
                    warn!(entry = e.id, effect = e.effect.name(), "reclaiming side effect with expired lease");
                }
                e.state = DeliveryState::InFlight;
                e.claimed_at = Some(now);
                (e.id, e.effect.clone())
            })
            .collect()
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut OutboxEntry> {
        let idx = self.entries.binary_search_by_key(&id, |e| e.id).ok()?;
        self.entries.get_mut(idx)
    }

    fn mark_delivered(&mut self, id: u64) {
        if let Some(entry) = self.entry_mut(id) {
            entry.attempts += 1;
            entry.state = DeliveryState::Delivered;
            entry.claimed_at = None;
            entry.finished_at = Some(Utc::now());
        }
    }

    fn mark_failed(&mut self, id: u64, message: String, max_attempts: u32) -> DeliveryState {
        let Some(entry) = self.entry_mut(id) else {
            return DeliveryState::DeadLetter;
        };
        entry.attempts += 1;
        entry.last_error = Some(message);
        entry.claimed_at = None;
        if entry.attempts >= max_attempts {
            entry.state = DeliveryState::DeadLetter;
            entry.finished_at = Some(Utc::now());
        } else {
            entry.state = DeliveryState::Pending;
        }
        entry.state
    }

    /// Hand in-flight entries back to the next drain.
    fn unclaim(&mut self, ids: &[u64]) {
        for &id in ids {
            if let Some(entry) = self.entry_mut(id) {
                if entry.state == DeliveryState::InFlight {
                    entry.state = DeliveryState::Pending;
                    entry.claimed_at = None;
                }
            }
        }
    }

    /// Drop delivered and dead-lettered entries finished at least
    /// `retention` before `now`. Returns how many were removed.
    fn prune_finished(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            !(e.is_finished() && e.finished_at.is_some_and(|at| older_than(at, now, retention)))
        });
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    pub fn count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.effect.name() == name)
            .count()
    }

    pub fn pending_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == DeliveryState::Pending)
            .count()
    }
}

/// Delivers side effects (email, invoicing, statistics, admin alerts).
#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    async fn handle(&self, effect: &SideEffect) -> Result<(), SideEffectError>;
}

/// Handler that records each effect in the log. Used where delivery
/// collaborators are not wired in, e.g. the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSideEffects;

#[async_trait]
impl SideEffectHandler for LoggingSideEffects {
    async fn handle(&self, effect: &SideEffect) -> Result<(), SideEffectError> {
        info!(effect = effect.name(), "side effect delivered");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub delivered: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Handled, but the result could not be written back; these are
    /// offered to the next drain again.
    pub unrecorded: usize,
    pub pruned: usize,
}

pub struct OutboxDispatcher<H> {
    db: Arc<Database>,
    handler: H,
    max_attempts: u32,
    lease: Duration,
    retention: Duration,
}

impl<H: SideEffectHandler> OutboxDispatcher<H> {
    pub fn new(db: Arc<Database>, handler: H, max_attempts: u32) -> Self {
        Self {
            db,
            handler,
            max_attempts: max_attempts.max(1),
            lease: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Deliver every due entry once.
    ///
    /// Only a failure to claim is an error. An entry whose outcome cannot be
    /// written back is handed back to the next drain, or reclaimed once its
    /// lease runs out if even that fails.
    pub async fn drain(&self) -> Result<DrainStats, StoreError> {
        let lease = self.lease;
        let claimed = self
            .db
            .transaction::<_, StoreError>(|t| Ok(t.outbox.claim_due(Utc::now(), lease)))
            .await?;

        let mut stats = DrainStats::default();
        let mut unrecorded = Vec::new();
        for (id, effect) in claimed {
            let result = self.handler.handle(&effect).await;
            let max_attempts = self.max_attempts;
            let marked = self
                .db
                .transaction::<_, StoreError>(|t| {
                    Ok(match result {
                        Ok(()) => {
                            t.outbox.mark_delivered(id);
                            DeliveryState::Delivered
                        }
                        Err(e) => t.outbox.mark_failed(id, e.to_string(), max_attempts),
                    })
                })
                .await;

            match marked {
                Ok(DeliveryState::Delivered) => stats.delivered += 1,
                Ok(DeliveryState::DeadLetter) => {
                    error!(entry = id, effect = effect.name(), "side effect abandoned after retries");
                    stats.dead_lettered += 1;
                }
                Ok(_) => {
                    warn!(entry = id, effect = effect.name(), "side effect failed, will retry");
                    stats.retrying += 1;
                }
                Err(e) => {
                    warn!(entry = id, effect = effect.name(), reason = %e, "side effect outcome not recorded");
                    unrecorded.push(id);
                }
            }
        }
        stats.unrecorded = unrecorded.len();

        let retention = self.retention;
        let housekeeping = self
            .db
            .transaction::<_, StoreError>(|t| {
                t.outbox.unclaim(&unrecorded);
                Ok(t.outbox.prune_finished(Utc::now(), retention))
            })
            .await;
        match housekeeping {
            Ok(pruned) => stats.pruned = pruned,
            Err(e) => {
                warn!(entries = unrecorded.len(), reason = %e, "outbox housekeeping skipped, leases will expire");
            }
        }
        Ok(stats)
    }

    /// Drain on a fixed interval until `shutdown` resolves.
    pub async fn run(&self, every: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(every);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        warn!(reason = %e, "outbox drain skipped");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Fails the first `failures` calls.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SideEffectHandler for Flaky {
        async fn handle(&self, effect: &SideEffect) -> Result<(), SideEffectError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(SideEffectError {
                    effect: effect.name(),
                    message: "smtp down".into(),
                });
            }
            Ok(())
        }
    }

    fn email() -> SideEffect {
        SideEffect::ConfirmationEmail {
            booking: Uuid::new_v4(),
            reference: "CB-1".into(),
            email: "a@example.com".into(),
        }
    }

    async fn db_with(effects: Vec<SideEffect>) -> Arc<Database> {
        let db = Arc::new(Database::new(Duration::from_millis(100)));
        db.transaction::<_, StoreError>(|t| {
            for e in effects {
                t.outbox.push(e);
            }
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn drain_delivers_pending_once() {
        let db = db_with(vec![email()]).await;
        let dispatcher = OutboxDispatcher::new(db.clone(), LoggingSideEffects, 3);

        let stats = dispatcher.drain().await.unwrap();
        assert_eq!(stats.delivered, 1);

        let stats = dispatcher.drain().await.unwrap();
        assert_eq!(stats, DrainStats::default());
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_independently() {
        let db = db_with(vec![email()]).await;
        let handler = Flaky {
            failures: 1,
            calls: AtomicU32::new(0),
        };
        let dispatcher = OutboxDispatcher::new(db.clone(), handler, 3);

        assert_eq!(dispatcher.drain().await.unwrap().retrying, 1);
        assert_eq!(dispatcher.drain().await.unwrap().delivered, 1);

        let entry = db.read(|t| t.outbox.entries()[0].clone()).await.unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.state, DeliveryState::Delivered);
        assert_eq!(entry.last_error.as_deref(), Some("confirmation_email failed: smtp down"));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let db = db_with(vec![email()]).await;
        let handler = Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let dispatcher = OutboxDispatcher::new(db.clone(), handler, 2);

        dispatcher.drain().await.unwrap();
        let stats = dispatcher.drain().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(db.read(|t| t.outbox.pending_len()).await.unwrap(), 0);
    }

    /// Holds the tables lock past the store timeout while handling the
    /// first effect, so recording that outcome fails.
    struct Contending {
        db: Arc<Database>,
        hold: Duration,
        contended: AtomicU32,
    }

    #[async_trait]
    impl SideEffectHandler for Contending {
        async fn handle(&self, _effect: &SideEffect) -> Result<(), SideEffectError> {
            if self.contended.fetch_add(1, Ordering::SeqCst) == 0 {
                let (held, acquired) = tokio::sync::oneshot::channel();
                let db = self.db.clone();
                let hold = self.hold;
                tokio::spawn(async move {
                    let _tables = db.hold_tables().await;
                    let _ = held.send(());
                    tokio::time::sleep(hold).await;
                });
                let _ = acquired.await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn unrecorded_outcome_does_not_strand_entries() {
        let db = db_with(vec![email(), email()]).await;
        let handler = Contending {
            db: db.clone(),
            hold: Duration::from_millis(150),
            contended: AtomicU32::new(0),
        };
        let dispatcher = OutboxDispatcher::new(db.clone(), handler, 3);

        let first = dispatcher.drain().await.unwrap();
        assert_eq!(first.unrecorded, 1);
        assert_eq!(first.delivered, 1);

        let second = dispatcher.drain().await.unwrap();
        assert_eq!(second.delivered, 1);

        let states = db
            .read(|t| t.outbox.entries().iter().map(|e| e.state).collect::<Vec<_>>())
            .await
            .unwrap();
        assert_eq!(states, vec![DeliveryState::Delivered, DeliveryState::Delivered]);
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let mut outbox = Outbox::default();
        outbox.push(email());
        let lease = Duration::from_secs(60);
        let now = Utc::now();

        assert_eq!(outbox.claim_due(now, lease).len(), 1);
        // still leased
        assert!(outbox.claim_due(now + chrono::Duration::seconds(30), lease).is_empty());
        let reclaimed = outbox.claim_due(now + chrono::Duration::seconds(61), lease);
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(outbox.entries()[0].state, DeliveryState::InFlight);
    }

    #[test]
    fn prune_drops_only_old_finished_entries() {
        let mut outbox = Outbox::default();
        let delivered = outbox.push(email());
        let dead = outbox.push(email());
        let pending = outbox.push(email());
        outbox.mark_delivered(delivered);
        outbox.mark_failed(dead, "bounced".into(), 1);

        let retention = Duration::from_secs(3600);
        assert_eq!(outbox.prune_finished(Utc::now(), retention), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(outbox.prune_finished(later, retention), 2);

        assert_eq!(outbox.entries().len(), 1);
        assert_eq!(outbox.entries()[0].id, pending);
        // ids keep counting after a prune
        assert_eq!(outbox.push(email()), pending + 1);
        outbox.mark_delivered(pending + 1);
        assert_eq!(outbox.entries()[1].state, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let db = db_with(vec![email()]).await;
        let dispatcher = OutboxDispatcher::new(db.clone(), LoggingSideEffects, 3);
        dispatcher
            .run(Duration::from_millis(5), tokio::time::sleep(Duration::from_millis(30)))
            .await;
        let state = db.read(|t| t.outbox.entries()[0].state).await.unwrap();
        assert_eq!(state, DeliveryState::Delivered);
    }
}
