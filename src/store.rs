//! Transactional in-process store.
//!
//! Sessions live in individually lockable rows so reservations on different
//! sessions never contend. Everything else lives in a single [`Tables`] set
//! guarded by one lock. Changes that cross both always lock the session row
//! first and the tables second.
//!
//! All closures run synchronously while the lock is held, so no provider
//! call can be awaited under a lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::error::StoreError;
use crate::events::EventLog;
use crate::model::{
    Booking, BookingId, Payment, PaymentId, Refund, RefundId, Session, SessionId,
    WebhookEventRecord,
};
use crate::outbox::Outbox;

/// Result of an insert-if-absent on the webhook event table.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted,
    /// The id was already present; carries the stored record.
    Existing(WebhookEventRecord),
}

/// Non-session tables.
#[derive(Debug, Default)]
pub struct Tables {
    bookings: HashMap<BookingId, Booking>,
    references: HashSet<String>,
    payments: HashMap<PaymentId, Payment>,
    payments_by_intent: HashMap<String, PaymentId>,
    refunds: HashMap<RefundId, Refund>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    pub events: EventLog,
    pub outbox: Outbox,
}

impl Tables {
    pub fn insert_booking(&mut self, booking: Booking) -> Result<(), StoreError> {
        if self.bookings.contains_key(&booking.id) {
            return Err(StoreError::DuplicateKey {
                table: "bookings",
                key: booking.id.to_string(),
            });
        }
        if !self.references.insert(booking.reference.clone()) {
            return Err(StoreError::DuplicateKey {
                table: "bookings",
                key: booking.reference,
            });
        }
        self.bookings.insert(booking.id, booking);
        Ok(())
    }

    pub fn reference_taken(&self, reference: &str) -> bool {
        self.references.contains(reference)
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.get(&id)
    }

    pub fn booking_mut(&mut self, id: BookingId) -> Option<&mut Booking> {
        self.bookings.get_mut(&id)
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> + '_ {
        self.bookings.values()
    }

    pub fn bookings_for_session(
        &self,
        session: SessionId,
    ) -> impl Iterator<Item = &Booking> + '_ {
        self.bookings
            .values()
            .filter(move |b| b.session_id == session)
    }

    pub fn insert_payment(&mut self, payment: Payment) -> Result<(), StoreError> {
        if self
            .payments_by_intent
            .contains_key(&payment.external_intent_id)
        {
            return Err(StoreError::DuplicateKey {
                table: "payments",
                key: payment.external_intent_id,
            });
        }
        self.payments_by_intent
            .insert(payment.external_intent_id.clone(), payment.id);
        self.payments.insert(payment.id, payment);
        Ok(())
    }

    pub fn payment(&self, id: PaymentId) -> Option<&Payment> {
        self.payments.get(&id)
    }

    pub fn payment_mut(&mut self, id: PaymentId) -> Option<&mut Payment> {
        self.payments.get_mut(&id)
    }

    pub fn payment_by_intent(&self, intent_id: &str) -> Option<&Payment> {
        self.payments_by_intent
            .get(intent_id)
            .and_then(|id| self.payments.get(id))
    }

    /// Most recent payment attempt for a booking.
    pub fn payment_for_booking(&self, booking: BookingId) -> Option<&Payment> {
        self.payments
            .values()
            .filter(|p| p.booking_id == booking)
            .max_by_key(|p| p.created_at)
    }

    pub fn payments(&self) -> impl Iterator<Item = &Payment> + '_ {
        self.payments.values()
    }

    pub fn insert_refund(&mut self, refund: Refund) -> Result<(), StoreError> {
        if self.refunds.contains_key(&refund.id) {
            return Err(StoreError::DuplicateKey {
                table: "refunds",
                key: refund.id.to_string(),
            });
        }
        self.refunds.insert(refund.id, refund);
        Ok(())
    }

    pub fn refund(&self, id: RefundId) -> Option<&Refund> {
        self.refunds.get(&id)
    }

    pub fn refund_mut(&mut self, id: RefundId) -> Option<&mut Refund> {
        self.refunds.get_mut(&id)
    }

    pub fn refund_by_provider_id(&self, provider_refund_id: &str) -> Option<&Refund> {
        self.refunds
            .values()
            .find(|r| r.provider_refund_id.as_deref() == Some(provider_refund_id))
    }

    pub fn refunds_for_payment(
        &self,
        payment: PaymentId,
    ) -> impl Iterator<Item = &Refund> + '_ {
        self.refunds
            .values()
            .filter(move |r| r.payment_id == payment)
    }

    pub fn refunds(&self) -> impl Iterator<Item = &Refund> + '_ {
        self.refunds.values()
    }

    /// Insert-if-absent keyed by the provider's event id. Exactly one caller
    /// observes `Inserted` for a given id.
    pub fn insert_webhook_event(&mut self, record: WebhookEventRecord) -> InsertOutcome {
        match self.webhook_events.get(&record.external_event_id) {
            Some(existing) => InsertOutcome::Existing(existing.clone()),
            None => {
                self.webhook_events
                    .insert(record.external_event_id.clone(), record);
                InsertOutcome::Inserted
            }
        }
    }

    pub fn webhook_event(&self, event_id: &str) -> Option<&WebhookEventRecord> {
        self.webhook_events.get(event_id)
    }

    pub fn webhook_event_mut(&mut self, event_id: &str) -> Option<&mut WebhookEventRecord> {
        self.webhook_events.get_mut(event_id)
    }

    pub fn webhook_events(&self) -> impl Iterator<Item = &WebhookEventRecord> + '_ {
        self.webhook_events.values()
    }
}

/// The shared store handed to every service.
pub struct Database {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    tables: Mutex<Tables>,
    lock_timeout: Duration,
}

impl Database {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            tables: Mutex::new(Tables::default()),
            lock_timeout,
        }
    }

    pub async fn insert_session(&self, session: Session) -> Result<SessionId, StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::DuplicateKey {
                table: "sessions",
                key: session.id.to_string(),
            });
        }
        let id = session.id;
        sessions.insert(id, Arc::new(Mutex::new(session)));
        Ok(id)
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Snapshot of a session row.
    pub async fn session(&self, id: SessionId) -> Result<Session, StoreError> {
        let row = self.session_row(id).await?;
        let guard = self.acquire(&row, LockTarget::Session(id)).await?;
        Ok(guard.clone())
    }

    /// Run `f` with the session row exclusively locked. The row is written
    /// back only if `f` succeeds.
    pub async fn with_session_lock<R, E>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let row = self.session_row(id).await?;
        let mut guard = self.acquire(&row, LockTarget::Session(id)).await?;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        *guard = draft;
        Ok(out)
    }

    /// Run `f` over the non-session tables. Closures check every
    /// precondition before writing so an `Err` leaves the tables untouched.
    pub async fn transaction<R, E>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let mut tables = self.acquire(&self.tables, LockTarget::Tables).await?;
        f(&mut tables)
    }

    /// Lock the session row, then the tables. The session row is written
    /// back only if `f` succeeds.
    pub async fn transaction_with_session<R, E>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session, &mut Tables) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let row = self.session_row(id).await?;
        let mut session = self.acquire(&row, LockTarget::Session(id)).await?;
        let mut tables = self.acquire(&self.tables, LockTarget::Tables).await?;
        let mut draft = session.clone();
        let out = f(&mut draft, &mut tables)?;
        *session = draft;
        Ok(out)
    }

    /// Read-only access to the tables.
    pub async fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        let tables = self.acquire(&self.tables, LockTarget::Tables).await?;
        Ok(f(&tables))
    }

    async fn session_row(&self, id: SessionId) -> Result<Arc<Mutex<Session>>, StoreError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(id))
    }

    async fn acquire<'a, T>(
        &self,
        lock: &'a Mutex<T>,
        target: LockTarget,
    ) -> Result<MutexGuard<'a, T>, StoreError> {
        match tokio::time::timeout(self.lock_timeout, lock.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!(%target, timeout_ms = self.lock_timeout.as_millis() as u64, "lock wait timed out");
                Err(StoreError::LockTimeout(target.to_string()))
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn hold_session(&self, id: SessionId) -> tokio::sync::OwnedMutexGuard<Session> {
        let row = self.session_row(id).await.unwrap();
        row.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) async fn hold_tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().await
    }
}

#[derive(Debug, Clone, Copy)]
enum LockTarget {
    Session(SessionId),
    Tables,
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session {id}"),
            Self::Tables => f.write_str("booking tables"),
        }
    }
}
