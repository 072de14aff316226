//! Capacity ledger.
//!
//! Owns `Session::current_capacity` and `Session::status`. Every change runs
//! under the session's row lock so concurrent reservations are serialized:
//! the second caller always observes the first caller's committed count.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{LedgerError, StoreError};
use crate::model::{Session, SessionId};
use crate::store::{Database, Tables};

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub ok: bool,
    /// Spots left after the attempt (unchanged when `ok` is false).
    pub available_spots: u32,
}

/// Counter mismatch found and corrected by [`CapacityLedger::recompute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drift {
    pub session: SessionId,
    pub recorded: u32,
    /// Seats held by live bookings.
    pub actual: u32,
    /// Live bookings hold more seats than the session has. The counter is
    /// pinned at `max_capacity` and the session needs an operator.
    pub overbooked: bool,
}

/// Reserve `count` seats on a locked session row. Writes nothing when the
/// seats are not available.
pub(crate) fn reserve_seats(session: &mut Session, count: u32) -> Reservation {
    let available = session.available_spots();
    if count > available {
        return Reservation {
            ok: false,
            available_spots: available,
        };
    }
    session.current_capacity += count;
    session.recompute_status();
    Reservation {
        ok: true,
        available_spots: session.available_spots(),
    }
}

/// Release `count` seats on a locked session row, flooring at zero.
/// Returns the number of seats actually released.
pub(crate) fn release_seats(session: &mut Session, count: u32) -> u32 {
    let released = count.min(session.current_capacity);
    if released < count {
        warn!(
            session = %session.id,
            requested = count,
            held = session.current_capacity,
            "release larger than held capacity, flooring at zero"
        );
    }
    session.current_capacity -= released;
    session.recompute_status();
    released
}

/// Seats held by bookings that are still live.
pub(crate) fn held_seats(tables: &Tables, session: SessionId) -> u32 {
    tables
        .bookings_for_session(session)
        .filter(|b| b.status.holds_seats())
        .map(|b| b.participant_count)
        .sum()
}

/// Retry `op` while it fails with a lock conflict, doubling the backoff.
pub(crate) async fn retry_on_conflict<T, E, F, Fut>(
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: AsConflict,
{
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "lock conflict, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Errors that may signal lock contention.
pub(crate) trait AsConflict {
    fn is_conflict(&self) -> bool;
}

impl AsConflict for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

pub struct CapacityLedger {
    db: Arc<Database>,
    max_attempts: u32,
    backoff: Duration,
}

impl CapacityLedger {
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        Self {
            db,
            max_attempts: config.reserve_max_attempts.max(1),
            backoff: config.reserve_backoff,
        }
    }

    /// Read-only availability; reserves nothing.
    pub async fn availability(&self, session: SessionId) -> Result<u32, StoreError> {
        Ok(self.db.session(session).await?.available_spots())
    }

    /// Single locked attempt to reserve `count` seats.
    pub async fn reserve(&self, session: SessionId, count: u32) -> Result<Reservation, StoreError> {
        let reservation = self
            .db
            .with_session_lock::<_, StoreError>(session, |s| Ok(reserve_seats(s, count)))
            .await?;
        if reservation.ok {
            info!(session = %session, count, available = reservation.available_spots, "seats reserved");
        } else {
            info!(session = %session, count, available = reservation.available_spots, "reservation refused");
        }
        Ok(reservation)
    }

    /// [`reserve`](Self::reserve) with bounded retries on lock timeouts.
    pub async fn reserve_with_retry(
        &self,
        session: SessionId,
        count: u32,
    ) -> Result<Reservation, LedgerError> {
        retry_on_conflict(self.max_attempts, self.backoff, || self.reserve(session, count))
            .await
            .map_err(|e| self.exhausted(session, e))
    }

    /// Release `count` seats; always permitted, floors at zero and reopens a
    /// full session.
    pub async fn release(&self, session: SessionId, count: u32) -> Result<u32, LedgerError> {
        let released = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db
                .with_session_lock::<_, StoreError>(session, |s| Ok(release_seats(s, count)))
        })
        .await
        .map_err(|e| self.exhausted(session, e))?;
        info!(session = %session, released, "seats released");
        Ok(released)
    }

    /// Rebuild the session counter from live bookings under the row lock.
    ///
    /// The counter never goes above `max_capacity`; an overbooked session
    /// is reported with [`Drift::overbooked`] on every pass until resolved.
    pub async fn recompute(&self, session: SessionId) -> Result<Option<Drift>, LedgerError> {
        let drift = retry_on_conflict(self.max_attempts, self.backoff, || {
            self.db
                .transaction_with_session::<_, StoreError>(session, |s, tables| {
                    let actual = held_seats(tables, session);
                    let recorded = s.current_capacity;
                    let overbooked = actual > s.max_capacity;
                    s.current_capacity = actual.min(s.max_capacity);
                    s.recompute_status();
                    Ok((recorded != actual).then_some(Drift {
                        session,
                        recorded,
                        actual,
                        overbooked,
                    }))
                })
        })
        .await
        .map_err(|e| self.exhausted(session, e))?;

        match &drift {
            Some(d) if d.overbooked => error!(
                session = %d.session,
                recorded = d.recorded,
                held = d.actual,
                "live bookings exceed session capacity, needs review"
            ),
            Some(d) => warn!(
                session = %d.session,
                recorded = d.recorded,
                actual = d.actual,
                "capacity drift corrected"
            ),
            None => {}
        }
        Ok(drift)
    }

    /// Recompute every session, returning the corrections made.
    pub async fn recompute_all(&self) -> Result<Vec<Drift>, LedgerError> {
        let mut drifts = Vec::new();
        for session in self.db.session_ids().await {
            if let Some(d) = self.recompute(session).await? {
                drifts.push(d);
            }
        }
        Ok(drifts)
    }

    fn exhausted(&self, session: SessionId, e: StoreError) -> LedgerError {
        if e.is_conflict() {
            LedgerError::RetriesExhausted {
                session,
                attempts: self.max_attempts,
            }
        } else {
            LedgerError::Store(e)
        }
    }
}
