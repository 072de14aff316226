//! Booking validator.
//!
//! Runs the capacity, price, duplicate and session-status checks
//! concurrently and merges them into one [`ValidationReport`]. The capacity
//! check is a read-only pre-check; the authoritative reservation happens
//! later, inside booking creation's transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::Amount;
use crate::booking::BookingRequest;
use crate::config::Config;
use crate::error::{NotBookableReason, StoreError, ValidationError, ValidationWarning};
use crate::ledger::CapacityLedger;
use crate::model::Session;
use crate::outbox::SideEffect;
use crate::store::Database;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    fn new(errors: Vec<ValidationError>, warnings: Vec<ValidationWarning>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

pub struct BookingValidator {
    db: Arc<Database>,
    ledger: Arc<CapacityLedger>,
    large_group_threshold: u32,
    low_availability_threshold: u32,
    price_tolerance: Amount,
}

impl BookingValidator {
    pub fn new(db: Arc<Database>, ledger: Arc<CapacityLedger>, config: &Config) -> Self {
        Self {
            db,
            ledger,
            large_group_threshold: config.large_group_threshold,
            low_availability_threshold: config.low_availability_threshold,
            price_tolerance: config.price_tolerance,
        }
    }

    /// Never fails: internal problems become a single generic error.
    pub async fn validate(&self, request: &BookingRequest) -> ValidationReport {
        match self.run_checks(request).await {
            Ok(report) => report,
            Err(e) => {
                error!(session = %request.session_id, reason = %e, "booking validation failed internally");
                ValidationReport::new(vec![ValidationError::Internal], Vec::new())
            }
        }
    }

    async fn run_checks(&self, request: &BookingRequest) -> Result<ValidationReport, StoreError> {
        let mut errors = input_errors(request);
        let mut warnings = Vec::new();
        let count = request.participant_count();

        let session = match self.db.session(request.session_id).await {
            Ok(session) => session,
            Err(StoreError::SessionNotFound(id)) => {
                errors.push(ValidationError::SessionNotFound(id));
                return Ok(ValidationReport::new(errors, warnings));
            }
            Err(e) => return Err(e),
        };

        let (capacity, price, duplicate, status) = tokio::join!(
            self.check_capacity(&session, count),
            async { self.check_price(&session, count, request.total_amount) },
            self.check_duplicate(&session, &request.contact_email),
            async { check_status(&session, Utc::now()) },
        );

        let (capacity_error, capacity_warning) = capacity?;
        errors.extend(capacity_error);
        warnings.extend(capacity_warning);
        errors.extend(price);
        errors.extend(duplicate?);
        errors.extend(status);

        if count > self.large_group_threshold {
            warnings.push(ValidationWarning::LargeGroup {
                count,
                threshold: self.large_group_threshold,
            });
        }
        Ok(ValidationReport::new(errors, warnings))
    }

    async fn check_capacity(
        &self,
        session: &Session,
        count: u32,
    ) -> Result<(Option<ValidationError>, Option<ValidationWarning>), StoreError> {
        let available = self.ledger.availability(session.id).await?;
        if count > available {
            return Ok((
                Some(ValidationError::InsufficientCapacity {
                    requested: count,
                    available,
                }),
                None,
            ));
        }
        let warning = (available <= self.low_availability_threshold)
            .then_some(ValidationWarning::LowAvailability { available });
        Ok((None, warning))
    }

    fn check_price(&self, session: &Session, count: u32, submitted: Amount) -> Option<ValidationError> {
        let expected = session.price.times(count);
        (submitted.abs_diff(expected) > self.price_tolerance)
            .then_some(ValidationError::PriceMismatch { submitted, expected })
    }

    /// An email may hold one live booking per session. A hit also raises an
    /// admin alert; failing to queue the alert does not change the verdict.
    async fn check_duplicate(
        &self,
        session: &Session,
        email: &str,
    ) -> Result<Option<ValidationError>, StoreError> {
        let email = email.trim();
        let duplicate = self
            .db
            .read(|t| {
                t.bookings_for_session(session.id).any(|b| {
                    b.status.holds_seats() && b.contact_email.eq_ignore_ascii_case(email)
                })
            })
            .await?;
        if !duplicate {
            return Ok(None);
        }

        let alert = SideEffect::DuplicateBookingAlert {
            session: session.id,
            email: email.to_string(),
        };
        if let Err(e) = self
            .db
            .transaction::<_, StoreError>(|t| {
                t.outbox.push(alert);
                Ok(())
            })
            .await
        {
            warn!(session = %session.id, reason = %e, "duplicate booking alert not queued");
        }
        Ok(Some(ValidationError::DuplicateBooking {
            email: email.to_string(),
        }))
    }
}

fn check_status(session: &Session, now: DateTime<Utc>) -> Option<ValidationError> {
    let reason = NotBookableReason::from_status(session.status)
        .or_else(|| session.has_started(now).then_some(NotBookableReason::Started))?;
    Some(ValidationError::SessionNotBookable(reason))
}

fn input_errors(request: &BookingRequest) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if request.participants.is_empty() {
        errors.push(ValidationError::InvalidParticipantCount(0));
    }
    for (idx, participant) in request.participants.iter().enumerate() {
        if participant.name.trim().is_empty() {
            errors.push(ValidationError::MissingParticipantName(idx + 1));
        }
        if let Some(email) = &participant.email {
            if !looks_like_email(email) {
                errors.push(ValidationError::InvalidEmail(email.clone()));
            }
        }
    }
    if !looks_like_email(&request.contact_email) {
        errors.push(ValidationError::InvalidEmail(request.contact_email.clone()));
    }
    errors
}

pub(crate) fn looks_like_email(email: &str) -> bool {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::reserve_seats;
    use crate::model::{Booking, BookingStatus, Participant, SessionId, SessionStatus};
    use chrono::Duration;
    use uuid::Uuid;

    async fn setup(max: u32, taken: u32) -> (Arc<Database>, BookingValidator, SessionId) {
        let config = Config::default();
        let db = Arc::new(Database::new(std::time::Duration::from_millis(200)));
        let mut session = Session::published(
            "Emergency First Aid at Work",
            Amount::from_major(75),
            max,
            Utc::now() + Duration::days(10),
        );
        session.current_capacity = taken;
        session.recompute_status();
        let id = db.insert_session(session).await.unwrap();
        let ledger = Arc::new(CapacityLedger::new(db.clone(), &config));
        (db.clone(), BookingValidator::new(db, ledger, &config), id)
    }

    fn request(session: SessionId, names: &[&str], total: Amount) -> BookingRequest {
        BookingRequest {
            session_id: session,
            participants: names
                .iter()
                .map(|n| Participant {
                    name: n.to_string(),
                    email: None,
                })
                .collect(),
            contact_email: "lee@example.com".into(),
            total_amount: total,
            special_requirements: None,
        }
    }

    #[tokio::test]
    async fn valid_request_passes() {
        let (_, validator, id) = setup(12, 0).await;
        let report = validator
            .validate(&request(id, &["Lee", "Max"], Amount::from_major(150)))
            .await;
        assert!(report.is_valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn price_mismatch_reports_expected_amount() {
        let (_, validator, id) = setup(12, 0).await;
        let report = validator
            .validate(&request(id, &["Lee", "Max"], Amount::from_major(140)))
            .await;
        assert!(!report.is_valid);
        assert_eq!(
            report.errors,
            vec![ValidationError::PriceMismatch {
                submitted: Amount::from_major(140),
                expected: Amount::from_major(150),
            }]
        );
    }

    #[tokio::test]
    async fn price_within_a_penny_is_accepted() {
        let (_, validator, id) = setup(12, 0).await;
        let total: Amount = "149.99".parse().unwrap();
        assert!(validator.validate(&request(id, &["Lee", "Max"], total)).await.is_valid);

        let total: Amount = "149.98".parse().unwrap();
        assert!(!validator.validate(&request(id, &["Lee", "Max"], total)).await.is_valid);
    }

    #[tokio::test]
    async fn insufficient_capacity_and_low_availability() {
        let (_, validator, id) = setup(12, 10).await;
        let report = validator
            .validate(&request(id, &["A", "B", "C"], Amount::from_major(225)))
            .await;
        assert_eq!(
            report.errors,
            vec![ValidationError::InsufficientCapacity {
                requested: 3,
                available: 2
            }]
        );

        let report = validator
            .validate(&request(id, &["A"], Amount::from_major(75)))
            .await;
        assert!(report.is_valid);
        assert_eq!(
            report.warnings,
            vec![ValidationWarning::LowAvailability { available: 2 }]
        );
    }

    #[tokio::test]
    async fn large_group_warns_but_passes() {
        let (_, validator, id) = setup(30, 0).await;
        let names: Vec<String> = (0..11).map(|i| format!("P{i}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let report = validator
            .validate(&request(id, &names, Amount::from_major(75 * 11)))
            .await;
        assert!(report.is_valid);
        assert!(report.warnings.contains(&ValidationWarning::LargeGroup {
            count: 11,
            threshold: 10
        }));
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_and_alerted() {
        let (db, validator, id) = setup(12, 0).await;
        let now = Utc::now();
        let existing = Booking {
            id: Uuid::new_v4(),
            session_id: id,
            reference: "CB-261019-CCCCCC".into(),
            contact_email: "LEE@example.com".into(),
            participants: vec![Participant { name: "Lee".into(), email: None }],
            participant_count: 1,
            total_amount: Amount::from_major(75),
            status: BookingStatus::Confirmed,
            special_requirements: None,
            created_at: now,
            updated_at: now,
        };
        db.transaction_with_session::<_, StoreError>(id, |s, t| {
            reserve_seats(s, 1);
            t.insert_booking(existing)
        })
        .await
        .unwrap();

        let report = validator
            .validate(&request(id, &["Lee"], Amount::from_major(75)))
            .await;
        assert!(matches!(
            report.errors.as_slice(),
            [ValidationError::DuplicateBooking { .. }]
        ));
        assert_eq!(
            db.read(|t| t.outbox.count("duplicate_booking_alert")).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn cancelled_booking_is_not_a_duplicate() {
        let (db, validator, id) = setup(12, 0).await;
        let now = Utc::now();
        let cancelled = Booking {
            id: Uuid::new_v4(),
            session_id: id,
            reference: "CB-261019-DDDDDD".into(),
            contact_email: "lee@example.com".into(),
            participants: vec![Participant { name: "Lee".into(), email: None }],
            participant_count: 1,
            total_amount: Amount::from_major(75),
            status: BookingStatus::Cancelled,
            special_requirements: None,
            created_at: now,
            updated_at: now,
        };
        db.transaction::<_, StoreError>(|t| t.insert_booking(cancelled))
            .await
            .unwrap();

        assert!(validator
            .validate(&request(id, &["Lee"], Amount::from_major(75)))
            .await
            .is_valid);
    }

    #[tokio::test]
    async fn unbookable_sessions() {
        let (db, validator, id) = setup(12, 0).await;
        db.with_session_lock::<_, StoreError>(id, |s| {
            s.status = SessionStatus::Cancelled;
            Ok(())
        })
        .await
        .unwrap();
        let report = validator
            .validate(&request(id, &["Lee"], Amount::from_major(75)))
            .await;
        assert_eq!(
            report.errors,
            vec![ValidationError::SessionNotBookable(NotBookableReason::Cancelled)]
        );

        db.with_session_lock::<_, StoreError>(id, |s| {
            s.status = SessionStatus::Published;
            s.start_time = Utc::now() - Duration::minutes(5);
            Ok(())
        })
        .await
        .unwrap();
        let report = validator
            .validate(&request(id, &["Lee"], Amount::from_major(75)))
            .await;
        assert_eq!(
            report.errors,
            vec![ValidationError::SessionNotBookable(NotBookableReason::Started)]
        );
    }

    #[tokio::test]
    async fn malformed_input_collects_every_error() {
        let (_, validator, id) = setup(12, 0).await;
        let mut req = request(id, &["Lee", " "], Amount::from_major(150));
        req.contact_email = "not-an-email".into();
        let report = validator.validate(&req).await;
        assert!(report.errors.contains(&ValidationError::MissingParticipantName(2)));
        assert!(report
            .errors
            .contains(&ValidationError::InvalidEmail("not-an-email".into())));

        let report = validator.validate(&request(id, &[], Amount::ZERO)).await;
        assert!(report.errors.contains(&ValidationError::InvalidParticipantCount(0)));
    }

    #[tokio::test]
    async fn unknown_session() {
        let (_, validator, _) = setup(12, 0).await;
        let missing = Uuid::new_v4();
        let report = validator
            .validate(&request(missing, &["Lee"], Amount::from_major(75)))
            .await;
        assert_eq!(report.errors, vec![ValidationError::SessionNotFound(missing)]);
    }

    #[tokio::test]
    async fn internal_failure_becomes_generic_error() {
        let config = Config {
            lock_timeout: std::time::Duration::from_millis(10),
            ..Config::default()
        };
        let db = Arc::new(Database::new(config.lock_timeout));
        let id = db
            .insert_session(Session::published(
                "EFAW",
                Amount::from_major(75),
                12,
                Utc::now() + Duration::days(1),
            ))
            .await
            .unwrap();
        let ledger = Arc::new(CapacityLedger::new(db.clone(), &config));
        let validator = BookingValidator::new(db.clone(), ledger, &config);

        let _held = db.hold_session(id).await;
        let report = validator
            .validate(&request(id, &["Lee"], Amount::from_major(75)))
            .await;
        assert_eq!(report.errors, vec![ValidationError::Internal]);
    }

    #[test]
    fn email_shapes() {
        assert!(looks_like_email("a.b@example.co.uk"));
        assert!(!looks_like_email("a@b"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("a b@example.com"));
        assert!(!looks_like_email("a@@example.com"));
    }
}
