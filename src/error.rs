//! Error types for the reservation and payment core.
//!
//! Every component has its own enum; [`Error`] unifies them for callers that
//! only need the machine-readable [`ErrorCode`].

use std::fmt;

use thiserror::Error;

use crate::Amount;
use crate::csv::CsvError;
use crate::model::{
    BookingId, BookingStatus, PaymentId, PaymentStatus, RefundId, RefundStatus, SessionId,
    SessionStatus,
};

/// Machine-readable error codes returned to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    CapacityUnavailable,
    SessionNotBookable,
    TransientFailure,
    PaymentFailed,
    InvalidSignature,
    MalformedPayload,
    RefundRejected,
    InvalidTransition,
    NotFound,
    Configuration,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::CapacityUnavailable => "CAPACITY_UNAVAILABLE",
            Self::SessionNotBookable => "SESSION_NOT_BOOKABLE",
            Self::TransientFailure => "TRANSIENT_FAILURE",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::MalformedPayload => "MALFORMED_PAYLOAD",
            Self::RefundRejected => "REFUND_REJECTED",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::NotFound => "NOT_FOUND",
            Self::Configuration => "CONFIGURATION",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error for callers that mix components.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Booking(#[from] BookingError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Csv(#[from] CsvError),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Booking(e) => e.code(),
            Self::Payment(e) => e.code(),
            Self::Refund(e) => e.code(),
            Self::Webhook(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::Config(_) => ErrorCode::Configuration,
            Self::Csv(_) => ErrorCode::MalformedPayload,
        }
    }
}

/// Errors raised by the transactional store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("duplicate key {key} in {table}")]
    DuplicateKey { table: &'static str, key: String },
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionNotFound(_) => ErrorCode::NotFound,
            Self::LockTimeout(_) => ErrorCode::TransientFailure,
            Self::DuplicateKey { .. } => ErrorCode::Internal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

/// Errors raised by the capacity ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("could not lock session {session} after {attempts} attempts")]
    RetriesExhausted { session: SessionId, attempts: u32 },
}

/// Why a session cannot take bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotBookableReason {
    Cancelled,
    Full,
    Started,
    Unpublished,
}

impl fmt::Display for NotBookableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cancelled => "session is cancelled",
            Self::Full => "session is full",
            Self::Started => "session has already started",
            Self::Unpublished => "session is not published",
        })
    }
}

impl NotBookableReason {
    pub fn from_status(status: SessionStatus) -> Option<Self> {
        match status {
            SessionStatus::Published => None,
            SessionStatus::Full => Some(Self::Full),
            SessionStatus::Cancelled => Some(Self::Cancelled),
            SessionStatus::Draft => Some(Self::Unpublished),
        }
    }
}

/// A single failed validation rule.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("participant count must be at least 1, got {0}")]
    InvalidParticipantCount(u32),

    #[error("participant {0} has no name")]
    MissingParticipantName(usize),

    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("only {available} spots available, {requested} requested")]
    InsufficientCapacity { requested: u32, available: u32 },

    #[error("total amount {submitted} does not match expected amount {expected}")]
    PriceMismatch { submitted: Amount, expected: Amount },

    #[error("{email} already has an active booking for this session")]
    DuplicateBooking { email: String },

    #[error("{0}")]
    SessionNotBookable(NotBookableReason),

    #[error("booking could not be validated, please try again")]
    Internal,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParticipantCount(_) => "INVALID_PARTICIPANT_COUNT",
            Self::MissingParticipantName(_) => "INVALID_PARTICIPANT",
            Self::InvalidEmail(_) => "INVALID_EMAIL",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::InsufficientCapacity { .. } => "INSUFFICIENT_CAPACITY",
            Self::PriceMismatch { .. } => "PRICE_MISMATCH",
            Self::DuplicateBooking { .. } => "DUPLICATE_BOOKING",
            Self::SessionNotBookable(_) => "SESSION_NOT_BOOKABLE",
            Self::Internal => "VALIDATION_ERROR",
        }
    }
}

/// Non-blocking advice attached to a validation verdict.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationWarning {
    #[error("groups larger than {threshold} ({count} requested) should use the group booking process")]
    LargeGroup { count: u32, threshold: u32 },

    #[error("only {available} spots left")]
    LowAvailability { available: u32 },
}

/// Errors returned by booking creation and admin booking actions.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("booking validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("not enough capacity: {available} spots available")]
    CapacityUnavailable { available: u32 },

    #[error("session cannot be booked: {0}")]
    SessionNotBookable(NotBookableReason),

    #[error("temporary failure, please try again: {0}")]
    TransientFailure(String),

    #[error("payment could not be started: {0}")]
    Gateway(#[from] GatewayError),

    #[error("booking {0} not found")]
    NotFound(BookingId),

    #[error("booking {booking} cannot move from {from} to {to}")]
    InvalidTransition {
        booking: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl BookingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::CapacityUnavailable { .. } => ErrorCode::CapacityUnavailable,
            Self::SessionNotBookable(_) => ErrorCode::SessionNotBookable,
            Self::TransientFailure(_) => ErrorCode::TransientFailure,
            Self::Gateway(_) => ErrorCode::PaymentFailed,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::Store(e) => e.code(),
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LockTimeout(_) => BookingError::TransientFailure(e.to_string()),
            other => BookingError::Store(other),
        }
    }
}

impl From<LedgerError> for BookingError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Store(e) => e.into(),
            e @ LedgerError::RetriesExhausted { .. } => {
                BookingError::TransientFailure(e.to_string())
            }
        }
    }
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors from the payment provider, translated into our taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{operation}: provider rejected the request: {message}")]
    Rejected {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("{operation}: provider did not answer in time")]
    Timeout { operation: &'static str },

    #[error("{operation}: provider unavailable: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: {id} not found at provider")]
    NotFound { operation: &'static str, id: String },
}

impl GatewayError {
    /// The outcome at the provider is unknown; the webhook is the source of truth.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Unavailable { .. })
    }
}

/// Errors from the payment state machine.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("no payment for provider intent {0}")]
    UnknownIntent(String),

    #[error("payment {0} not found")]
    NotFound(PaymentId),

    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("no payment recorded for booking {0}")]
    NoPaymentForBooking(BookingId),

    /// Money was captured after the booking gave up its seats and they are
    /// gone; the payment needs an operator refund.
    #[error("booking {booking} was paid but its seats are no longer available")]
    SeatsLost { booking: BookingId },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PaymentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownIntent(_)
            | Self::NotFound(_)
            | Self::BookingNotFound(_)
            | Self::NoPaymentForBooking(_) => ErrorCode::NotFound,
            Self::SeatsLost { .. } => ErrorCode::CapacityUnavailable,
            Self::Gateway(_) => ErrorCode::PaymentFailed,
            Self::Store(e) => e.code(),
        }
    }
}

/// Errors from the refund processor.
#[derive(Debug, Error)]
pub enum RefundError {
    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("no payment recorded for booking {0}")]
    PaymentNotFound(BookingId),

    #[error("refund {0} not found")]
    NotFound(RefundId),

    #[error("no refund for provider reference {0}")]
    UnknownProviderRefund(String),

    #[error("refund amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("refund of {requested} exceeds refundable balance {refundable}")]
    ExceedsRefundableBalance { requested: Amount, refundable: Amount },

    #[error("payment {payment} is {status} and cannot be refunded")]
    PaymentNotRefundable {
        payment: PaymentId,
        status: PaymentStatus,
    },

    #[error("payment {0} has no captured charge")]
    MissingCharge(PaymentId),

    #[error("cannot {operation} refund {refund} in state {status}")]
    InvalidState {
        refund: RefundId,
        status: RefundStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RefundError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BookingNotFound(_)
            | Self::PaymentNotFound(_)
            | Self::NotFound(_)
            | Self::UnknownProviderRefund(_) => ErrorCode::NotFound,
            Self::InvalidAmount(_)
            | Self::ExceedsRefundableBalance { .. }
            | Self::PaymentNotRefundable { .. }
            | Self::MissingCharge(_) => ErrorCode::RefundRejected,
            Self::InvalidState { .. } => ErrorCode::InvalidTransition,
            Self::Store(e) => e.code(),
            Self::Ledger(_) => ErrorCode::TransientFailure,
        }
    }
}

/// Webhook signature failures. Carries no payload content.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is missing or malformed")]
    MalformedHeader,

    #[error("signature timestamp is outside the tolerance window")]
    Expired,

    #[error("signature does not match payload")]
    Mismatch,
}

/// Errors from webhook ingestion.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WebhookError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidSignature(_) => ErrorCode::InvalidSignature,
            Self::MalformedPayload(_) => ErrorCode::MalformedPayload,
            Self::Payment(e) => e.code(),
            Self::Refund(e) => e.code(),
            Self::Store(e) => e.code(),
        }
    }
}

/// Failure reported by a side-effect handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{effect} failed: {message}")]
pub struct SideEffectError {
    pub effect: &'static str,
    pub message: String,
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
