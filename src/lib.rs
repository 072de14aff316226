pub mod amount;
pub mod app;
pub mod booking;
pub mod config;
pub mod csv;
pub mod error;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod outbox;
pub mod payments;
pub mod reconciliation;
pub mod refunds;
pub mod store;
pub mod validator;
pub mod webhook;

pub use amount::Amount;
pub use app::Platform;
pub use booking::{BookingCreated, BookingRequest, BookingService};
pub use config::Config;
pub use error::{Error, ErrorCode};
pub use model::{
    Booking, BookingId, BookingStatus, Payment, PaymentStatus, Refund, RefundStatus, Session,
    SessionId, SessionStatus,
};
