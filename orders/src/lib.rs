//! # Ordermesh Orders
//!
//! The order bounded context: owns orders and their state machine and
//! orchestrates the creation saga across inventory and payment.
//!
//! - [`service`] — the [`OrderService`](service::OrderService) request-path
//!   operations (create with duplicate rejection, cancel with the 24-hour
//!   window, fulfilment progression, refunds)
//! - [`saga`] — the [`OrderSaga`](saga::OrderSaga) coordinator consuming
//!   inventory events and driving payment with compensations
//! - [`payment`] — the deadline/retry/circuit-breaker adapter around the
//!   external gateway port

pub mod payment;
pub mod saga;
pub mod service;

use ordermesh_core::order::OrderError;
use ordermesh_core::ports::{PaymentError, RepositoryError};
use ordermesh_core::{Classify, ErrorClass};
use thiserror::Error;

pub use payment::PaymentAdapter;
pub use saga::OrderSaga;
pub use service::{NewOrderItem, OrderService};

/// Failures from order operations.
#[derive(Error, Debug)]
pub enum OrdersError {
    /// An order state-machine or validation rule was violated.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// The aggregate store failed or conflicted.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The payment gateway failed (transport, not a decline).
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

impl Classify for OrdersError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Order(e) => e.class(),
            Self::Repository(e) => e.class(),
            Self::Payment(e) => e.class(),
        }
    }
}
