//! # Ordermesh Inventory
//!
//! The inventory bounded context: owns products and their stock ledger and
//! exposes the reservation, deduction, release, and adjustment operations.
//!
//! - [`service`] — the [`StockService`](service::StockService) application
//!   service (lock → load → mutate → persist → publish, with bounded
//!   conflict retry and write-through caching)
//! - [`consumer`] — the event handlers that drive the ledger from order
//!   and payment events
//! - [`expirer`] — the periodic sweep releasing lapsed reservations

pub mod consumer;
pub mod expirer;
pub mod service;

use ordermesh_core::ports::RepositoryError;
use ordermesh_core::product::StockError;
use ordermesh_core::{Classify, ErrorClass};
use ordermesh_runtime::lock::LockError;
use thiserror::Error;

pub use consumer::InventoryConsumer;
pub use expirer::ReservationExpirer;
pub use service::{ReserveLine, StockService};

/// Failures from inventory operations.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// A stock-ledger rule was violated.
    #[error(transparent)]
    Stock(#[from] StockError),

    /// The aggregate store failed or conflicted.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The product lock could not be taken.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl Classify for InventoryError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Stock(e) => e.class(),
            Self::Repository(e) => e.class(),
            Self::Lock(e) => e.class(),
        }
    }
}
