//! # Ordermesh Postgres
//!
//! PostgreSQL persistence for the ordermesh subsystem: the aggregate
//! repositories with optimistic `version` columns, the processed-event
//! log, and the dead-letter store. Table DDL is documented in each
//! module; schema management is handled by the deployment.

pub mod dead_letter_queue;
pub mod order_repository;
pub mod processed_events;
pub mod product_repository;

pub use dead_letter_queue::{DlqError, DlqStatus, PgDeadLetterStore, StoredDeadLetter};
pub use order_repository::PgOrderRepository;
pub use processed_events::PgProcessedEventLog;
pub use product_repository::PgProductRepository;
