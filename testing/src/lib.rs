//! # Ordermesh Testing
//!
//! In-memory implementations of every port plus deterministic clocks, so
//! domain services and sagas run end-to-end in tests with no broker,
//! database, or gateway.
//!
//! ## Example
//!
//! ```
//! use ordermesh_testing::{test_clock, mocks::InMemoryEventBus};
//! use std::sync::Arc;
//!
//! let _clock = test_clock();
//! let bus = Arc::new(InMemoryEventBus::new());
//! assert!(bus.published().is_empty());
//! ```

pub mod mocks;

pub use mocks::{
    test_clock, test_instant, FixedClock, InMemoryDeadLetterSink, InMemoryEventBus,
    InMemoryOrderRepository, InMemoryProcessedEventLog, InMemoryProductRepository, ScriptedCharge,
    SteppingClock, StubPaymentGateway,
};
