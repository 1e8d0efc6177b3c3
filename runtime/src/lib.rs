//! # Ordermesh Runtime
//!
//! Infrastructure runtime for the ordermesh subsystem: the pieces that keep
//! thousands of concurrent operations correct and bounded.
//!
//! - [`lock`] — lease-based distributed locking with re-entrancy, watchdog
//!   renewal, per-call fairness, and in-process deadlock detection
//! - [`rwlock`] — shared/exclusive locking for read-mostly paths
//! - [`cache`] — write-through TTL cache with version-stamped conditional
//!   writes, broadcast invalidation, and hot-item tracking
//! - [`retry`] — bounded exponential backoff with jitter, class-aware
//! - [`circuit_breaker`] — fail-fast guard for the external payment path
//! - [`scheduler`] — named periodic jobs with graceful drain
//! - [`publisher`] — publish-with-retry, dead-letter on exhaustion
//! - [`dispatcher`] — idempotent, partition-serial event consumption with
//!   class-routed retry/DLQ policy
//!
//! Everything here is constructed at process start and injected into the
//! context services; lifecycle is tied to the process (init on boot,
//! graceful drain on shutdown).

pub mod cache;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod lock;
pub mod publisher;
pub mod retry;
pub mod rwlock;
pub mod scheduler;

pub use cache::{Cache, CacheMaintenance, CacheRead, Invalidation, InvalidationBus};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use dispatcher::{Dispatcher, EventHandler, HandlerError};
pub use lock::{Fairness, InProcessLockStore, LockError, LockHandle, LockService};
pub use publisher::ReliablePublisher;
pub use retry::{retry_classified, retry_with_policy, RetryPolicy};
pub use scheduler::{Job, Scheduler};
