//! Lease-based distributed locking.
//!
//! Every mutation of a product aggregate is serialised through a named lock
//! whose key is the product id. The [`LockService`] layers waiting,
//! per-call fairness, re-entrancy, watchdog renewal, and in-process
//! deadlock detection over a [`LockStore`] port that enforces lease expiry
//! as absolute wall-clock instants.
//!
//! Locks are explicit handle values passed through call stacks; re-entrancy
//! is a hold count on the handle, never thread-local state. Dropping a
//! handle releases the lock, so a cancelled caller does not keep holding
//! resources.
//!
//! Multi-key callers must acquire in ascending key order (see
//! [`LockService::acquire_many`]) so lock cycles cannot form across
//! processes; the local wait-for graph additionally surfaces in-process
//! cycles as [`LockError::PotentialDeadlock`] without blocking.

use ordermesh_core::ports::{LockStore, LockStoreError};
use ordermesh_core::{Classify, ErrorClass};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// How often a blocked acquire re-polls the store.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors from lock acquisition and release.
#[derive(Error, Debug)]
pub enum LockError {
    /// The wait time elapsed without winning the lock.
    #[error("Lock acquisition timed out for key '{key}' after {waited_ms}ms")]
    Timeout {
        /// The contested key.
        key: String,
        /// How long the caller waited.
        waited_ms: u128,
    },

    /// Granting the request would close a wait cycle inside this process.
    #[error("Potential deadlock: '{owner}' waiting for key '{key}' closes a cycle")]
    PotentialDeadlock {
        /// The requested key.
        key: String,
        /// The requesting owner.
        owner: String,
    },

    /// The lock store failed.
    #[error(transparent)]
    Store(#[from] LockStoreError),
}

impl Classify for LockError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::PotentialDeadlock { .. } => ErrorClass::Conflict,
            Self::Store(e) => e.class(),
        }
    }
}

/// Fairness mode, selectable per call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Fairness {
    /// Contenders race on each poll; highest throughput.
    #[default]
    Unfair,
    /// Contenders are granted the lock in FIFO arrival order.
    Fair,
}

#[derive(Default)]
struct WaitGraph {
    /// key -> owner currently holding it (local knowledge only).
    held_by: HashMap<String, String>,
    /// owner -> key it is blocked on.
    waiting_for: HashMap<String, String>,
}

impl WaitGraph {
    /// Would `owner` waiting on `key` close a cycle?
    fn would_deadlock(&self, owner: &str, key: &str) -> bool {
        let mut current_key = key;
        loop {
            let Some(holder) = self.held_by.get(current_key) else {
                return false;
            };
            if holder == owner {
                return true;
            }
            let Some(next_key) = self.waiting_for.get(holder) else {
                return false;
            };
            current_key = next_key;
        }
    }
}

struct ServiceShared {
    store: Arc<dyn LockStore>,
    graph: Mutex<WaitGraph>,
    /// FIFO ticket queues per key, for fair mode.
    queues: Mutex<HashMap<String, VecDeque<u64>>>,
    ticket_counter: AtomicU64,
    owner_counter: AtomicU64,
    /// Distinguishes this process's owners from its peers'.
    process_nonce: u64,
}

/// The distributed lock service.
#[derive(Clone)]
pub struct LockService {
    shared: Arc<ServiceShared>,
    default_wait: Duration,
    default_lease: Duration,
}

impl LockService {
    /// Build a service over a lock store with the given defaults
    /// (typically 3 s wait, 10 s lease).
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>, default_wait: Duration, default_lease: Duration) -> Self {
        use rand::Rng;
        Self {
            shared: Arc::new(ServiceShared {
                store,
                graph: Mutex::new(WaitGraph::default()),
                queues: Mutex::new(HashMap::new()),
                ticket_counter: AtomicU64::new(0),
                owner_counter: AtomicU64::new(0),
                process_nonce: rand::thread_rng().gen(),
            }),
            default_wait,
            default_lease,
        }
    }

    /// Acquire `key` with the service defaults, unfair mode.
    ///
    /// # Errors
    ///
    /// See [`LockService::acquire_with`].
    pub async fn acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        self.acquire_with(key, self.default_wait, self.default_lease, Fairness::Unfair)
            .await
    }

    /// Acquire `key`, waiting up to `wait` for a lease of `lease`.
    ///
    /// A watchdog renews the lease at one-third intervals while the handle
    /// is live.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] when `wait` elapses, [`LockError::Store`] when
    /// the store fails.
    pub async fn acquire_with(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        fairness: Fairness,
    ) -> Result<LockHandle, LockError> {
        let owner = self.fresh_owner();
        self.acquire_as(owner, key, wait, lease, fairness).await
    }

    /// Acquire a second key while already holding `held`, sharing its owner
    /// identity so the wait-for graph can see the dependency. Surfaces
    /// [`LockError::PotentialDeadlock`] without blocking when the request
    /// would close an in-process cycle.
    ///
    /// # Errors
    ///
    /// [`LockError::PotentialDeadlock`], [`LockError::Timeout`], or
    /// [`LockError::Store`].
    pub async fn acquire_nested(
        &self,
        held: &LockHandle,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        self.acquire_as(held.owner.clone(), key, wait, lease, Fairness::Unfair)
            .await
    }

    /// Acquire several keys atomically-enough for a batch operation:
    /// always in ascending key order, so concurrent batches cannot form a
    /// lock cycle. On any failure every already-taken lock is released
    /// (dropped) before the error surfaces.
    ///
    /// # Errors
    ///
    /// The first acquisition error encountered.
    pub async fn acquire_many(
        &self,
        keys: &[String],
        wait: Duration,
        lease: Duration,
    ) -> Result<Vec<LockHandle>, LockError> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut handles = Vec::with_capacity(sorted.len());
        for key in sorted {
            match self
                .acquire_with(key, wait, lease, Fairness::Unfair)
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Handles drop here, releasing in reverse.
                    drop(handles);
                    return Err(err);
                },
            }
        }
        Ok(handles)
    }

    fn fresh_owner(&self) -> String {
        let seq = self.shared.owner_counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{seq}", self.shared.process_nonce)
    }

    async fn acquire_as(
        &self,
        owner: String,
        key: &str,
        wait: Duration,
        lease: Duration,
        fairness: Fairness,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = started + wait;

        // Register the wait edge and check for an in-process cycle before
        // blocking at all.
        {
            let mut graph = self
                .shared
                .graph
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if graph.would_deadlock(&owner, key) {
                metrics::counter!("lock.deadlock_detected").increment(1);
                return Err(LockError::PotentialDeadlock {
                    key: key.to_string(),
                    owner,
                });
            }
            graph.waiting_for.insert(owner.clone(), key.to_string());
        }

        let ticket = match fairness {
            Fairness::Fair => Some(self.join_queue(key)),
            Fairness::Unfair => None,
        };

        let result = self
            .poll_until_acquired(&owner, key, started, deadline, lease, ticket)
            .await;

        // Clear the wait edge; record the hold on success.
        {
            let mut graph = self
                .shared
                .graph
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            graph.waiting_for.remove(&owner);
            if result.is_ok() {
                graph.held_by.insert(key.to_string(), owner.clone());
            }
        }
        if let Some(ticket) = ticket {
            self.leave_queue(key, ticket);
        }

        match result {
            Ok(()) => {
                let waited = started.elapsed();
                metrics::histogram!("lock.wait_ms").record(waited.as_millis() as f64);
                tracing::debug!(key, owner = %owner, waited_ms = waited.as_millis(), "Lock acquired");
                Ok(LockHandle::new(
                    Arc::clone(&self.shared),
                    key.to_string(),
                    owner,
                    lease,
                ))
            },
            Err(err) => {
                metrics::counter!("lock.timeout").increment(1);
                Err(err)
            },
        }
    }

    async fn poll_until_acquired(
        &self,
        owner: &str,
        key: &str,
        started: Instant,
        deadline: Instant,
        lease: Duration,
        ticket: Option<u64>,
    ) -> Result<(), LockError> {
        loop {
            let my_turn = ticket.map_or(true, |t| self.is_front(key, t));
            if my_turn && self.shared.store.try_acquire(key, owner, lease).await? {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            let remaining = deadline - now;
            sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }

    fn join_queue(&self, key: &str) -> u64 {
        let ticket = self.shared.ticket_counter.fetch_add(1, Ordering::Relaxed);
        let mut queues = self
            .shared
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues.entry(key.to_string()).or_default().push_back(ticket);
        ticket
    }

    fn is_front(&self, key: &str, ticket: u64) -> bool {
        let queues = self
            .shared
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues
            .get(key)
            .and_then(VecDeque::front)
            .is_some_and(|front| *front == ticket)
    }

    fn leave_queue(&self, key: &str, ticket: u64) {
        let mut queues = self
            .shared
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(queue) = queues.get_mut(key) {
            queue.retain(|t| *t != ticket);
            if queue.is_empty() {
                queues.remove(key);
            }
        }
    }
}

/// A held lock. Re-entrancy is a hold count on this value; the lock is
/// returned to the store when the count reaches zero (or the handle is
/// dropped).
pub struct LockHandle {
    shared: Arc<ServiceShared>,
    key: String,
    owner: String,
    lease: Duration,
    hold_count: AtomicU32,
    released: AtomicBool,
    watchdog: tokio::task::JoinHandle<()>,
}

impl LockHandle {
    fn new(shared: Arc<ServiceShared>, key: String, owner: String, lease: Duration) -> Self {
        let watchdog = Self::spawn_watchdog(&shared, &key, &owner, lease);
        Self {
            shared,
            key,
            owner,
            lease,
            hold_count: AtomicU32::new(1),
            released: AtomicBool::new(false),
            watchdog,
        }
    }

    /// The watchdog renews at one-third of the lease while the handle
    /// lives; if a renewal is refused the lease has been lost and renewal
    /// stops.
    fn spawn_watchdog(
        shared: &Arc<ServiceShared>,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&shared.store);
        let key = key.to_string();
        let owner = owner.to_string();
        tokio::spawn(async move {
            let interval = lease / 3;
            loop {
                sleep(interval).await;
                match store.renew(&key, &owner, lease).await {
                    Ok(true) => {
                        tracing::trace!(key = %key, "Lock lease renewed");
                    },
                    Ok(false) => {
                        tracing::warn!(key = %key, owner = %owner, "Lock lease lost, watchdog stopping");
                        metrics::counter!("lock.lease_lost").increment(1);
                        break;
                    },
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Lock renewal failed");
                    },
                }
            }
        })
    }

    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owner identity this handle holds the lock as.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Re-enter the lock: increments the hold count. Each re-entry must be
    /// paired with a [`LockHandle::release`].
    pub fn reenter(&self) {
        self.hold_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Current hold count.
    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.hold_count.load(Ordering::Acquire)
    }

    /// Release one hold. When the count reaches zero the store lock is
    /// released and the watchdog stops. Returns whether the store lock was
    /// actually released by this call.
    ///
    /// # Errors
    ///
    /// [`LockError::Store`] when the store release fails (the local state
    /// is cleaned up regardless).
    pub async fn release(&self) -> Result<bool, LockError> {
        let previous = self.hold_count.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            return Ok(false);
        }
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        self.watchdog.abort();
        self.forget_hold();
        let released = self.shared.store.release(&self.key, &self.owner).await?;
        tracing::debug!(key = %self.key, "Lock released");
        Ok(released)
    }

    /// Extend the lease to `lease` from now.
    ///
    /// # Errors
    ///
    /// [`LockError::Store`] when the store call fails.
    pub async fn renew(&self, lease: Duration) -> Result<bool, LockError> {
        Ok(self.shared.store.renew(&self.key, &self.owner, lease).await?)
    }

    /// The lease this handle was acquired with.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    fn forget_hold(&self) {
        let mut graph = self
            .shared
            .graph
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if graph.held_by.get(&self.key) == Some(&self.owner) {
            graph.held_by.remove(&self.key);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.watchdog.abort();
        if !self.released.swap(true, Ordering::AcqRel) {
            self.forget_hold();
            let store = Arc::clone(&self.shared.store);
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            tokio::spawn(async move {
                if let Err(e) = store.release(&key, &owner).await {
                    tracing::warn!(key = %key, error = %e, "Best-effort lock release on drop failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("hold_count", &self.hold_count())
            .finish_non_exhaustive()
    }
}

/// In-process lock store: leases tracked as absolute instants in local
/// memory. Backs tests and single-process deployments; multi-process
/// deployments plug in a shared store behind the same port.
#[derive(Default)]
pub struct InProcessLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InProcessLockStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, (String, Instant)>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut entries)
    }
}

impl LockStore for InProcessLockStore {
    fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> ordermesh_core::ports::PortFuture<'_, Result<bool, LockStoreError>> {
        let key = key.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let now = Instant::now();
            Ok(self.with_entries(|entries| match entries.get(&key) {
                Some((holder, expires)) if *expires > now && *holder != owner => false,
                _ => {
                    entries.insert(key.clone(), (owner, now + lease));
                    true
                },
            }))
        })
    }

    fn renew(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
    ) -> ordermesh_core::ports::PortFuture<'_, Result<bool, LockStoreError>> {
        let key = key.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            let now = Instant::now();
            Ok(self.with_entries(|entries| match entries.get_mut(&key) {
                Some((holder, expires)) if *holder == owner && *expires > now => {
                    *expires = now + lease;
                    true
                },
                _ => false,
            }))
        })
    }

    fn release(
        &self,
        key: &str,
        owner: &str,
    ) -> ordermesh_core::ports::PortFuture<'_, Result<bool, LockStoreError>> {
        let key = key.to_string();
        let owner = owner.to_string();
        Box::pin(async move {
            Ok(self.with_entries(|entries| match entries.get(&key) {
                Some((holder, _)) if *holder == owner => {
                    entries.remove(&key);
                    true
                },
                _ => false,
            }))
        })
    }
}
