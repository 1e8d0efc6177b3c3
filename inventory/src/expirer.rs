//! The reservation expirer.
//!
//! A periodic job (default every 60 s) that finds products holding lapsed
//! `Active` reservations, takes each product's lock in turn, and expires
//! them — returning the stock to availability and publishing one
//! `StockReleased(EXPIRED)` per reservation. Safe to run on many processes
//! at once: the per-product lock serialises the sweep, and expiring an
//! already-expired reservation is a no-op.

use crate::service::StockService;
use ordermesh_core::ids::CorrelationId;
use ordermesh_core::ports::{Clock, ProductRepository};
use ordermesh_runtime::scheduler::Job;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The sweep job. Register it on the scheduler with the configured
/// interval.
pub struct ReservationExpirer {
    service: Arc<StockService>,
    products: Arc<dyn ProductRepository>,
    clock: Arc<dyn Clock>,
}

impl ReservationExpirer {
    /// Wire the expirer to its resources.
    #[must_use]
    pub fn new(
        service: Arc<StockService>,
        products: Arc<dyn ProductRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service,
            products,
            clock,
        }
    }

    /// One sweep: expire every lapsed reservation across all products.
    /// Returns how many reservations were expired.
    ///
    /// # Errors
    ///
    /// The repository error when the candidate query fails; per-product
    /// failures are logged and skipped so one wedged product cannot stall
    /// the whole sweep.
    pub async fn sweep(&self) -> Result<usize, ordermesh_core::ports::RepositoryError> {
        let now = self.clock.now();
        let candidates = self.products.products_with_expired_reservations(now).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        // Each sweep is one business flow.
        let correlation_id = CorrelationId::new();
        let mut expired = 0_usize;

        for product_id in candidates {
            match self.service.sweep_expired(product_id, correlation_id).await {
                Ok(swept) => expired += swept.len(),
                Err(e) => {
                    tracing::warn!(
                        product_id = %product_id,
                        error = %e,
                        "Sweep skipped product"
                    );
                },
            }
        }

        if expired > 0 {
            tracing::info!(expired, "Expired lapsed reservations");
            metrics::counter!("stock.reservations_expired").increment(expired as u64);
        }
        Ok(expired)
    }
}

impl Job for ReservationExpirer {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            self.sweep().await.map(|_| ()).map_err(|e| e.to_string())
        })
    }
}
