//! Named periodic jobs.
//!
//! Background work (the reservation expirer, cache maintenance) runs as
//! explicit named jobs on one scheduler owned by the process. Each job is
//! isolated: a failing run is logged and the next tick still fires. On
//! shutdown the scheduler signals every job and waits for in-flight runs
//! to drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A periodic job: each tick produces a future that runs to completion
/// before the next tick is considered.
pub trait Job: Send + Sync {
    /// One run of the job. Errors are logged by the scheduler, not fatal.
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// Blanket implementation so closures returning futures can be jobs.
impl<F, Fut> Job for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(self())
    }
}

struct RunningJob {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Periodic job scheduler with graceful drain.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    jobs: Vec<RunningJob>,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            jobs: Vec::new(),
        }
    }

    /// Register and start a named job firing every `period`. The first run
    /// happens one period after registration.
    pub fn register(&mut self, name: &'static str, period: Duration, job: Arc<dyn Job>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately; consume
            // it so the job starts one period from now.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = std::time::Instant::now();
                        match job.run().await {
                            Ok(()) => {
                                metrics::histogram!("scheduler.run_ms", "job" => name)
                                    .record(started.elapsed().as_millis() as f64);
                                tracing::debug!(job = name, elapsed_ms = started.elapsed().as_millis(), "Job run completed");
                            },
                            Err(e) => {
                                metrics::counter!("scheduler.run_failed", "job" => name).increment(1);
                                tracing::error!(job = name, error = %e, "Job run failed");
                            },
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        tracing::info!(job = name, "Job shutting down");
                        break;
                    },
                }
            }
        });

        tracing::info!(job = name, period_ms = period.as_millis(), "Job registered");
        self.jobs.push(RunningJob { name, handle });
    }

    /// Signal every job to stop and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for job in self.jobs {
            if let Err(e) = job.handle.await {
                tracing::warn!(job = job.name, error = %e, "Job task ended abnormally");
            }
        }
        tracing::info!("Scheduler drained");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn job_fires_on_each_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);

        let mut scheduler = Scheduler::new();
        scheduler.register(
            "test-job",
            Duration::from_secs(60),
            Arc::new(move || {
                let runs = Arc::clone(&runs_clone);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_run_does_not_kill_the_job() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);

        let mut scheduler = Scheduler::new();
        scheduler.register(
            "flaky-job",
            Duration::from_secs(10),
            Arc::new(move || {
                let runs = Arc::clone(&runs_clone);
                async move {
                    let run = runs.fetch_add(1, Ordering::SeqCst);
                    if run == 0 {
                        Err("first run fails".to_string())
                    } else {
                        Ok(())
                    }
                }
            }),
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_jobs() {
        let mut scheduler = Scheduler::new();
        scheduler.register(
            "idle-job",
            Duration::from_secs(3600),
            Arc::new(|| async { Ok(()) }),
        );
        // Must return promptly even though the period is an hour.
        scheduler.shutdown().await;
    }
}
