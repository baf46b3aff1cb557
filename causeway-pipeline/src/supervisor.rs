//! Worker supervision.
//!
//! Each worker is registered with a factory that builds a fresh future for
//! it. The supervisor runs every worker as its own task inside a `JoinSet`;
//! when one panics it is logged, counted and started again from its
//! factory. A worker that returns normally stays stopped. Workers keep
//! their durable state (lanes, shard slots) outside the future, so a
//! restart loses nothing that was committed.

use crate::stats::PipelineStats;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

pub type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

type Factory = Arc<dyn Fn() -> WorkerFuture + Send + Sync>;

struct Worker {
    name: String,
    factory: Factory,
}

pub struct Supervisor {
    label: &'static str,
    workers: Vec<Worker>,
    tasks: JoinSet<(usize, Result<(), JoinError>)>,
    stats: Arc<PipelineStats>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("label", &self.label)
            .field("workers", &self.workers.len())
            .field("running", &self.tasks.len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(label: &'static str, stats: Arc<PipelineStats>) -> Self {
        Self {
            label,
            workers: Vec::new(),
            tasks: JoinSet::new(),
            stats,
        }
    }

    /// Register and start a worker.
    pub fn spawn<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> WorkerFuture + Send + Sync + 'static,
    {
        let index = self.workers.len();
        self.workers.push(Worker {
            name: name.into(),
            factory: Arc::new(factory),
        });
        self.start(index);
    }

    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    fn start(&mut self, index: usize) {
        let Some(worker) = self.workers.get(index) else {
            return;
        };
        // The inner task isolates the panic; the outer one reports which
        // worker it was.
        let inner = tokio::spawn((worker.factory)());
        self.tasks.spawn(async move { (index, inner.await) });
    }

    /// Supervise until every worker has returned. Panicked workers are
    /// restarted unless `shutdown` is already set.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) {
        tracing::info!(supervisor = self.label, workers = self.workers.len(), "Supervisor started");

        while let Some(joined) = self.tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(supervisor = self.label, error = %e, "Supervision task failed");
                    continue;
                }
            };
            let name = self
                .workers
                .get(index)
                .map(|w| w.name.as_str())
                .unwrap_or("unknown");

            match outcome {
                Ok(()) => tracing::debug!(supervisor = self.label, worker = name, "Worker exited"),
                Err(e) if e.is_panic() => {
                    if *shutdown.borrow() {
                        tracing::error!(
                            supervisor = self.label,
                            worker = name,
                            "Worker panicked during shutdown, not restarting"
                        );
                    } else {
                        tracing::error!(supervisor = self.label, worker = name, "Worker panicked, restarting");
                        PipelineStats::add(&self.stats.restarts, 1);
                        self.start(index);
                    }
                }
                Err(e) => {
                    tracing::warn!(supervisor = self.label, worker = name, error = %e, "Worker cancelled");
                }
            }
        }

        tracing::info!(supervisor = self.label, "Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_panicked_worker_restarts() {
        let stats = Arc::new(PipelineStats::new());
        let runs = Arc::new(AtomicU32::new(0));
        let mut supervisor = Supervisor::new("test", Arc::clone(&stats));

        let counter = Arc::clone(&runs);
        supervisor.spawn("flaky", move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
            })
        });

        let (_tx, rx) = watch::channel(false);
        supervisor.run(rx).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(stats.snapshot().restarts, 2);
    }

    #[tokio::test]
    async fn test_no_restart_after_shutdown() {
        let stats = Arc::new(PipelineStats::new());
        let runs = Arc::new(AtomicU32::new(0));
        let mut supervisor = Supervisor::new("test", Arc::clone(&stats));

        let counter = Arc::clone(&runs);
        supervisor.spawn("doomed", move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            })
        });

        let (_tx, rx) = watch::channel(true);
        supervisor.run(rx).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(stats.snapshot().restarts, 0);
    }

    #[tokio::test]
    async fn test_clean_exit_not_restarted() {
        let stats = Arc::new(PipelineStats::new());
        let mut supervisor = Supervisor::new("test", Arc::clone(&stats));
        supervisor.spawn("once", || Box::pin(async {}));
        supervisor.spawn("twice", || Box::pin(async {}));
        assert_eq!(supervisor.running(), 2);

        let (_tx, rx) = watch::channel(false);
        supervisor.run(rx).await;
        assert_eq!(stats.snapshot().restarts, 0);
    }
}
