//! Worker pool with a global parallelism limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;

use crate::config::SagaConfig;
use crate::dispatcher::SagaDispatcher;
use crate::error::Result;
use crate::transport::MessageSource;

/// Pulls messages from a [`MessageSource`] and dispatches them.
///
/// `workers` tasks receive in parallel. Each one takes a permit from a
/// shared semaphore before it receives and hands the permit to the spawned
/// dispatch, so at most `max_parallelism` dispatches are in flight across
/// the pool. At capacity, workers wait for a permit instead of dropping
/// messages.
///
/// Dropping the pool without calling [`SagaWorkerPool::shutdown`] stops the
/// workers but does not wait for in-flight dispatches.
pub struct SagaWorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    limiter: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    max_parallelism: u32,
}

impl SagaWorkerPool {
    /// Validates `config` and starts the workers on the current runtime.
    pub fn start(
        config: &SagaConfig,
        source: Arc<dyn MessageSource>,
        dispatcher: Arc<SagaDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let max_parallelism = u32::try_from(config.max_parallelism).map_err(|_| {
            crate::SagaError::Configuration("max_parallelism must fit in u32".into())
        })?;

        let limiter = Arc::new(Semaphore::new(config.max_parallelism));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (shutdown, signal) = watch::channel(false);

        let workers = (0..config.workers)
            .map(|worker| {
                tokio::spawn(run_worker(Worker {
                    id: worker,
                    source: Arc::clone(&source),
                    dispatcher: Arc::clone(&dispatcher),
                    limiter: Arc::clone(&limiter),
                    in_flight: Arc::clone(&in_flight),
                    shutdown: signal.clone(),
                }))
            })
            .collect();

        tracing::info!(
            workers = config.workers,
            max_parallelism = config.max_parallelism,
            pessimistic_locking = config.pessimistic_locking,
            lock_max_wait_ms = config.lock_max_wait.as_millis() as u64,
            "saga worker pool started"
        );

        Ok(Self {
            shutdown,
            workers,
            limiter,
            in_flight,
            max_parallelism,
        })
    }

    /// Dispatches currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stops receiving and waits for in-flight dispatches to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.drain().await;
    }

    /// Waits for the workers to stop on their own (the source was closed),
    /// then for in-flight dispatches to finish.
    pub async fn join(self) {
        self.drain().await;
    }

    async fn drain(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "saga worker task failed");
            }
        }
        // Every permit back in the semaphore means no dispatch is running.
        match self.limiter.acquire_many(self.max_parallelism).await {
            Ok(_all) => tracing::info!("saga worker pool drained"),
            Err(e) => tracing::error!(error = %e, "saga worker pool limiter closed"),
        }
    }
}

impl std::fmt::Debug for SagaWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaWorkerPool")
            .field("workers", &self.workers.len())
            .field("max_parallelism", &self.max_parallelism)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct Worker {
    id: usize,
    source: Arc<dyn MessageSource>,
    dispatcher: Arc<SagaDispatcher>,
    limiter: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    shutdown: watch::Receiver<bool>,
}

async fn run_worker(mut worker: Worker) {
    tracing::debug!(worker = worker.id, "saga worker started");
    loop {
        let permit = tokio::select! {
            biased;
            _ = worker.shutdown.changed() => break,
            permit = Arc::clone(&worker.limiter).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            biased;
            _ = worker.shutdown.changed() => break,
            delivery = worker.source.receive() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let source = Arc::clone(&worker.source);
        let dispatcher = Arc::clone(&worker.dispatcher);
        let in_flight = InFlight::enter(&worker.in_flight, permit);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            match dispatcher.dispatch(&delivery.message).await {
                Ok(_) => source.ack(delivery).await,
                Err(e) => source.nack(delivery, &e).await,
            }
        });
    }
    tracing::debug!(worker = worker.id, "saga worker stopped");
}

/// Holds a limiter permit and the in-flight count for one dispatch.
struct InFlight {
    counter: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>, permit: OwnedSemaphorePermit) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
