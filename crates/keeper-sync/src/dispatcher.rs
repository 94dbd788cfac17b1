//! Fixed-size worker pool for per-file network operations.
//!
//! Workers pull [`Job`]s from one bounded intake channel, run the injected
//! processor and push a [`JobResult`] onto their own result channel. A fan-in
//! task merges every worker's results into the single receiver handed back by
//! [`WorkDispatcher::spawn`]. Every accepted job yields exactly one result;
//! order across workers is arrival order.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use keeper_core::{KeeperError, KeeperResult};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One unit of work: a file key owned by a user.
#[derive(Debug, Clone)]
pub struct Job {
    pub key: String,
    pub owner: String,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn new(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug)]
pub struct JobResult {
    pub key: String,
    pub owner: String,
    pub outcome: KeeperResult<()>,
}

pub struct WorkDispatcher {
    intake: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkDispatcher {
    /// Start `workers` workers (at least one) sharing an intake of
    /// `capacity` pending jobs.
    pub fn spawn<F, Fut>(
        workers: usize,
        capacity: usize,
        processor: F,
    ) -> (Self, mpsc::UnboundedReceiver<JobResult>)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KeeperResult<()>> + Send + 'static,
    {
        let workers = workers.max(1);
        let (intake_tx, intake_rx) = mpsc::channel::<Job>(capacity.max(1));
        let intake_rx = Arc::new(Mutex::new(intake_rx));
        let processor = Arc::new(processor);

        let mut handles = Vec::with_capacity(workers + 1);
        let mut per_worker = StreamMap::new();
        for id in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            per_worker.insert(id, UnboundedReceiverStream::new(rx));
            handles.push(tokio::spawn(worker(
                id,
                intake_rx.clone(),
                processor.clone(),
                tx,
            )));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        handles.push(tokio::spawn(fan_in(per_worker, out_tx)));

        debug!(workers, capacity, "work dispatcher started");
        (
            Self {
                intake: Mutex::new(Some(intake_tx)),
                handles,
            },
            out_rx,
        )
    }

    /// Enqueue a job, waiting while the intake is full.
    ///
    /// Fails with `DispatcherClosed` once [`close`](Self::close) has been called.
    pub async fn add_work(&self, job: Job) -> KeeperResult<()> {
        let sender = self
            .intake
            .lock()
            .await
            .clone()
            .ok_or(KeeperError::DispatcherClosed)?;
        sender
            .send(job)
            .await
            .map_err(|_| KeeperError::DispatcherClosed)
    }

    /// Stop accepting jobs. Already enqueued jobs still run; workers and the
    /// fan-in exit once the intake drains.
    pub async fn close(&self) {
        if self.intake.lock().await.take().is_some() {
            debug!("work dispatcher closed");
        }
    }

    /// Close and wait for every worker and the fan-in to finish.
    pub async fn shutdown(self) {
        self.close().await;
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("dispatcher task failed: {e}");
            }
        }
    }
}

async fn worker<F, Fut>(
    id: usize,
    intake: Arc<Mutex<mpsc::Receiver<Job>>>,
    processor: Arc<F>,
    results: mpsc::UnboundedSender<JobResult>,
) where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = KeeperResult<()>> + Send + 'static,
{
    loop {
        // Holding the lock across recv hands each job to exactly one worker.
        let Some(job) = intake.lock().await.recv().await else {
            break;
        };

        let key = job.key.clone();
        let owner = job.owner.clone();
        let cancel = job.cancel.clone();

        let outcome = if cancel.is_cancelled() {
            Err(KeeperError::Cancelled)
        } else {
            let run = AssertUnwindSafe(processor(job)).catch_unwind();
            tokio::select! {
                _ = cancel.cancelled() => Err(KeeperError::Cancelled),
                res = run => res.unwrap_or_else(|_| {
                    Err(KeeperError::Other(anyhow::anyhow!("job {key} panicked")))
                }),
            }
        };

        debug!(worker = id, key = %key, ok = outcome.is_ok(), "job finished");
        if results
            .send(JobResult {
                key,
                owner,
                outcome,
            })
            .is_err()
        {
            // Result receiver dropped; nobody is listening any more.
            break;
        }
    }
}

async fn fan_in(
    mut per_worker: StreamMap<usize, UnboundedReceiverStream<JobResult>>,
    out: mpsc::UnboundedSender<JobResult>,
) {
    while let Some((_, result)) = per_worker.next().await {
        if out.send(result).is_err() {
            break;
        }
    }
}
