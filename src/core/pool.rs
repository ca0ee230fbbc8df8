/*!
 * Worker pool for part transfers
 *
 * A scheduler task feeds every part into a work queue sized to the part
 * count and then closes it. `workers` tasks pull from the queue until it is
 * empty, run the per-part transfer and push one [`PartOutcome`] per part onto
 * the result channel. Results arrive in completion order, not index order.
 *
 * Cancellation is cooperative: after [`PoolRun::cancel`] workers stop pulling
 * new parts, but a transfer already in flight runs to completion and still
 * reports its outcome.
 */

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::core::partition::Part;
use crate::error::{TransferError, TransferResult};

/// Callback run by a worker right before a part is transferred
///
/// An error returned here becomes the outcome of that part, which makes the
/// hook a seam for fault injection and per-part instrumentation.
pub type PartHook = Arc<dyn Fn(&Part) -> TransferResult<()> + Send + Sync>;

/// The per-part transfer operation
#[async_trait]
pub trait PartWorker: Send + Sync + 'static {
    /// Value produced by a successful part transfer
    type Output: Send + 'static;

    /// Transfer one part
    async fn transfer(&self, part: &Part) -> TransferResult<Self::Output>;
}

/// Result of one part transfer
#[derive(Debug)]
pub struct PartOutcome<T> {
    /// The part that was transferred
    pub part: Part,

    /// Transfer output or the failure
    pub result: TransferResult<T>,
}

/// Fixed-size pool of part workers
#[derive(Clone)]
pub struct WorkerPool {
    workers: usize,
    hook: Option<PartHook>,
}

impl WorkerPool {
    /// Pool running `workers` concurrent workers (at least one)
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            hook: None,
        }
    }

    /// Run `hook` before every part transfer
    pub fn with_hook(mut self, hook: Option<PartHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Number of workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start transferring `parts` with `worker`
    ///
    /// Must be called within a tokio runtime.
    pub fn run<W: PartWorker>(&self, parts: Vec<Part>, worker: Arc<W>) -> PoolRun<W::Output> {
        let capacity = parts.len().max(1);
        let (work_tx, work_rx) = mpsc::channel::<Part>(capacity);
        let (result_tx, result_rx) = mpsc::channel::<PartOutcome<W::Output>>(capacity);
        let queue = Arc::new(Mutex::new(work_rx));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(schedule(parts, work_tx));

        for id in 0..self.workers {
            tasks.spawn(work(
                id,
                queue.clone(),
                result_tx.clone(),
                worker.clone(),
                self.hook.clone(),
                cancel.clone(),
            ));
        }

        PoolRun {
            results: result_rx,
            cancel,
            tasks,
        }
    }
}

async fn schedule(parts: Vec<Part>, work_tx: mpsc::Sender<Part>) {
    for part in parts {
        // Only fails once every worker is gone.
        if work_tx.send(part).await.is_err() {
            break;
        }
    }
}

async fn work<W: PartWorker>(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Part>>>,
    results: mpsc::Sender<PartOutcome<W::Output>>,
    worker: Arc<W>,
    hook: Option<PartHook>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            trace!(worker = id, "Worker cancelled");
            break;
        }

        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                part = queue.recv() => part,
            }
        };
        let Some(part) = next else {
            break;
        };

        debug!(worker = id, part = part.index, bytes = part.len(), "Transferring part");
        let result = match &hook {
            Some(hook) => match hook(&part) {
                Ok(()) => worker.transfer(&part).await,
                Err(e) => Err(e),
            },
            None => worker.transfer(&part).await,
        };

        if results.send(PartOutcome { part, result }).await.is_err() {
            break;
        }
    }
}

/// Handle on a running pool
pub struct PoolRun<T> {
    results: mpsc::Receiver<PartOutcome<T>>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl<T> PoolRun<T> {
    /// Next part outcome, `None` once every worker has stopped
    pub async fn next(&mut self) -> Option<PartOutcome<T>> {
        self.results.recv().await
    }

    /// Stop handing out parts; in-flight transfers still finish
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel, discard undelivered outcomes and wait for every task to exit
    pub async fn shutdown(mut self) -> TransferResult<()> {
        self.cancel();
        self.results.close();
        while self.results.recv().await.is_some() {}
        self.join().await
    }

    /// Wait for every task to exit, reporting the first panicked task
    pub async fn join(mut self) -> TransferResult<()> {
        let mut first_error: Option<TransferError> = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if first_error.is_none() {
                    first_error = Some(TransferError::from(e));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::partition::partition;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoWorker {
        calls: AtomicUsize,
        fail_index: Option<usize>,
        delay: Duration,
    }

    impl EchoWorker {
        fn new(fail_index: Option<usize>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_index,
                delay,
            })
        }
    }

    #[async_trait]
    impl PartWorker for EchoWorker {
        type Output = u64;

        async fn transfer(&self, part: &Part) -> TransferResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if Some(part.index) == self.fail_index {
                return Err(TransferError::Network(format!("part {} failed", part.index)));
            }
            Ok(part.len())
        }
    }

    #[tokio::test]
    async fn test_all_parts_complete() {
        let parts = partition(0, 999, 100).unwrap();
        let worker = EchoWorker::new(None, Duration::from_millis(1));
        let mut run = WorkerPool::new(4).run(parts, worker.clone());

        let mut seen = HashSet::new();
        let mut bytes = 0;
        while let Some(outcome) = run.next().await {
            bytes += outcome.result.unwrap();
            assert!(seen.insert(outcome.part.index));
        }
        run.join().await.unwrap();

        assert_eq!(seen.len(), 10);
        assert_eq!(bytes, 1000);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_more_workers_than_parts() {
        let parts = partition(0, 9, 5).unwrap();
        let worker = EchoWorker::new(None, Duration::ZERO);
        let mut run = WorkerPool::new(16).run(parts, worker);

        let mut count = 0;
        while run.next().await.is_some() {
            count += 1;
        }
        run.join().await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_empty_plan() {
        let worker = EchoWorker::new(None, Duration::ZERO);
        let mut run = WorkerPool::new(3).run(Vec::new(), worker);
        assert!(run.next().await.is_none());
        run.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_new_work() {
        let parts = partition(0, 999, 100).unwrap();
        let worker = EchoWorker::new(Some(0), Duration::from_millis(20));
        let mut run = WorkerPool::new(1).run(parts, worker.clone());

        let first = run.next().await.unwrap();
        assert_eq!(first.part.index, 0);
        assert!(first.result.is_err());
        run.cancel();
        assert!(run.is_cancelled());

        let mut drained = 0;
        while let Some(outcome) = run.next().await {
            // The part in flight when cancel fired still finishes.
            assert!(outcome.result.is_ok());
            drained += 1;
        }
        run.join().await.unwrap();

        assert!(drained <= 1);
        assert!(worker.calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_hook_failure_becomes_outcome() {
        let parts = partition(0, 299, 100).unwrap();
        let worker = EchoWorker::new(None, Duration::ZERO);
        let hook: PartHook = Arc::new(|part: &Part| {
            if part.index == 1 {
                Err(TransferError::Network("injected".to_string()))
            } else {
                Ok(())
            }
        });
        let mut run = WorkerPool::new(2).with_hook(Some(hook)).run(parts, worker.clone());

        let mut failed = Vec::new();
        while let Some(outcome) = run.next().await {
            if outcome.result.is_err() {
                failed.push(outcome.part.index);
            }
        }
        run.join().await.unwrap();

        assert_eq!(failed, vec![1]);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_workers() {
        let parts = partition(0, 999, 10).unwrap();
        let worker = EchoWorker::new(None, Duration::from_millis(5));
        let mut run = WorkerPool::new(3).run(parts, worker.clone());

        run.next().await.unwrap();
        run.shutdown().await.unwrap();

        let calls = worker.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(worker.calls.load(Ordering::SeqCst), calls);
        assert!(calls < 100);
    }
}
