use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One unit of pool work: a table name plus the boxed future that exports it.
pub struct TableTask {
    pub id: u64,
    pub table: String,
    pub work: BoxFuture<'static, Result<(), String>>,
}

/// Pool-level record of one executed task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub id: u64,
    pub table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Bounded-concurrency executor for table tasks.
///
/// `start` spawns the fixed set of workers over one shared queue, so at no
/// point do more than `size` task bodies run concurrently. Workers keep
/// draining the queue after cancellation (cancelled task bodies return
/// quickly on their own) and exit once the queue is closed and empty.
pub struct WorkerPool {
    size: usize,
    queue_tx: Option<mpsc::UnboundedSender<TableTask>>,
    queue_rx: Option<mpsc::UnboundedReceiver<TableTask>>,
    workers: Vec<JoinHandle<()>>,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            size: size.max(1),
            queue_tx: Some(queue_tx),
            queue_rx: Some(queue_rx),
            workers: Vec::new(),
            outcomes: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently executing their bodies (point-in-time).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the workers. Call once, before the first `submit`.
    pub fn start(&mut self, ctx: CancellationToken) {
        let queue_rx = self
            .queue_rx
            .take()
            .expect("worker pool started more than once");
        let shared_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        for worker_idx in 0..self.size {
            let shared_rx = shared_rx.clone();
            let outcomes = self.outcomes.clone();
            let in_flight = self.in_flight.clone();
            let ctx = ctx.clone();
            self.workers.push(tokio::spawn(run_worker(
                worker_idx, shared_rx, outcomes, in_flight, ctx,
            )));
        }

        debug!(workers = self.size, "worker pool started");
    }

    /// Enqueue a task. Safe to call from multiple tasks concurrently; fails
    /// once `wait` has closed the queue.
    pub fn submit(&self, task: TableTask) -> Result<(), String> {
        match &self.queue_tx {
            Some(tx) => tx
                .send(task)
                .map_err(|_| "worker pool queue is closed".to_string()),
            None => Err("worker pool is already draining".to_string()),
        }
    }

    /// Signal end of submissions, wait for the queue to drain and all workers
    /// to exit, and return the per-task records.
    pub async fn wait(&mut self) -> Vec<TaskOutcome> {
        // Closing the sender lets workers run the queue dry and exit.
        self.queue_tx.take();

        for worker in self.workers.drain(..) {
            // Worker bodies don't panic; a join error would mean the runtime
            // tore them down underneath us.
            let _ = worker.await;
        }

        std::mem::take(&mut *self.outcomes.lock().unwrap())
    }
}

async fn run_worker(
    worker_idx: usize,
    shared_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TableTask>>>,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
    in_flight: Arc<AtomicUsize>,
    ctx: CancellationToken,
) {
    loop {
        let task = {
            let mut rx = shared_rx.lock().await;
            tokio::select! {
                task = rx.recv() => task,
                // Cancelled with an idle queue: pick up any stragglers and
                // exit instead of parking on recv forever.
                _ = ctx.cancelled() => rx.try_recv().ok(),
            }
        };
        let Some(task) = task else { break };

        trace!(worker_idx, table = %task.table, task_id = task.id, "task picked up");
        in_flight.fetch_add(1, Ordering::SeqCst);

        let started_at = Utc::now();
        let started = Instant::now();
        let error = task.work.await.err();
        let finished_at = Utc::now();

        in_flight.fetch_sub(1, Ordering::SeqCst);

        outcomes.lock().unwrap().push(TaskOutcome {
            id: task.id,
            table: task.table,
            started_at,
            finished_at,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        });
    }

    trace!(worker_idx, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn executes_all_tasks_with_bounded_concurrency() {
        let mut pool = WorkerPool::new(2);
        pool.start(CancellationToken::new());

        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            pool.submit(TableTask {
                id: i,
                table: format!("T{}", i),
                work: Box::pin(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }),
            })
            .unwrap();
        }

        let outcomes = pool.wait().await;
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn records_task_errors() {
        let mut pool = WorkerPool::new(1);
        pool.start(CancellationToken::new());

        pool.submit(TableTask {
            id: 1,
            table: "BROKEN".to_string(),
            work: Box::pin(async { Err("stream failed".to_string()) }),
        })
        .unwrap();

        let outcomes = pool.wait().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error.as_deref(), Some("stream failed"));
    }

    #[tokio::test]
    async fn submit_fails_after_wait() {
        let mut pool = WorkerPool::new(1);
        pool.start(CancellationToken::new());
        pool.wait().await;

        let rejected = pool.submit(TableTask {
            id: 1,
            table: "LATE".to_string(),
            work: Box::pin(async { Ok(()) }),
        });
        assert!(rejected.is_err());
    }
}
