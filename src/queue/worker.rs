//! Worker pool over the durable queue.
//!
//! Each queue gets a bounded set of workers pulling one job at a time. The
//! handler's error kind decides the outcome: retryable errors go back through
//! the queue's retry path, everything else dead-letters immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Job, JobQueue};
use crate::error::SyncError;

const IDLE_POLL: Duration = Duration::from_millis(500);
const RECLAIM_EVERY: Duration = Duration::from_secs(30);

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), SyncError>;
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registrations: HashMap<String, Registration>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            registrations: HashMap::new(),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        self.registrations.insert(
            queue_name.to_string(),
            Registration {
                handler,
                concurrency: concurrency.max(1),
            },
        );
    }

    pub fn start(&mut self) {
        for (queue_name, registration) in &self.registrations {
            for slot in 0..registration.concurrency {
                let queue = self.queue.clone();
                let handler = registration.handler.clone();
                let name = queue_name.clone();
                let mut shutdown = self.shutdown_tx.subscribe();
                self.handles.push(tokio::spawn(async move {
                    worker_loop(queue, handler, name, slot, &mut shutdown).await;
                }));
            }
        }

        // One reclaim sweeper for the whole pool.
        let queue = self.queue.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RECLAIM_EVERY) => {
                        match queue.reclaim_expired() {
                            Ok(0) => {}
                            Ok(n) => warn!(reclaimed = n, "Reclaimed expired job leases"),
                            Err(e) => error!(error = %e, "Lease reclaim failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        info!(
            queues = self.registrations.len(),
            workers = self.handles.len().saturating_sub(1),
            "Worker pool started"
        );
    }

    /// Signal shutdown and wait for in-flight jobs to drain.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Worker pool drained");
    }
}

async fn worker_loop(
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    queue_name: String,
    slot: usize,
    shutdown: &mut watch::Receiver<bool>,
) {
    debug!(queue = %queue_name, slot, "Worker online");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = match queue.fetch_next(&queue_name) {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => continue,
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                error!(queue = %queue_name, error = %e, "Job fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let started = std::time::Instant::now();
        match handler.handle(&job).await {
            Ok(()) => {
                if let Err(e) = queue.complete(&job.id) {
                    error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
                debug!(
                    job_id = %job.id,
                    queue = %queue_name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) if e.is_gate_block() => {
                // Not an error to retry: the order waits for a payment event
                // or the scheduled sweep to re-enqueue it.
                if let Err(err) = queue.complete(&job.id) {
                    error!(job_id = %job.id, error = %err, "Failed to settle gate-blocked job");
                }
                info!(job_id = %job.id, queue = %queue_name, reason = %e, "Job blocked by payment gate");
            }
            Err(e) if e.is_retryable() => {
                let outcome = match queue.fail(&job.id, &e.to_string()) {
                    Ok(state) => state.as_str(),
                    Err(err) => {
                        error!(job_id = %job.id, error = %err, "Failed to record job failure");
                        "unknown"
                    }
                };
                warn!(
                    job_id = %job.id,
                    queue = %queue_name,
                    retry_count = job.retry_count,
                    error = %e,
                    outcome,
                    "Job failed, retry scheduled"
                );
            }
            Err(e) => {
                if let Err(err) = queue.fail_terminal(&job.id, &e.to_string()) {
                    error!(job_id = %job.id, error = %err, "Failed to dead-letter job");
                }
                error!(job_id = %job.id, queue = %queue_name, error = %e, "Job failed permanently");
            }
        }
    }
    debug!(queue = %queue_name, slot, "Worker offline");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobOptions, JobState, ORDER_SYNC_TO_FFN};
    use crate::store::Database;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail_with: Option<fn() -> SyncError>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }
    }

    async fn wait_for_state(queue: &JobQueue, job_id: &str, state: JobState) {
        for _ in 0..100 {
            if queue.get_job(job_id).unwrap().unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never reached {state:?}");
    }

    #[tokio::test]
    async fn completes_jobs() {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db).unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });

        let mut pool = WorkerPool::new(queue.clone());
        pool.register(ORDER_SYNC_TO_FFN, 2, handler.clone());
        pool.start();

        let id = queue
            .enqueue(ORDER_SYNC_TO_FFN, json!({"order_id": "o1"}), JobOptions::default())
            .unwrap()
            .unwrap();

        wait_for_state(&queue, &id, JobState::Completed).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn non_retryable_errors_dead_letter_immediately() {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db).unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| SyncError::Validation("bad payload".into())),
        });

        let mut pool = WorkerPool::new(queue.clone());
        pool.register(ORDER_SYNC_TO_FFN, 1, handler.clone());
        pool.start();

        let id = queue
            .enqueue(
                ORDER_SYNC_TO_FFN,
                json!({}),
                JobOptions {
                    retry_limit: 5,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        wait_for_state(&queue, &id, JobState::Failed).await;
        // Retry budget untouched: exactly one attempt.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let job = queue.get_job(&id).unwrap().unwrap();
        assert_eq!(job.retry_count, 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn gate_blocked_jobs_settle_without_retry() {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db).unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| SyncError::BlockedByPaymentGate {
                reason: "payment_status=pending".into(),
            }),
        });

        let mut pool = WorkerPool::new(queue.clone());
        pool.register(ORDER_SYNC_TO_FFN, 1, handler.clone());
        pool.start();

        let id = queue
            .enqueue(ORDER_SYNC_TO_FFN, json!({}), JobOptions::default())
            .unwrap()
            .unwrap();

        wait_for_state(&queue, &id, JobState::Completed).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn retryable_errors_go_back_to_pending() {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db).unwrap());
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| SyncError::FfnApi {
                status: 503,
                body: "unavailable".into(),
            }),
        });

        let mut pool = WorkerPool::new(queue.clone());
        pool.register(ORDER_SYNC_TO_FFN, 1, handler.clone());
        pool.start();

        let id = queue
            .enqueue(
                ORDER_SYNC_TO_FFN,
                json!({}),
                JobOptions {
                    retry_limit: 3,
                    retry_delay_secs: 3600,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        // One attempt, then parked an hour out.
        for _ in 0..100 {
            let job = queue.get_job(&id).unwrap().unwrap();
            if job.retry_count == 1 && job.state == JobState::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let job = queue.get_job(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        pool.stop().await;
    }
}
