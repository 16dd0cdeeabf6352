//! Background mirror propagation
//!
//! Jobs go through a bounded channel to a fixed pool of worker tasks. A
//! failing batch is retried with backoff; once the retry budget is spent the
//! job is abandoned, logged, and kept in a registry keyed by whisper id, job
//! kind and revision. Callers never see mirror failures.

use super::propagation::MirrorJob;
use super::retry::RetryPolicy;
use crate::config::MirrorConfig;
use crate::graph::{BatchOutcome, MirrorBatch};
use crate::model::WhisperId;
use crate::storage::MirrorStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Snapshot of propagation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PropagationStats {
    /// Jobs accepted onto the queue
    pub submitted: u64,
    /// Jobs where at least one batch changed the mirror
    pub applied: u64,
    /// Jobs where every batch was skipped by a guard or tombstone
    pub stale: u64,
    /// Individual batch retries
    pub retried: u64,
    pub abandoned: u64,
    /// Jobs refused because the queue was shut down
    pub dropped: u64,
}

/// A job that exhausted its retries.
#[derive(Debug, Clone)]
pub struct AbandonedJob {
    pub job: MirrorJob,
    pub attempts: u32,
    pub error: String,
    pub abandoned_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PropagationStats {
        PropagationStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Registry key: one entry per distinct job, so an abandoned tag resync
/// never hides an abandoned full sync of the same whisper.
type AbandonedKey = (WhisperId, &'static str, Option<u64>);

fn abandoned_key(job: &MirrorJob) -> AbandonedKey {
    (job.whisper_id().clone(), job.kind(), job.revision())
}

enum JobOutcome {
    Applied,
    Stale,
    Abandoned,
}

/// State shared between the queue handle and its workers.
struct Shared {
    mirror: Arc<dyn MirrorStore>,
    retry: RetryPolicy,
    in_flight: AtomicUsize,
    idle: Notify,
    counters: Counters,
    abandoned: DashMap<AbandonedKey, AbandonedJob>,
}

impl Shared {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn drop_job(&self, job: &MirrorJob) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            whisper_id = %job.whisper_id(),
            job = job.kind(),
            "propagation queue closed, job dropped"
        );
    }

    /// Send on a full queue. Runs as its own task.
    async fn send_waiting(self: Arc<Self>, sender: mpsc::Sender<MirrorJob>, job: MirrorJob) {
        match sender.send(job).await {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::SendError(job)) => {
                self.finish_one();
                self.drop_job(&job);
            }
        }
    }

    async fn process(&self, job: MirrorJob) {
        let outcome = self.run_job(&job).await;
        match outcome {
            JobOutcome::Applied => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Stale => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
            }
            JobOutcome::Abandoned => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn run_job(&self, job: &MirrorJob) -> JobOutcome {
        let mut any_applied = false;
        for batch in job.batches() {
            match self.run_batch(job, batch).await {
                Ok(BatchOutcome::Applied) => any_applied = true,
                Ok(BatchOutcome::Stale) => {
                    debug!(
                        whisper_id = %job.whisper_id(),
                        job = job.kind(),
                        revision = ?job.revision(),
                        "mirror batch stale, skipped"
                    );
                }
                Err((attempts, e)) => {
                    error!(
                        whisper_id = %job.whisper_id(),
                        job = job.kind(),
                        revision = ?job.revision(),
                        attempt = attempts,
                        error = %e,
                        "mirror propagation abandoned"
                    );
                    self.abandoned.insert(
                        abandoned_key(job),
                        AbandonedJob {
                            job: job.clone(),
                            attempts,
                            error: e,
                            abandoned_at: Utc::now(),
                        },
                    );
                    return JobOutcome::Abandoned;
                }
            }
        }

        if any_applied {
            debug!(
                whisper_id = %job.whisper_id(),
                job = job.kind(),
                revision = ?job.revision(),
                "mirror propagation applied"
            );
            JobOutcome::Applied
        } else {
            JobOutcome::Stale
        }
    }

    /// Execute one batch until it succeeds or the policy gives up.
    /// On failure returns the number of attempts made and the last error.
    async fn run_batch(
        &self,
        job: &MirrorJob,
        batch: MirrorBatch,
    ) -> Result<BatchOutcome, (u32, String)> {
        let mut attempt = 1;
        loop {
            match self.mirror.execute(batch.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        whisper_id = %job.whisper_id(),
                        job = job.kind(),
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "mirror batch failed, retrying"
                    );
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e.to_string())),
            }
        }
    }
}

/// Bounded queue plus worker pool feeding a mirror store.
pub struct PropagationQueue {
    sender: Mutex<Option<mpsc::Sender<MirrorJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl PropagationQueue {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(mirror: Arc<dyn MirrorStore>, config: &MirrorConfig) -> Self {
        let (tx, rx) = mpsc::channel::<MirrorJob>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(Shared {
            mirror,
            retry: config.retry.clone(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            counters: Counters::default(),
            abandoned: DashMap::new(),
        });

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver lock only while waiting for a job
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        shared.process(job).await;
                        shared.finish_one();
                    }
                    debug!(worker, "propagation worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity.max(1),
            partition = %shared.mirror.partition(),
            "propagation queue started"
        );

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shared,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<MirrorJob>> {
        self.sender.lock().ok().and_then(|guard| guard.clone())
    }

    /// Enqueue a job. Waits while the queue is full. After shutdown the job
    /// is dropped with a warning.
    ///
    /// Once called, the job reaches a worker even if the caller's future is
    /// dropped while waiting: the blocked send runs in a spawned task.
    pub async fn submit(&self, job: MirrorJob) {
        let Some(sender) = self.sender() else {
            self.shared.drop_job(&job);
            return;
        };

        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let job = match sender.try_send(job) {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.shared.finish_one();
                self.shared.drop_job(&job);
                return;
            }
            Err(mpsc::error::TrySendError::Full(job)) => job,
        };

        let handoff = tokio::spawn(Arc::clone(&self.shared).send_waiting(sender, job));
        if let Err(e) = handoff.await {
            warn!(error = %e, "propagation hand-off task failed");
        }
    }

    /// Wait until every accepted job has been applied, skipped, or
    /// abandoned.
    pub async fn drain(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent notify is not missed
            notified.as_mut().enable();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drain, close the queue, and join the workers. Safe to call twice.
    pub async fn shutdown(&self) -> PropagationStats {
        self.drain().await;

        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);

        let workers = self
            .workers
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "propagation worker panicked");
            }
        }

        let stats = self.stats();
        info!(
            applied = stats.applied,
            stale = stats.stale,
            abandoned = stats.abandoned,
            "propagation queue shut down"
        );
        stats
    }

    pub fn stats(&self) -> PropagationStats {
        self.shared.counters.snapshot()
    }

    /// Jobs currently recorded as abandoned, oldest first.
    pub fn abandoned(&self) -> Vec<AbandonedJob> {
        let mut jobs: Vec<AbandonedJob> = self
            .shared
            .abandoned
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|j| j.abandoned_at);
        jobs
    }

    /// Move every abandoned job back onto the queue. Returns how many were
    /// resubmitted.
    pub async fn requeue_abandoned(&self) -> usize {
        let mut entries: Vec<(AbandonedKey, DateTime<Utc>)> = self
            .shared
            .abandoned
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().abandoned_at))
            .collect();
        entries.sort_by_key(|(_, at)| *at);

        let mut count = 0;
        for (key, _) in entries {
            if let Some((_, entry)) = self.shared.abandoned.remove(&key) {
                self.submit(entry.job).await;
                count += 1;
            }
        }
        count
    }
}
