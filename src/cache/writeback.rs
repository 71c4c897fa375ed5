//! Write-behind worker for post-response cache writes.
//!
//! The read path hands captured responses to a bounded queue and returns
//! immediately; a single task drains the queue and persists entries. When the
//! queue is full the write is dropped: the next request is simply another miss.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::entry::CachedResponse;
use super::service::CacheService;
use super::stats::METRIC_WRITE_DROPPED_TOTAL;
use super::tags::Tag;

const TARGET: &str = "tagcache::cache::writeback";

/// One captured response waiting to be stored.
#[derive(Debug, Clone)]
pub struct PersistJob {
    pub id: Uuid,
    pub key: String,
    pub response: CachedResponse,
    pub ttl: Duration,
    pub tags: Vec<Tag>,
}

impl PersistJob {
    pub fn new(key: String, response: CachedResponse, ttl: Duration, tags: Vec<Tag>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            response,
            ttl,
            tags,
        }
    }
}

enum WriteJob {
    Persist(PersistJob),
    /// Resolved once every job queued before it has been handled.
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WriteBehind {
    tx: mpsc::Sender<WriteJob>,
    dropped: Arc<AtomicU64>,
}

impl WriteBehind {
    /// Start the worker. It runs until every `WriteBehind` handle is dropped.
    pub fn spawn(service: Arc<CacheService>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Persist(job) => persist(&service, job).await,
                    WriteJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            info!(target = TARGET, "Write-behind worker stopped");
        });
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }

    /// Queue a job without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, job: PersistJob) -> bool {
        match self.tx.try_send(WriteJob::Persist(job)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(WriteJob::Persist(job))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_WRITE_DROPPED_TOTAL).increment(1);
                warn!(
                    target = TARGET,
                    job = %job.id,
                    key = %job.key,
                    "Write-behind queue full; dropping cache write"
                );
                false
            }
            Err(_) => {
                warn!(target = TARGET, "Write-behind worker gone; dropping cache write");
                false
            }
        }
    }

    /// Wait until everything submitted so far has been persisted (or failed).
    pub async fn flush(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriteJob::Flush(done)).await.is_err() {
            return false;
        }
        wait.await.is_ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[instrument(skip_all, fields(job = %job.id, key = %job.key))]
async fn persist(service: &CacheService, job: PersistJob) {
    let stored = service
        .set(&job.key, &job.response, job.ttl, &job.tags)
        .await;
    if stored {
        debug!(
            target = TARGET,
            ttl_secs = job.ttl.as_secs(),
            tags = job.tags.len(),
            "Response persisted"
        );
    } else {
        // The store adapter already logged the underlying failure.
        debug!(target = TARGET, "Response not persisted");
    }
}
