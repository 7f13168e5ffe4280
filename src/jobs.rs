//! Bounded background worker pool for public-knowledge ingestion.
//!
//! Public uploads return immediately; the pipeline runs on a fixed set of
//! workers draining a bounded queue. Enqueueing past the queue depth fails
//! fast so callers see backpressure instead of unbounded task spawning.
//! Job progress is observable through batch status polling; there is no
//! cancellation — a started job runs to completion or failure.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::loader::FileKind;

/// One queued public ingestion. Bytes are not carried here: workers read
/// them back from the stored file, which is also what makes re-enqueueing
/// a stalled batch possible.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub batch_id: String,
    pub stored_file_id: String,
    pub filename: String,
    pub kind: FileKind,
    pub uploader: String,
}

/// Executes one job to its terminal batch status.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: IngestJob);
}

pub struct JobQueue {
    tx: mpsc::Sender<IngestJob>,
    workers: Vec<JoinHandle<()>>,
}

impl JobQueue {
    pub fn start(workers: usize, depth: usize, runner: Arc<dyn JobRunner>) -> Self {
        let (tx, rx) = mpsc::channel::<IngestJob>(depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        match job {
                            Some(job) => {
                                info!(worker, batch_id = %job.batch_id, file = %job.filename, "ingestion job started");
                                runner.run(job).await;
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers: handles,
        }
    }

    /// Submit a job without waiting. Errors when the queue is full
    /// (backpressure) or shut down.
    pub fn enqueue(&self, job: IngestJob) -> Result<()> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => {
                anyhow::anyhow!("ingestion queue is full, rejecting batch {}", job.batch_id)
            }
            mpsc::error::TrySendError::Closed(job) => {
                anyhow::anyhow!("ingestion queue is shut down, rejecting batch {}", job.batch_id)
            }
        })
    }

    /// Stop accepting jobs, drain the queue, and join the workers.
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}
