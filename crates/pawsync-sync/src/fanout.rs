//! Downstream notification: reindex and image-processing jobs.

use pawsync_core::{ImageProcessingJob, QueueSendError, ReindexJob, IMAGE_QUEUE, REINDEX_QUEUE};
use pawsync_storage::{encode_batch, JobQueue};
use serde::Serialize;
use tracing::{debug, warn};

/// Jobs collected during one run, sent once the run's writes are done.
#[derive(Debug, Default)]
pub struct FanOut {
    pub reindex: Vec<ReindexJob>,
    pub images: Vec<ImageProcessingJob>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub reindex_jobs: usize,
    pub reindex_sends: usize,
    pub image_jobs: usize,
    pub image_sends: usize,
    pub failures: Vec<String>,
}

impl FanOut {
    pub fn is_empty(&self) -> bool {
        self.reindex.is_empty() && self.images.is_empty()
    }

    /// Sends everything in chunks of at most `batch_size`. A failed chunk is
    /// reported and the remaining chunks are still attempted.
    pub async fn flush(self, queue: &dyn JobQueue, batch_size: usize) -> FanOutReport {
        let mut report = FanOutReport {
            reindex_jobs: self.reindex.len(),
            image_jobs: self.images.len(),
            ..Default::default()
        };
        let (sends, failures) = send_batched(queue, REINDEX_QUEUE, &self.reindex, batch_size).await;
        report.reindex_sends = sends;
        report.failures.extend(failures.into_iter().map(|e| e.to_string()));

        let (sends, failures) = send_batched(queue, IMAGE_QUEUE, &self.images, batch_size).await;
        report.image_sends = sends;
        report.failures.extend(failures.into_iter().map(|e| e.to_string()));
        report
    }
}

/// Returns the number of sends attempted and the ones that failed.
pub async fn send_batched<T: Serialize>(
    queue: &dyn JobQueue,
    name: &str,
    jobs: &[T],
    batch_size: usize,
) -> (usize, Vec<QueueSendError>) {
    let mut sends = 0;
    let mut failures = Vec::new();
    for chunk in jobs.chunks(batch_size.max(1)) {
        sends += 1;
        let result = match encode_batch(name, chunk) {
            Ok(payloads) => queue.send_batch(name, payloads).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => debug!(queue = name, size = chunk.len(), "sent batch"),
            Err(err) => {
                warn!(queue = name, size = chunk.len(), error = %err, "batch send failed");
                failures.push(err);
            }
        }
    }
    (sends, failures)
}
