//! Background deletion of stored photos, decoupled from whatever triggered
//! it. Failures surface on a separate channel and never reach the caller.

use std::sync::Arc;

use pawsync_storage::BlobStore;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CleanupTask {
    pub listing_id: Uuid,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub listing_id: Uuid,
    pub key: String,
    pub cause: String,
}

pub struct PhotoCleanupPool {
    tasks: mpsc::Sender<CleanupTask>,
    workers: Vec<JoinHandle<()>>,
}

impl PhotoCleanupPool {
    /// Starts `workers` tasks draining a queue of `capacity` pending
    /// cleanups. The receiver yields every failed deletion.
    pub fn spawn(
        blobs: Arc<dyn BlobStore>,
        workers: usize,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<CleanupFailure>) {
        let (task_tx, task_rx) = mpsc::channel::<CleanupTask>(capacity.max(1));
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let task_rx = Arc::new(Mutex::new(task_rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let blobs = blobs.clone();
                let task_rx = task_rx.clone();
                let failure_tx = failure_tx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = task_rx.lock().await.recv().await;
                        let Some(task) = next else { break };
                        for key in &task.keys {
                            match blobs.delete(key).await {
                                Ok(existed) => {
                                    debug!(worker, listing_id = %task.listing_id, key = %key, existed, "photo deleted")
                                }
                                Err(err) => {
                                    warn!(worker, listing_id = %task.listing_id, key = %key, error = %err, "photo cleanup failed");
                                    let _ = failure_tx.send(CleanupFailure {
                                        listing_id: task.listing_id,
                                        key: key.clone(),
                                        cause: format!("{err:#}"),
                                    });
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        (
            Self {
                tasks: task_tx,
                workers: handles,
            },
            failure_rx,
        )
    }

    /// Queues a cleanup without waiting for it. Returns `false` when the
    /// queue is full or the pool has stopped.
    pub fn submit(&self, task: CleanupTask) -> bool {
        if task.keys.is_empty() {
            return true;
        }
        match self.tasks.try_send(task) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "photo cleanup not queued");
                false
            }
        }
    }

    /// Stops accepting work and waits for queued cleanups to finish.
    pub async fn shutdown(self) {
        drop(self.tasks);
        for handle in self.workers {
            let _ = handle.await;
        }
    }
}
