//! Queue consumer pool for inbound scrape requests.
//!
//! A message is acked when its run completes or fails in a way retrying
//! cannot fix. Retryable failures leave it unacked so it reappears once its
//! visibility window lapses.

use std::sync::Arc;
use std::time::Duration;

use pawsync_core::{ScrapeRequest, SCRAPE_QUEUE};
use pawsync_storage::{JobQueue, QueueMessage};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::engine::ReconciliationEngine;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub visibility: Duration,
    pub max_attempts: u32,
    /// Sleep between polls of an empty queue.
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility: Duration::from_secs(900),
            max_attempts: 5,
            idle_poll: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    /// Acked without a successful run.
    Rejected,
    /// Left for redelivery.
    Retry,
}

pub struct WorkerPool {
    engine: Arc<ReconciliationEngine>,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            queue,
            config,
        }
    }

    /// Runs until `shutdown` flips to `true`. In-flight runs are finished
    /// before this returns.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut set = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            let engine = self.engine.clone();
            let queue = self.queue.clone();
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            set.spawn(async move { consume(worker, engine, queue, config, shutdown).await });
        }
        info!(workers = self.config.workers.max(1), "worker pool started");
        while let Some(joined) = set.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn consume(
    worker: usize,
    engine: Arc<ReconciliationEngine>,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let messages = match queue.receive(SCRAPE_QUEUE, 1, config.visibility).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(worker, error = %err, "receive failed");
                Vec::new()
            }
        };
        if messages.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(config.idle_poll) => {}
            }
            continue;
        }
        for message in messages {
            let disposition = handle_message(&engine, queue.as_ref(), &message, config.max_attempts).await;
            debug!(worker, message_id = %message.id, ?disposition, "message handled");
        }
    }
}

/// Processes one delivery and acks it unless it should be retried.
pub async fn handle_message(
    engine: &ReconciliationEngine,
    queue: &dyn JobQueue,
    message: &QueueMessage,
    max_attempts: u32,
) -> Disposition {
    let disposition = if message.attempts > max_attempts {
        error!(
            message_id = %message.id,
            attempts = message.attempts,
            "dropping scrape request after too many deliveries"
        );
        Disposition::Rejected
    } else {
        match message.decode::<ScrapeRequest>() {
            Err(err) => {
                error!(message_id = %message.id, error = %err, "malformed scrape request");
                Disposition::Rejected
            }
            Ok(request) => match engine.run(&request).await {
                Ok(_) => Disposition::Completed,
                Err(err) if err.is_retryable() => {
                    warn!(
                        message_id = %message.id,
                        shelter = %request.shelter_slug,
                        attempts = message.attempts,
                        error = %err,
                        "run failed; leaving request for redelivery"
                    );
                    Disposition::Retry
                }
                Err(err) => {
                    error!(message_id = %message.id, shelter = %request.shelter_slug, error = %err, "run rejected");
                    Disposition::Rejected
                }
            },
        }
    };

    if disposition != Disposition::Retry {
        if let Err(err) = queue.ack(message.id).await {
            warn!(message_id = %message.id, error = %err, "ack failed; message may be redelivered");
        }
    }
    disposition
}
