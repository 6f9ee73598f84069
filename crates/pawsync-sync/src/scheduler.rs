use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use pawsync_core::{ScrapeRequest, SCRAPE_QUEUE};
use pawsync_storage::{encode_batch, JobQueue, RelationalStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::bookkeeping::StaleRunCollector;
use crate::config::SyncConfig;

/// Queues one scrape request per active shelter, or only for `slug` when
/// given (active or not). Returns the number queued.
pub async fn enqueue_scrapes(
    store: &dyn RelationalStore,
    queue: &dyn JobQueue,
    slug: Option<&str>,
) -> Result<usize> {
    let shelters = store.list_shelters().await.context("listing shelters")?;
    let requests: Vec<ScrapeRequest> = shelters
        .iter()
        .filter(|s| match slug {
            Some(slug) => s.slug == slug,
            None => s.active,
        })
        .map(ScrapeRequest::for_shelter)
        .collect();
    if let Some(slug) = slug {
        if requests.is_empty() {
            anyhow::bail!("unknown shelter `{slug}`");
        }
    }
    if requests.is_empty() {
        return Ok(0);
    }
    let payloads = encode_batch(SCRAPE_QUEUE, &requests)?;
    queue
        .send_batch(SCRAPE_QUEUE, payloads)
        .await
        .context("queueing scrape requests")?;
    info!(count = requests.len(), "scrape requests queued");
    Ok(requests.len())
}

/// Cron jobs for periodic scrapes and stale-run collection, or `None`
/// when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    store: Arc<dyn RelationalStore>,
    queue: Arc<dyn JobQueue>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_store = store.clone();
    let sync_job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let store = sync_store.clone();
        let queue = queue.clone();
        Box::pin(async move {
            if let Err(err) = enqueue_scrapes(store.as_ref(), queue.as_ref(), None).await {
                error!(error = %format!("{err:#}"), "scheduled enqueue failed");
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {}", config.sync_cron))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let collector = StaleRunCollector::new(store, config.stale_run_timeout());
    let gc_job = Job::new_async(config.gc_cron.as_str(), move |_uuid, _l| {
        let collector = collector.clone();
        Box::pin(async move {
            if let Err(err) = collector.collect(Utc::now()).await {
                error!(error = %err, "stale-run sweep failed");
            }
        })
    })
    .with_context(|| format!("creating gc job for cron {}", config.gc_cron))?;
    sched.add(gc_job).await.context("adding gc job")?;

    Ok(Some(sched))
}
