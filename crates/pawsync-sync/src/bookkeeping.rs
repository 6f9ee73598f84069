//! SyncRun lifecycle: open, finalize, and the age-based collector for runs
//! whose worker never came back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pawsync_core::{PersistenceError, ScrapeRequest, SyncRun};
use pawsync_storage::RelationalStore;
use tracing::{info, warn};
use uuid::Uuid;

pub const STALE_RUN_MESSAGE: &str = "Stale job timeout (no worker completion)";

/// Opens the run for `request`. A pre-allocated `sync_run_id` is reused
/// while that run is still open; a redelivered request whose run was
/// already finished gets a fresh run.
pub async fn open_run(
    store: &dyn RelationalStore,
    request: &ScrapeRequest,
    now: DateTime<Utc>,
) -> Result<SyncRun, PersistenceError> {
    if let Some(id) = request.sync_run_id {
        match store.get_sync_run(id).await? {
            Some(run) if run.is_open() && run.shelter_id == request.shelter_id => return Ok(run),
            Some(_) => {
                info!(sync_run_id = %id, "requested sync run cannot be reused; opening a new one");
            }
            None => {
                let run = SyncRun::start(id, request.shelter_id, now);
                store.insert_sync_run(&run).await?;
                return Ok(run);
            }
        }
    }
    let run = SyncRun::start(Uuid::new_v4(), request.shelter_id, now);
    store.insert_sync_run(&run).await?;
    Ok(run)
}

/// Writes the terminal state of `run` and mirrors its status onto the
/// shelter. Returns `false` if the collector had already closed the run.
pub async fn finalize_run(
    store: &dyn RelationalStore,
    run: &mut SyncRun,
    now: DateTime<Utc>,
) -> Result<bool, PersistenceError> {
    run.finished_at = Some(now);
    let written = store.finish_sync_run(run).await?;
    if !written {
        warn!(sync_run_id = %run.id, "sync run was already closed by the stale-run collector");
    }
    store
        .update_shelter(run.shelter_id, now, run.status())
        .await?;
    Ok(written)
}

/// Force-finishes runs left open longer than `timeout`.
#[derive(Clone)]
pub struct StaleRunCollector {
    store: Arc<dyn RelationalStore>,
    timeout: Duration,
}

impl StaleRunCollector {
    pub fn new(store: Arc<dyn RelationalStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Each stale run is closed by exactly one sweep; later sweeps skip it.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, PersistenceError> {
        let closed = self
            .store
            .finish_stale_sync_runs(now - self.timeout, now, STALE_RUN_MESSAGE)
            .await?;
        for id in &closed {
            warn!(sync_run_id = %id, "force-finished stale sync run");
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "stale-run sweep complete");
        }
        Ok(closed)
    }
}
