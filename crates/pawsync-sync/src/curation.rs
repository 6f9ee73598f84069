//! Explicit status decisions made outside reconciliation.
//!
//! Heartbeat will not resurrect a curated removal. Curation gives no
//! protection from the staleness sweep: a curated listing the source stops
//! publishing is removed like any other, and that removal is the engine's.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pawsync_core::{
    Listing, ListingStatus, PersistenceError, QueueSendError, ReindexJob, REINDEX_QUEUE,
};
use pawsync_storage::{encode_batch, JobQueue, RelationalStore};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::cleanup::{CleanupTask, PhotoCleanupPool};

#[derive(Debug, Error)]
pub enum CurationError {
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Queue(#[from] QueueSendError),
}

pub struct Curator {
    store: Arc<dyn RelationalStore>,
    queue: Arc<dyn JobQueue>,
    cleanup: Option<Arc<PhotoCleanupPool>>,
    blob_base_url: Option<String>,
}

impl Curator {
    pub fn new(store: Arc<dyn RelationalStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            cleanup: None,
            blob_base_url: None,
        }
    }

    pub fn with_photo_cleanup(
        mut self,
        pool: Arc<PhotoCleanupPool>,
        blob_base_url: impl Into<String>,
    ) -> Self {
        self.cleanup = Some(pool);
        self.blob_base_url = Some(blob_base_url.into());
        self
    }

    async fn notify(&self, job: ReindexJob) -> Result<(), CurationError> {
        let payloads = encode_batch(REINDEX_QUEUE, std::slice::from_ref(&job))?;
        self.queue.send_batch(REINDEX_QUEUE, payloads).await?;
        Ok(())
    }

    /// Records `status` as a curated decision and tells the index about it.
    pub async fn set_status(
        &self,
        listing_id: Uuid,
        status: ListingStatus,
        now: DateTime<Utc>,
    ) -> Result<Listing, CurationError> {
        if self.store.get_listing(listing_id).await?.is_none() {
            return Err(CurationError::NotFound(listing_id));
        }
        self.store
            .set_listing_status(listing_id, status, now, true)
            .await?;
        let listing = self
            .store
            .get_listing(listing_id)
            .await?
            .ok_or(CurationError::NotFound(listing_id))?;
        info!(listing_id = %listing_id, status = %status, "curated status recorded");

        let job = if status.is_active() {
            ReindexJob::upsert(&listing)
        } else {
            ReindexJob::delete(listing_id)
        };
        self.notify(job).await?;
        Ok(listing)
    }

    /// Hard-deletes a listing. Its stored photos are handed to the cleanup
    /// pool; that cleanup's outcome does not affect this call.
    pub async fn delete(&self, listing_id: Uuid) -> Result<Listing, CurationError> {
        let listing = self
            .store
            .delete_listing(listing_id)
            .await?
            .ok_or(CurationError::NotFound(listing_id))?;
        info!(listing_id = %listing_id, "listing deleted");

        if let (Some(pool), Some(base)) = (&self.cleanup, &self.blob_base_url) {
            let keys = stored_photo_keys(&listing.photos, base);
            pool.submit(CleanupTask { listing_id, keys });
        }
        self.notify(ReindexJob::delete(listing_id)).await?;
        Ok(listing)
    }
}

/// Blob keys of the photos that live in our own store.
pub fn stored_photo_keys(photos: &[String], blob_base_url: &str) -> Vec<String> {
    let base = blob_base_url.trim_end_matches('/');
    photos
        .iter()
        .filter_map(|url| url.strip_prefix(base))
        .map(|rest| rest.trim_start_matches('/').to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_our_own_photos_become_blob_keys() {
        let photos = vec![
            "https://blobs.pawsync.example/dogs/a/1.jpg".to_string(),
            "https://shelter.example/2.jpg".to_string(),
        ];
        assert_eq!(
            stored_photo_keys(&photos, "https://blobs.pawsync.example/"),
            vec!["dogs/a/1.jpg".to_string()]
        );
    }
}
