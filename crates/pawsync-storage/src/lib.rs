//! Persistence, queueing, blob storage and HTTP plumbing for pawsync.
//!
//! The reconciliation engine only sees the [`RelationalStore`], [`JobQueue`]
//! and [`BlobStore`] traits. In-memory implementations back the tests; the
//! PostgreSQL ones back deployments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawsync_core::{
    Listing, ListingStatus, PersistenceError, QueueSendError, Shelter, SyncRun, SyncStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod blob;
pub mod http;
pub mod memory;
pub mod postgres;

pub use blob::{BlobStore, FsBlobStore, StoredBlob};
pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClient, HttpClientConfig};
pub use memory::{InMemoryJobQueue, InMemoryStore};
pub use postgres::{PgJobQueue, PgStore};

pub const CRATE_NAME: &str = "pawsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content fingerprint of a listing. The shelter id is always hashed first so
/// two sources can never produce the same fingerprint.
pub fn fingerprint<'a>(shelter_id: Uuid, parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(shelter_id.as_bytes());
    for part in parts {
        hasher.update([0x1fu8]);
        hasher.update(part.trim().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Listing, sync-run and shelter persistence.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Insert a listing, or refresh the row already holding its fingerprint.
    ///
    /// On conflict the stored `id`, `status`, `curated_at` and `created_at`
    /// are kept; enrichment columns are only filled where still empty. The
    /// stored row is returned.
    async fn upsert_by_fingerprint(&self, listing: &Listing) -> Result<Listing, PersistenceError>;

    async fn select_by_shelter(&self, shelter_id: Uuid) -> Result<Vec<Listing>, PersistenceError>;

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, PersistenceError>;

    /// Heartbeat: sets `last_seen_at` and nothing else.
    async fn touch_listings(
        &self,
        ids: &[Uuid],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError>;

    /// `curated` marks the status as an explicit external decision.
    async fn set_listing_status(
        &self,
        id: Uuid,
        status: ListingStatus,
        at: DateTime<Utc>,
        curated: bool,
    ) -> Result<(), PersistenceError>;

    /// Engine-side lifecycle change. Applies only while the row still holds
    /// `expected` and `expected_curated_at`, so a curation that lands after
    /// the engine read the row is never overwritten. Returns `false` when
    /// the row changed (or vanished) in between. A successful transition
    /// clears `curated_at`, since the status is the engine's again.
    async fn transition_listing(
        &self,
        id: Uuid,
        expected: ListingStatus,
        expected_curated_at: Option<DateTime<Utc>>,
        status: ListingStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    async fn delete_listing(&self, id: Uuid) -> Result<Option<Listing>, PersistenceError>;

    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), PersistenceError>;

    async fn get_sync_run(&self, id: Uuid) -> Result<Option<SyncRun>, PersistenceError>;

    async fn latest_sync_run(&self, shelter_id: Uuid)
        -> Result<Option<SyncRun>, PersistenceError>;

    /// Write the final state of a run. Returns `false` when the run had
    /// already been finished (for example by the stale-run collector).
    async fn finish_sync_run(&self, run: &SyncRun) -> Result<bool, PersistenceError>;

    /// Force-finish every open run started before `started_before`.
    /// Returns the ids that were closed by this call.
    async fn finish_stale_sync_runs(
        &self,
        started_before: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Uuid>, PersistenceError>;

    async fn upsert_shelter(&self, shelter: &Shelter) -> Result<(), PersistenceError>;

    async fn list_shelters(&self) -> Result<Vec<Shelter>, PersistenceError>;

    async fn update_shelter(
        &self,
        shelter_id: Uuid,
        last_sync: DateTime<Utc>,
        status: SyncStatus,
    ) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("unknown message {0}")]
    UnknownMessage(Uuid),
}

/// At-least-once queue. A received message stays invisible for the
/// visibility window and is redelivered unless acked before it ends.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send_batch(
        &self,
        queue: &str,
        payloads: Vec<serde_json::Value>,
    ) -> Result<(), QueueSendError>;

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn ack(&self, message_id: Uuid) -> Result<(), QueueError>;

    async fn send(&self, queue: &str, payload: serde_json::Value) -> Result<(), QueueSendError> {
        self.send_batch(queue, vec![payload]).await
    }
}

/// Serialize typed jobs for [`JobQueue::send_batch`].
pub fn encode_batch<T: Serialize>(
    queue: &str,
    jobs: &[T],
) -> Result<Vec<serde_json::Value>, QueueSendError> {
    jobs.iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| QueueSendError::new(queue, jobs.len(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn fingerprint_embeds_the_shelter() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let parts = ["rex", "friendly boy", "https://img/1.jpg"];
        assert_eq!(fingerprint(a, parts), fingerprint(a, parts));
        assert_ne!(fingerprint(a, parts), fingerprint(b, parts));
    }

    #[test]
    fn fingerprint_separates_parts() {
        let shelter = Uuid::nil();
        assert_ne!(fingerprint(shelter, ["ab", "c"]), fingerprint(shelter, ["a", "bc"]));
    }
}
