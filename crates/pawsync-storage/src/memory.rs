//! In-process store and queue. Used by tests and local dry runs.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawsync_core::{
    Listing, ListingStatus, PersistenceError, QueueSendError, Shelter, SyncRun, SyncStatus,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{JobQueue, QueueError, QueueMessage, RelationalStore};

#[derive(Debug, Default)]
struct StoreState {
    listings: HashMap<Uuid, Listing>,
    by_fingerprint: HashMap<String, Uuid>,
    runs: HashMap<Uuid, SyncRun>,
    shelters: HashMap<Uuid, Shelter>,
    failing_fingerprints: HashSet<String>,
    unavailable: bool,
    /// Curation applied right after the next `select_by_shelter` snapshot.
    curation_after_select: Option<(Uuid, ListingStatus, DateTime<Utc>)>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert of `fingerprint` fail.
    pub async fn fail_upserts_for(&self, fingerprint: impl Into<String>) {
        self.state
            .lock()
            .await
            .failing_fingerprints
            .insert(fingerprint.into());
    }

    /// Make every operation fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Curate `id` to `status` immediately after the next
    /// `select_by_shelter` has taken its snapshot, as a concurrent
    /// `pawsync curate` would.
    pub async fn curate_after_next_select(
        &self,
        id: Uuid,
        status: ListingStatus,
        at: DateTime<Utc>,
    ) {
        self.state.lock().await.curation_after_select = Some((id, status, at));
    }

    /// Seed or overwrite a row as-is, bypassing upsert semantics.
    pub async fn put_listing(&self, listing: Listing) {
        let mut state = self.state.lock().await;
        state
            .by_fingerprint
            .insert(listing.fingerprint.clone(), listing.id);
        state.listings.insert(listing.id, listing);
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.state.lock().await.listings.values().cloned().collect()
    }

    pub async fn sync_runs(&self) -> Vec<SyncRun> {
        self.state.lock().await.runs.values().cloned().collect()
    }

    pub async fn shelter(&self, id: Uuid) -> Option<Shelter> {
        self.state.lock().await.shelters.get(&id).cloned()
    }
}

fn check_available(state: &StoreState, operation: &'static str) -> Result<(), PersistenceError> {
    if state.unavailable {
        Err(PersistenceError::new(operation, "store unavailable"))
    } else {
        Ok(())
    }
}

fn merge_on_conflict(stored: &mut Listing, incoming: &Listing) {
    stored.last_seen_at = stored.last_seen_at.max(incoming.last_seen_at);
    stored.updated_at = incoming.updated_at;
    if stored.text_attributes.is_none() {
        stored.text_attributes = incoming.text_attributes.clone();
    }
    if stored.photo_attributes.is_none() {
        stored.photo_attributes = incoming.photo_attributes.clone();
    }
    if stored.bio.is_none() {
        stored.bio = incoming.bio.clone();
    }
    if stored.personality_tags.is_empty() {
        stored.personality_tags = incoming.personality_tags.clone();
    }
    if stored.breeds.is_empty() {
        stored.breeds = incoming.breeds.clone();
    }
    stored.size = stored.size.or(incoming.size);
    stored.age_months = stored.age_months.or(incoming.age_months);
    stored.sex = stored.sex.or(incoming.sex);
    if stored.city.is_none() {
        stored.city = incoming.city.clone();
    }
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    async fn upsert_by_fingerprint(&self, listing: &Listing) -> Result<Listing, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "upsert_by_fingerprint")?;
        if state.failing_fingerprints.contains(&listing.fingerprint) {
            return Err(PersistenceError::new("upsert_by_fingerprint", "injected failure")
                .for_shelter(listing.shelter_id));
        }

        if let Some(existing_id) = state.by_fingerprint.get(&listing.fingerprint).copied() {
            if let Some(stored) = state.listings.get_mut(&existing_id) {
                merge_on_conflict(stored, listing);
                return Ok(stored.clone());
            }
        }

        state
            .by_fingerprint
            .insert(listing.fingerprint.clone(), listing.id);
        state.listings.insert(listing.id, listing.clone());
        Ok(listing.clone())
    }

    async fn select_by_shelter(&self, shelter_id: Uuid) -> Result<Vec<Listing>, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "select_by_shelter")?;
        let snapshot = state
            .listings
            .values()
            .filter(|l| l.shelter_id == shelter_id)
            .cloned()
            .collect();
        if let Some((id, status, at)) = state.curation_after_select.take() {
            if let Some(listing) = state.listings.get_mut(&id) {
                listing.status = status;
                listing.updated_at = at;
                listing.curated_at = Some(at);
            }
        }
        Ok(snapshot)
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, PersistenceError> {
        let state = self.state.lock().await;
        check_available(&state, "get_listing")?;
        Ok(state.listings.get(&id).cloned())
    }

    async fn touch_listings(
        &self,
        ids: &[Uuid],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "touch_listings")?;
        let mut touched = 0;
        for id in ids {
            if let Some(listing) = state.listings.get_mut(id) {
                listing.last_seen_at = seen_at;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn set_listing_status(
        &self,
        id: Uuid,
        status: ListingStatus,
        at: DateTime<Utc>,
        curated: bool,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "set_listing_status")?;
        let listing = state.listings.get_mut(&id).ok_or_else(|| {
            PersistenceError::new("set_listing_status", "no such listing").for_listing(id)
        })?;
        listing.status = status;
        listing.updated_at = at;
        if curated {
            listing.curated_at = Some(at);
        }
        Ok(())
    }

    async fn transition_listing(
        &self,
        id: Uuid,
        expected: ListingStatus,
        expected_curated_at: Option<DateTime<Utc>>,
        status: ListingStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "transition_listing")?;
        match state.listings.get_mut(&id) {
            Some(listing)
                if listing.status == expected && listing.curated_at == expected_curated_at =>
            {
                listing.status = status;
                listing.updated_at = at;
                listing.curated_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_listing(&self, id: Uuid) -> Result<Option<Listing>, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "delete_listing")?;
        let removed = state.listings.remove(&id);
        if let Some(listing) = &removed {
            state.by_fingerprint.remove(&listing.fingerprint);
        }
        Ok(removed)
    }

    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "insert_sync_run")?;
        if state.runs.contains_key(&run.id) {
            return Err(PersistenceError::new("insert_sync_run", "duplicate id")
                .for_shelter(run.shelter_id));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_sync_run(&self, id: Uuid) -> Result<Option<SyncRun>, PersistenceError> {
        let state = self.state.lock().await;
        check_available(&state, "get_sync_run")?;
        Ok(state.runs.get(&id).cloned())
    }

    async fn latest_sync_run(
        &self,
        shelter_id: Uuid,
    ) -> Result<Option<SyncRun>, PersistenceError> {
        let state = self.state.lock().await;
        check_available(&state, "latest_sync_run")?;
        Ok(state
            .runs
            .values()
            .filter(|r| r.shelter_id == shelter_id)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn finish_sync_run(&self, run: &SyncRun) -> Result<bool, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "finish_sync_run")?;
        match state.runs.get_mut(&run.id) {
            Some(stored) if stored.is_open() => {
                *stored = run.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PersistenceError::new("finish_sync_run", "no such sync run")
                .for_shelter(run.shelter_id)),
        }
    }

    async fn finish_stale_sync_runs(
        &self,
        started_before: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Uuid>, PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "finish_stale_sync_runs")?;
        let mut closed = Vec::new();
        for run in state.runs.values_mut() {
            if run.is_open() && run.started_at < started_before {
                run.finished_at = Some(finished_at);
                run.error_message = Some(error_message.to_string());
                closed.push(run.id);
            }
        }
        Ok(closed)
    }

    async fn upsert_shelter(&self, shelter: &Shelter) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "upsert_shelter")?;
        match state.shelters.get_mut(&shelter.id) {
            Some(stored) => {
                stored.slug = shelter.slug.clone();
                stored.name = shelter.name.clone();
                stored.base_url = shelter.base_url.clone();
                stored.active = shelter.active;
            }
            None => {
                state.shelters.insert(shelter.id, shelter.clone());
            }
        }
        Ok(())
    }

    async fn list_shelters(&self) -> Result<Vec<Shelter>, PersistenceError> {
        let state = self.state.lock().await;
        check_available(&state, "list_shelters")?;
        let mut shelters: Vec<_> = state.shelters.values().cloned().collect();
        shelters.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(shelters)
    }

    async fn update_shelter(
        &self,
        shelter_id: Uuid,
        last_sync: DateTime<Utc>,
        status: SyncStatus,
    ) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        check_available(&state, "update_shelter")?;
        // Shelters registered only through a scrape request have no row yet.
        if let Some(shelter) = state.shelters.get_mut(&shelter_id) {
            shelter.last_sync = Some(last_sync);
            shelter.status = Some(status);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Envelope {
    message: QueueMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<String, VecDeque<Envelope>>,
    send_calls: HashMap<String, usize>,
    failing_queues: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `queue` fail.
    pub async fn fail_sends_to(&self, queue: &str) {
        self.state
            .lock()
            .await
            .failing_queues
            .insert(queue.to_string());
    }

    /// Number of successful `send_batch` calls made against `queue`.
    pub async fn send_calls(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .send_calls
            .get(queue)
            .copied()
            .unwrap_or(0)
    }

    /// Payloads currently held for `queue`, visible or not.
    pub async fn payloads(&self, queue: &str) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.iter().map(|e| e.message.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send_batch(
        &self,
        queue: &str,
        payloads: Vec<serde_json::Value>,
    ) -> Result<(), QueueSendError> {
        let mut state = self.state.lock().await;
        if state.failing_queues.contains(queue) {
            return Err(QueueSendError::new(queue, payloads.len(), "injected failure"));
        }
        *state.send_calls.entry(queue.to_string()).or_default() += 1;
        let now = Instant::now();
        let entries = state.queues.entry(queue.to_string()).or_default();
        for payload in payloads {
            entries.push_back(Envelope {
                message: QueueMessage {
                    id: Uuid::new_v4(),
                    queue: queue.to_string(),
                    payload,
                    attempts: 0,
                    enqueued_at: Utc::now(),
                },
                visible_at: now,
            });
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(entries) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut delivered = Vec::new();
        for envelope in entries.iter_mut() {
            if delivered.len() >= max {
                break;
            }
            if envelope.visible_at <= now {
                envelope.visible_at = now + visibility;
                envelope.message.attempts += 1;
                delivered.push(envelope.message.clone());
            }
        }
        Ok(delivered)
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        for entries in state.queues.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.message.id == message_id) {
                entries.remove(pos);
                return Ok(());
            }
        }
        Err(QueueError::UnknownMessage(message_id))
    }
}
