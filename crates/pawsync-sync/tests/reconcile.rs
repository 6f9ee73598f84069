use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pawsync_adapters::{AdapterRegistry, RawPayload, ScrapeConfig, SourceAdapter};
use pawsync_core::{
    CombinedAttributes, EnrichmentError, EnrichmentStage, GeneratedBio, Listing, ListingStatus,
    ParseError, PhotoAttributes, RawListing, ScrapeError, ScrapeRequest, Shelter, SyncStatus,
    TextAttributes, IMAGE_QUEUE, REINDEX_QUEUE, SCRAPE_QUEUE,
};
use pawsync_storage::{fingerprint, InMemoryJobQueue, InMemoryStore, JobQueue, RelationalStore};
use pawsync_sync::{
    handle_message, Disposition, EngineConfig, Enricher, EnrichmentServices,
    ReconciliationEngine, RunError, StaleRunCollector, WorkerConfig, WorkerPool,
    STALE_RUN_MESSAGE,
};
use uuid::Uuid;

const SLUG: &str = "happy-paws";

#[derive(Default)]
struct ScriptedAdapter {
    listings: Mutex<Vec<RawListing>>,
    fail_fetch: AtomicBool,
}

impl ScriptedAdapter {
    fn set(&self, listings: Vec<RawListing>) {
        *self.listings.lock().unwrap() = listings;
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, config: &ScrapeConfig) -> Result<RawPayload, ScrapeError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ScrapeError::new(config.shelter_id, "HTTP 503"));
        }
        Ok(RawPayload {
            url: config.base_url.clone(),
            body: Vec::new(),
            fetched_at: Utc::now(),
        })
    }

    fn parse(&self, _raw: &RawPayload, _config: &ScrapeConfig) -> Result<Vec<RawListing>, ParseError> {
        Ok(self.listings.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct ScriptedEnrichment {
    fail_extract: AtomicBool,
    extract_calls: AtomicUsize,
    analyze_calls: AtomicUsize,
    generate_calls: AtomicUsize,
}

impl ScriptedEnrichment {
    fn calls(&self) -> usize {
        self.extract_calls.load(Ordering::SeqCst)
            + self.analyze_calls.load(Ordering::SeqCst)
            + self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentServices for ScriptedEnrichment {
    async fn extract(&self, _text: &str) -> Result<TextAttributes, EnrichmentError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extract.load(Ordering::SeqCst) {
            return Err(EnrichmentError::Service {
                stage: EnrichmentStage::Extract,
                cause: "model overloaded".into(),
            });
        }
        Ok(TextAttributes {
            personality_tags: vec!["friendly".into()],
            good_with_kids: Some(true),
            ..Default::default()
        })
    }

    async fn analyze_multiple(&self, urls: &[String]) -> Result<PhotoAttributes, EnrichmentError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PhotoAttributes {
            fur_length: Some("short".into()),
            colors: vec![format!("{} photo(s)", urls.len())],
            breeds: Vec::new(),
        })
    }

    async fn generate(&self, attributes: &CombinedAttributes) -> Result<GeneratedBio, EnrichmentError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GeneratedBio {
            bio: format!("{} is looking for a home.", attributes.name),
        })
    }
}

struct Harness {
    shelter_id: Uuid,
    store: Arc<InMemoryStore>,
    queue: Arc<InMemoryJobQueue>,
    adapter: Arc<ScriptedAdapter>,
    enrichment: Arc<ScriptedEnrichment>,
    engine: Arc<ReconciliationEngine>,
}

impl Harness {
    async fn new() -> Self {
        let shelter_id = Uuid::new_v4();
        let store = Arc::new(InMemoryStore::new());
        store
            .upsert_shelter(&Shelter {
                id: shelter_id,
                slug: SLUG.into(),
                name: "Happy Paws".into(),
                base_url: "https://happypaws.example".into(),
                active: true,
                status: None,
                last_sync: None,
            })
            .await
            .unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let adapter = Arc::new(ScriptedAdapter::default());
        let enrichment = Arc::new(ScriptedEnrichment::default());
        let engine = ReconciliationEngine::new(
            store.clone(),
            queue.clone(),
            AdapterRegistry::new().with(SLUG, adapter.clone()),
            Enricher::new(enrichment.clone(), Duration::from_secs(5), 8),
            EngineConfig {
                blob_base_url: Some("https://blobs.pawsync.example/".into()),
                ..Default::default()
            },
        );
        Self {
            shelter_id,
            store,
            queue,
            adapter,
            enrichment,
            engine: Arc::new(engine),
        }
    }

    fn request(&self) -> ScrapeRequest {
        ScrapeRequest {
            shelter_id: self.shelter_id,
            shelter_slug: SLUG.into(),
            base_url: "https://happypaws.example".into(),
            sync_run_id: None,
        }
    }

    fn raw(&self, name: &str) -> RawListing {
        let description = format!("{name} is a friendly dog.");
        let photo = format!("https://happypaws.example/img/{name}.jpg");
        RawListing {
            external_id: Some(name.to_lowercase()),
            fingerprint: fingerprint(self.shelter_id, [name, description.as_str(), photo.as_str()]),
            name: name.into(),
            raw_description: Some(description),
            photos: vec![photo],
            sex: Some("F".into()),
            source_url: None,
            breed: None,
            age_text: Some("2 years".into()),
            size_text: None,
            city: None,
        }
    }

    fn raws(&self, prefix: &str, n: usize) -> Vec<RawListing> {
        (0..n).map(|i| self.raw(&format!("{prefix}{i}"))).collect()
    }

    /// Stored row for `raw` as an earlier run would have left it.
    async fn seed(&self, raw: &RawListing, status: ListingStatus, last_seen: DateTime<Utc>) -> Listing {
        let row = Listing {
            id: Uuid::new_v4(),
            shelter_id: self.shelter_id,
            external_id: raw.external_id.clone(),
            fingerprint: raw.fingerprint.clone(),
            name: raw.name.clone(),
            status,
            curated_at: None,
            description: raw.raw_description.clone(),
            sex: None,
            source_url: None,
            photos: raw.photos.clone(),
            city: None,
            breeds: Vec::new(),
            size: None,
            age_months: None,
            personality_tags: Vec::new(),
            text_attributes: None,
            photo_attributes: None,
            bio: None,
            last_seen_at: last_seen,
            created_at: last_seen,
            updated_at: last_seen,
        };
        self.store.put_listing(row.clone()).await;
        row
    }

    async fn by_status(&self, status: ListingStatus) -> usize {
        self.store
            .listings()
            .await
            .iter()
            .filter(|l| l.status == status)
            .count()
    }
}

fn by_fingerprint(rows: Vec<Listing>) -> HashMap<String, Listing> {
    rows.into_iter().map(|l| (l.fingerprint.clone(), l)).collect()
}

#[tokio::test]
async fn first_run_creates_and_rerun_only_refreshes_last_seen() {
    let h = Harness::new().await;
    h.adapter.set(h.raws("dog", 3));
    let t0 = Utc::now();

    let first = h.engine.run_at(&h.request(), t0).await.unwrap();
    assert_eq!(first.run.dogs_added, 3);
    assert_eq!(first.run.status(), SyncStatus::Success);
    assert_eq!(first.fan_out.reindex_jobs, 3);
    assert_eq!(first.fan_out.image_jobs, 3);
    let calls_after_first = h.enrichment.calls();
    let before = by_fingerprint(h.store.listings().await);
    assert!(before.values().all(|l| l.bio.is_some() && l.status == ListingStatus::Available));

    let t1 = t0 + ChronoDuration::hours(6);
    let second = h.engine.run_at(&h.request(), t1).await.unwrap();
    assert_eq!(second.run.dogs_added, 0);
    assert_eq!(second.run.dogs_updated, 3);
    assert_eq!(second.run.dogs_removed, 0);
    assert_eq!(second.fan_out.reindex_jobs, 0);
    assert_eq!(h.enrichment.calls(), calls_after_first);

    let after = by_fingerprint(h.store.listings().await);
    assert_eq!(before.len(), after.len());
    for (fp, old) in &before {
        let new = &after[fp];
        assert_eq!(new.last_seen_at, t1);
        let mut normalized = new.clone();
        normalized.last_seen_at = old.last_seen_at;
        assert_eq!(&normalized, old, "only last_seen_at may change");
    }

    let shelter = h.store.shelter(h.shelter_id).await.unwrap();
    assert_eq!(shelter.status, Some(SyncStatus::Success));
    assert!(shelter.last_sync.is_some());
}

#[tokio::test]
async fn breaker_at_twenty_percent_suppresses_removals() {
    let h = Harness::new().await;
    let now = Utc::now();
    let all = h.raws("dog", 100);
    for raw in &all {
        h.seed(raw, ListingStatus::Available, now - ChronoDuration::hours(48)).await;
    }
    h.adapter.set(all[..20].to_vec());

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert!(outcome.breaker_tripped);
    assert_eq!(h.by_status(ListingStatus::Removed).await, 0);
    assert_eq!(outcome.run.dogs_removed, 0);
    assert_eq!(outcome.run.dogs_updated, 20);
    assert_eq!(
        outcome.run.errors,
        vec!["circuit breaker: scraped 20 of 100 expected (<30%)".to_string()]
    );
    assert_eq!(outcome.run.status(), SyncStatus::Error);
    assert!(h.queue.payloads(REINDEX_QUEUE).await.is_empty());
}

#[tokio::test]
async fn breaker_at_fifty_percent_lets_stale_rows_go() {
    let h = Harness::new().await;
    let now = Utc::now();
    let all = h.raws("dog", 100);
    for raw in &all {
        h.seed(raw, ListingStatus::Available, now - ChronoDuration::hours(48)).await;
    }
    h.adapter.set(all[..50].to_vec());

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert!(!outcome.breaker_tripped);
    assert!(outcome.run.errors.is_empty());
    assert_eq!(outcome.run.dogs_removed, 50);
    assert_eq!(h.by_status(ListingStatus::Removed).await, 50);
    assert_eq!(h.by_status(ListingStatus::Available).await, 50);

    let deletes = h.queue.payloads(REINDEX_QUEUE).await;
    assert_eq!(deletes.len(), 50);
    assert!(deletes.iter().all(|job| job["type"] == "delete"));
    assert_eq!(h.queue.send_calls(REINDEX_QUEUE).await, 1);
}

#[tokio::test]
async fn a_single_missed_run_does_not_remove() {
    let h = Harness::new().await;
    let now = Utc::now();
    let fresh = h.raw("Fresh");
    let stale = h.raw("Stale");
    let kept = h.raw("Kept");
    h.seed(&fresh, ListingStatus::Available, now - ChronoDuration::hours(10)).await;
    let stale_row = h.seed(&stale, ListingStatus::Pending, now - ChronoDuration::hours(40)).await;
    h.seed(&kept, ListingStatus::Available, now - ChronoDuration::hours(40)).await;
    h.adapter.set(vec![kept.clone()]);

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert_eq!(outcome.run.dogs_removed, 1);
    let rows = by_fingerprint(h.store.listings().await);
    assert_eq!(rows[&fresh.fingerprint].status, ListingStatus::Available);
    assert_eq!(rows[&stale.fingerprint].status, ListingStatus::Removed);
    assert_eq!(rows[&kept.fingerprint].last_seen_at, now);
    assert_eq!(
        h.queue.payloads(REINDEX_QUEUE).await[0]["dogId"],
        stale_row.id.to_string()
    );
}

#[tokio::test]
async fn reappearing_listing_is_resurrected_without_enrichment() {
    let h = Harness::new().await;
    let now = Utc::now();
    let back = h.raw("Back");
    let curated = h.raw("Adopted");
    let row = h.seed(&back, ListingStatus::Removed, now - ChronoDuration::days(5)).await;
    let curated_row = h.seed(&curated, ListingStatus::Removed, now - ChronoDuration::days(5)).await;
    h.store
        .set_listing_status(curated_row.id, ListingStatus::Removed, now - ChronoDuration::days(1), true)
        .await
        .unwrap();
    h.adapter.set(vec![back.clone(), curated.clone()]);

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert_eq!(outcome.resurrected, 1);
    let back_row = h.store.get_listing(row.id).await.unwrap().unwrap();
    assert_eq!(back_row.status, ListingStatus::Available);
    assert_eq!(back_row.last_seen_at, now);
    assert_eq!(h.enrichment.calls(), 0);

    let still_removed = h.store.get_listing(curated_row.id).await.unwrap().unwrap();
    assert_eq!(still_removed.status, ListingStatus::Removed);
    assert_eq!(still_removed.last_seen_at, now);
}

#[tokio::test]
async fn curated_listing_is_still_swept_once_stale() {
    let h = Harness::new().await;
    let now = Utc::now();
    let present = h.raws("dog", 5);
    for raw in &present {
        h.seed(raw, ListingStatus::Available, now - ChronoDuration::hours(1)).await;
    }
    let gone = h.raw("Gone");
    let gone_row = h.seed(&gone, ListingStatus::Available, now - ChronoDuration::hours(48)).await;
    h.store
        .set_listing_status(gone_row.id, ListingStatus::Available, now - ChronoDuration::hours(47), true)
        .await
        .unwrap();
    h.adapter.set(present.clone());

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert!(!outcome.breaker_tripped);
    assert_eq!(outcome.run.dogs_removed, 1);
    let swept = h.store.get_listing(gone_row.id).await.unwrap().unwrap();
    assert_eq!(swept.status, ListingStatus::Removed);
    assert!(!swept.is_curated());

    // The removal was the engine's, so the listing comes back with its fingerprint.
    let mut back = present;
    back.push(gone);
    h.adapter.set(back);
    let later = now + ChronoDuration::hours(6);
    let outcome = h.engine.run_at(&h.request(), later).await.unwrap();
    assert_eq!(outcome.resurrected, 1);
    let row = h.store.get_listing(gone_row.id).await.unwrap().unwrap();
    assert_eq!(row.status, ListingStatus::Available);
}

#[tokio::test]
async fn curation_during_a_run_is_not_overwritten() {
    let h = Harness::new().await;
    let now = Utc::now();
    let returning = h.raw("Returning");
    let returning_row = h.seed(&returning, ListingStatus::Removed, now - ChronoDuration::days(3)).await;
    h.adapter.set(vec![returning.clone()]);
    h.store
        .curate_after_next_select(returning_row.id, ListingStatus::Removed, now)
        .await;

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert_eq!(outcome.resurrected, 0);
    assert!(outcome.run.errors.is_empty());
    let row = h.store.get_listing(returning_row.id).await.unwrap().unwrap();
    assert_eq!(row.status, ListingStatus::Removed);
    assert_eq!(row.curated_at, Some(now));

    let present = h.raws("dog", 3);
    for raw in &present {
        h.seed(raw, ListingStatus::Available, now).await;
    }
    let stale = h.raw("Stale");
    let stale_row = h.seed(&stale, ListingStatus::Available, now - ChronoDuration::hours(48)).await;
    h.adapter.set(present);
    h.store
        .curate_after_next_select(stale_row.id, ListingStatus::Reserved, now)
        .await;

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert!(!outcome.breaker_tripped);
    assert_eq!(outcome.run.dogs_removed, 0);
    assert!(outcome.run.errors.is_empty());
    let row = h.store.get_listing(stale_row.id).await.unwrap().unwrap();
    assert_eq!(row.status, ListingStatus::Reserved);
    assert!(h.queue.payloads(REINDEX_QUEUE).await.is_empty());
}

#[tokio::test]
async fn breaker_counts_duplicate_rows_in_the_scrape_size() {
    let h = Harness::new().await;
    let now = Utc::now();
    let all = h.raws("dog", 10);
    for raw in &all {
        h.seed(raw, ListingStatus::Available, now - ChronoDuration::hours(48)).await;
    }
    let repeated = vec![all[0].clone(), all[0].clone(), all[1].clone(), all[1].clone()];
    h.adapter.set(repeated);

    let outcome = h.engine.run_at(&h.request(), now).await.unwrap();

    assert!(!outcome.breaker_tripped, "4 of 10 rows is above the threshold");
    assert_eq!(outcome.run.dogs_updated, 2);
    assert_eq!(outcome.run.dogs_removed, 8);
}

#[tokio::test]
async fn extract_failure_still_persists_with_photo_attributes() {
    let h = Harness::new().await;
    h.enrichment.fail_extract.store(true, Ordering::SeqCst);
    let raw = h.raw("Luna");
    h.adapter.set(vec![raw.clone()]);

    let outcome = h.engine.run_at(&h.request(), Utc::now()).await.unwrap();

    assert_eq!(outcome.run.dogs_added, 1);
    assert!(outcome.run.errors.is_empty());
    assert_eq!(outcome.run.status(), SyncStatus::Success);

    let rows = by_fingerprint(h.store.listings().await);
    let luna = &rows[&raw.fingerprint];
    assert!(luna.text_attributes.is_none());
    assert!(luna.personality_tags.is_empty());
    assert_eq!(
        luna.photo_attributes.as_ref().and_then(|p| p.fur_length.as_deref()),
        Some("short")
    );
    assert!(luna.bio.is_none(), "no bio without extracted attributes");
    assert_eq!(luna.age_months, Some(24), "adapter fallback is used");
    assert_eq!(h.enrichment.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fan_out_is_batched_by_one_hundred() {
    let h = Harness::new().await;
    h.adapter.set(h.raws("pup", 250));

    let outcome = h.engine.run_at(&h.request(), Utc::now()).await.unwrap();

    assert_eq!(outcome.run.dogs_added, 250);
    assert_eq!(outcome.fan_out.reindex_jobs, 250);
    assert_eq!(outcome.fan_out.reindex_sends, 3);
    assert_eq!(h.queue.send_calls(REINDEX_QUEUE).await, 3);
    assert_eq!(h.queue.payloads(REINDEX_QUEUE).await.len(), 250);
    assert_eq!(h.queue.payloads(IMAGE_QUEUE).await.len(), 250);
}

#[tokio::test]
async fn own_blob_photos_need_no_image_job() {
    let h = Harness::new().await;
    let mut raw = h.raw("Hosted");
    raw.photos = vec!["https://blobs.pawsync.example/dogs/x/1.jpg".into()];
    h.adapter.set(vec![raw]);

    let outcome = h.engine.run_at(&h.request(), Utc::now()).await.unwrap();

    assert_eq!(outcome.fan_out.image_jobs, 0);
    assert_eq!(h.queue.send_calls(IMAGE_QUEUE).await, 0);
}

#[tokio::test]
async fn failed_insert_skips_only_that_listing() {
    let h = Harness::new().await;
    let raws = h.raws("dog", 3);
    h.store.fail_upserts_for(raws[1].fingerprint.clone()).await;
    h.adapter.set(raws.clone());

    let outcome = h.engine.run_at(&h.request(), Utc::now()).await.unwrap();

    assert_eq!(outcome.run.dogs_added, 2);
    assert_eq!(outcome.run.errors.len(), 1);
    assert!(outcome.run.errors[0].contains("upsert_by_fingerprint"));
    assert_eq!(outcome.run.status(), SyncStatus::Error);
    assert_eq!(h.store.listings().await.len(), 2);
    assert_eq!(outcome.fan_out.reindex_jobs, 2);
}

#[tokio::test]
async fn queue_failure_is_recorded_without_undoing_writes() {
    let h = Harness::new().await;
    h.queue.fail_sends_to(REINDEX_QUEUE).await;
    h.adapter.set(h.raws("dog", 2));

    let outcome = h.engine.run_at(&h.request(), Utc::now()).await.unwrap();

    assert_eq!(outcome.run.dogs_added, 2);
    assert_eq!(h.store.listings().await.len(), 2);
    assert_eq!(outcome.run.errors.len(), 1);
    assert!(outcome.run.errors[0].contains("reindex"));
}

#[tokio::test]
async fn adapter_failure_closes_the_run_and_is_retryable() {
    let h = Harness::new().await;
    h.adapter.fail_fetch.store(true, Ordering::SeqCst);

    let err = h.engine.run(&h.request()).await.unwrap_err();

    assert!(matches!(err, RunError::Scrape(_)));
    assert!(err.is_retryable());
    let runs = h.store.sync_runs().await;
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].is_open());
    assert!(runs[0].error_message.as_deref().unwrap_or_default().contains("HTTP 503"));
    assert_eq!(
        h.store.shelter(h.shelter_id).await.unwrap().status,
        Some(SyncStatus::Error)
    );
}

#[tokio::test]
async fn stale_runs_are_collected_exactly_once() {
    let h = Harness::new().await;
    let now = Utc::now();
    let mut crashed = h.request();
    crashed.sync_run_id = Some(Uuid::new_v4());
    h.store
        .insert_sync_run(&pawsync_core::SyncRun::start(
            crashed.sync_run_id.unwrap(),
            h.shelter_id,
            now - ChronoDuration::hours(3),
        ))
        .await
        .unwrap();

    let collector = StaleRunCollector::new(h.store.clone(), ChronoDuration::hours(2));
    assert_eq!(collector.collect(now).await.unwrap().len(), 1);
    assert!(collector.collect(now).await.unwrap().is_empty());
    assert!(collector.collect(now + ChronoDuration::hours(1)).await.unwrap().is_empty());

    let run = h.store.get_sync_run(crashed.sync_run_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(run.error_message.as_deref(), Some(STALE_RUN_MESSAGE));

    // A late redelivery of the same request starts a fresh run.
    h.adapter.set(h.raws("dog", 1));
    let outcome = h.engine.run_at(&crashed, now).await.unwrap();
    assert_ne!(Some(outcome.run.id), crashed.sync_run_id);
}

#[tokio::test]
async fn worker_acks_completed_and_rejected_but_not_retryable() {
    let h = Harness::new().await;
    h.adapter.set(h.raws("dog", 1));
    let visibility = Duration::from_secs(60);

    h.queue
        .send(SCRAPE_QUEUE, serde_json::to_value(h.request()).unwrap())
        .await
        .unwrap();
    let msg = h.queue.receive(SCRAPE_QUEUE, 1, visibility).await.unwrap().remove(0);
    assert_eq!(handle_message(&h.engine, h.queue.as_ref(), &msg, 5).await, Disposition::Completed);

    h.queue
        .send(SCRAPE_QUEUE, serde_json::json!({"shelterSlug": 42}))
        .await
        .unwrap();
    let msg = h.queue.receive(SCRAPE_QUEUE, 1, visibility).await.unwrap().remove(0);
    assert_eq!(handle_message(&h.engine, h.queue.as_ref(), &msg, 5).await, Disposition::Rejected);

    let mut unknown = h.request();
    unknown.shelter_slug = "nobody".into();
    h.queue
        .send(SCRAPE_QUEUE, serde_json::to_value(&unknown).unwrap())
        .await
        .unwrap();
    let msg = h.queue.receive(SCRAPE_QUEUE, 1, visibility).await.unwrap().remove(0);
    assert_eq!(handle_message(&h.engine, h.queue.as_ref(), &msg, 5).await, Disposition::Rejected);
    assert!(h.queue.payloads(SCRAPE_QUEUE).await.is_empty());

    h.adapter.fail_fetch.store(true, Ordering::SeqCst);
    h.queue
        .send(SCRAPE_QUEUE, serde_json::to_value(h.request()).unwrap())
        .await
        .unwrap();
    let msg = h.queue.receive(SCRAPE_QUEUE, 1, visibility).await.unwrap().remove(0);
    assert_eq!(handle_message(&h.engine, h.queue.as_ref(), &msg, 5).await, Disposition::Retry);
    assert_eq!(h.queue.payloads(SCRAPE_QUEUE).await.len(), 1);
}

#[tokio::test]
async fn worker_drops_requests_past_the_attempt_limit() {
    let h = Harness::new().await;
    h.adapter.fail_fetch.store(true, Ordering::SeqCst);
    h.queue
        .send(SCRAPE_QUEUE, serde_json::to_value(h.request()).unwrap())
        .await
        .unwrap();

    for _ in 0..2 {
        let msg = h
            .queue
            .receive(SCRAPE_QUEUE, 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(handle_message(&h.engine, h.queue.as_ref(), &msg, 2).await, Disposition::Retry);
    }
    let msg = h
        .queue
        .receive(SCRAPE_QUEUE, 1, Duration::ZERO)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(msg.attempts, 3);
    assert_eq!(handle_message(&h.engine, h.queue.as_ref(), &msg, 2).await, Disposition::Rejected);
    assert!(h.queue.payloads(SCRAPE_QUEUE).await.is_empty());
}

#[tokio::test]
async fn worker_pool_drains_the_queue_and_stops_on_shutdown() {
    let h = Harness::new().await;
    h.adapter.set(h.raws("dog", 2));
    h.queue
        .send(SCRAPE_QUEUE, serde_json::to_value(h.request()).unwrap())
        .await
        .unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let pool = WorkerPool::new(
        h.engine.clone(),
        h.queue.clone(),
        WorkerConfig {
            workers: 2,
            idle_poll: Duration::from_millis(10),
            ..Default::default()
        },
    );
    let handle = tokio::spawn(pool.run(rx));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.store.listings().await.len() < 2 || !h.queue.payloads(SCRAPE_QUEUE).await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "worker never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool stops")
        .unwrap();

    let runs = h.store.sync_runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status(), SyncStatus::Success);
}
