//! One reconciliation run: scrape, diff, enrich, persist, heartbeat, sweep,
//! fan out, close the run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pawsync_adapters::{AdapterRegistry, ScrapeConfig, SourceAdapter};
use pawsync_core::{
    ImageProcessingJob, Listing, ListingStatus, NormalizedListing, ParseError, PersistenceError,
    ReindexJob, ScrapeError, ScrapeRequest, SyncRun,
};
use pawsync_storage::{JobQueue, RelationalStore};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::bookkeeping::{finalize_run, open_run};
use crate::breaker::{BreakerDecision, CircuitBreaker};
use crate::config::EngineConfig;
use crate::diff::{partition, DiffPartition};
use crate::enrichment::Enricher;
use crate::fanout::{FanOut, FanOutReport};
use crate::mapping::{external_photos, new_listing};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no adapter registered for shelter `{slug}`")]
    UnknownSource { slug: String },
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl RunError {
    /// Whether the inbound request should be left for redelivery.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnknownSource { .. } => false,
            Self::Scrape(_) | Self::Parse(_) | Self::Persistence(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: SyncRun,
    pub breaker_tripped: bool,
    pub resurrected: usize,
    pub fan_out: FanOutReport,
}

pub struct ReconciliationEngine {
    store: Arc<dyn RelationalStore>,
    queue: Arc<dyn JobQueue>,
    adapters: AdapterRegistry,
    enricher: Enricher,
    breaker: CircuitBreaker,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn RelationalStore>,
        queue: Arc<dyn JobQueue>,
        adapters: AdapterRegistry,
        enricher: Enricher,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            adapters,
            enricher,
            breaker: CircuitBreaker::new(config.breaker_ratio),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    pub async fn run(&self, request: &ScrapeRequest) -> Result<RunOutcome, RunError> {
        self.run_at(request, Utc::now()).await
    }

    /// Same as [`run`](Self::run) with an explicit notion of "now" for
    /// heartbeat and staleness decisions.
    pub async fn run_at(
        &self,
        request: &ScrapeRequest,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, RunError> {
        let adapter = self
            .adapters
            .get(&request.shelter_slug)
            .ok_or_else(|| RunError::UnknownSource {
                slug: request.shelter_slug.clone(),
            })?;
        let mut run = open_run(self.store.as_ref(), request, now).await?;

        let span = info_span!(
            "reconcile",
            shelter = %request.shelter_slug,
            shelter_id = %request.shelter_id,
            sync_run_id = %run.id,
        );
        async {
            match self.reconcile(adapter.as_ref(), request, &mut run, now).await {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    self.abort(&mut run, &err, now).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile(
        &self,
        adapter: &dyn SourceAdapter,
        request: &ScrapeRequest,
        run: &mut SyncRun,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, RunError> {
        let scrape_config = ScrapeConfig {
            shelter_id: request.shelter_id,
            shelter_slug: request.shelter_slug.clone(),
            base_url: request.base_url.clone(),
            run_id: run.id,
        };
        let raw = adapter.fetch(&scrape_config).await?;
        let parsed = adapter.parse(&raw, &scrape_config)?;
        let scraped: Vec<NormalizedListing> = parsed
            .iter()
            .map(|listing| adapter.transform(listing, &scrape_config))
            .collect();

        let existing = self.store.select_by_shelter(request.shelter_id).await?;
        let expected = existing.iter().filter(|l| l.status.is_active()).count();
        let diff = partition(scraped, existing);
        info!(
            new = diff.new.len(),
            matched = diff.matched.len(),
            missing = diff.missing.len(),
            duplicates = diff.duplicates,
            "diff computed"
        );

        // Duplicate fingerprints still count toward the scrape size.
        let decision = self
            .breaker
            .evaluate(diff.scraped() + diff.duplicates, expected);
        if let BreakerDecision::Tripped { scraped, expected } = decision {
            let diagnostic = self.breaker.diagnostic(scraped, expected);
            warn!(scraped, expected, "circuit breaker tripped; removals suppressed");
            run.errors.push(diagnostic);
        }

        let DiffPartition {
            new,
            matched,
            missing,
            ..
        } = diff;
        let mut fan_out = FanOut::default();

        self.create_new(new, run, &mut fan_out, now).await;
        let resurrected = self.heartbeat(&matched, run, now).await;
        if !decision.is_tripped() {
            // Matched rows were just heartbeated, so only the missing
            // partition can hold stale rows.
            self.sweep(&missing, run, &mut fan_out, now).await;
        }

        let report = fan_out.flush(self.queue.as_ref(), self.config.reindex_batch).await;
        for failure in &report.failures {
            run.errors.push(failure.clone());
        }

        finalize_run(self.store.as_ref(), run, Utc::now().max(now)).await?;
        info!(
            added = run.dogs_added,
            updated = run.dogs_updated,
            removed = run.dogs_removed,
            errors = run.errors.len(),
            status = %run.status(),
            "sync run finished"
        );

        Ok(RunOutcome {
            run: run.clone(),
            breaker_tripped: decision.is_tripped(),
            resurrected,
            fan_out: report,
        })
    }

    async fn create_new(
        &self,
        new: Vec<NormalizedListing>,
        run: &mut SyncRun,
        fan_out: &mut FanOut,
        now: DateTime<Utc>,
    ) {
        if new.is_empty() {
            return;
        }
        let enriched = self.enricher.enrich_all(new).await;
        for (normalized, enrichment) in enriched {
            let row = new_listing(normalized, enrichment, now);
            match self.store.upsert_by_fingerprint(&row).await {
                Ok(stored) => {
                    run.dogs_added += 1;
                    fan_out.reindex.push(ReindexJob::upsert(&stored));
                    let urls =
                        external_photos(&stored.photos, self.config.blob_base_url.as_deref());
                    if !urls.is_empty() {
                        fan_out.images.push(ImageProcessingJob {
                            dog_id: stored.id,
                            urls,
                        });
                    }
                }
                Err(err) => {
                    warn!(fingerprint = %row.fingerprint, error = %err, "skipping listing");
                    run.errors.push(err.to_string());
                }
            }
        }
    }

    /// Refreshes `last_seen_at` on every matched row and brings back
    /// reconciliation-removed rows whose fingerprint reappeared. A curated
    /// removal stays removed.
    async fn heartbeat(
        &self,
        matched: &[Listing],
        run: &mut SyncRun,
        now: DateTime<Utc>,
    ) -> usize {
        if matched.is_empty() {
            return 0;
        }
        let ids: Vec<_> = matched.iter().map(|l| l.id).collect();
        match self.store.touch_listings(&ids, now).await {
            Ok(_) => run.dogs_updated = u32::try_from(ids.len()).unwrap_or(u32::MAX),
            Err(err) => {
                warn!(error = %err, "heartbeat failed");
                run.errors.push(err.for_shelter(run.shelter_id).to_string());
            }
        }

        let mut resurrected = 0;
        for row in matched
            .iter()
            .filter(|l| l.status == ListingStatus::Removed && !l.is_curated())
        {
            match self
                .store
                .transition_listing(
                    row.id,
                    ListingStatus::Removed,
                    row.curated_at,
                    ListingStatus::Available,
                    now,
                )
                .await
            {
                Ok(true) => {
                    info!(listing_id = %row.id, "listing reappeared; marked available");
                    resurrected += 1;
                }
                Ok(false) => {
                    info!(listing_id = %row.id, "listing changed since the snapshot; not resurrected");
                }
                Err(err) => {
                    warn!(listing_id = %row.id, error = %err, "resurrection failed");
                    run.errors.push(err.to_string());
                }
            }
        }
        resurrected
    }

    async fn sweep(
        &self,
        candidates: &[Listing],
        run: &mut SyncRun,
        fan_out: &mut FanOut,
        now: DateTime<Utc>,
    ) {
        let cutoff = now - self.config.staleness;
        for row in candidates
            .iter()
            .filter(|l| l.status != ListingStatus::Removed && l.last_seen_at < cutoff)
        {
            match self
                .store
                .transition_listing(
                    row.id,
                    row.status,
                    row.curated_at,
                    ListingStatus::Removed,
                    now,
                )
                .await
            {
                Ok(true) => {
                    run.dogs_removed += 1;
                    fan_out.reindex.push(ReindexJob::delete(row.id));
                }
                Ok(false) => {
                    info!(listing_id = %row.id, "listing changed since the snapshot; removal skipped");
                }
                Err(err) => {
                    warn!(listing_id = %row.id, error = %err, "removal failed");
                    run.errors.push(err.to_string());
                }
            }
        }
    }

    async fn abort(&self, run: &mut SyncRun, err: &RunError, now: DateTime<Utc>) {
        error!(error = %err, retryable = err.is_retryable(), "sync run failed");
        run.error_message = Some(err.to_string());
        if let Err(finalize_err) =
            finalize_run(self.store.as_ref(), run, Utc::now().max(now)).await
        {
            error!(error = %finalize_err, "could not record failed sync run");
        }
    }
}
