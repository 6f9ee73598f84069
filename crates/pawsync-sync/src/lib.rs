//! Listing reconciliation for pawsync: one run per scrape request, plus the
//! worker pool, scheduler and maintenance paths around it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pawsync_adapters::{AdapterRegistry, SourceEntry};
use pawsync_storage::{HttpClient, HttpClientConfig, JobQueue, RelationalStore};
use tracing::info;

pub mod bookkeeping;
pub mod breaker;
pub mod cleanup;
pub mod config;
pub mod curation;
pub mod diff;
pub mod engine;
pub mod enrichment;
pub mod fanout;
pub mod mapping;
pub mod scheduler;
pub mod status;
pub mod worker;

pub use bookkeeping::{StaleRunCollector, STALE_RUN_MESSAGE};
pub use breaker::{BreakerDecision, CircuitBreaker};
pub use cleanup::{CleanupFailure, CleanupTask, PhotoCleanupPool};
pub use config::{load_sources, EngineConfig, SyncConfig};
pub use curation::{CurationError, Curator};
pub use diff::{partition, DiffPartition};
pub use engine::{ReconciliationEngine, RunError, RunOutcome};
pub use enrichment::{
    DisabledEnrichment, Enricher, Enrichment, EnrichmentServices, HttpEnrichmentClient,
};
pub use scheduler::{enqueue_scrapes, maybe_build_scheduler};
pub use status::{shelter_statuses, ShelterStatus};
pub use worker::{handle_message, Disposition, WorkerConfig, WorkerPool};

pub const CRATE_NAME: &str = "pawsync-sync";

pub fn http_client(config: &SyncConfig) -> Result<HttpClient> {
    HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

/// HTTP enrichment when a service URL is configured, otherwise disabled.
pub fn enricher_from_config(config: &SyncConfig, http: &HttpClient) -> Enricher {
    let engine = config.engine();
    let services: Arc<dyn EnrichmentServices> = match &config.enrichment_url {
        Some(url) => Arc::new(HttpEnrichmentClient::new(http.clone(), url.clone())),
        None => {
            info!("no enrichment service configured; listings are stored unenriched");
            Arc::new(DisabledEnrichment)
        }
    };
    Enricher::new(
        services,
        engine.enrichment_timeout,
        engine.enrichment_concurrency,
    )
}

/// Mirrors `sources.yaml` into the store so scheduling and status see every
/// shelter.
pub async fn register_shelters(
    store: &dyn RelationalStore,
    sources: &[SourceEntry],
) -> Result<usize> {
    for source in sources {
        store
            .upsert_shelter(&source.to_shelter())
            .await
            .with_context(|| format!("registering shelter {}", source.slug))?;
    }
    Ok(sources.len())
}

/// Wires an engine from environment config and the source registry.
pub async fn build_engine(
    config: &SyncConfig,
    store: Arc<dyn RelationalStore>,
    queue: Arc<dyn JobQueue>,
) -> Result<ReconciliationEngine> {
    let sources = load_sources(&config.sources_path()).await?;
    register_shelters(store.as_ref(), &sources).await?;
    let http = http_client(config)?;
    let adapters = AdapterRegistry::from_sources(&sources, &config.workspace_root, &http);
    info!(shelters = adapters.len(), "source registry loaded");
    Ok(ReconciliationEngine::new(
        store,
        queue,
        adapters,
        enricher_from_config(config, &http),
        config.engine(),
    ))
}

pub fn worker_config(config: &SyncConfig) -> WorkerConfig {
    WorkerConfig {
        workers: config.workers.max(1),
        visibility: Duration::from_secs(config.visibility_secs.max(1)),
        max_attempts: config.max_attempts.max(1),
        ..Default::default()
    }
}
