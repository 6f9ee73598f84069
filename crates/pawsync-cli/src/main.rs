use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pawsync_core::{ListingStatus, ScrapeRequest};
use pawsync_storage::{FsBlobStore, PgJobQueue, PgStore, RelationalStore};
use pawsync_sync::{
    build_engine, enqueue_scrapes, maybe_build_scheduler, shelter_statuses, worker_config,
    Curator, PhotoCleanupPool, StaleRunCollector, SyncConfig, WorkerPool,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pawsync")]
#[command(about = "Adoptable listing reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consume scrape requests until Ctrl-C.
    Worker,
    /// Reconcile one shelter now, bypassing the queue.
    Sync { slug: String },
    /// Queue scrape requests for every active shelter, or for one.
    Enqueue { slug: Option<String> },
    /// Force-finish sync runs whose worker never completed.
    Gc,
    Migrate,
    Status,
    /// Record a curated status for a listing.
    Curate {
        listing_id: Uuid,
        status: ListingStatus,
    },
    /// Delete a listing and its stored photos.
    Delete { listing_id: Uuid },
}

async fn connect(config: &SyncConfig) -> Result<(Arc<PgStore>, Arc<PgJobQueue>)> {
    let store = PgStore::connect(&config.database_url).await?;
    let queue = PgJobQueue::new(store.pool().clone());
    Ok((Arc::new(store), Arc::new(queue)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let (store, queue) = connect(&config).await?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Worker => {
            let engine = Arc::new(build_engine(&config, store.clone(), queue.clone()).await?);
            let mut scheduler = maybe_build_scheduler(&config, store.clone(), queue.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(sync = %config.sync_cron, gc = %config.gc_cron, "scheduler started");
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let pool = WorkerPool::new(engine, queue.clone(), worker_config(&config));
            let workers = tokio::spawn(pool.run(shutdown_rx));

            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutdown requested; finishing in-flight runs");
            let _ = shutdown_tx.send(true);
            workers.await.context("joining worker pool")?;
            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Sync { slug } => {
            let engine = build_engine(&config, store.clone(), queue.clone()).await?;
            let shelter = store
                .list_shelters()
                .await?
                .into_iter()
                .find(|s| s.slug == slug)
                .with_context(|| format!("unknown shelter `{slug}`"))?;
            let outcome = engine.run(&ScrapeRequest::for_shelter(&shelter)).await?;
            println!(
                "sync complete: run_id={} status={} added={} updated={} removed={} errors={}",
                outcome.run.id,
                outcome.run.status(),
                outcome.run.dogs_added,
                outcome.run.dogs_updated,
                outcome.run.dogs_removed,
                outcome.run.errors.len()
            );
            for error in &outcome.run.errors {
                println!("  - {error}");
            }
        }
        Commands::Enqueue { slug } => {
            let sources = pawsync_sync::load_sources(&config.sources_path()).await?;
            pawsync_sync::register_shelters(store.as_ref(), &sources).await?;
            let queued = enqueue_scrapes(store.as_ref(), queue.as_ref(), slug.as_deref()).await?;
            println!("queued {queued} scrape request(s)");
        }
        Commands::Gc => {
            let collector = StaleRunCollector::new(store.clone(), config.stale_run_timeout());
            let closed = collector.collect(Utc::now()).await?;
            println!("closed {} stale sync run(s)", closed.len());
        }
        Commands::Status => {
            for status in shelter_statuses(store.as_ref()).await? {
                println!("{}", status.summary_line());
            }
        }
        Commands::Curate { listing_id, status } => {
            let curator = Curator::new(store.clone(), queue.clone());
            let listing = curator.set_status(listing_id, status, Utc::now()).await?;
            println!("{} ({}) is now {}", listing.name, listing.id, listing.status);
        }
        Commands::Delete { listing_id } => {
            let mut curator = Curator::new(store.clone(), queue.clone());
            let mut cleanup = None;
            if let Some(base) = &config.blob_base_url {
                let blobs = Arc::new(FsBlobStore::new(&config.blob_dir));
                let (pool, failures) = PhotoCleanupPool::spawn(blobs, 2, 64);
                let pool = Arc::new(pool);
                curator = curator.with_photo_cleanup(pool.clone(), base.clone());
                cleanup = Some((pool, failures));
            }

            let listing = curator.delete(listing_id).await?;
            println!("deleted {} ({})", listing.name, listing.id);

            drop(curator);
            if let Some((pool, mut failures)) = cleanup {
                if let Ok(pool) = Arc::try_unwrap(pool) {
                    pool.shutdown().await;
                }
                while let Some(failure) = failures.recv().await {
                    eprintln!("photo cleanup failed for {}: {}", failure.key, failure.cause);
                }
            }
        }
    }

    Ok(())
}
