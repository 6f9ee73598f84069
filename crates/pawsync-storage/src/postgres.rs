//! PostgreSQL implementations of [`RelationalStore`] and [`JobQueue`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pawsync_core::{
    Listing, ListingStatus, PersistenceError, PhotoAttributes, QueueSendError, Shelter, SyncRun,
    SyncStatus, TextAttributes,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{JobQueue, QueueError, QueueMessage, RelationalStore};

const LISTING_COLUMNS: &str = "id, shelter_id, external_id, fingerprint, name, status, curated_at, \
     description, sex, source_url, photos, city, breeds, size, age_months, personality_tags, \
     text_attributes, photo_attributes, bio, last_seen_at, created_at, updated_at";

const SYNC_RUN_COLUMNS: &str = "id, shelter_id, started_at, finished_at, dogs_added, \
     dogs_updated, dogs_removed, errors, error_message";

const SHELTER_COLUMNS: &str = "id, slug, name, base_url, active, status, last_sync";

fn db_err(operation: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |err| PersistenceError::new(operation, err)
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

fn parse_optional_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| value.parse::<T>())
        .transpose()
        .map_err(|err| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(err),
        })
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn listing_from_row(row: &PgRow) -> Result<Listing, sqlx::Error> {
    Ok(Listing {
        id: row.try_get("id")?,
        shelter_id: row.try_get("shelter_id")?,
        external_id: row.try_get("external_id")?,
        fingerprint: row.try_get("fingerprint")?,
        name: row.try_get("name")?,
        status: parse_column(row, "status")?,
        curated_at: row.try_get("curated_at")?,
        description: row.try_get("description")?,
        sex: parse_optional_column(row, "sex")?,
        source_url: row.try_get("source_url")?,
        photos: row.try_get("photos")?,
        city: row.try_get("city")?,
        breeds: row.try_get("breeds")?,
        size: parse_optional_column(row, "size")?,
        age_months: row.try_get::<Option<i32>, _>("age_months")?.map(to_u32),
        personality_tags: row.try_get("personality_tags")?,
        text_attributes: row
            .try_get::<Option<Json<TextAttributes>>, _>("text_attributes")?
            .map(|json| json.0),
        photo_attributes: row
            .try_get::<Option<Json<PhotoAttributes>>, _>("photo_attributes")?
            .map(|json| json.0),
        bio: row.try_get("bio")?,
        last_seen_at: row.try_get("last_seen_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_run_from_row(row: &PgRow) -> Result<SyncRun, sqlx::Error> {
    Ok(SyncRun {
        id: row.try_get("id")?,
        shelter_id: row.try_get("shelter_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        dogs_added: to_u32(row.try_get("dogs_added")?),
        dogs_updated: to_u32(row.try_get("dogs_updated")?),
        dogs_removed: to_u32(row.try_get("dogs_removed")?),
        errors: row.try_get("errors")?,
        error_message: row.try_get("error_message")?,
    })
}

fn shelter_from_row(row: &PgRow) -> Result<Shelter, sqlx::Error> {
    Ok(Shelter {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        base_url: row.try_get("base_url")?,
        active: row.try_get("active")?,
        status: parse_optional_column(row, "status")?,
        last_sync: row.try_get("last_sync")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn upsert_by_fingerprint(&self, listing: &Listing) -> Result<Listing, PersistenceError> {
        let sql = format!(
            "INSERT INTO listings ({LISTING_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
             ON CONFLICT (fingerprint) DO UPDATE SET
                 last_seen_at = GREATEST(listings.last_seen_at, EXCLUDED.last_seen_at),
                 updated_at = EXCLUDED.updated_at,
                 text_attributes = COALESCE(listings.text_attributes, EXCLUDED.text_attributes),
                 photo_attributes = COALESCE(listings.photo_attributes, EXCLUDED.photo_attributes),
                 bio = COALESCE(listings.bio, EXCLUDED.bio),
                 personality_tags = CASE WHEN cardinality(listings.personality_tags) = 0
                     THEN EXCLUDED.personality_tags ELSE listings.personality_tags END,
                 breeds = CASE WHEN cardinality(listings.breeds) = 0
                     THEN EXCLUDED.breeds ELSE listings.breeds END,
                 size = COALESCE(listings.size, EXCLUDED.size),
                 age_months = COALESCE(listings.age_months, EXCLUDED.age_months),
                 sex = COALESCE(listings.sex, EXCLUDED.sex),
                 city = COALESCE(listings.city, EXCLUDED.city)
             RETURNING {LISTING_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(listing.id)
            .bind(listing.shelter_id)
            .bind(&listing.external_id)
            .bind(&listing.fingerprint)
            .bind(&listing.name)
            .bind(listing.status.as_str())
            .bind(listing.curated_at)
            .bind(&listing.description)
            .bind(listing.sex.map(|s| s.as_str()))
            .bind(&listing.source_url)
            .bind(&listing.photos)
            .bind(&listing.city)
            .bind(&listing.breeds)
            .bind(listing.size.map(|s| s.as_str()))
            .bind(listing.age_months.map(to_i32))
            .bind(&listing.personality_tags)
            .bind(listing.text_attributes.clone().map(Json))
            .bind(listing.photo_attributes.clone().map(Json))
            .bind(&listing.bio)
            .bind(listing.last_seen_at)
            .bind(listing.created_at)
            .bind(listing.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                PersistenceError::new("upsert_by_fingerprint", err).for_shelter(listing.shelter_id)
            })?;
        listing_from_row(&row).map_err(db_err("upsert_by_fingerprint"))
    }

    async fn select_by_shelter(&self, shelter_id: Uuid) -> Result<Vec<Listing>, PersistenceError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE shelter_id = $1");
        let rows = sqlx::query(&sql)
            .bind(shelter_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| PersistenceError::new("select_by_shelter", err).for_shelter(shelter_id))?;
        rows.iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("select_by_shelter"))
    }

    async fn get_listing(&self, id: Uuid) -> Result<Option<Listing>, PersistenceError> {
        let sql = format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_listing"))?;
        row.as_ref()
            .map(listing_from_row)
            .transpose()
            .map_err(db_err("get_listing"))
    }

    async fn touch_listings(
        &self,
        ids: &[Uuid],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("UPDATE listings SET last_seen_at = $1 WHERE id = ANY($2)")
            .bind(seen_at)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(db_err("touch_listings"))?;
        Ok(result.rows_affected())
    }

    async fn set_listing_status(
        &self,
        id: Uuid,
        status: ListingStatus,
        at: DateTime<Utc>,
        curated: bool,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            "UPDATE listings
             SET status = $1,
                 updated_at = $2,
                 curated_at = CASE WHEN $3 THEN $2 ELSE curated_at END
             WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(curated)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("set_listing_status", err).for_listing(id))?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::new("set_listing_status", "no such listing").for_listing(id));
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
        let result = sqlx::query(
            "UPDATE listings
             SET status = $1, updated_at = $2, curated_at = NULL
             WHERE id = $3 AND status = $4 AND curated_at IS NOT DISTINCT FROM $5",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(id)
        .bind(expected.as_str())
        .bind(expected_curated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("transition_listing", err).for_listing(id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_listing(&self, id: Uuid) -> Result<Option<Listing>, PersistenceError> {
        let sql = format!("DELETE FROM listings WHERE id = $1 RETURNING {LISTING_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| PersistenceError::new("delete_listing", err).for_listing(id))?;
        row.as_ref()
            .map(listing_from_row)
            .transpose()
            .map_err(db_err("delete_listing"))
    }

    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), PersistenceError> {
        let sql = format!(
            "INSERT INTO sync_runs ({SYNC_RUN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        sqlx::query(&sql)
            .bind(run.id)
            .bind(run.shelter_id)
            .bind(run.started_at)
            .bind(run.finished_at)
            .bind(to_i32(run.dogs_added))
            .bind(to_i32(run.dogs_updated))
            .bind(to_i32(run.dogs_removed))
            .bind(&run.errors)
            .bind(&run.error_message)
            .execute(&self.pool)
            .await
            .map_err(|err| PersistenceError::new("insert_sync_run", err).for_shelter(run.shelter_id))?;
        Ok(())
    }

    async fn get_sync_run(&self, id: Uuid) -> Result<Option<SyncRun>, PersistenceError> {
        let sql = format!("SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get_sync_run"))?;
        row.as_ref()
            .map(sync_run_from_row)
            .transpose()
            .map_err(db_err("get_sync_run"))
    }

    async fn latest_sync_run(
        &self,
        shelter_id: Uuid,
    ) -> Result<Option<SyncRun>, PersistenceError> {
        let sql = format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE shelter_id = $1
             ORDER BY started_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(shelter_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| PersistenceError::new("latest_sync_run", err).for_shelter(shelter_id))?;
        row.as_ref()
            .map(sync_run_from_row)
            .transpose()
            .map_err(db_err("latest_sync_run"))
    }

    async fn finish_sync_run(&self, run: &SyncRun) -> Result<bool, PersistenceError> {
        let result = sqlx::query(
            "UPDATE sync_runs
             SET finished_at = $1, dogs_added = $2, dogs_updated = $3, dogs_removed = $4,
                 errors = $5, error_message = $6
             WHERE id = $7 AND finished_at IS NULL",
        )
        .bind(run.finished_at.unwrap_or_else(Utc::now))
        .bind(to_i32(run.dogs_added))
        .bind(to_i32(run.dogs_updated))
        .bind(to_i32(run.dogs_removed))
        .bind(&run.errors)
        .bind(&run.error_message)
        .bind(run.id)
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("finish_sync_run", err).for_shelter(run.shelter_id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_stale_sync_runs(
        &self,
        started_before: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Uuid>, PersistenceError> {
        let rows = sqlx::query(
            "UPDATE sync_runs SET finished_at = $1, error_message = $2
             WHERE finished_at IS NULL AND started_at < $3
             RETURNING id",
        )
        .bind(finished_at)
        .bind(error_message)
        .bind(started_before)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("finish_stale_sync_runs"))?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("finish_stale_sync_runs"))
    }

    async fn upsert_shelter(&self, shelter: &Shelter) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO shelters (id, slug, name, base_url, active)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                 slug = EXCLUDED.slug, name = EXCLUDED.name,
                 base_url = EXCLUDED.base_url, active = EXCLUDED.active",
        )
        .bind(shelter.id)
        .bind(&shelter.slug)
        .bind(&shelter.name)
        .bind(&shelter.base_url)
        .bind(shelter.active)
        .execute(&self.pool)
        .await
        .map_err(|err| PersistenceError::new("upsert_shelter", err).for_shelter(shelter.id))?;
        Ok(())
    }

    async fn list_shelters(&self) -> Result<Vec<Shelter>, PersistenceError> {
        let sql = format!("SELECT {SHELTER_COLUMNS} FROM shelters ORDER BY slug");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list_shelters"))?;
        rows.iter()
            .map(shelter_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err("list_shelters"))
    }

    async fn update_shelter(
        &self,
        shelter_id: Uuid,
        last_sync: DateTime<Utc>,
        status: SyncStatus,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE shelters SET last_sync = $1, status = $2 WHERE id = $3")
            .bind(last_sync)
            .bind(status.as_str())
            .bind(shelter_id)
            .execute(&self.pool)
            .await
            .map_err(|err| PersistenceError::new("update_shelter", err).for_shelter(shelter_id))?;
        Ok(())
    }
}

/// Queue table polled with `FOR UPDATE SKIP LOCKED`; visibility is a
/// `visible_at` timestamp pushed forward on every delivery.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn send_batch(
        &self,
        queue: &str,
        payloads: Vec<serde_json::Value>,
    ) -> Result<(), QueueSendError> {
        let batch_size = payloads.len();
        let send_err = |err: sqlx::Error| QueueSendError::new(queue, batch_size, err);

        let mut tx = self.pool.begin().await.map_err(send_err)?;
        for payload in payloads {
            sqlx::query(
                "INSERT INTO queue_messages (id, queue, payload, attempts, visible_at, enqueued_at)
                 VALUES ($1, $2, $3, 0, now(), now())",
            )
            .bind(Uuid::new_v4())
            .bind(queue)
            .bind(Json(payload))
            .execute(&mut *tx)
            .await
            .map_err(send_err)?;
        }
        tx.commit().await.map_err(send_err)
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let rows = sqlx::query(
            "UPDATE queue_messages
             SET attempts = attempts + 1,
                 visible_at = now() + make_interval(secs => $3)
             WHERE id IN (
                 SELECT id FROM queue_messages
                 WHERE queue = $1 AND visible_at <= now()
                 ORDER BY enqueued_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, queue, payload, attempts, enqueued_at",
        )
        .bind(queue)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .bind(visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| QueueError::Backend(err.to_string()))?;

        rows.iter()
            .map(|row| -> Result<QueueMessage, sqlx::Error> {
                Ok(QueueMessage {
                    id: row.try_get("id")?,
                    queue: row.try_get("queue")?,
                    payload: row.try_get::<Json<serde_json::Value>, _>("payload")?.0,
                    attempts: to_u32(row.try_get("attempts")?),
                    enqueued_at: row.try_get("enqueued_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|err| QueueError::Backend(err.to_string()))
    }

    async fn ack(&self, message_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|err| QueueError::Backend(err.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownMessage(message_id));
        }
        Ok(())
    }
}
