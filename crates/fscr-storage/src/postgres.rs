//! Postgres-backed catalog store. Tables are described in `schema/catalog.sql`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fscr_core::{ActiveIndex, CanonicalStall, Coordinates, Location, StallStatus, SyncRun};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::{info_span, Instrument};

use crate::{CatalogStore, CommitOutcome, CommitPlan, StoreError};

const ACTIVE_INDEX_SQL: &str =
    "SELECT source_key, payload_hash FROM stalls WHERE status = 'active'";

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn stall_from_row(row: &PgRow, locations: Vec<Location>) -> Result<CanonicalStall, StoreError> {
    let status: String = row.try_get("status")?;
    let status = StallStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown stall status {status}")))?;
    let episode_number: Option<i32> = row.try_get("episode_number")?;
    Ok(CanonicalStall {
        id: row.try_get("id")?,
        source_key: row.try_get("source_key")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        cuisine_id: row.try_get("cuisine_id")?,
        cuisine_label: row.try_get("cuisine_label")?,
        country: row.try_get("country")?,
        primary_address: row.try_get("primary_address")?,
        episode_number: episode_number.and_then(|n| u32::try_from(n).ok()),
        dish_name: row.try_get("dish_name")?,
        price: row.try_get("price")?,
        host_rating: row.try_get("host_rating")?,
        guest_rating: row.try_get("guest_rating")?,
        opening_hours: row.try_get("opening_hours")?,
        time_categories: row.try_get::<Json<Vec<String>>, _>("time_categories")?.0,
        hits: row.try_get::<Json<Vec<String>>, _>("hits")?.0,
        misses: row.try_get::<Json<Vec<String>>, _>("misses")?.0,
        media_title: row.try_get("media_title")?,
        media_url: row.try_get("media_url")?,
        media_id: row.try_get("media_id")?,
        awards: row.try_get::<Json<Vec<String>>, _>("awards")?.0,
        status,
        rank_score: row.try_get("rank_score")?,
        inputs_hash: row.try_get("inputs_hash")?,
        media_hash: row.try_get("media_hash")?,
        payload_hash: row.try_get("payload_hash")?,
        locations,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

fn location_from_row(row: &PgRow) -> Result<Location, StoreError> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    Ok(Location {
        id: row.try_get("id")?,
        stall_id: row.try_get("stall_id")?,
        address: row.try_get("address")?,
        coordinates: latitude.zip(longitude).map(|(latitude, longitude)| Coordinates {
            latitude,
            longitude,
        }),
        media_url: row.try_get("media_url")?,
        is_primary: row.try_get("is_primary")?,
        is_active: row.try_get("is_active")?,
    })
}

async fn upsert_stall(
    tx: &mut Transaction<'_, Postgres>,
    stall: &CanonicalStall,
    synced_at: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let episode_number = stall.episode_number.and_then(|n| i32::try_from(n).ok());
    sqlx::query(
        r#"
        INSERT INTO stalls (
            id, source_key, slug, name, cuisine_id, cuisine_label, country, primary_address,
            episode_number, dish_name, price, host_rating, guest_rating, opening_hours,
            time_categories, hits, misses, media_title, media_url, media_id, awards,
            status, rank_score, inputs_hash, media_hash, payload_hash, last_synced_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19, $20, $21, 'active', $22, $23, $24, $25, $26
        )
        ON CONFLICT (id) DO UPDATE SET
            slug = EXCLUDED.slug,
            name = EXCLUDED.name,
            cuisine_id = EXCLUDED.cuisine_id,
            cuisine_label = EXCLUDED.cuisine_label,
            country = EXCLUDED.country,
            primary_address = EXCLUDED.primary_address,
            episode_number = EXCLUDED.episode_number,
            dish_name = EXCLUDED.dish_name,
            price = EXCLUDED.price,
            host_rating = EXCLUDED.host_rating,
            guest_rating = EXCLUDED.guest_rating,
            opening_hours = EXCLUDED.opening_hours,
            time_categories = EXCLUDED.time_categories,
            hits = EXCLUDED.hits,
            misses = EXCLUDED.misses,
            media_title = EXCLUDED.media_title,
            media_url = EXCLUDED.media_url,
            media_id = EXCLUDED.media_id,
            awards = EXCLUDED.awards,
            status = 'active',
            rank_score = EXCLUDED.rank_score,
            inputs_hash = EXCLUDED.inputs_hash,
            media_hash = EXCLUDED.media_hash,
            payload_hash = EXCLUDED.payload_hash,
            last_synced_at = EXCLUDED.last_synced_at
        "#,
    )
    .bind(&stall.id)
    .bind(&stall.source_key)
    .bind(&stall.slug)
    .bind(&stall.name)
    .bind(&stall.cuisine_id)
    .bind(&stall.cuisine_label)
    .bind(&stall.country)
    .bind(&stall.primary_address)
    .bind(episode_number)
    .bind(&stall.dish_name)
    .bind(stall.price)
    .bind(stall.host_rating)
    .bind(stall.guest_rating)
    .bind(&stall.opening_hours)
    .bind(Json(&stall.time_categories))
    .bind(Json(&stall.hits))
    .bind(Json(&stall.misses))
    .bind(&stall.media_title)
    .bind(&stall.media_url)
    .bind(&stall.media_id)
    .bind(Json(&stall.awards))
    .bind(stall.rank_score)
    .bind(&stall.inputs_hash)
    .bind(&stall.media_hash)
    .bind(&stall.payload_hash)
    .bind(synced_at)
    .execute(&mut **tx)
    .await?;

    // at most one primary per stall at any point inside the transaction
    sqlx::query("UPDATE stall_locations SET is_primary = FALSE WHERE stall_id = $1 AND is_primary")
        .bind(&stall.id)
        .execute(&mut **tx)
        .await?;

    for location in &stall.locations {
        sqlx::query(
            r#"
            INSERT INTO stall_locations (
                id, stall_id, address, latitude, longitude, media_url, is_primary, is_active, last_synced_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8)
            ON CONFLICT (id) DO UPDATE SET
                address = EXCLUDED.address,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                media_url = EXCLUDED.media_url,
                is_primary = EXCLUDED.is_primary,
                is_active = TRUE,
                last_synced_at = EXCLUDED.last_synced_at
            "#,
        )
        .bind(&location.id)
        .bind(&stall.id)
        .bind(&location.address)
        .bind(location.coordinates.map(|c| c.latitude))
        .bind(location.coordinates.map(|c| c.longitude))
        .bind(&location.media_url)
        .bind(location.is_primary)
        .bind(synced_at)
        .execute(&mut **tx)
        .await?;
    }

    let confirmed: Vec<String> = stall.locations.iter().map(|l| l.id.clone()).collect();
    let deactivated = sqlx::query(
        r#"
        UPDATE stall_locations
           SET is_active = FALSE,
               is_primary = FALSE,
               last_synced_at = $3
         WHERE stall_id = $1
           AND is_active
           AND NOT (id = ANY($2))
        "#,
    )
    .bind(&stall.id)
    .bind(&confirmed)
    .bind(synced_at)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok(deactivated)
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn load_active_index(&self) -> Result<ActiveIndex, StoreError> {
        let rows = sqlx::query(ACTIVE_INDEX_SQL)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, String), StoreError> {
                Ok((row.try_get("source_key")?, row.try_get("payload_hash")?))
            })
            .collect()
    }

    async fn load_slug_index(
        &self,
        closed_since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_key, slug
              FROM stalls
             WHERE status = 'active'
                OR last_synced_at >= $1
            "#,
        )
        .bind(closed_since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, String), StoreError> {
                Ok((row.try_get("source_key")?, row.try_get("slug")?))
            })
            .collect()
    }

    async fn fetch_stall(&self, source_key: &str) -> Result<Option<CanonicalStall>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM stalls WHERE source_key = $1")
            .bind(source_key)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let stall_id: String = row.try_get("id")?;
        let location_rows = sqlx::query(
            r#"
            SELECT id, stall_id, address, latitude, longitude, media_url, is_primary, is_active
              FROM stall_locations
             WHERE stall_id = $1
             ORDER BY is_primary DESC, id
            "#,
        )
        .bind(&stall_id)
        .fetch_all(&self.pool)
        .await?;
        let locations = location_rows
            .iter()
            .map(location_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        stall_from_row(&row, locations).map(Some)
    }

    async fn commit(&self, plan: &CommitPlan) -> Result<CommitOutcome, StoreError> {
        let span = info_span!(
            "catalog_commit",
            upserts = plan.upserts.len(),
            closures = plan.closures.len()
        );
        async move {
            let mut outcome = CommitOutcome::default();
            let mut tx = self.pool.begin().await?;

            for stall in &plan.upserts {
                let deactivated = upsert_stall(&mut tx, stall, plan.synced_at).await?;
                outcome.stalls_written += 1;
                outcome.locations_written += stall.locations.len();
                outcome.locations_deactivated += deactivated as usize;
            }

            if !plan.closures.is_empty() {
                let closed = sqlx::query(
                    r#"
                    UPDATE stalls
                       SET status = 'closed',
                           last_synced_at = $2
                     WHERE source_key = ANY($1)
                       AND status = 'active'
                    "#,
                )
                .bind(&plan.closures)
                .bind(plan.synced_at)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                let deactivated = sqlx::query(
                    r#"
                    UPDATE stall_locations
                       SET is_active = FALSE,
                           last_synced_at = $2
                     WHERE is_active
                       AND stall_id IN (SELECT id FROM stalls WHERE source_key = ANY($1))
                    "#,
                )
                .bind(&plan.closures)
                .bind(plan.synced_at)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                outcome.stalls_closed = closed as usize;
                outcome.locations_deactivated += deactivated as usize;
            }

            tx.commit().await?;
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    async fn record_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        let summary: serde_json::Value = serde_json::from_str(&run.summary)?;
        sqlx::query(
            r#"
            INSERT INTO sync_runs (id, trigger, mode, status, started_at, finished_at, summary, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(run.id)
        .bind(run.trigger.as_str())
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(Json(summary))
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
