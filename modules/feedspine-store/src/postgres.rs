//! Postgres-backed store.
//!
//! Natural-key uniqueness rides on a UNIQUE index; per-key sighting
//! appends serialize through a transaction-scoped advisory lock on the
//! key hash, so the first-sighting answer and the append commit
//! together. Sightings carry a BIGSERIAL `seq` to break `seen_at` ties
//! in append order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use feedspine_core::{
    Content, FeedSpineError, Layer, Metadata, NaturalKey, Record, RecordId, Sighting, SightingId,
};

use crate::traits::{OrderBy, RecordQuery, RecordStore};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, FeedSpineError> {
        let pool = PgPool::connect(url).await.map_err(FeedSpineError::storage)?;
        Ok(Self::new(pool))
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a RecordQuery) {
        if let Some(source) = &query.source {
            builder.push(" AND metadata->>'source' = ").push_bind(source);
        }
        if let Some(record_type) = &query.record_type {
            builder
                .push(" AND metadata->>'record_type' = ")
                .push_bind(record_type);
        }
        if let Some(layer) = query.layer {
            builder.push(" AND layer = ").push_bind(layer.to_string());
        }
    }
}

fn record_from_row(row: &PgRow) -> Result<Record, FeedSpineError> {
    let natural_key: String = row.try_get("natural_key").map_err(FeedSpineError::storage)?;
    let layer: String = row.try_get("layer").map_err(FeedSpineError::storage)?;
    let content: serde_json::Value = row.try_get("content").map_err(FeedSpineError::storage)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(FeedSpineError::storage)?;
    Ok(Record {
        record_id: RecordId::from(
            row.try_get::<uuid::Uuid, _>("record_id")
                .map_err(FeedSpineError::storage)?,
        ),
        natural_key: NaturalKey::new(&natural_key)?,
        published_at: row
            .try_get::<Option<DateTime<Utc>>, _>("published_at")
            .map_err(FeedSpineError::storage)?,
        content: content
            .as_object()
            .cloned()
            .unwrap_or_default(),
        metadata: serde_json::from_value::<Metadata>(metadata)
            .map_err(FeedSpineError::storage)?,
        content_hash: row
            .try_get::<Option<String>, _>("content_hash")
            .map_err(FeedSpineError::storage)?,
        layer: layer
            .parse::<Layer>()
            .map_err(FeedSpineError::Storage)?,
        captured_at: row.try_get("captured_at").map_err(FeedSpineError::storage)?,
        updated_at: row.try_get("updated_at").map_err(FeedSpineError::storage)?,
        first_seen_at: row
            .try_get("first_seen_at")
            .map_err(FeedSpineError::storage)?,
        last_seen_at: row
            .try_get("last_seen_at")
            .map_err(FeedSpineError::storage)?,
    })
}

fn sighting_from_row(row: &PgRow) -> Result<Sighting, FeedSpineError> {
    let natural_key: String = row.try_get("natural_key").map_err(FeedSpineError::storage)?;
    Ok(Sighting {
        sighting_id: SightingId::from(
            row.try_get::<uuid::Uuid, _>("sighting_id")
                .map_err(FeedSpineError::storage)?,
        ),
        natural_key: NaturalKey::new(&natural_key)?,
        source: row.try_get("source").map_err(FeedSpineError::storage)?,
        seen_at: row.try_get("seen_at").map_err(FeedSpineError::storage)?,
        is_new: row.try_get("is_new").map_err(FeedSpineError::storage)?,
        record_id: RecordId::from(
            row.try_get::<uuid::Uuid, _>("record_id")
                .map_err(FeedSpineError::storage)?,
        ),
        content_hash: row
            .try_get::<Option<String>, _>("content_hash")
            .map_err(FeedSpineError::storage)?,
    })
}

/// True for the Postgres unique-violation SQLSTATE.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn initialize(&self) -> Result<(), FeedSpineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                record_id     UUID PRIMARY KEY,
                natural_key   TEXT NOT NULL,
                published_at  TIMESTAMPTZ,
                content       JSONB NOT NULL,
                metadata      JSONB NOT NULL,
                content_hash  TEXT,
                layer         TEXT NOT NULL,
                captured_at   TIMESTAMPTZ NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL,
                first_seen_at TIMESTAMPTZ NOT NULL,
                last_seen_at  TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(FeedSpineError::storage)?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS records_natural_key_idx ON records (natural_key)",
        )
        .execute(&self.pool)
        .await
        .map_err(FeedSpineError::storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS records_layer_idx ON records (layer)")
            .execute(&self.pool)
            .await
            .map_err(FeedSpineError::storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sightings (
                seq          BIGSERIAL PRIMARY KEY,
                sighting_id  UUID NOT NULL UNIQUE,
                natural_key  TEXT NOT NULL,
                source       TEXT NOT NULL,
                seen_at      TIMESTAMPTZ NOT NULL,
                is_new       BOOLEAN NOT NULL,
                record_id    UUID NOT NULL,
                content_hash TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(FeedSpineError::storage)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS sightings_key_seen_idx ON sightings (natural_key, seen_at, seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(FeedSpineError::storage)?;

        info!("Postgres store schema ready");
        Ok(())
    }

    async fn close(&self) -> Result<(), FeedSpineError> {
        self.pool.close().await;
        Ok(())
    }

    async fn insert(&self, record: &Record) -> Result<(), FeedSpineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO records
                (record_id, natural_key, published_at, content, metadata, content_hash,
                 layer, captured_at, updated_at, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(record.record_id.as_uuid())
        .bind(record.natural_key.as_str())
        .bind(record.published_at)
        .bind(serde_json::Value::Object(record.content.clone()))
        .bind(serde_json::to_value(&record.metadata).map_err(FeedSpineError::storage)?)
        .bind(&record.content_hash)
        .bind(record.layer.to_string())
        .bind(record.captured_at)
        .bind(record.updated_at)
        .bind(record.first_seen_at)
        .bind(record.last_seen_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(FeedSpineError::DuplicateNaturalKey(
                record.natural_key.to_string(),
            )),
            Err(err) => Err(FeedSpineError::storage(err)),
        }
    }

    async fn upsert_last_seen(
        &self,
        record_id: RecordId,
        seen_at: DateTime<Utc>,
        content_hash: Option<&str>,
    ) -> Result<(), FeedSpineError> {
        sqlx::query(
            r#"
            UPDATE records
            SET last_seen_at = GREATEST(last_seen_at, $2),
                updated_at   = GREATEST(updated_at, $2),
                content_hash = COALESCE($3, content_hash)
            WHERE record_id = $1
            "#,
        )
        .bind(record_id.as_uuid())
        .bind(seen_at)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .map_err(FeedSpineError::storage)?;
        Ok(())
    }

    async fn update_layer(
        &self,
        record_id: RecordId,
        new_layer: Layer,
        merged_content: Content,
        updated_at: DateTime<Utc>,
    ) -> Result<(), FeedSpineError> {
        let mut tx = self.pool.begin().await.map_err(FeedSpineError::storage)?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT layer FROM records WHERE record_id = $1 FOR UPDATE")
                .bind(record_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(FeedSpineError::storage)?;

        let current = current
            .ok_or_else(|| FeedSpineError::Storage(format!("no record {record_id}")))?
            .0
            .parse::<Layer>()
            .map_err(FeedSpineError::Storage)?;

        if new_layer <= current {
            return Err(FeedSpineError::InvalidPromotion {
                record_id,
                from: current,
                to: new_layer,
            });
        }

        sqlx::query(
            r#"
            UPDATE records
            SET layer = $2, content = $3, updated_at = GREATEST(updated_at, $4)
            WHERE record_id = $1
            "#,
        )
        .bind(record_id.as_uuid())
        .bind(new_layer.to_string())
        .bind(serde_json::Value::Object(merged_content))
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .map_err(FeedSpineError::storage)?;

        tx.commit().await.map_err(FeedSpineError::storage)
    }

    async fn get(&self, record_id: RecordId) -> Result<Option<Record>, FeedSpineError> {
        let row = sqlx::query("SELECT * FROM records WHERE record_id = $1")
            .bind(record_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(FeedSpineError::storage)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Option<Record>, FeedSpineError> {
        let row = sqlx::query("SELECT * FROM records WHERE natural_key = $1")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(FeedSpineError::storage)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn exists_by_natural_key(&self, key: &NaturalKey) -> Result<bool, FeedSpineError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM records WHERE natural_key = $1)")
                .bind(key.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(FeedSpineError::storage)?;
        Ok(exists)
    }

    async fn delete(&self, record_id: RecordId) -> Result<bool, FeedSpineError> {
        let result = sqlx::query("DELETE FROM records WHERE record_id = $1")
            .bind(record_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(FeedSpineError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    fn query(&self, query: RecordQuery) -> BoxStream<'_, Result<Record, FeedSpineError>> {
        async_stream::stream! {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("SELECT * FROM records WHERE TRUE");
            Self::push_filters(&mut builder, &query);
            builder.push(match query.order_by {
                OrderBy::CapturedAt => " ORDER BY captured_at, record_id",
                OrderBy::PublishedAt => " ORDER BY published_at, record_id",
                OrderBy::NaturalKey => " ORDER BY natural_key",
            });
            if let Some(limit) = query.limit {
                builder.push(" LIMIT ").push_bind(limit as i64);
            }
            builder.push(" OFFSET ").push_bind(query.offset as i64);

            let mut rows = builder.build().fetch(&self.pool);
            while let Some(row) = rows.next().await {
                match row {
                    Ok(row) => yield record_from_row(&row),
                    Err(err) => {
                        yield Err(FeedSpineError::storage(err));
                        break;
                    }
                }
            }
        }
        .boxed()
    }

    async fn count(&self, query: &RecordQuery) -> Result<u64, FeedSpineError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM records WHERE TRUE");
        Self::push_filters(&mut builder, query);
        let (count,): (i64,) = builder
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(FeedSpineError::storage)?;
        Ok(count as u64)
    }

    async fn record_sighting(&self, sighting: &Sighting) -> Result<bool, FeedSpineError> {
        let mut tx = self.pool.begin().await.map_err(FeedSpineError::storage)?;

        // Serialize concurrent appends for the same key; released at
        // commit/rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(sighting.natural_key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(FeedSpineError::storage)?;

        let (first,): (bool,) = sqlx::query_as(
            "SELECT NOT EXISTS(SELECT 1 FROM sightings WHERE natural_key = $1)",
        )
        .bind(sighting.natural_key.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(FeedSpineError::storage)?;

        sqlx::query(
            r#"
            INSERT INTO sightings
                (sighting_id, natural_key, source, seen_at, is_new, record_id, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(sighting.sighting_id.as_uuid())
        .bind(sighting.natural_key.as_str())
        .bind(&sighting.source)
        .bind(sighting.seen_at)
        .bind(sighting.is_new)
        .bind(sighting.record_id.as_uuid())
        .bind(&sighting.content_hash)
        .execute(&mut *tx)
        .await
        .map_err(FeedSpineError::storage)?;

        tx.commit().await.map_err(FeedSpineError::storage)?;
        Ok(first)
    }

    async fn get_sightings(&self, key: &NaturalKey) -> Result<Vec<Sighting>, FeedSpineError> {
        let rows = sqlx::query(
            "SELECT * FROM sightings WHERE natural_key = $1 ORDER BY seen_at, seq",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(FeedSpineError::storage)?;
        rows.iter().map(sighting_from_row).collect()
    }
}
