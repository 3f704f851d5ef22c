use crate::error::{ApiError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

/// Metadata of a stored index snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SnapshotInfo {
    pub id: i64,
    pub model_name: String,
    pub dimension: i32,
    pub vector_count: i32,
    pub inserted_at: DateTime<Utc>,
}

/// A snapshot with its serialized index and the `(product_id, variant_id)`
/// pair for every index position, in position order.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub info: SnapshotInfo,
    pub blob: Vec<u8>,
    pub id_map: Vec<(i64, i64)>,
}

/// Persistence for index snapshots. "Latest" means most recently inserted.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store the index blob and its id map atomically. Returns the new
    /// snapshot id.
    async fn save_snapshot(
        &self,
        model_name: &str,
        dimension: usize,
        blob: &[u8],
        id_map: &[(i64, i64)],
    ) -> Result<i64>;

    async fn latest_snapshot_id(&self) -> Result<Option<i64>>;

    async fn latest_info(&self) -> Result<Option<SnapshotInfo>>;

    async fn load_latest(&self) -> Result<Option<StoredSnapshot>>;
}

fn snapshot_counts(dimension: usize, vectors: usize) -> Result<(i32, i32)> {
    let dimension = i32::try_from(dimension)
        .map_err(|_| ApiError::IndexError(format!("Dimension {} out of range", dimension)))?;
    let count = i32::try_from(vectors)
        .map_err(|_| ApiError::IndexError("Too many vectors for one snapshot".to_string()))?;
    Ok((dimension, count))
}

#[derive(Clone)]
pub struct IndexRepository {
    pool: PgPool,
}

impl IndexRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for IndexRepository {
    async fn save_snapshot(
        &self,
        model_name: &str,
        dimension: usize,
        blob: &[u8],
        id_map: &[(i64, i64)],
    ) -> Result<i64> {
        let (dimension, count) = snapshot_counts(dimension, id_map.len())?;

        let mut tx = self.pool.begin().await?;

        let snapshot_id: i64 = sqlx::query_scalar(
            "INSERT INTO semantic_index (model_name, dimension, vector_count, index_blob) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(model_name)
        .bind(dimension)
        .bind(count)
        .bind(blob)
        .fetch_one(&mut *tx)
        .await?;

        let positions: Vec<i32> = (0..count).collect();
        let (product_ids, variant_ids): (Vec<i64>, Vec<i64>) = id_map.iter().copied().unzip();

        sqlx::query(
            "INSERT INTO semantic_index_positions (snapshot_id, position, product_id, variant_id) \
             SELECT $1, t.position, t.product_id, t.variant_id \
             FROM unnest($2::int[], $3::bigint[], $4::bigint[]) AS t(position, product_id, variant_id)",
        )
        .bind(snapshot_id)
        .bind(&positions)
        .bind(&product_ids)
        .bind(&variant_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(snapshot_id, vectors = count, "Saved index snapshot");
        Ok(snapshot_id)
    }

    async fn latest_snapshot_id(&self) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM semantic_index ORDER BY inserted_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn latest_info(&self) -> Result<Option<SnapshotInfo>> {
        let info = sqlx::query_as::<_, SnapshotInfo>(
            "SELECT id, model_name, dimension, vector_count, inserted_at FROM semantic_index \
             ORDER BY inserted_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(info)
    }

    async fn load_latest(&self) -> Result<Option<StoredSnapshot>> {
        let Some(info) = self.latest_info().await? else {
            return Ok(None);
        };

        let blob: Vec<u8> =
            sqlx::query_scalar("SELECT index_blob FROM semantic_index WHERE id = $1")
                .bind(info.id)
                .fetch_one(&self.pool)
                .await?;

        let id_map = sqlx::query_as::<_, (i64, i64)>(
            "SELECT product_id, variant_id FROM semantic_index_positions \
             WHERE snapshot_id = $1 ORDER BY position",
        )
        .bind(info.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(StoredSnapshot { info, blob, id_map }))
    }
}
