use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::models::VolumeRecord;
use super::traits::VolumeRepository;
use crate::csi::options::ImageParameters;

/// Volume records in the `volumes` table, for controllers that run with more than one replica
/// and cannot share a plugin directory.
pub struct PgVolumeRepository {
    pool: PgPool,
}

impl PgVolumeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<VolumeRecord> {
        use sqlx::Row;

        let Json(parameters): Json<ImageParameters> = row.try_get("parameters")?;

        Ok(VolumeRecord {
            vol_id: row.try_get("vol_id")?,
            vol_name: row.try_get("vol_name")?,
            vol_size: row.try_get("vol_size")?,
            parameters,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl VolumeRepository for PgVolumeRepository {
    async fn put(&self, record: &VolumeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO volumes (vol_id, vol_name, vol_size, parameters, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (vol_id) DO UPDATE
            SET vol_name = EXCLUDED.vol_name,
                vol_size = EXCLUDED.vol_size,
                parameters = EXCLUDED.parameters
            "#,
        )
        .bind(&record.vol_id)
        .bind(&record.vol_name)
        .bind(record.vol_size)
        .bind(Json(&record.parameters))
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(vol_id = %record.vol_id, vol_name = %record.vol_name, "Stored volume record");

        Ok(())
    }

    async fn get(&self, vol_id: &str) -> Result<Option<VolumeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT vol_id, vol_name, vol_size, parameters, created_at
            FROM volumes
            WHERE vol_id = $1
            "#,
        )
        .bind(vol_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<VolumeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT vol_id, vol_name, vol_size, parameters, created_at
            FROM volumes
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn delete(&self, vol_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM volumes WHERE vol_id = $1")
            .bind(vol_id)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;

        if deleted {
            tracing::info!(vol_id = %vol_id, "Deleted volume record");
        }

        Ok(deleted)
    }
}
