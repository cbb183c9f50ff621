//! Detection request repository.

use async_trait::async_trait;
use sqlx::Row;

use kaizen_core::{BlobId, Detection, DetectionId, DetectionRepository, Error, Result};

use crate::store::{not_found, write_err, PgStore};

#[async_trait]
impl DetectionRepository for PgStore {
    async fn create_detection(&self, blob_id: BlobId) -> Result<Detection> {
        let id: i64 = sqlx::query_scalar("INSERT INTO detection (blob_id) VALUES ($1) RETURNING id")
            .bind(blob_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_err(e, "detection"))?;

        Ok(Detection { id, blob_id })
    }

    async fn get_detection(&self, id: DetectionId) -> Result<Detection> {
        let row = sqlx::query("SELECT id, blob_id FROM detection WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(|row| Detection {
            id: row.get("id"),
            blob_id: row.get("blob_id"),
        })
        .ok_or_else(|| not_found("detection", id))
    }
}
