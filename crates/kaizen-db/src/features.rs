//! Append-only feature cache backed by pgvector.

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::Row;

use kaizen_core::{Error, Feature, FeatureRepository, FeatureSpecId, PatchId, Result};

use crate::store::{write_err, PgStore};

#[async_trait]
impl FeatureRepository for PgStore {
    async fn get_feature(
        &self,
        patch_id: PatchId,
        spec_id: FeatureSpecId,
    ) -> Result<Option<Feature>> {
        let row = sqlx::query("SELECT vector FROM feature WHERE patch_id = $1 AND spec_id = $2")
            .bind(patch_id)
            .bind(spec_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(row.map(|row| {
            let vector: Vector = row.get("vector");
            Feature {
                patch_id,
                spec_id,
                vector: vector.to_vec(),
            }
        }))
    }

    async fn insert_feature(&self, feature: &Feature) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO feature (patch_id, spec_id, vector) VALUES ($1, $2, $3)
             ON CONFLICT (patch_id, spec_id) DO NOTHING",
        )
        .bind(feature.patch_id)
        .bind(feature.spec_id)
        .bind(Vector::from(feature.vector.clone()))
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, "feature"))?;

        Ok(result.rows_affected() == 1)
    }
}
