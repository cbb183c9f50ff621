//! Dataset, blob and feature-spec repository.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::Row;

use kaizen_core::{
    Blob, BlobId, Dataset, DatasetId, DatasetRepository, Error, ExtractorKind, FeatureSpec,
    FeatureSpecId, PatchSpecId, Result,
};

use crate::store::{not_found, write_err, PgStore};

fn dataset_from_row(row: &PgRow) -> Dataset {
    Dataset {
        id: row.get("id"),
        name: row.get("name"),
        patch_spec_id: row.get("patch_spec_id"),
    }
}

fn blob_from_row(row: &PgRow) -> Blob {
    Blob {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        location: row.get("location"),
    }
}

pub(crate) fn feature_spec_from_row(row: &PgRow) -> Result<FeatureSpec> {
    let kind: String = row.get("kind");
    Ok(FeatureSpec {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        kind: kind.parse::<ExtractorKind>().map_err(Error::Serialization)?,
        params: row.get("params"),
    })
}

#[async_trait]
impl DatasetRepository for PgStore {
    async fn create_dataset(
        &self,
        name: &str,
        patch_spec_id: Option<PatchSpecId>,
    ) -> Result<Dataset> {
        let row = sqlx::query(
            "INSERT INTO dataset (name, patch_spec_id) VALUES ($1, $2)
             RETURNING id, name, patch_spec_id",
        )
        .bind(name)
        .bind(patch_spec_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "dataset"))?;

        Ok(dataset_from_row(&row))
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<Dataset> {
        let row = sqlx::query("SELECT id, name, patch_spec_id FROM dataset WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref()
            .map(dataset_from_row)
            .ok_or_else(|| not_found("dataset", id))
    }

    async fn create_blob(&self, dataset_id: DatasetId, location: &str) -> Result<Blob> {
        let row = sqlx::query(
            "INSERT INTO blob (dataset_id, location) VALUES ($1, $2)
             RETURNING id, dataset_id, location",
        )
        .bind(dataset_id)
        .bind(location)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "blob"))?;

        Ok(blob_from_row(&row))
    }

    async fn get_blob(&self, id: BlobId) -> Result<Blob> {
        let row = sqlx::query("SELECT id, dataset_id, location FROM blob WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref()
            .map(blob_from_row)
            .ok_or_else(|| not_found("blob", id))
    }

    async fn dataset_blobs(&self, dataset_id: DatasetId) -> Result<Vec<Blob>> {
        let rows = sqlx::query(
            "SELECT id, dataset_id, location FROM blob WHERE dataset_id = $1 ORDER BY id",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(blob_from_row).collect())
    }

    async fn create_feature_spec(
        &self,
        dataset_id: DatasetId,
        kind: ExtractorKind,
        params: JsonValue,
    ) -> Result<FeatureSpec> {
        let row = sqlx::query(
            "INSERT INTO feature_spec (dataset_id, kind, params) VALUES ($1, $2, $3)
             RETURNING id, dataset_id, kind, params",
        )
        .bind(dataset_id)
        .bind(kind.as_str())
        .bind(&params)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "feature spec"))?;

        feature_spec_from_row(&row)
    }

    async fn get_feature_spec(&self, id: FeatureSpecId) -> Result<FeatureSpec> {
        let row = sqlx::query("SELECT id, dataset_id, kind, params FROM feature_spec WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => feature_spec_from_row(&row),
            None => Err(not_found("feature spec", id)),
        }
    }

    async fn dataset_feature_specs(&self, dataset_id: DatasetId) -> Result<Vec<FeatureSpec>> {
        let rows = sqlx::query(
            "SELECT id, dataset_id, kind, params FROM feature_spec
             WHERE dataset_id = $1 ORDER BY id",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(feature_spec_from_row).collect()
    }
}
