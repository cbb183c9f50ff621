//! Patch and patch-spec repository.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::trace;

use kaizen_core::{
    BlobId, DatasetId, Error, NewPatchSpec, Patch, PatchId, PatchKey, PatchRepository, PatchSpec,
    PatchSpecId, Result,
};

use crate::store::{not_found, write_err, PgStore};

const PATCH_COLUMNS: &str = "id, blob_id, x, y, width, height, fliplr, rotation";
const PATCH_SPEC_COLUMNS: &str = "id, name, width, height, x_overlap, y_overlap, fliplr";

fn patch_from_row(row: &PgRow) -> Patch {
    Patch {
        id: row.get("id"),
        key: PatchKey {
            blob_id: row.get("blob_id"),
            x: row.get("x"),
            y: row.get("y"),
            width: row.get("width"),
            height: row.get("height"),
            fliplr: row.get("fliplr"),
            rotation: row.get("rotation"),
        },
    }
}

fn patch_spec_from_row(row: &PgRow) -> PatchSpec {
    PatchSpec {
        id: row.get("id"),
        name: row.get("name"),
        width: row.get("width"),
        height: row.get("height"),
        x_overlap: row.get("x_overlap"),
        y_overlap: row.get("y_overlap"),
        fliplr: row.get("fliplr"),
    }
}

#[async_trait]
impl PatchRepository for PgStore {
    async fn ensure_patch(&self, key: &PatchKey) -> Result<Patch> {
        // The no-op update makes RETURNING yield the existing row on conflict,
        // so concurrent ensures of one key converge without a second read.
        let row = sqlx::query(&format!(
            "INSERT INTO patch (blob_id, x, y, width, height, fliplr, rotation)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (blob_id, x, y, width, height, fliplr, rotation)
             DO UPDATE SET blob_id = EXCLUDED.blob_id
             RETURNING {PATCH_COLUMNS}"
        ))
        .bind(key.blob_id)
        .bind(key.x)
        .bind(key.y)
        .bind(key.width)
        .bind(key.height)
        .bind(key.fliplr)
        .bind(key.rotation)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "patch"))?;

        let patch = patch_from_row(&row);
        trace!(
            subsystem = "db",
            component = "patches",
            patch_id = patch.id,
            blob_id = key.blob_id,
            "Patch ensured"
        );
        Ok(patch)
    }

    async fn get_patch(&self, id: PatchId) -> Result<Patch> {
        let row = sqlx::query(&format!("SELECT {PATCH_COLUMNS} FROM patch WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref()
            .map(patch_from_row)
            .ok_or_else(|| not_found("patch", id))
    }

    async fn blob_patches(&self, blob_id: BlobId) -> Result<Vec<Patch>> {
        let rows = sqlx::query(&format!(
            "SELECT {PATCH_COLUMNS} FROM patch WHERE blob_id = $1 ORDER BY id"
        ))
        .bind(blob_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(patch_from_row).collect())
    }

    async fn dataset_patches(&self, dataset_id: DatasetId) -> Result<Vec<Patch>> {
        let rows = sqlx::query(
            "SELECT p.id, p.blob_id, p.x, p.y, p.width, p.height, p.fliplr, p.rotation
             FROM patch p
             JOIN blob b ON b.id = p.blob_id
             WHERE b.dataset_id = $1
             ORDER BY p.id",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(patch_from_row).collect())
    }

    async fn create_patch_spec(&self, spec: &NewPatchSpec) -> Result<PatchSpec> {
        let row = sqlx::query(&format!(
            "INSERT INTO patch_spec (name, width, height, x_overlap, y_overlap, fliplr)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {PATCH_SPEC_COLUMNS}"
        ))
        .bind(&spec.name)
        .bind(spec.width)
        .bind(spec.height)
        .bind(spec.x_overlap)
        .bind(spec.y_overlap)
        .bind(spec.fliplr)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "patch spec"))?;

        Ok(patch_spec_from_row(&row))
    }

    async fn get_patch_spec(&self, id: PatchSpecId) -> Result<PatchSpec> {
        let row = sqlx::query(&format!(
            "SELECT {PATCH_SPEC_COLUMNS} FROM patch_spec WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(patch_spec_from_row)
            .ok_or_else(|| not_found("patch spec", id))
    }

    async fn get_patch_spec_by_name(&self, name: &str) -> Result<PatchSpec> {
        let row = sqlx::query(&format!(
            "SELECT {PATCH_SPEC_COLUMNS} FROM patch_spec WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(patch_spec_from_row)
            .ok_or_else(|| not_found("patch spec", name))
    }
}
