//! Keyword and seed repository.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

use kaizen_core::{
    DatasetId, Error, Keyword, KeywordId, KeywordRepository, PatchId, Result, Seed,
};

use crate::store::{not_found, write_err, PgStore};

fn keyword_from_row(row: &PgRow) -> Keyword {
    Keyword {
        id: row.get("id"),
        dataset_id: row.get("dataset_id"),
        name: row.get("name"),
        definition_file: row.get("definition_file"),
    }
}

fn seed_from_row(row: &PgRow) -> Seed {
    Seed {
        id: row.get("id"),
        keyword_id: row.get("keyword_id"),
        patch_id: row.get("patch_id"),
        value: row.get("value"),
    }
}

#[async_trait]
impl KeywordRepository for PgStore {
    async fn create_keyword(
        &self,
        dataset_id: DatasetId,
        name: &str,
        definition_file: Option<&str>,
    ) -> Result<Keyword> {
        let row = sqlx::query(
            "INSERT INTO keyword (dataset_id, name, definition_file) VALUES ($1, $2, $3)
             RETURNING id, dataset_id, name, definition_file",
        )
        .bind(dataset_id)
        .bind(name)
        .bind(definition_file)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "keyword"))?;

        Ok(keyword_from_row(&row))
    }

    async fn get_keyword(&self, id: KeywordId) -> Result<Keyword> {
        let row = sqlx::query(
            "SELECT id, dataset_id, name, definition_file FROM keyword WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(keyword_from_row)
            .ok_or_else(|| not_found("keyword", id))
    }

    async fn dataset_keywords(&self, dataset_id: DatasetId) -> Result<Vec<Keyword>> {
        let rows = sqlx::query(
            "SELECT id, dataset_id, name, definition_file FROM keyword
             WHERE dataset_id = $1 ORDER BY id",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(keyword_from_row).collect())
    }

    async fn add_seed(&self, keyword_id: KeywordId, patch_id: PatchId, value: bool) -> Result<Seed> {
        // First writer keeps its value; a retried seed load returns that row.
        let row = sqlx::query(
            "INSERT INTO seed (keyword_id, patch_id, value) VALUES ($1, $2, $3)
             ON CONFLICT (keyword_id, patch_id) DO UPDATE SET keyword_id = EXCLUDED.keyword_id
             RETURNING id, keyword_id, patch_id, value",
        )
        .bind(keyword_id)
        .bind(patch_id)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "seed"))?;

        Ok(seed_from_row(&row))
    }

    async fn keyword_seeds(&self, keyword_id: KeywordId) -> Result<Vec<Seed>> {
        let rows = sqlx::query(
            "SELECT id, keyword_id, patch_id, value FROM seed WHERE keyword_id = $1 ORDER BY id",
        )
        .bind(keyword_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(seed_from_row).collect())
    }
}
