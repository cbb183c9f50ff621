//! Classifier repository.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;

use kaizen_core::{
    Classifier, ClassifierId, ClassifierRepository, DatasetId, Error, KeywordId, Result, Round,
};

use crate::store::{not_found, write_err, PgStore};

fn classifier_from_row(row: &PgRow) -> Classifier {
    Classifier {
        id: row.get("id"),
        keyword_id: row.get("keyword_id"),
        dataset_id: row.get("dataset_id"),
    }
}

#[async_trait]
impl ClassifierRepository for PgStore {
    async fn create_classifier(
        &self,
        keyword_id: KeywordId,
        dataset_id: DatasetId,
    ) -> Result<(Classifier, Round)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "INSERT INTO classifier (keyword_id, dataset_id) VALUES ($1, $2)
             RETURNING id, keyword_id, dataset_id",
        )
        .bind(keyword_id)
        .bind(dataset_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| write_err(e, "classifier"))?;
        let classifier = classifier_from_row(&row);

        let round_id: i64 = sqlx::query_scalar(
            "INSERT INTO round (classifier_id, number) VALUES ($1, 0) RETURNING id",
        )
        .bind(classifier.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| write_err(e, "round"))?;

        tx.commit().await.map_err(Error::Database)?;

        Ok((
            classifier,
            Round {
                id: round_id,
                classifier_id: classifier.id,
                number: 0,
            },
        ))
    }

    async fn get_classifier(&self, id: ClassifierId) -> Result<Classifier> {
        let row = sqlx::query("SELECT id, keyword_id, dataset_id FROM classifier WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref()
            .map(classifier_from_row)
            .ok_or_else(|| not_found("classifier", id))
    }

    async fn classifier_for_keyword(&self, keyword_id: KeywordId) -> Result<Option<Classifier>> {
        let row = sqlx::query(
            "SELECT id, keyword_id, dataset_id FROM classifier
             WHERE keyword_id = $1 ORDER BY id LIMIT 1",
        )
        .bind(keyword_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.as_ref().map(classifier_from_row))
    }

    async fn dataset_classifiers(&self, dataset_id: DatasetId) -> Result<Vec<Classifier>> {
        let rows = sqlx::query(
            "SELECT id, keyword_id, dataset_id FROM classifier WHERE dataset_id = $1 ORDER BY id",
        )
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(classifier_from_row).collect())
    }
}
