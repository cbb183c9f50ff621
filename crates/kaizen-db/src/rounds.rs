//! Round repository: examples, predictions, pending queries and responses.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use kaizen_core::{
    ClassifierId, Error, Example, NewExample, NewPrediction, PatchId, PendingQuery, Prediction,
    QueryId, Response, Result, Round, RoundId, RoundRepository,
};

use crate::store::{not_found, write_err, PgStore};

fn round_from_row(row: &PgRow) -> Round {
    Round {
        id: row.get("id"),
        classifier_id: row.get("classifier_id"),
        number: row.get("number"),
    }
}

fn example_from_row(row: &PgRow) -> Example {
    Example {
        id: row.get("id"),
        round_id: row.get("round_id"),
        patch_id: row.get("patch_id"),
        value: row.get("value"),
    }
}

fn prediction_from_row(row: &PgRow) -> Prediction {
    Prediction {
        id: row.get("id"),
        round_id: row.get("round_id"),
        patch_id: row.get("patch_id"),
        score: row.get("score"),
    }
}

fn query_from_row(row: &PgRow) -> PendingQuery {
    PendingQuery {
        id: row.get("id"),
        round_id: row.get("round_id"),
        patch_id: row.get("patch_id"),
    }
}

fn response_from_row(row: &PgRow) -> Response {
    Response {
        id: row.get("id"),
        query_id: row.get("query_id"),
        value: row.get("value"),
    }
}

async fn insert_examples_tx(
    tx: &mut Transaction<'_, Postgres>,
    round_id: RoundId,
    examples: &[NewExample],
) -> Result<usize> {
    if examples.is_empty() {
        return Ok(0);
    }
    let patch_ids: Vec<i64> = examples.iter().map(|e| e.patch_id).collect();
    let values: Vec<bool> = examples.iter().map(|e| e.value).collect();

    let result = sqlx::query(
        "INSERT INTO example (round_id, patch_id, value)
         SELECT $1, t.patch_id, t.value
         FROM UNNEST($2::bigint[], $3::bool[]) WITH ORDINALITY AS t(patch_id, value, ord)
         ORDER BY t.ord
         ON CONFLICT (round_id, patch_id) DO NOTHING",
    )
    .bind(round_id)
    .bind(&patch_ids)
    .bind(&values)
    .execute(&mut **tx)
    .await
    .map_err(|e| write_err(e, "example"))?;

    Ok(result.rows_affected() as usize)
}

#[async_trait]
impl RoundRepository for PgStore {
    async fn get_round(&self, id: RoundId) -> Result<Round> {
        let row = sqlx::query("SELECT id, classifier_id, number FROM round WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref()
            .map(round_from_row)
            .ok_or_else(|| not_found("round", id))
    }

    async fn latest_round(&self, classifier_id: ClassifierId) -> Result<Round> {
        let row = sqlx::query(
            "SELECT id, classifier_id, number FROM round
             WHERE classifier_id = $1 ORDER BY number DESC LIMIT 1",
        )
        .bind(classifier_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref()
            .map(round_from_row)
            .ok_or_else(|| not_found("rounds of classifier", classifier_id))
    }

    async fn classifier_rounds(&self, classifier_id: ClassifierId) -> Result<Vec<Round>> {
        let rows = sqlx::query(
            "SELECT id, classifier_id, number FROM round WHERE classifier_id = $1 ORDER BY number",
        )
        .bind(classifier_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(round_from_row).collect())
    }

    async fn create_round(
        &self,
        classifier_id: ClassifierId,
        number: i32,
        examples: &[NewExample],
    ) -> Result<Round> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(
            "INSERT INTO round (classifier_id, number) VALUES ($1, $2)
             RETURNING id, classifier_id, number",
        )
        .bind(classifier_id)
        .bind(number)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| write_err(e, "round"))?;
        let round = round_from_row(&row);

        let added = insert_examples_tx(&mut tx, round.id, examples).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "rounds",
            op = "create_round",
            classifier_id,
            round_id = round.id,
            round_number = number,
            example_count = added,
            "Round created"
        );
        Ok(round)
    }

    async fn add_examples(&self, round_id: RoundId, examples: &[NewExample]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let added = insert_examples_tx(&mut tx, round_id, examples).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(added)
    }

    async fn round_examples(&self, round_id: RoundId) -> Result<Vec<Example>> {
        let rows = sqlx::query(
            "SELECT id, round_id, patch_id, value FROM example WHERE round_id = $1 ORDER BY id",
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(example_from_row).collect())
    }

    async fn add_predictions(
        &self,
        round_id: RoundId,
        predictions: &[NewPrediction],
    ) -> Result<usize> {
        // One statement may not update the same row twice; the last score wins.
        let latest: BTreeMap<PatchId, f32> =
            predictions.iter().map(|p| (p.patch_id, p.score)).collect();
        if latest.is_empty() {
            return Ok(0);
        }
        let patch_ids: Vec<i64> = latest.keys().copied().collect();
        let scores: Vec<f32> = latest.values().copied().collect();

        let result = sqlx::query(
            "INSERT INTO prediction (round_id, patch_id, score)
             SELECT $1, t.patch_id, t.score
             FROM UNNEST($2::bigint[], $3::real[]) AS t(patch_id, score)
             ON CONFLICT (round_id, patch_id) DO UPDATE SET score = EXCLUDED.score",
        )
        .bind(round_id)
        .bind(&patch_ids)
        .bind(&scores)
        .execute(&self.pool)
        .await
        .map_err(|e| write_err(e, "prediction"))?;

        Ok(result.rows_affected() as usize)
    }

    async fn round_predictions(&self, round_id: RoundId) -> Result<Vec<Prediction>> {
        let rows = sqlx::query(
            "SELECT id, round_id, patch_id, score FROM prediction
             WHERE round_id = $1 ORDER BY patch_id",
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(prediction_from_row).collect())
    }

    async fn add_queries(
        &self,
        round_id: RoundId,
        patch_ids: &[PatchId],
    ) -> Result<Vec<PendingQuery>> {
        if patch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "INSERT INTO pending_query (round_id, patch_id)
             SELECT $1, t.patch_id
             FROM UNNEST($2::bigint[]) WITH ORDINALITY AS t(patch_id, ord)
             ORDER BY t.ord
             ON CONFLICT (round_id, patch_id) DO NOTHING
             RETURNING id, round_id, patch_id",
        )
        .bind(round_id)
        .bind(patch_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| write_err(e, "pending query"))?;

        let mut queries: Vec<PendingQuery> = rows.iter().map(query_from_row).collect();
        queries.sort_by_key(|q| q.id);
        Ok(queries)
    }

    async fn round_queries(&self, round_id: RoundId) -> Result<Vec<PendingQuery>> {
        let rows = sqlx::query(
            "SELECT id, round_id, patch_id FROM pending_query WHERE round_id = $1 ORDER BY id",
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(query_from_row).collect())
    }

    async fn add_response(&self, query_id: QueryId, value: bool) -> Result<Response> {
        let row = sqlx::query(
            "INSERT INTO response (query_id, value) VALUES ($1, $2)
             RETURNING id, query_id, value",
        )
        .bind(query_id)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_err(e, "response"))?;

        Ok(response_from_row(&row))
    }

    async fn query_responses(&self, query_id: QueryId) -> Result<Vec<Response>> {
        let rows = sqlx::query(
            "SELECT id, query_id, value FROM response WHERE query_id = $1 ORDER BY id",
        )
        .bind(query_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(response_from_row).collect())
    }
}
