//! Job queue and barrier repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use kaizen_core::{
    next_stage, Continuation, Error, Job, JobRepository, JobStatus, Result, TaskName, TaskSpec,
};

const JOB_COLUMNS: &str = "id, task, args, status, attempts, barrier_id, not_before, last_error, \
                           created_at, started_at, completed_at";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_job_row(row: PgRow) -> Result<Job> {
        let task: String = row.get("task");
        let status: String = row.get("status");
        let args: JsonValue = row.get("args");
        let attempts: i32 = row.get("attempts");

        Ok(Job {
            id: row.get("id"),
            spec: TaskSpec {
                task: task.parse::<TaskName>().map_err(Error::Job)?,
                args: serde_json::from_value(args)?,
            },
            status: status.parse::<JobStatus>().map_err(Error::Job)?,
            attempts: attempts.max(0) as u32,
            barrier_id: row.get("barrier_id"),
            not_before: row.get("not_before"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }

    async fn insert_job(
        tx: &mut Transaction<'_, Postgres>,
        spec: &TaskSpec,
        barrier_id: Option<Uuid>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO job_queue (id, task, args, status, barrier_id, not_before, created_at)
             VALUES ($1, $2, $3, 'pending', $4, $5, $5)",
        )
        .bind(id)
        .bind(spec.task.as_str())
        .bind(spec.payload())
        .bind(barrier_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(id)
    }

    /// Queue the first non-empty stage, behind a barrier when stages follow.
    async fn enqueue_stages_tx(
        tx: &mut Transaction<'_, Postgres>,
        stages: &[Vec<TaskSpec>],
    ) -> Result<Option<Uuid>> {
        let Some((stage, rest)) = next_stage(stages) else {
            return Ok(None);
        };

        let barrier = if rest.is_empty() {
            None
        } else {
            let id = Uuid::now_v7();
            let remaining = i32::try_from(stage.len())
                .map_err(|_| Error::InvalidInput(format!("stage too large: {}", stage.len())))?;
            sqlx::query(
                "INSERT INTO job_barrier (id, remaining, continuation) VALUES ($1, $2, $3)",
            )
            .bind(id)
            .bind(remaining)
            .bind(serde_json::to_value(&rest)?)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
            Some(id)
        };

        for spec in stage {
            Self::insert_job(tx, spec, barrier).await?;
        }
        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "enqueue_stages",
            tasks = stage.len(),
            remaining_stages = rest.len(),
            barrier_id = ?barrier,
            "Stage queued"
        );
        Ok(barrier)
    }

    /// Record one arrival at a barrier. The arrival that brings it to zero
    /// queues its continuation and returns the barrier id.
    async fn arrive_tx(
        tx: &mut Transaction<'_, Postgres>,
        barrier_id: Uuid,
    ) -> Result<Option<Uuid>> {
        // The row lock taken by the decrement serializes arrivals, so exactly
        // one transaction observes the transition to zero.
        let row = sqlx::query(
            "UPDATE job_barrier SET remaining = remaining - 1
             WHERE id = $1 AND remaining > 0
             RETURNING remaining, continuation",
        )
        .bind(barrier_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let remaining: i32 = row.get("remaining");
        if remaining > 0 {
            return Ok(None);
        }
        let continuation: JsonValue = row.get("continuation");
        let rest: Continuation = serde_json::from_value(continuation)?;
        Self::enqueue_stages_tx(tx, &rest).await?;
        Ok(Some(barrier_id))
    }

    /// Settle an unfinished job, failed when `error` is given, and record
    /// its arrival in one transaction.
    async fn finish(&self, job_id: Uuid, error: Option<&str>) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // A job that already finished matches nothing and arrives no more.
        let update = match error {
            None => sqlx::query(
                "UPDATE job_queue SET status = 'completed', completed_at = $2
                 WHERE id = $1 AND status IN ('pending', 'running')
                 RETURNING barrier_id",
            )
            .bind(job_id)
            .bind(Utc::now()),
            Some(error) => sqlx::query(
                "UPDATE job_queue
                 SET status = 'failed', attempts = attempts + 1, last_error = $3,
                     completed_at = $2
                 WHERE id = $1 AND status IN ('pending', 'running')
                 RETURNING barrier_id",
            )
            .bind(job_id)
            .bind(Utc::now())
            .bind(error),
        };
        let settled = update
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;
        let opened = match settled.and_then(|row| row.get::<Option<Uuid>, _>("barrier_id")) {
            Some(barrier_id) => Self::arrive_tx(&mut tx, barrier_id).await?,
            None => None,
        };

        tx.commit().await.map_err(Error::Database)?;
        if let Some(barrier_id) = opened {
            debug!(
                subsystem = "jobs",
                component = "queue",
                %job_id,
                %barrier_id,
                "Barrier opened"
            );
        }
        Ok(opened)
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, spec: &TaskSpec, barrier_id: Option<Uuid>) -> Result<Uuid> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let id = Self::insert_job(&mut tx, spec, barrier_id).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "jobs",
            component = "queue",
            op = "enqueue",
            job_id = %id,
            task = spec.task.as_str(),
            "Job queued"
        );
        Ok(id)
    }

    async fn claim_next(&self, tasks: &[TaskName]) -> Result<Option<Job>> {
        let now = Utc::now();
        let task_strings: Vec<String> = tasks.iter().map(|t| t.as_str().to_string()).collect();

        // Filter before locking; SKIP LOCKED lets concurrent workers pass
        // over rows another worker is claiming. Empty array = any task.
        let row = sqlx::query(&format!(
            "UPDATE job_queue
             SET status = 'running', started_at = $1
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE status = 'pending'
                   AND not_before <= $1
                   AND (cardinality($2::text[]) = 0 OR task = ANY($2))
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(&task_strings)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn enqueue_stages(&self, stages: &Continuation) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let barrier = Self::enqueue_stages_tx(&mut tx, stages).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(barrier)
    }

    async fn complete(&self, job_id: Uuid) -> Result<Option<Uuid>> {
        self.finish(job_id, None).await
    }

    async fn reschedule(
        &self,
        job_id: Uuid,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue
             SET status = 'pending', attempts = attempts + 1, not_before = $1,
                 last_error = $2, started_at = NULL
             WHERE id = $3",
        )
        .bind(not_before)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<Option<Uuid>> {
        self.finish(job_id, Some(error)).await
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM job_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;

        Ok(count.0)
    }
}
