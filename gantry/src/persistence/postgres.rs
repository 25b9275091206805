use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::job::{Attributes, CompletionOutcome, ExternalJobId, RunJob, RunJobId};
use crate::persistence::{MonitorRow, PersistenceGateway};

const SELECT_COLUMNS: &str = r#"
    SELECT id, external_id, name, plugin, owner, status, global_state, location,
           retry_count, cache_dir, submission_info, attributes, active, outcome,
           status_time, completed_at
    FROM gantry_runjob
"#;

/// PostgreSQL-backed persistence gateway.
///
/// Stores run jobs in `gantry_runjob` and the status vocabulary in
/// `gantry_status`; a job's status is a foreign key into the latter, so the
/// database itself rejects unregistered statuses.
#[derive(Debug, Clone)]
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool from configuration.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn uuids(ids: &[RunJobId]) -> Vec<Uuid> {
        ids.iter().map(RunJobId::as_uuid).collect()
    }

    fn row_to_job(row: &PgRow) -> anyhow::Result<RunJob> {
        let retry_count: i32 = row.try_get("retry_count")?;
        let outcome: Option<String> = row.try_get("outcome")?;
        let submission_info: Json<Attributes> = row.try_get("submission_info")?;
        let attributes: Json<Attributes> = row.try_get("attributes")?;

        Ok(RunJob {
            id: Some(RunJobId(row.try_get("id")?)),
            external_id: ExternalJobId(row.try_get("external_id")?),
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            global_state: row.try_get("global_state")?,
            plugin: row.try_get("plugin")?,
            user: row.try_get("owner")?,
            location: row.try_get("location")?,
            retry_count: u32::try_from(retry_count)?,
            cache_dir: row.try_get("cache_dir")?,
            submission_info: submission_info.0,
            attributes: attributes.0,
            active: row.try_get("active")?,
            status_time: row.try_get("status_time")?,
            completed_at: row.try_get("completed_at")?,
            outcome: outcome.as_deref().map(CompletionOutcome::parse).transpose()?,
        })
    }

    fn rows_to_jobs(rows: &[PgRow]) -> anyhow::Result<Vec<RunJob>> {
        rows.iter().map(Self::row_to_job).collect()
    }
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    async fn register_states(&self, states: &[String]) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO gantry_status (name)
            SELECT UNNEST($1::text[])
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(states)
        .execute(&self.pool)
        .await?;

        debug!(
            requested = states.len(),
            inserted = result.rows_affected(),
            "registered job states"
        );
        Ok(())
    }

    async fn insert_jobs(&self, jobs: Vec<RunJob>) -> anyhow::Result<Vec<RunJob>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(jobs.len());
        let now: DateTime<Utc> = Utc::now();

        for mut job in jobs {
            let id = RunJobId::generate();
            let retry_count = i32::try_from(job.retry_count)?;

            let insert_res = sqlx::query(
                r#"
                INSERT INTO gantry_runjob (
                    id, external_id, name, plugin, owner, status, global_state, location,
                    retry_count, cache_dir, submission_info, attributes, active,
                    status_time, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, TRUE, $13, $13)
                "#,
            )
            .bind(id.as_uuid())
            .bind(job.external_id.0)
            .bind(&job.name)
            .bind(&job.plugin)
            .bind(&job.user)
            .bind(&job.status)
            .bind(&job.global_state)
            .bind(&job.location)
            .bind(retry_count)
            .bind(&job.cache_dir)
            .bind(Json(&job.submission_info))
            .bind(Json(&job.attributes))
            .bind(now)
            .execute(&mut *tx)
            .await;

            match insert_res {
                Ok(_) => {
                    job.id = Some(id);
                    job.active = true;
                    job.status_time = Some(now);
                    out.push(job);
                }
                Err(sqlx::Error::Database(db_err)) => {
                    let code = db_err.code().map(|c| c.to_string());
                    drop(tx.rollback().await);
                    return Err(match code.as_deref() {
                        Some("23505") => anyhow::anyhow!(
                            "external job {} is already tracked",
                            job.external_id
                        ),
                        Some("23503") => anyhow::anyhow!(
                            "status {:?} is not registered",
                            job.status
                        ),
                        _ => anyhow::anyhow!("insert_jobs failed: {}", db_err),
                    });
                }
                Err(e) => {
                    drop(tx.rollback().await);
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn update_jobs(&self, jobs: &[RunJob]) -> anyhow::Result<u64> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for job in jobs {
            let Some(id) = job.id else {
                drop(tx.rollback().await);
                anyhow::bail!(
                    "cannot update external job {} before it is persisted",
                    job.external_id
                );
            };

            let res = sqlx::query(
                r#"
                UPDATE gantry_runjob
                SET status_time = CASE WHEN status <> $1 THEN NOW() ELSE status_time END,
                    status = $1,
                    global_state = $2,
                    location = $3,
                    retry_count = $4,
                    attributes = $5
                WHERE id = $6
                "#,
            )
            .bind(&job.status)
            .bind(&job.global_state)
            .bind(&job.location)
            .bind(i32::try_from(job.retry_count)?)
            .bind(Json(&job.attributes))
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await;

            match res {
                Ok(done) => updated += done.rows_affected(),
                Err(e) => {
                    drop(tx.rollback().await);
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_jobs(&self, ids: &[RunJobId]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let res = sqlx::query("DELETE FROM gantry_runjob WHERE id = ANY($1)")
            .bind(Self::uuids(ids))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn complete_jobs(
        &self,
        ids: &[RunJobId],
        outcome: CompletionOutcome,
    ) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let res = sqlx::query(
            r#"
            UPDATE gantry_runjob
            SET active = FALSE,
                outcome = $2,
                completed_at = NOW()
            WHERE id = ANY($1)
              AND active
            "#,
        )
        .bind(Self::uuids(ids))
        .bind(outcome.as_str())
        .execute(&self.pool)
        .await?;

        let completed = res.rows_affected();
        if completed < ids.len() as u64 {
            warn!(
                requested = ids.len(),
                completed,
                outcome = %outcome,
                "some jobs were already complete or missing"
            );
        }
        Ok(completed)
    }

    async fn load_running(&self) -> anyhow::Result<Vec<RunJob>> {
        let sql = format!("{SELECT_COLUMNS} WHERE active ORDER BY external_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Self::rows_to_jobs(&rows)
    }

    async fn load_by_status(&self, status: &str) -> anyhow::Result<Vec<RunJob>> {
        let sql = format!("{SELECT_COLUMNS} WHERE active AND status = $1 ORDER BY external_id");
        let rows = sqlx::query(&sql).bind(status).fetch_all(&self.pool).await?;
        Self::rows_to_jobs(&rows)
    }

    async fn load_by_id(&self, ids: &[RunJobId]) -> anyhow::Result<Vec<RunJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{SELECT_COLUMNS} WHERE id = ANY($1) ORDER BY external_id");
        let rows = sqlx::query(&sql)
            .bind(Self::uuids(ids))
            .fetch_all(&self.pool)
            .await?;
        Self::rows_to_jobs(&rows)
    }

    async fn load_by_external_id(&self, ids: &[ExternalJobId]) -> anyhow::Result<Vec<RunJob>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let external: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let sql = format!("{SELECT_COLUMNS} WHERE external_id = ANY($1) ORDER BY external_id");
        let rows = sqlx::query(&sql)
            .bind(external)
            .fetch_all(&self.pool)
            .await?;
        Self::rows_to_jobs(&rows)
    }

    async fn load_for_monitoring(&self) -> anyhow::Result<Vec<MonitorRow>> {
        let rows = sqlx::query(
            r#"
            SELECT plugin, status, location, COUNT(*)::bigint AS count
            FROM gantry_runjob
            WHERE active
            GROUP BY plugin, status, location
            ORDER BY plugin, status, location
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let count: i64 = row.try_get("count")?;
                Ok(MonitorRow {
                    plugin: row.try_get("plugin")?,
                    status: row.try_get("status")?,
                    location: row.try_get("location")?,
                    count: u64::try_from(count)?,
                })
            })
            .collect()
    }
}
