use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::{CompletionOutcome, ExternalJobId, RunJob, RunJobId};

#[cfg(feature = "postgres")]
/// PostgreSQL implementation of the gateway.
///
/// Provides `PostgresGateway`, backed by the schema in
/// `migrations/001_initial_schema.sql`, when the `postgres` feature is enabled.
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PostgresGateway;

/// Durable store for run jobs and the registered status vocabulary.
///
/// Every mutating call is a single transaction: it either applies to the
/// whole batch or to none of it. Only active jobs are returned by
/// `load_running` and `load_by_status`; lookups by id also see completed
/// jobs until they are deleted.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Upsert the status vocabulary. Existing states are left alone.
    async fn register_states(&self, states: &[String]) -> anyhow::Result<()>;

    /// Persist new jobs, assigning each a [`RunJobId`].
    ///
    /// Fails the whole batch if any external id already belongs to a stored job.
    async fn insert_jobs(&self, jobs: Vec<RunJob>) -> anyhow::Result<Vec<RunJob>>;

    /// Write back status, global state, location, retry count and attributes.
    async fn update_jobs(&self, jobs: &[RunJob]) -> anyhow::Result<u64>;

    async fn delete_jobs(&self, ids: &[RunJobId]) -> anyhow::Result<u64>;

    /// Mark active jobs completed with the given outcome.
    async fn complete_jobs(
        &self,
        ids: &[RunJobId],
        outcome: CompletionOutcome,
    ) -> anyhow::Result<u64>;

    async fn load_running(&self) -> anyhow::Result<Vec<RunJob>>;

    async fn load_by_status(&self, status: &str) -> anyhow::Result<Vec<RunJob>>;

    async fn load_by_id(&self, ids: &[RunJobId]) -> anyhow::Result<Vec<RunJob>>;

    async fn load_by_external_id(&self, ids: &[ExternalJobId]) -> anyhow::Result<Vec<RunJob>>;

    /// Aggregate view of active jobs for external monitoring.
    async fn load_for_monitoring(&self) -> anyhow::Result<Vec<MonitorRow>>;
}

/// Count of active jobs sharing a plugin, status and location.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MonitorRow {
    pub plugin: String,
    pub status: String,
    pub location: Option<String>,
    pub count: u64,
}
