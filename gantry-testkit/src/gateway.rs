use async_trait::async_trait;
use chrono::Utc;
use gantry::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// In-memory [`PersistenceGateway`] with the same batch semantics as the
/// PostgreSQL one: a write either applies to every job or to none.
///
/// Clones share the same store, so a test can keep a handle for inspection
/// after moving one into a coordinator.
#[derive(Clone, Debug, Default)]
pub struct InMemoryGateway {
    inner: Arc<Mutex<Store>>,
}

#[derive(Debug, Default)]
struct Store {
    states: BTreeSet<String>,
    jobs: BTreeMap<RunJobId, RunJob>,
    fail_writes: bool,
    fail_reads: bool,
}

impl Store {
    fn check_write(&self) -> anyhow::Result<()> {
        if self.fail_writes {
            anyhow::bail!("in-memory gateway is failing writes");
        }
        Ok(())
    }

    fn check_read(&self) -> anyhow::Result<()> {
        if self.fail_reads {
            anyhow::bail!("in-memory gateway is failing reads");
        }
        Ok(())
    }

    fn check_status(&self, status: &str) -> anyhow::Result<()> {
        if !self.states.contains(status) {
            anyhow::bail!("status {status:?} is not registered");
        }
        Ok(())
    }

    fn select(&self, keep: impl Fn(&RunJob) -> bool) -> Vec<RunJob> {
        let mut jobs: Vec<RunJob> = self.jobs.values().filter(|&job| keep(job)).cloned().collect();
        jobs.sort_by_key(|job| job.external_id);
        jobs
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Make every query fail until reset.
    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    pub fn registered_states(&self) -> Vec<String> {
        self.inner.lock().states.iter().cloned().collect()
    }

    /// Every stored job, completed ones included.
    pub fn jobs(&self) -> Vec<RunJob> {
        self.inner.lock().select(|_| true)
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().jobs.values().filter(|job| job.active).count()
    }

    pub fn find_external(&self, id: impl Into<ExternalJobId>) -> Option<RunJob> {
        let id = id.into();
        self.inner
            .lock()
            .jobs
            .values()
            .find(|job| job.external_id == id)
            .cloned()
    }

    /// Overwrite a stored job's status without going through any checks, as
    /// a backend or operator editing the store directly would.
    pub fn force_status(&self, id: impl Into<ExternalJobId>, status: &str) -> bool {
        let id = id.into();
        let mut store = self.inner.lock();
        match store.jobs.values_mut().find(|job| job.external_id == id) {
            Some(job) => {
                job.status = status.to_string();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn register_states(&self, states: &[String]) -> anyhow::Result<()> {
        let mut store = self.inner.lock();
        store.check_write()?;
        store.states.extend(states.iter().cloned());
        Ok(())
    }

    async fn insert_jobs(&self, jobs: Vec<RunJob>) -> anyhow::Result<Vec<RunJob>> {
        let mut store = self.inner.lock();
        store.check_write()?;

        let mut seen: HashSet<ExternalJobId> =
            store.jobs.values().map(|job| job.external_id).collect();
        for job in &jobs {
            store.check_status(&job.status)?;
            if !seen.insert(job.external_id) {
                anyhow::bail!("external job {} is already tracked", job.external_id);
            }
        }

        let now = Utc::now();
        let stored: Vec<RunJob> = jobs
            .into_iter()
            .map(|mut job| {
                job.id = Some(RunJobId::generate());
                job.active = true;
                job.status_time = Some(now);
                job
            })
            .collect();

        for job in &stored {
            if let Some(id) = job.id {
                store.jobs.insert(id, job.clone());
            }
        }
        tracing::debug!(inserted = stored.len(), "in-memory insert");
        Ok(stored)
    }

    async fn update_jobs(&self, jobs: &[RunJob]) -> anyhow::Result<u64> {
        let mut store = self.inner.lock();
        store.check_write()?;

        for job in jobs {
            if job.id.is_none() {
                anyhow::bail!(
                    "cannot update external job {} before it is persisted",
                    job.external_id
                );
            }
            store.check_status(&job.status)?;
        }

        let now = Utc::now();
        let mut updated = 0;
        for job in jobs {
            let Some(stored) = job.id.and_then(|id| store.jobs.get_mut(&id)) else {
                continue;
            };
            if stored.status != job.status {
                stored.status_time = Some(now);
            }
            stored.status = job.status.clone();
            stored.global_state = job.global_state.clone();
            stored.location = job.location.clone();
            stored.retry_count = job.retry_count;
            stored.attributes = job.attributes.clone();
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_jobs(&self, ids: &[RunJobId]) -> anyhow::Result<u64> {
        let mut store = self.inner.lock();
        store.check_write()?;
        Ok(ids.iter().filter(|id| store.jobs.remove(*id).is_some()).count() as u64)
    }

    async fn complete_jobs(
        &self,
        ids: &[RunJobId],
        outcome: CompletionOutcome,
    ) -> anyhow::Result<u64> {
        let mut store = self.inner.lock();
        store.check_write()?;

        let now = Utc::now();
        let mut completed = 0;
        for id in ids {
            if let Some(job) = store.jobs.get_mut(id).filter(|job| job.active) {
                job.active = false;
                job.outcome = Some(outcome);
                job.completed_at = Some(now);
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn load_running(&self) -> anyhow::Result<Vec<RunJob>> {
        let store = self.inner.lock();
        store.check_read()?;
        Ok(store.select(|job| job.active))
    }

    async fn load_by_status(&self, status: &str) -> anyhow::Result<Vec<RunJob>> {
        let store = self.inner.lock();
        store.check_read()?;
        Ok(store.select(|job| job.active && job.status == status))
    }

    async fn load_by_id(&self, ids: &[RunJobId]) -> anyhow::Result<Vec<RunJob>> {
        let store = self.inner.lock();
        store.check_read()?;
        let wanted: HashSet<&RunJobId> = ids.iter().collect();
        Ok(store.select(|job| job.id.as_ref().is_some_and(|id| wanted.contains(id))))
    }

    async fn load_by_external_id(&self, ids: &[ExternalJobId]) -> anyhow::Result<Vec<RunJob>> {
        let store = self.inner.lock();
        store.check_read()?;
        let wanted: HashSet<&ExternalJobId> = ids.iter().collect();
        Ok(store.select(|job| wanted.contains(&job.external_id)))
    }

    async fn load_for_monitoring(&self) -> anyhow::Result<Vec<MonitorRow>> {
        let store = self.inner.lock();
        store.check_read()?;

        let mut groups: BTreeMap<(String, String, Option<String>), u64> = BTreeMap::new();
        for job in store.jobs.values().filter(|job| job.active) {
            *groups
                .entry((job.plugin.clone(), job.status.clone(), job.location.clone()))
                .or_default() += 1;
        }

        Ok(groups
            .into_iter()
            .map(|((plugin, status, location), count)| MonitorRow {
                plugin,
                status,
                location,
                count,
            })
            .collect())
    }
}
