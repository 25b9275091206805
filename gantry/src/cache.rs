use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::job::{RunJob, RunJobId};

/// Backend and owner association remembered for a tracked job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub plugin: String,
    pub user: String,
}

impl CacheEntry {
    pub fn new(plugin: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            user: user.into(),
        }
    }
}

impl From<&RunJob> for CacheEntry {
    fn from(job: &RunJob) -> Self {
        Self::new(job.plugin.clone(), job.user.clone())
    }
}

/// In-process working set mapping tracked job ids to their plugin and user.
///
/// Never authoritative. Entries are written only for jobs already in the
/// store, and anything missing is reloaded by the coordinator on demand.
/// Clones share one map.
#[derive(Clone, Default, Debug)]
pub struct WorkingSetCache {
    inner: Arc<Mutex<HashMap<RunJobId, CacheEntry>>>,
}

impl WorkingSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember every persisted job in `jobs`; unpersisted ones are skipped.
    ///
    /// Returns how many entries were written.
    pub async fn remember_jobs<'a, I>(&self, jobs: I) -> usize
    where
        I: IntoIterator<Item = &'a RunJob>,
    {
        let mut guard = self.inner.lock().await;
        let mut written = 0;
        for job in jobs {
            if let Some(id) = job.id {
                guard.insert(id, CacheEntry::from(job));
                written += 1;
            }
        }
        written
    }

    pub async fn fetch(&self, id: RunJobId) -> Option<CacheEntry> {
        let guard = self.inner.lock().await;
        guard.get(&id).cloned()
    }

    /// Drop entries for all `ids`, returning how many were present.
    pub async fn forget_many(&self, ids: &[RunJobId]) -> usize {
        let mut guard = self.inner.lock().await;
        let removed = ids.iter().filter(|id| guard.remove(*id).is_some()).count();
        debug!(removed, requested = ids.len(), "evicted working-set entries");
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Forget everything, as after a process restart.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExternalJob;

    fn persisted(external: i64, plugin: &str, user: &str) -> RunJob {
        let mut job = RunJob::from_external(&ExternalJob::new(external, plugin, user), "New");
        job.id = Some(RunJobId::generate());
        job
    }

    #[tokio::test]
    async fn fetch_returns_owner_of_remembered_job() {
        let cache = WorkingSetCache::new();
        let job = persisted(1, "CondorPlugin", "mnorman");
        cache.remember_jobs([&job]).await;

        let id = job.id.unwrap();
        assert_eq!(
            cache.fetch(id).await,
            Some(CacheEntry::new("CondorPlugin", "mnorman"))
        );
        assert!(cache.fetch(RunJobId::generate()).await.is_none());
    }

    #[tokio::test]
    async fn later_load_overwrites_owner() {
        let cache = WorkingSetCache::new();
        let mut job = persisted(1, "CondorPlugin", "mnorman");
        cache.remember_jobs([&job]).await;
        job.user = "sfoulkes".into();
        cache.remember_jobs([&job]).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.fetch(job.id.unwrap()).await.unwrap().user, "sfoulkes");
    }

    #[tokio::test]
    async fn unpersisted_jobs_are_not_cached() {
        let cache = WorkingSetCache::new();
        let stored = persisted(1, "CondorPlugin", "mnorman");
        let fresh = RunJob::from_external(&ExternalJob::new(2, "CondorPlugin", "x"), "New");

        assert_eq!(cache.remember_jobs([&stored, &fresh]).await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn forget_many_ignores_unknown_ids() {
        let cache = WorkingSetCache::new();
        let jobs: Vec<RunJob> = (0..3).map(|i| persisted(i, "TestPlugin", "u")).collect();
        cache.remember_jobs(&jobs).await;

        let mut ids: Vec<RunJobId> = jobs.iter().filter_map(|j| j.id).collect();
        ids.push(RunJobId::generate());
        assert_eq!(cache.forget_many(&ids).await, 3);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn clear_is_seen_through_every_handle() {
        let cache = WorkingSetCache::new();
        let handle = cache.clone();
        handle
            .remember_jobs([&persisted(7, "TestPlugin", "u")])
            .await;
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(handle.is_empty().await);
    }
}
