use std::any::type_name;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, warn};

use crate::cache::WorkingSetCache;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::job::{CompletionOutcome, ExternalJob, ExternalJobId, RunJob, RunJobId};
use crate::persistence::{MonitorRow, PersistenceGateway};
use crate::plugin::{Plugin, PluginOperation, PluginRegistry, SubmitInfo};
use crate::status::StatusRegistry;
use crate::telemetry;

/// What happened to each job passed to [`Coordinator::submit`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitReport {
    /// Jobs the backend took; these are now persisted and tracked.
    pub accepted: Vec<ExternalJob>,
    /// Jobs the backend refused, or whose backend call failed.
    pub rejected: Vec<ExternalJob>,
    /// Jobs naming a plugin that is not loaded. Nothing was done with them.
    pub unroutable: Vec<ExternalJob>,
    /// Jobs whose external id is already tracked or appeared earlier in the
    /// same batch. They never reach a plugin.
    #[serde(default)]
    pub duplicate: Vec<ExternalJob>,
}

impl SubmitReport {
    pub fn total(&self) -> usize {
        self.accepted.len() + self.rejected.len() + self.unroutable.len() + self.duplicate.len()
    }
}

/// Jobs for one loaded plugin, ready to dispatch.
type Route = (String, Arc<dyn Plugin>, Vec<RunJob>);

/// The job-lifecycle coordinator.
///
/// Routes submit, track, kill and complete calls to the owning plugin,
/// keeps the durable store consistent with what the backends report, and
/// heals its working-set cache from the store when entries are missing.
/// `track` and `kill` are serialized on one instance; everything else may
/// run concurrently.
pub struct Coordinator<G: PersistenceGateway + 'static> {
    config: CoordinatorConfig,
    plugins: PluginRegistry,
    statuses: StatusRegistry,
    gateway: Arc<G>,
    cache: WorkingSetCache,
    lifecycle: Mutex<()>,
}

impl<G: PersistenceGateway + 'static> fmt::Debug for Coordinator<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .field("statuses", &self.statuses)
            .field("gateway_type", &type_name::<G>())
            .field("cache", &self.cache)
            .finish()
    }
}

fn partition(jobs: impl IntoIterator<Item = RunJob>) -> BTreeMap<String, Vec<RunJob>> {
    let mut partitions: BTreeMap<String, Vec<RunJob>> = BTreeMap::new();
    for job in jobs {
        partitions.entry(job.plugin.clone()).or_default().push(job);
    }
    partitions
}

fn externals(jobs: &[RunJob]) -> Vec<ExternalJob> {
    jobs.iter().map(RunJob::to_external).collect()
}

fn tracked_ids(jobs: &[RunJob]) -> Vec<RunJobId> {
    jobs.iter().filter_map(|job| job.id).collect()
}

impl<G: PersistenceGateway + 'static> Coordinator<G> {
    /// Register the status vocabulary and return a ready coordinator.
    ///
    /// The registry is the union of every loaded plugin's states plus
    /// `config.new_state`, and is written to the store before anything else.
    pub async fn start(
        config: CoordinatorConfig,
        plugins: PluginRegistry,
        gateway: Arc<G>,
    ) -> Result<Self> {
        if plugins.is_empty() {
            return Err(CoordinatorError::NoPlugins);
        }

        let statuses = StatusRegistry::from_plugins(&plugins, config.new_state.clone());
        gateway
            .register_states(&statuses.to_vec())
            .await
            .map_err(CoordinatorError::Persistence)?;

        info!(
            plugins = ?plugins.names().collect::<Vec<_>>(),
            states = statuses.len(),
            bootstrap = statuses.bootstrap(),
            "coordinator started"
        );

        Ok(Self {
            config,
            plugins,
            statuses,
            gateway,
            cache: WorkingSetCache::new(),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn statuses(&self) -> &StatusRegistry {
        &self.statuses
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// The working-set cache. Clearing it simulates a process restart.
    pub fn cache(&self) -> &WorkingSetCache {
        &self.cache
    }

    /// Run every loaded plugin's pre-flight check.
    pub async fn check(&self) -> Result<()> {
        for (name, plugin) in self.plugins.iter() {
            self.call(name, PluginOperation::Check, plugin.check())
                .await
                .map_err(|err| match err {
                    CoordinatorError::Plugin { plugin, source, .. } => {
                        CoordinatorError::PluginCheck { plugin, source }
                    }
                    other => other,
                })
                .inspect_err(|err| error!(plugin = name, error = %err, "pre-flight check failed"))?;
        }
        Ok(())
    }

    /// Hand each job to its plugin and persist whatever the plugins accept.
    ///
    /// Jobs whose external id is already tracked, or repeated within the
    /// batch, are reported as duplicates before any plugin is called. Jobs
    /// for plugins that are not loaded are skipped and reported as
    /// unroutable. A plugin call that fails rejects that plugin's jobs only.
    pub async fn submit(
        &self,
        jobs: &[ExternalJob],
        info: Option<&SubmitInfo>,
    ) -> Result<SubmitReport> {
        self.submit_inner(jobs, info)
            .instrument(telemetry::submit_span(jobs.len()))
            .await
    }

    async fn submit_inner(
        &self,
        jobs: &[ExternalJob],
        info: Option<&SubmitInfo>,
    ) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }
        self.check().await?;

        let fresh = self.screen_duplicates(jobs, &mut report).await?;
        let bootstrap = self.statuses.bootstrap();
        let mut accepted = Vec::new();

        for (name, batch) in partition(
            fresh
                .into_iter()
                .map(|job| RunJob::from_external(job, bootstrap)),
        ) {
            let Some(plugin) = self.plugins.get(&name) else {
                warn!(
                    plugin = %name,
                    jobs = batch.len(),
                    "skipping jobs for a plugin that is not loaded"
                );
                telemetry::record_submitted(&name, "unroutable", batch.len());
                report.unroutable.extend(externals(&batch));
                continue;
            };

            let pending = externals(&batch);
            match self
                .call(&name, PluginOperation::Submit, plugin.submit(batch, info))
                .await
            {
                Ok(outcome) => {
                    let (valid, invalid) = self.split_registered(&name, outcome.accepted);
                    telemetry::record_submitted(&name, "accepted", valid.len());
                    telemetry::record_submitted(
                        &name,
                        "rejected",
                        outcome.rejected.len() + invalid.len(),
                    );
                    report.rejected.extend(externals(&outcome.rejected));
                    report.rejected.extend(externals(&invalid));
                    accepted.extend(valid);
                }
                Err(err) => {
                    error!(
                        plugin = %name,
                        jobs = pending.len(),
                        error = %err,
                        "submission failed; rejecting the plugin's jobs"
                    );
                    telemetry::record_submitted(&name, "rejected", pending.len());
                    report.rejected.extend(pending);
                }
            }
        }

        if !accepted.is_empty() {
            let stored = self.persist_new(accepted).await?;
            report.accepted = externals(&stored);
        }

        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            unroutable = report.unroutable.len(),
            duplicate = report.duplicate.len(),
            "submit finished"
        );
        Ok(report)
    }

    /// Reconcile every running job with its backend.
    ///
    /// Returns the jobs whose status changed, in external form. Jobs the
    /// backends report as finished are completed. A running job whose plugin
    /// is not loaded aborts the whole pass.
    pub async fn track(&self) -> Result<Vec<ExternalJob>> {
        self.track_inner().instrument(telemetry::track_span()).await
    }

    async fn track_inner(&self) -> Result<Vec<ExternalJob>> {
        let _serial = self.lifecycle.lock().await;

        let running = self.list_running().await?;
        if running.is_empty() {
            debug!("no running jobs to track");
            return Ok(Vec::new());
        }

        let batch = self.reconcile(running).await?;
        let routes = self.route(batch, PluginOperation::Track)?;

        let mut changed = Vec::new();
        let mut finished = Vec::new();
        for (name, plugin, jobs) in routes {
            let outcome = self
                .call(&name, PluginOperation::Track, plugin.track(jobs))
                .await?;
            telemetry::record_changed(&name, outcome.changed.len());
            changed.extend(outcome.changed);
            finished.extend(outcome.finished);
        }

        if !changed.is_empty() {
            self.validate(&changed)?;
            let updated = self
                .gateway
                .update_jobs(&changed)
                .await
                .map_err(CoordinatorError::Persistence)?;
            debug!(updated, "wrote back status changes");
        }

        self.complete(finished, CompletionOutcome::Finished).await?;

        Ok(externals(&changed))
    }

    /// Kill the running jobs matching `jobs` by external id and complete them.
    ///
    /// Returns the jobs that were killed.
    pub async fn kill(&self, jobs: &[ExternalJob]) -> Result<Vec<ExternalJob>> {
        self.kill_inner(jobs)
            .instrument(telemetry::kill_span(jobs.len()))
            .await
    }

    async fn kill_inner(&self, jobs: &[ExternalJob]) -> Result<Vec<ExternalJob>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.check().await?;

        let _serial = self.lifecycle.lock().await;

        let wanted: BTreeSet<ExternalJobId> = jobs.iter().map(|job| job.id).collect();
        let running: Vec<RunJob> = self
            .list_running()
            .await?
            .into_iter()
            .filter(|job| wanted.contains(&job.external_id))
            .collect();
        if running.len() < wanted.len() {
            debug!(
                requested = wanted.len(),
                running = running.len(),
                "some kill targets are not running"
            );
        }
        if running.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self.reconcile(running).await?;
        let routes = self.route(batch, PluginOperation::Kill)?;

        let mut killed = Vec::new();
        for (name, plugin, jobs) in routes {
            self.call(&name, PluginOperation::Kill, plugin.kill(&jobs))
                .await?;
            info!(plugin = %name, jobs = jobs.len(), "killed jobs");
            killed.extend(externals(&jobs));
            self.complete(jobs, CompletionOutcome::Killed).await?;
        }

        Ok(killed)
    }

    /// Delete jobs from the store. No plugin is consulted and repeated calls
    /// are harmless.
    pub async fn remove_complete(&self, jobs: &[ExternalJob]) -> Result<u64> {
        self.remove_complete_inner(jobs)
            .instrument(telemetry::remove_complete_span(jobs.len()))
            .await
    }

    async fn remove_complete_inner(&self, jobs: &[ExternalJob]) -> Result<u64> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let external: Vec<ExternalJobId> = jobs.iter().map(|job| job.id).collect();
        let stored = self
            .gateway
            .load_by_external_id(&external)
            .await
            .map_err(CoordinatorError::Persistence)?;

        let removed = self.delete_jobs(&tracked_ids(&stored)).await?;
        telemetry::record_removed(removed);
        Ok(removed)
    }

    /// Aggregate counts of active jobs for external monitoring.
    pub async fn monitor(&self) -> Result<Vec<MonitorRow>> {
        async {
            self.gateway
                .load_for_monitoring()
                .await
                .map_err(CoordinatorError::Persistence)
        }
        .instrument(telemetry::monitor_span())
        .await
    }

    /// Persist external records directly, without any plugin interaction.
    pub async fn create_new_jobs(&self, jobs: &[ExternalJob]) -> Result<Vec<RunJob>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let bootstrap = self.statuses.bootstrap();
        let fresh = jobs
            .iter()
            .map(|job| RunJob::from_external(job, bootstrap))
            .collect();
        self.persist_new(fresh).await
    }

    /// All active jobs.
    pub async fn list_running(&self) -> Result<Vec<RunJob>> {
        self.gateway
            .load_running()
            .await
            .map_err(CoordinatorError::Persistence)
    }

    /// Active jobs in `status`, which must be registered.
    pub async fn load_by_status(&self, status: &str) -> Result<Vec<RunJob>> {
        self.statuses
            .validate(status)
            .inspect_err(|err| error!(error = %err, "refusing to query an unregistered status"))?;
        self.gateway
            .load_by_status(status)
            .await
            .map_err(CoordinatorError::Persistence)
    }

    /// Load jobs by tracked id and remember them in the working set.
    pub async fn load_by_id(&self, ids: &[RunJobId]) -> Result<Vec<RunJob>> {
        let jobs = self
            .gateway
            .load_by_id(ids)
            .await
            .map_err(CoordinatorError::Persistence)?;
        self.cache.remember_jobs(&jobs).await;
        Ok(jobs)
    }

    /// Load the stored jobs behind external records.
    pub async fn load_by_external(
        &self,
        jobs: &[ExternalJob],
        add_to_cache: bool,
    ) -> Result<Vec<RunJob>> {
        let external: Vec<ExternalJobId> = jobs.iter().map(|job| job.id).collect();
        let stored = self
            .gateway
            .load_by_external_id(&external)
            .await
            .map_err(CoordinatorError::Persistence)?;
        if add_to_cache {
            self.cache.remember_jobs(&stored).await;
        }
        Ok(stored)
    }

    /// Write back job changes. Every status must be registered.
    pub async fn update_jobs(&self, jobs: &[RunJob]) -> Result<u64> {
        if jobs.is_empty() {
            return Ok(0);
        }
        self.validate(jobs)?;
        self.gateway
            .update_jobs(jobs)
            .await
            .map_err(CoordinatorError::Persistence)
    }

    pub async fn delete_jobs(&self, ids: &[RunJobId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self
            .gateway
            .delete_jobs(ids)
            .await
            .map_err(CoordinatorError::Persistence)?;
        self.cache.forget_many(ids).await;
        telemetry::set_working_set_size(self.cache.len().await);
        Ok(deleted)
    }

    fn validate(&self, jobs: &[RunJob]) -> Result<()> {
        self.statuses
            .validate_jobs(jobs)
            .inspect_err(|err| error!(error = %err, "job carries an unregistered status"))
    }

    /// Drop repeated external ids and ids the store already holds, recording
    /// them in `report`. Returns the jobs that may be dispatched.
    async fn screen_duplicates<'a>(
        &self,
        jobs: &'a [ExternalJob],
        report: &mut SubmitReport,
    ) -> Result<Vec<&'a ExternalJob>> {
        let mut seen = BTreeSet::new();
        let mut unique = Vec::with_capacity(jobs.len());
        for job in jobs {
            if seen.insert(job.id) {
                unique.push(job);
            } else {
                report.duplicate.push(job.clone());
            }
        }

        let ids: Vec<ExternalJobId> = seen.into_iter().collect();
        let tracked: BTreeSet<ExternalJobId> = self
            .gateway
            .load_by_external_id(&ids)
            .await
            .map_err(CoordinatorError::Persistence)?
            .into_iter()
            .map(|job| job.external_id)
            .collect();
        let (known, fresh): (Vec<&ExternalJob>, Vec<&ExternalJob>) = unique
            .into_iter()
            .partition(|job| tracked.contains(&job.id));
        report.duplicate.extend(known.into_iter().cloned());

        if !report.duplicate.is_empty() {
            warn!(
                duplicate = report.duplicate.len(),
                "skipping jobs whose external id is already tracked"
            );
            for job in &report.duplicate {
                telemetry::record_submitted(&job.plugin, "duplicate", 1);
            }
        }
        Ok(fresh)
    }

    /// Split a plugin's accepted jobs into those carrying a registered status
    /// and those that do not. The latter cannot be stored.
    fn split_registered(&self, plugin: &str, jobs: Vec<RunJob>) -> (Vec<RunJob>, Vec<RunJob>) {
        let (valid, invalid): (Vec<RunJob>, Vec<RunJob>) = jobs
            .into_iter()
            .partition(|job| self.statuses.contains(&job.status));
        for job in &invalid {
            error!(
                plugin,
                external_id = %job.external_id,
                status = %job.status,
                "plugin accepted a job with an unregistered status; reporting it as rejected"
            );
        }
        (valid, invalid)
    }

    /// Validate, insert in one transaction, then cache under the new ids.
    async fn persist_new(&self, jobs: Vec<RunJob>) -> Result<Vec<RunJob>> {
        self.validate(&jobs)?;
        let stored = self
            .gateway
            .insert_jobs(jobs)
            .await
            .map_err(CoordinatorError::Persistence)?;
        self.cache.remember_jobs(&stored).await;
        telemetry::set_working_set_size(self.cache.len().await);
        Ok(stored)
    }

    /// Attach plugin and user to each running job, from the working set when
    /// possible and from the store otherwise. Recovered jobs are cached again.
    async fn reconcile(&self, running: Vec<RunJob>) -> Result<Vec<RunJob>> {
        let mut batch = Vec::with_capacity(running.len());
        let mut missing = Vec::new();

        for mut job in running {
            let cached = match job.id {
                Some(id) => self.cache.fetch(id).await,
                None => None,
            };
            match cached {
                Some(entry) => {
                    job.plugin = entry.plugin;
                    job.user = entry.user;
                    batch.push(job);
                }
                None => missing.push(job.external_id),
            }
        }

        debug!(hits = batch.len(), misses = missing.len(), "working-set lookup");
        if missing.is_empty() {
            return Ok(batch);
        }

        let recovered: Vec<RunJob> = self
            .gateway
            .load_by_external_id(&missing)
            .await
            .map_err(CoordinatorError::Persistence)?
            .into_iter()
            .filter(|job| job.active)
            .collect();

        if recovered.len() < missing.len() {
            warn!(
                missing = missing.len(),
                recovered = recovered.len(),
                "some running jobs vanished before they could be recovered"
            );
        }

        self.cache.remember_jobs(&recovered).await;
        telemetry::record_recovered(recovered.len());
        telemetry::set_working_set_size(self.cache.len().await);
        batch.extend(recovered);
        Ok(batch)
    }

    /// Group jobs by plugin. Every plugin must be loaded.
    fn route(&self, jobs: Vec<RunJob>, operation: PluginOperation) -> Result<Vec<Route>> {
        let partitions = partition(jobs);

        if let Some((name, jobs)) = partitions
            .iter()
            .find(|(name, _)| !self.plugins.contains(name))
        {
            error!(
                plugin = %name,
                operation = %operation,
                jobs = jobs.len(),
                "jobs reference a plugin that is not loaded"
            );
            return Err(CoordinatorError::UnroutablePlugin {
                plugin: name.clone(),
                operation,
            });
        }

        Ok(partitions
            .into_iter()
            .filter_map(|(name, jobs)| {
                let plugin = Arc::clone(self.plugins.get(&name)?);
                Some((name, plugin, jobs))
            })
            .collect())
    }

    /// Backend teardown followed by one completion marker write for all jobs.
    async fn complete(&self, jobs: Vec<RunJob>, outcome: CompletionOutcome) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(jobs.len());
        for (name, plugin, jobs) in self.route(jobs, PluginOperation::Complete)? {
            async {
                self.call(&name, PluginOperation::Complete, plugin.complete(&jobs))
                    .await
            }
            .instrument(telemetry::complete_span(&name, outcome, jobs.len()))
            .await?;
            telemetry::record_completed(&name, outcome, jobs.len());
            ids.extend(tracked_ids(&jobs));
        }

        let marked = self
            .gateway
            .complete_jobs(&ids, outcome)
            .await
            .map_err(CoordinatorError::Persistence)?;
        debug!(marked, outcome = %outcome, "wrote completion markers");

        self.cache.forget_many(&ids).await;
        telemetry::set_working_set_size(self.cache.len().await);
        Ok(())
    }

    /// Run one plugin call under the configured time bound.
    async fn call<T, F>(&self, plugin: &str, operation: PluginOperation, call: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let limit = match operation {
            PluginOperation::Kill => self.config.kill_timeout(),
            _ => self.config.plugin_timeout(),
        };

        let timer = telemetry::start_plugin_call(plugin, operation);
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                CoordinatorError::PluginTimeout {
                    plugin: plugin.to_string(),
                    operation,
                    timeout: limit,
                }
            }),
            None => Ok(call.await),
        };
        timer.finish();

        result?.map_err(|source| CoordinatorError::plugin(plugin, operation, source))
    }
}
