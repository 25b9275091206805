use async_trait::async_trait;
use gantry::*;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// What a [`ScriptedPlugin`] reports when asked to track jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackBehavior {
    /// Nothing changed.
    Unchanged,
    /// Every job not already in `status` moves there.
    Transition {
        status: String,
        global_state: Option<String>,
    },
    /// Every job is done.
    Finish,
}

/// One recorded plugin call.
#[derive(Clone, Debug)]
pub struct PluginCall {
    pub operation: PluginOperation,
    pub external_ids: Vec<ExternalJobId>,
    pub info: Option<SubmitInfo>,
}

#[derive(Clone, Debug)]
struct Script {
    states: Vec<String>,
    track: TrackBehavior,
    submit_status: Option<String>,
    reject: BTreeSet<ExternalJobId>,
    failing: HashSet<PluginOperation>,
    delay: Option<Duration>,
}

/// Fake backend whose answers are scripted by the test and whose calls are
/// recorded for later assertions.
///
/// Clones share script and call log, so a handle kept by the test observes
/// calls made through the copy registered with the coordinator.
#[derive(Clone, Debug)]
pub struct ScriptedPlugin {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<PluginCall>>>,
}

impl ScriptedPlugin {
    pub fn new<I, S>(states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Arc::new(Mutex::new(Script {
                states: states.into_iter().map(Into::into).collect(),
                track: TrackBehavior::Unchanged,
                submit_status: None,
                reject: BTreeSet::new(),
                failing: HashSet::new(),
                delay: None,
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Plugin declaring the `Dead` and `Gone` states.
    pub fn test_plugin() -> Self {
        Self::new(["Dead", "Gone"])
    }

    pub fn with_track(self, behavior: TrackBehavior) -> Self {
        self.set_track(behavior);
        self
    }

    /// Status given to accepted jobs on submit.
    pub fn with_submit_status(self, status: impl Into<String>) -> Self {
        self.script.lock().submit_status = Some(status.into());
        self
    }

    /// Reject these external ids on submit.
    pub fn rejecting<I: IntoIterator<Item = i64>>(self, ids: I) -> Self {
        self.script
            .lock()
            .reject
            .extend(ids.into_iter().map(ExternalJobId));
        self
    }

    pub fn failing(self, operation: PluginOperation) -> Self {
        self.set_failing(operation, true);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.script.lock().delay = Some(delay);
        self
    }

    pub fn set_track(&self, behavior: TrackBehavior) {
        self.script.lock().track = behavior;
    }

    pub fn set_failing(&self, operation: PluginOperation, fail: bool) {
        let mut script = self.script.lock();
        if fail {
            script.failing.insert(operation);
        } else {
            script.failing.remove(&operation);
        }
    }

    /// Catalog factory handing out clones of this plugin.
    pub fn factory(
        &self,
    ) -> impl Fn(&CoordinatorConfig) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static
    {
        let plugin = self.clone();
        move |_config: &CoordinatorConfig| Ok(Arc::new(plugin.clone()) as Arc<dyn Plugin>)
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, operation: PluginOperation) -> Vec<PluginCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, operation: PluginOperation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// External ids seen by every call of `operation`, in call order.
    pub fn seen(&self, operation: PluginOperation) -> Vec<ExternalJobId> {
        self.calls_for(operation)
            .into_iter()
            .flat_map(|call| call.external_ids)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Record the call, honour the delay, then fail if scripted to.
    async fn enter(
        &self,
        operation: PluginOperation,
        jobs: &[RunJob],
        info: Option<&SubmitInfo>,
    ) -> anyhow::Result<Script> {
        self.calls.lock().push(PluginCall {
            operation,
            external_ids: jobs.iter().map(|job| job.external_id).collect(),
            info: info.cloned(),
        });

        let script = self.script.lock().clone();
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        if script.failing.contains(&operation) {
            anyhow::bail!("scripted {operation} failure");
        }
        Ok(script)
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn states(&self) -> Vec<String> {
        self.script.lock().states.clone()
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.enter(PluginOperation::Check, &[], None).await?;
        Ok(())
    }

    async fn submit(
        &self,
        jobs: Vec<RunJob>,
        info: Option<&SubmitInfo>,
    ) -> anyhow::Result<SubmitOutcome> {
        let script = self.enter(PluginOperation::Submit, &jobs, info).await?;

        let (rejected, mut accepted): (Vec<RunJob>, Vec<RunJob>) = jobs
            .into_iter()
            .partition(|job| script.reject.contains(&job.external_id));
        if let Some(status) = &script.submit_status {
            for job in &mut accepted {
                job.status = status.clone();
            }
        }
        Ok(SubmitOutcome { accepted, rejected })
    }

    async fn track(&self, jobs: Vec<RunJob>) -> anyhow::Result<TrackOutcome> {
        let script = self.enter(PluginOperation::Track, &jobs, None).await?;

        Ok(match script.track {
            TrackBehavior::Unchanged => TrackOutcome::default(),
            TrackBehavior::Transition {
                status,
                global_state,
            } => TrackOutcome {
                changed: jobs
                    .into_iter()
                    .filter(|job| job.status != status)
                    .map(|mut job| {
                        job.set_status(status.clone(), global_state.clone());
                        job
                    })
                    .collect(),
                finished: Vec::new(),
            },
            TrackBehavior::Finish => TrackOutcome {
                changed: Vec::new(),
                finished: jobs,
            },
        })
    }

    async fn kill(&self, jobs: &[RunJob]) -> anyhow::Result<()> {
        self.enter(PluginOperation::Kill, jobs, None).await?;
        Ok(())
    }

    async fn complete(&self, jobs: &[RunJob]) -> anyhow::Result<()> {
        self.enter(PluginOperation::Complete, jobs, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_jobs;

    fn run_jobs(first: i64, count: usize, status: &str) -> Vec<RunJob> {
        external_jobs(first, count, "TestPlugin", "mnorman")
            .iter()
            .map(|job| RunJob::from_external(job, status))
            .collect()
    }

    fn external_ids(jobs: &[RunJob]) -> Vec<ExternalJobId> {
        jobs.iter().map(|job| job.external_id).collect()
    }

    #[tokio::test]
    async fn rejecting_script_splits_the_batch() {
        let plugin = ScriptedPlugin::test_plugin()
            .rejecting([2])
            .with_submit_status("Dead");

        let outcome = plugin.submit(run_jobs(1, 3, "New"), None).await.unwrap();

        assert_eq!(external_ids(&outcome.rejected), vec![ExternalJobId(2)]);
        assert_eq!(outcome.rejected[0].status, "New");
        assert_eq!(
            external_ids(&outcome.accepted),
            vec![ExternalJobId(1), ExternalJobId(3)]
        );
        assert!(outcome.accepted.iter().all(|job| job.status == "Dead"));
    }

    #[tokio::test]
    async fn transition_skips_jobs_already_there() {
        let plugin = ScriptedPlugin::new(["Idle", "Running"]).with_track(TrackBehavior::Transition {
            status: "Running".into(),
            global_state: Some("Running".into()),
        });
        let mut jobs = run_jobs(1, 3, "Idle");
        jobs[1].status = "Running".into();

        let outcome = plugin.track(jobs).await.unwrap();

        assert_eq!(
            external_ids(&outcome.changed),
            vec![ExternalJobId(1), ExternalJobId(3)]
        );
        assert!(
            outcome
                .changed
                .iter()
                .all(|job| job.global_state.as_deref() == Some("Running"))
        );
        assert!(outcome.finished.is_empty());

        plugin.set_track(TrackBehavior::Finish);
        let outcome = plugin.track(run_jobs(5, 2, "Running")).await.unwrap();
        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.finished.len(), 2);
    }

    #[tokio::test]
    async fn failing_script_still_records_the_call() {
        let plugin = ScriptedPlugin::test_plugin().failing(PluginOperation::Kill);
        let handle = plugin.clone();
        let jobs = run_jobs(1, 2, "Dead");

        assert!(plugin.kill(&jobs).await.is_err());
        assert_eq!(handle.seen(PluginOperation::Kill), external_ids(&jobs));

        handle.set_failing(PluginOperation::Kill, false);
        plugin.kill(&jobs).await.unwrap();
        plugin.check().await.unwrap();
        assert_eq!(handle.call_count(PluginOperation::Kill), 2);
        assert_eq!(handle.calls().len(), 3);

        handle.clear_calls();
        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn submit_info_is_recorded_verbatim() {
        let plugin = ScriptedPlugin::test_plugin();
        let mut info = SubmitInfo::new();
        info.insert("priority".into(), serde_json::json!(7));

        plugin.submit(run_jobs(1, 1, "New"), Some(&info)).await.unwrap();

        let calls = plugin.calls_for(PluginOperation::Submit);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].info.as_ref(), Some(&info));
    }
}
