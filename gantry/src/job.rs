use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key under an external record's `custom` map that carries the execution site.
pub const CUSTOM_LOCATION_KEY: &str = "location";

/// Free-form JSON attributes carried alongside a job.
pub type Attributes = Map<String, Value>;

/// Tracked-job id, minted by the gateway when a [`RunJob`] is first stored.
///
/// Ids are UUIDv7, so ordering by id follows insertion order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunJobId(pub Uuid);

impl RunJobId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for RunJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identifier of the originating record in the upstream workload manager.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ExternalJobId(pub i64);

impl Display for ExternalJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ExternalJobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Why a job left the running set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    /// The backend reported the job as done.
    Finished,
    /// The job was killed through the coordinator.
    Killed,
}

impl CompletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionOutcome::Finished => "finished",
            CompletionOutcome::Killed => "killed",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "finished" => Ok(CompletionOutcome::Finished),
            "killed" => Ok(CompletionOutcome::Killed),
            other => Err(anyhow::anyhow!("invalid completion outcome: {}", other)),
        }
    }
}

impl Display for CompletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller-owned job record the coordinator accepts and returns.
///
/// Only `id`, `plugin` and `user` are required; everything else is carried
/// through to the owning plugin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalJob {
    pub id: ExternalJobId,
    #[serde(default)]
    pub name: Option<String>,
    pub plugin: String,
    pub user: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub global_state: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub cache_dir: Option<String>,
    /// Submission-time custom fields; `custom.location` seeds the run location.
    #[serde(default)]
    pub custom: Attributes,
    #[serde(default)]
    pub attributes: Attributes,
}

impl ExternalJob {
    pub fn new(
        id: impl Into<ExternalJobId>,
        plugin: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            plugin: plugin.into(),
            user: user.into(),
            ..Self::default()
        }
    }

    /// Location requested in the submission-custom block, if any.
    pub fn custom_location(&self) -> Option<&str> {
        self.custom.get(CUSTOM_LOCATION_KEY).and_then(Value::as_str)
    }
}

/// The coordinator's tracked-job record.
///
/// `id` is `None` until the gateway has persisted the job. `plugin` is fixed
/// at construction; gateways never rewrite it on update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub id: Option<RunJobId>,
    pub external_id: ExternalJobId,
    pub name: Option<String>,
    pub status: String,
    pub global_state: Option<String>,
    pub plugin: String,
    pub user: String,
    pub location: Option<String>,
    pub retry_count: u32,
    pub cache_dir: Option<String>,
    pub submission_info: Attributes,
    pub attributes: Attributes,
    /// False once a completion marker has been written.
    pub active: bool,
    pub status_time: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<CompletionOutcome>,
}

impl RunJob {
    /// Build an unpersisted run job from an external record, falling back to
    /// `default_status` when the record carries none.
    pub fn from_external(job: &ExternalJob, default_status: &str) -> Self {
        let status = job
            .status
            .as_deref()
            .filter(|status| !status.is_empty())
            .unwrap_or(default_status)
            .to_string();
        let location = job
            .custom_location()
            .map(str::to_string)
            .or_else(|| job.location.clone());

        Self {
            id: None,
            external_id: job.id,
            name: job.name.clone(),
            status,
            global_state: job.global_state.clone(),
            plugin: job.plugin.clone(),
            user: job.user.clone(),
            location,
            retry_count: job.retry_count,
            cache_dir: job.cache_dir.clone(),
            submission_info: job.custom.clone(),
            attributes: job.attributes.clone(),
            active: true,
            status_time: None,
            completed_at: None,
            outcome: None,
        }
    }

    /// Translate back into the caller's record format.
    pub fn to_external(&self) -> ExternalJob {
        ExternalJob {
            id: self.external_id,
            name: self.name.clone(),
            plugin: self.plugin.clone(),
            user: self.user.clone(),
            status: Some(self.status.clone()),
            global_state: self.global_state.clone(),
            location: self.location.clone(),
            retry_count: self.retry_count,
            cache_dir: self.cache_dir.clone(),
            custom: self.submission_info.clone(),
            attributes: self.attributes.clone(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Record a backend-reported transition.
    pub fn set_status(&mut self, status: impl Into<String>, global_state: Option<String>) {
        self.status = status.into();
        self.global_state = global_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condor_job() -> ExternalJob {
        let mut job = ExternalJob::new(42, "CondorPlugin", "mnorman");
        job.name = Some("ReReco-42".into());
        job.retry_count = 1;
        job.custom
            .insert(CUSTOM_LOCATION_KEY.into(), json!("T2_US_UCSD"));
        job
    }

    #[test]
    fn missing_status_gets_default() {
        let run = RunJob::from_external(&condor_job(), "New");
        assert_eq!(run.status, "New");
        assert!(run.active);
        assert!(!run.is_persisted());
    }

    #[test]
    fn empty_status_counts_as_missing() {
        let mut job = condor_job();
        job.status = Some(String::new());
        assert_eq!(RunJob::from_external(&job, "New").status, "New");
    }

    #[test]
    fn existing_status_is_kept() {
        let mut job = condor_job();
        job.status = Some("Idle".into());
        assert_eq!(RunJob::from_external(&job, "New").status, "Idle");
    }

    #[test]
    fn custom_location_wins_over_plain_location() {
        let mut job = condor_job();
        job.location = Some("T1_CH_CERN".into());
        let run = RunJob::from_external(&job, "New");
        assert_eq!(run.location.as_deref(), Some("T2_US_UCSD"));

        job.custom.clear();
        let run = RunJob::from_external(&job, "New");
        assert_eq!(run.location.as_deref(), Some("T1_CH_CERN"));
    }

    #[test]
    fn boundary_fields_survive_translation() {
        let mut run = RunJob::from_external(&condor_job(), "New");
        run.set_status("Running", Some("Running".into()));

        let back = run.to_external();
        assert_eq!(back.id, ExternalJobId(42));
        assert_eq!(back.plugin, "CondorPlugin");
        assert_eq!(back.user, "mnorman");
        assert_eq!(back.status.as_deref(), Some("Running"));
        assert_eq!(back.global_state.as_deref(), Some("Running"));
        assert_eq!(back.location.as_deref(), Some("T2_US_UCSD"));
        assert_eq!(back.custom_location(), Some("T2_US_UCSD"));
    }

    #[test]
    fn completion_outcome_parses_its_own_labels() {
        for outcome in [CompletionOutcome::Finished, CompletionOutcome::Killed] {
            assert_eq!(CompletionOutcome::parse(outcome.as_str()).unwrap(), outcome);
        }
        assert!(CompletionOutcome::parse("exploded").is_err());
    }

    #[test]
    fn generated_ids_sort_in_mint_order() {
        let first = RunJobId::generate();
        let second = RunJobId::generate();
        assert!(first < second);
        assert_eq!(
            serde_json::to_value(first).unwrap(),
            json!(first.as_uuid().to_string())
        );
    }
}
