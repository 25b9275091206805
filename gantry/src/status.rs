use std::collections::BTreeSet;

use crate::error::{CoordinatorError, Result};
use crate::job::RunJob;
use crate::plugin::PluginRegistry;

/// The closed set of statuses a [`RunJob`] may hold.
///
/// Built once from the loaded plugins plus the bootstrap status and never
/// mutated afterwards, so membership checks reflect exactly what the running
/// configuration can produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusRegistry {
    bootstrap: String,
    states: BTreeSet<String>,
}

impl StatusRegistry {
    pub fn new<I, S>(plugin_states: I, bootstrap: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bootstrap = bootstrap.into();
        let mut states: BTreeSet<String> = plugin_states.into_iter().map(Into::into).collect();
        states.insert(bootstrap.clone());
        Self { bootstrap, states }
    }

    pub fn from_plugins(plugins: &PluginRegistry, bootstrap: impl Into<String>) -> Self {
        Self::new(plugins.states(), bootstrap)
    }

    /// Status given to jobs that arrive without one.
    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    pub fn contains(&self, status: &str) -> bool {
        self.states.contains(status)
    }

    pub fn validate(&self, status: &str) -> Result<()> {
        if self.contains(status) {
            Ok(())
        } else {
            Err(CoordinatorError::UnknownStatus {
                status: status.to_string(),
            })
        }
    }

    /// Fail on the first job whose status is not registered.
    pub fn validate_jobs(&self, jobs: &[RunJob]) -> Result<()> {
        jobs.iter().try_for_each(|job| self.validate(&job.status))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.states.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ExternalJob;

    #[test]
    fn bootstrap_is_always_present() {
        let registry = StatusRegistry::new(["Dead", "Gone"], "New");
        assert_eq!(registry.to_vec(), vec!["Dead", "Gone", "New"]);
        assert_eq!(registry.bootstrap(), "New");
    }

    #[test]
    fn bootstrap_already_declared_is_not_duplicated() {
        let registry = StatusRegistry::new(["New", "Idle", "Idle"], "New");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unknown_status_is_a_consistency_error() {
        let registry = StatusRegistry::new(["Idle"], "New");
        let err = registry.validate("FalseStatus").unwrap_err();
        assert!(err.is_consistency());
        assert!(registry.validate("Idle").is_ok());
    }

    #[test]
    fn validate_jobs_stops_at_first_bad_status() {
        let registry = StatusRegistry::new(["Idle"], "New");
        let good = RunJob::from_external(&ExternalJob::new(1, "CondorPlugin", "alice"), "New");
        let mut bad = good.clone();
        bad.status = "Exploded".into();

        assert!(registry.validate_jobs(&[good.clone()]).is_ok());
        match registry.validate_jobs(&[good, bad]) {
            Err(CoordinatorError::UnknownStatus { status }) => assert_eq!(status, "Exploded"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
