use gantry::{CUSTOM_LOCATION_KEY, ExternalJob};
use serde_json::Value;

/// An external record with only the required fields set.
pub fn external_job(id: i64, plugin: &str, user: &str) -> ExternalJob {
    let mut job = ExternalJob::new(id, plugin, user);
    job.name = Some(format!("{plugin}-{id}"));
    job
}

/// An external record whose submission-custom block names a site.
pub fn external_job_at(id: i64, plugin: &str, user: &str, location: &str) -> ExternalJob {
    let mut job = external_job(id, plugin, user);
    job.custom
        .insert(CUSTOM_LOCATION_KEY.to_string(), Value::String(location.to_string()));
    job
}

/// `count` records with consecutive ids starting at `first_id`.
pub fn external_jobs(first_id: i64, count: usize, plugin: &str, user: &str) -> Vec<ExternalJob> {
    (first_id..)
        .take(count)
        .map(|id| external_job(id, plugin, user))
        .collect()
}
