//! Test doubles for gantry: a transactional in-memory gateway, a scripted
//! backend plugin that records every call, and external-job builders.

mod gateway;
mod job;
mod plugin;

pub use gateway::InMemoryGateway;
pub use job::{external_job, external_job_at, external_jobs};
pub use plugin::{PluginCall, ScriptedPlugin, TrackBehavior};
