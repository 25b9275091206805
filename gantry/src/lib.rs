//! Gantry - job-lifecycle coordination across pluggable batch and grid backends.
//!
//! Gantry sits between a workload manager's job records and the resource
//! managers that actually run the work (HTCondor pools, grid brokers, and so
//! on). Each backend is reached through a [`Plugin`]; the [`Coordinator`]
//! routes submit, track, kill and complete calls to the right plugin, keeps
//! the durable store in step with what the backends report, and rebuilds its
//! in-memory working set from that store after a restart.
//!
//! # Core Concepts
//!
//! - **RunJob**: The tracked-job record ([`RunJob`]). Callers speak
//!   [`ExternalJob`]; the coordinator translates at its boundary.
//!
//! - **Plugin**: The [`Plugin`] trait is the backend capability contract.
//!   A [`PluginCatalog`] maps names to factories and a [`PluginRegistry`]
//!   holds the instances loaded at startup.
//!
//! - **Status Registry**: [`StatusRegistry`] is the closed set of statuses a
//!   job may hold: every loaded plugin's states plus the bootstrap state.
//!
//! - **Persistence**: The [`PersistenceGateway`] trait abstracts the durable
//!   store. A PostgreSQL implementation ships behind the `postgres` feature.
//!
//! - **Working Set**: [`WorkingSetCache`] remembers which plugin and user own
//!   each tracked job. It is only a cache; `track` and `kill` heal it.
//!
//! - **Runtime**: [`TrackingDriver`] calls `track` on an interval until its
//!   [`ShutdownToken`] fires.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use gantry::*;
//!
//! let coordinator = CoordinatorBuilder::new(CoordinatorConfig::new(["CondorPlugin"]))
//!     .with_gateway(gateway)
//!     .with_catalog(catalog)
//!     .build()
//!     .await?;
//!
//! let report = coordinator.submit(&jobs, None).await?;
//! let changed = coordinator.track().await?;
//! ```

/// Coordinator construction.
pub mod builder;

/// In-process working set of tracked jobs.
pub mod cache;

/// Configuration structures for the coordinator, persistence and driver.
pub mod config;

/// The job-lifecycle coordinator.
///
/// [`Coordinator`] owns the status registry and working-set cache and
/// implements submit, track, kill, completion, cleanup and monitoring.
pub mod coordinator;

/// Error taxonomy.
pub mod error;

/// Job records and identifiers.
///
/// - [`RunJob`] - the tracked-job record
/// - [`ExternalJob`] - the caller-facing record
/// - [`RunJobId`] and [`ExternalJobId`]
/// - [`CompletionOutcome`] - why a job left the running set
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled with the `metrics` feature.
pub mod metrics;

/// Durable storage contract.
///
/// The `persistence` module defines [`PersistenceGateway`] and, when the
/// `postgres` feature is enabled, its PostgreSQL implementation.
pub mod persistence;

/// Backend plugin contract, catalog and registry.
pub mod plugin;

/// Background tracking loop and shutdown signalling.
pub mod runtime;

/// The registered status vocabulary.
pub mod status;

/// Tracing spans and event helpers.
pub mod telemetry;

pub use builder::CoordinatorBuilder;
pub use cache::{CacheEntry, WorkingSetCache};
pub use config::*;
pub use coordinator::{Coordinator, SubmitReport};
pub use error::{CoordinatorError, Result};
pub use job::*;
pub use persistence::{MonitorRow, PersistenceGateway};
#[cfg(feature = "postgres")]
pub use persistence::PostgresGateway;
pub use plugin::*;
pub use runtime::{ShutdownToken, TrackingDriver};
pub use status::StatusRegistry;
