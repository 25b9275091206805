//! PostgreSQL example driving a full job lifecycle through the coordinator.
//!
//! A toy "batch farm" plugin accepts jobs, moves them from `Idle` to
//! `Running` on the first tracking pass and finishes them on the second.
//!
//! # Prerequisites
//!
//! 1. PostgreSQL server running locally or accessible via network
//! 2. Database created: `createdb gantry_example`
//!
//! The schema is applied by the example itself through the bundled migrations.
//!
//! # Running the Example
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/gantry_example"
//! RUST_LOG=gantry=debug cargo run --example postgres_cycle --features postgres
//! ```

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use gantry::*;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Simulated backend: each job advances one step per tracking pass.
#[derive(Debug, Default)]
struct BatchFarmPlugin {
    passes: Mutex<HashMap<ExternalJobId, u32>>,
}

#[async_trait]
impl Plugin for BatchFarmPlugin {
    fn states(&self) -> Vec<String> {
        vec!["Idle".into(), "Running".into()]
    }

    async fn submit(
        &self,
        jobs: Vec<RunJob>,
        _info: Option<&SubmitInfo>,
    ) -> anyhow::Result<SubmitOutcome> {
        // Jobs without a site cannot be matched to a slot.
        let (mut accepted, rejected): (Vec<RunJob>, Vec<RunJob>) =
            jobs.into_iter().partition(|job| job.location.is_some());
        for job in &mut accepted {
            job.set_status("Idle", Some("Pending".into()));
        }
        Ok(SubmitOutcome { accepted, rejected })
    }

    async fn track(&self, jobs: Vec<RunJob>) -> anyhow::Result<TrackOutcome> {
        let mut passes = self.passes.lock().await;
        let mut outcome = TrackOutcome::default();
        for mut job in jobs {
            let seen = passes.entry(job.external_id).or_default();
            *seen += 1;
            if *seen == 1 {
                job.set_status("Running", Some("Running".into()));
                outcome.changed.push(job);
            } else {
                outcome.finished.push(job);
            }
        }
        Ok(outcome)
    }

    async fn kill(&self, jobs: &[RunJob]) -> anyhow::Result<()> {
        tracing::info!(jobs = jobs.len(), "batch farm removing jobs");
        Ok(())
    }

    async fn complete(&self, jobs: &[RunJob]) -> anyhow::Result<()> {
        let mut passes = self.passes.lock().await;
        for job in jobs {
            passes.remove(&job.external_id);
        }
        Ok(())
    }
}

fn workload() -> Vec<ExternalJob> {
    let sites = ["T2_US_UCSD", "T1_US_FNAL", "T2_CH_CERN"];
    (1..=6_i64)
        .map(|id| {
            let mut job = ExternalJob::new(id, "BatchFarmPlugin", "mnorman");
            job.name = Some(format!("reco-{id}"));
            // Job 4 deliberately has no site and is rejected.
            if id != 4 {
                job.custom.insert(
                    CUSTOM_LOCATION_KEY.to_string(),
                    sites[id as usize % sites.len()].into(),
                );
            }
            job
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gantry=info")),
        )
        .init();

    println!("=== Gantry PostgreSQL Lifecycle Example ===\n");

    let database_url = env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/gantry_example".to_string());
    println!("Database URL: {}\n", database_url);

    let gateway = PostgresGateway::connect(&PersistenceConfig::new(database_url)).await?;
    gateway.migrate().await?;

    let catalog = PluginCatalog::new().with("BatchFarmPlugin", |_config: &CoordinatorConfig| {
        Ok(Arc::new(BatchFarmPlugin::default()) as Arc<dyn Plugin>)
    });
    let config = CoordinatorConfig::new(["BatchFarmPlugin"]).with_plugin_timeout(30);
    let coordinator = CoordinatorBuilder::new(config)
        .with_gateway(Arc::new(gateway))
        .with_catalog(catalog)
        .build()
        .await?;
    println!("Registered statuses: {:?}\n", coordinator.statuses().to_vec());

    let jobs = workload();
    println!("1. Submitting {} jobs...", jobs.len());
    let report = coordinator.submit(&jobs, None).await?;
    println!(
        "   accepted={} rejected={} unroutable={} duplicate={}\n",
        report.accepted.len(),
        report.rejected.len(),
        report.unroutable.len(),
        report.duplicate.len()
    );

    println!("2. Monitoring view:");
    for row in coordinator.monitor().await? {
        println!(
            "   {:<16} {:<8} {:<12} {}",
            row.plugin,
            row.status,
            row.location.as_deref().unwrap_or("-"),
            row.count
        );
    }

    println!("\n3. Killing job 1...");
    let killed = coordinator.kill(&jobs[..1]).await?;
    println!("   killed {} job(s)\n", killed.len());

    println!("4. Tracking until every job is done...");
    let mut pass = 0;
    while !coordinator.list_running().await?.is_empty() {
        pass += 1;
        let changed = coordinator.track().await?;
        println!("   pass {pass}: {} job(s) changed status", changed.len());
    }

    println!("\n5. Removing completed jobs...");
    let removed = coordinator.remove_complete(&report.accepted).await?;
    println!("   removed {removed} row(s)");

    println!("\n=== Done ===");
    Ok(())
}
