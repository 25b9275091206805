//! Integration tests for the PostgreSQL gateway and a full coordinator cycle
//! on top of it.
//!
//! Requires a running Postgres instance reachable through `DATABASE_URL`.
//! Run with: `cargo test --test postgres_gateway --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::sync::Arc;

use gantry::*;
use gantry_testkit::{ScriptedPlugin, TrackBehavior, external_job_at, external_jobs};
use sqlx::Row;
use uuid::Uuid;

async fn gateway() -> PostgresGateway {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let gateway = PostgresGateway::connect(&PersistenceConfig::new(url))
        .await
        .expect("connect");
    gateway.migrate().await.expect("migrate");
    gateway
}

/// External ids unique to one test run so tests can share a database.
fn id_base() -> i64 {
    (Uuid::new_v4().as_u64_pair().0 >> 24) as i64
}

async fn cleanup(gateway: &PostgresGateway, first: i64, count: i64) {
    sqlx::query("DELETE FROM gantry_runjob WHERE external_id >= $1 AND external_id < $2")
        .bind(first)
        .bind(first + count)
        .execute(gateway.pool())
        .await
        .expect("cleanup");
}

fn states() -> Vec<String> {
    ["New", "Idle", "Running"].map(String::from).to_vec()
}

fn fresh(first: i64, count: usize) -> Vec<RunJob> {
    external_jobs(first, count, "CondorPlugin", "mnorman")
        .iter()
        .map(|job| RunJob::from_external(job, "New"))
        .collect()
}

#[tokio::test]
#[ignore]
async fn registering_states_twice_is_harmless() {
    let gateway = gateway().await;
    gateway.register_states(&states()).await.unwrap();
    gateway.register_states(&states()).await.unwrap();

    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM gantry_status WHERE name = ANY($1)")
        .bind(states())
        .fetch_one(gateway.pool())
        .await
        .unwrap()
        .try_get("n")
        .unwrap();
    assert_eq!(count, 3);
}

#[tokio::test]
#[ignore]
async fn insert_assigns_ids_and_rejects_duplicates() {
    let gateway = gateway().await;
    gateway.register_states(&states()).await.unwrap();
    let first = id_base();

    let stored = gateway.insert_jobs(fresh(first, 3)).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|job| job.is_persisted() && job.active));

    // The duplicate aborts the whole batch, including the new id.
    let mut batch = fresh(first + 2, 2);
    batch.rotate_left(1);
    assert!(gateway.insert_jobs(batch).await.is_err());
    assert!(gateway
        .load_by_external_id(&[ExternalJobId(first + 3)])
        .await
        .unwrap()
        .is_empty());

    cleanup(&gateway, first, 4).await;
}

#[tokio::test]
#[ignore]
async fn unregistered_status_is_refused_by_the_store() {
    let gateway = gateway().await;
    gateway.register_states(&states()).await.unwrap();
    let first = id_base();

    let mut jobs = fresh(first, 1);
    jobs[0].status = format!("Unregistered-{}", Uuid::new_v4());
    assert!(gateway.insert_jobs(jobs).await.is_err());

    cleanup(&gateway, first, 1).await;
}

#[tokio::test]
#[ignore]
async fn updates_and_completion_are_visible_to_queries() {
    let gateway = gateway().await;
    gateway.register_states(&states()).await.unwrap();
    let first = id_base();

    let mut stored = gateway.insert_jobs(fresh(first, 2)).await.unwrap();
    stored[0].set_status("Running", Some("Running".into()));
    assert_eq!(gateway.update_jobs(&stored[..1]).await.unwrap(), 1);

    let running = gateway.load_by_external_id(&[ExternalJobId(first)]).await.unwrap();
    assert_eq!(running[0].status, "Running");
    assert_eq!(running[0].global_state.as_deref(), Some("Running"));

    let ids: Vec<RunJobId> = stored.iter().filter_map(|job| job.id).collect();
    assert_eq!(
        gateway
            .complete_jobs(&ids, CompletionOutcome::Killed)
            .await
            .unwrap(),
        2
    );
    // Already completed rows are left alone.
    assert_eq!(
        gateway
            .complete_jobs(&ids, CompletionOutcome::Finished)
            .await
            .unwrap(),
        0
    );

    let loaded = gateway.load_by_id(&ids).await.unwrap();
    assert!(loaded.iter().all(|job| !job.active
        && job.outcome == Some(CompletionOutcome::Killed)
        && job.completed_at.is_some()));

    assert_eq!(gateway.delete_jobs(&ids).await.unwrap(), 2);
    assert_eq!(gateway.delete_jobs(&ids).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn coordinator_cycle_against_postgres() {
    let gateway = gateway().await;
    let first = id_base();

    let condor = ScriptedPlugin::new(["Idle", "Running"])
        .with_submit_status("Idle")
        .with_track(TrackBehavior::Finish);
    let coordinator = CoordinatorBuilder::new(CoordinatorConfig::default())
        .with_gateway(Arc::new(gateway.clone()))
        .with_plugin("CondorPlugin", Arc::new(condor.clone()))
        .build()
        .await
        .unwrap();

    let jobs: Vec<ExternalJob> = (first..first + 3)
        .map(|id| external_job_at(id, "CondorPlugin", "mnorman", "T2_US_UCSD"))
        .collect();
    let report = coordinator.submit(&jobs, None).await.unwrap();
    assert_eq!(report.accepted.len(), 3);

    let rows = coordinator.monitor().await.unwrap();
    assert!(rows.iter().any(|row| row.plugin == "CondorPlugin"
        && row.status == "Idle"
        && row.location.as_deref() == Some("T2_US_UCSD")
        && row.count >= 3));

    coordinator.track().await.unwrap();
    let left = coordinator.load_by_external(&jobs, false).await.unwrap();
    assert!(left.iter().all(|job| job.outcome == Some(CompletionOutcome::Finished)));

    assert_eq!(coordinator.remove_complete(&jobs).await.unwrap(), 3);
    assert_eq!(coordinator.remove_complete(&jobs).await.unwrap(), 0);
}
